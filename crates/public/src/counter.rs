/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::sync::Weak;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Signed(v) => write!(f, "{}", v),
            CounterValue::Unsigned(v) => write!(f, "{}", v),
            CounterValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

/// A counter source registered by name. The registry never keeps the
/// source alive.
pub struct Countable {
    pub module: &'static str,
    source: Weak<dyn RefCountable>,
}

impl Countable {
    pub fn new(module: &'static str, source: Weak<dyn RefCountable>) -> Self {
        Self { module, source }
    }

    pub fn get_counters(&self) -> Vec<Counter> {
        self.source
            .upgrade()
            .map(|c| c.get_counters())
            .unwrap_or_default()
    }

    pub fn closed(&self) -> bool {
        self.source.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use super::*;

    #[derive(Default)]
    struct Hits(AtomicU64);

    impl RefCountable for Hits {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "hits",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn countable_follows_source() {
        let hits = Arc::new(Hits::default());
        hits.0.fetch_add(3, Ordering::Relaxed);
        let source: Arc<dyn RefCountable> = hits.clone();
        let countable = Countable::new("test", Arc::downgrade(&source));
        drop(source);
        assert_eq!(
            countable.get_counters(),
            vec![("hits", CounterType::Counted, CounterValue::Unsigned(3))]
        );
        assert!(!countable.closed());
        drop(hits);
        assert!(countable.closed());
        assert!(countable.get_counters().is_empty());
    }

    #[test]
    fn values_serialize_untagged() {
        let json = serde_json::to_string(&[
            CounterValue::Unsigned(7),
            CounterValue::Signed(-1),
            CounterValue::Float(0.5),
        ])
        .unwrap();
        assert_eq!(json, "[7,-1,0.5]");
    }
}
