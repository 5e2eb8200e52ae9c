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
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle of a background activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Status {
    NotStarted = 0,
    Running = 1,
    BeingKilled = 2,
    Killed = 3,
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        match v {
            0 => Status::NotStarted,
            1 => Status::Running,
            2 => Status::BeingKilled,
            _ => Status::Killed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NotStarted => write!(f, "not started"),
            Status::Running => write!(f, "running"),
            Status::BeingKilled => write!(f, "being killed"),
            Status::Killed => write!(f, "killed"),
        }
    }
}

#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl Default for AtomicStatus {
    fn default() -> Self {
        Self(AtomicU8::new(Status::NotStarted as u8))
    }
}

impl AtomicStatus {
    pub fn load(&self) -> Status {
        Status::from(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`, returning false if the current status is
    /// not `from`.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_happen_once() {
        let status = AtomicStatus::default();
        assert_eq!(status.load(), Status::NotStarted);
        assert!(status.transition(Status::NotStarted, Status::Running));
        assert!(!status.transition(Status::NotStarted, Status::Running));
        assert!(status.transition(Status::Running, Status::BeingKilled));
        status.store(Status::Killed);
        assert_eq!(status.load(), Status::Killed);
        assert_eq!(status.load().to_string(), "killed");
    }
}
