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

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{flow::FlowSummary, view::FlowView};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    None,
    Pkts,
    Bytes,
    Pps,
    Bps,
}

impl SortOrder {
    fn key(&self, s: &FlowSummary) -> f64 {
        match self {
            SortOrder::None => 0.0,
            SortOrder::Pkts => s.size_pkts as f64,
            SortOrder::Bytes => s.size_bytes as f64,
            SortOrder::Pps => s.pps,
            SortOrder::Bps => s.bps,
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SortOrder::None),
            "pkts" | "packets" => Ok(SortOrder::Pkts),
            "bytes" => Ok(SortOrder::Bytes),
            "pps" => Ok(SortOrder::Pps),
            "bps" => Ok(SortOrder::Bps),
            _ => Err(format!("unknown sort order {}", s)),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SortOrder::None => "none",
            SortOrder::Pkts => "pkts",
            SortOrder::Bytes => "bytes",
            SortOrder::Pps => "pps",
            SortOrder::Bps => "bps",
        };
        write!(f, "{}", s)
    }
}

/// Orders views descending by `order`. Keys are read once per flow so the
/// comparison never takes a flow lock. Views of flows already reclaimed are
/// dropped.
pub fn sort_flows(views: Vec<FlowView>, order: SortOrder) -> Vec<FlowView> {
    if order == SortOrder::None {
        return views;
    }
    let mut keyed: Vec<(f64, FlowView)> = views
        .into_iter()
        .filter_map(|v| v.summary().map(|s| (order.key(&s), v)))
        .collect();
    keyed.sort_unstable_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    keyed.into_iter().map(|(_, v)| v).collect()
}
