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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::duration_to_micros;

pub const FLOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const FIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Header fields whose history is not recorded. Every field is recorded by
/// default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SkipFields {
    pub ip_id: bool,
    pub ip_ttl: bool,
    pub ip_len: bool,
    pub tcp_seq: bool,
    pub tcp_ack: bool,
    pub tcp_flags: bool,
    pub tcp_win: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    // micros
    pub flow_timeout: u64,
    pub fin_timeout: u64,
    pub skip: SkipFields,
}

impl FlowConfig {
    pub fn new(flow_timeout: Duration, fin_timeout: Duration, skip: SkipFields) -> Self {
        Self {
            flow_timeout: duration_to_micros(flow_timeout),
            fin_timeout: duration_to_micros(fin_timeout),
            skip,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::new(FLOW_TIMEOUT, FIN_TIMEOUT, SkipFields::default())
    }
}
