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

pub mod error;
pub mod flow;
pub mod flow_config;
mod flow_table;
mod sort;
mod view;

pub use error::{Error, Result};
pub use flow::{
    EncodingInfo, FieldEncoding, Flow, FlowBase, FlowInfo, FlowState, FlowSummary, PacketRecord,
    Packets, TcpFlow, TcpRecord, UdpFlow,
};
pub use flow_config::{FlowConfig, SkipFields, FIN_TIMEOUT, FLOW_TIMEOUT};
pub use flow_table::{FlowMap, FlowRef, FlowTable, FlowTableCounter};
pub use sort::{sort_flows, SortOrder};
pub use view::FlowView;
