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

pub mod collector;
pub mod common;
pub mod config;
pub mod dumper;
pub mod error;
pub mod flow_generator;
pub mod parser;
pub mod sniffer;
pub mod utils;

pub use common::{FlowId, FlowType, HeaderFields};
pub use config::Config;
pub use dumper::FlowSink;
pub use error::{Error, Result};
pub use flow_generator::{FlowView, SortOrder, TcpFlow, UdpFlow};
pub use parser::{ParserContext, ParserInfo};
