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

mod sniffer;
mod source;

pub use sniffer::{CaptureInfo, Ingest, Sniffer, SnifferCounter};
pub use source::{
    MemorySource, Next, Packet, PacketSource, PcapFileSource, PcapLiveSource, SourceStats,
};

use thiserror::Error;

use crate::common::header;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),
    #[error("poll failed: {0}")]
    Poll(#[from] nix::Error),
    #[error(transparent)]
    Header(#[from] header::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
