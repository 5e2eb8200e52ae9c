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

use thiserror::Error;

use public::{arena, codecs::varint};

#[derive(Debug, Error)]
pub enum Error {
    #[error("flow is being torn down")]
    FlowTimedOut,
    #[error("packet timestamp {new} precedes last seen {last}")]
    OutOfOrder { new: u64, last: u64 },
    #[error("timestamp delta {0} too large to encode")]
    DeltaTooLarge(u64),
    #[error("flow allocation failed: {0}")]
    Arena(#[from] arena::Error),
    #[error("packet protocol does not match flow")]
    ProtocolMismatch,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<varint::Error> for Error {
    fn from(e: varint::Error) -> Self {
        match e {
            varint::Error::ValueTooLarge(v) => Self::DeltaTooLarge(v),
        }
    }
}
