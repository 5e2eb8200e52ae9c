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

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::flow_generator;
use crate::sniffer;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sniffer(#[from] sniffer::Error),
    #[error(transparent)]
    Flow(#[from] flow_generator::Error),
    #[error("{0} already started")]
    AlreadyStarted(&'static str),
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] io::Error),
    #[error("parser already stopped")]
    Stopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
