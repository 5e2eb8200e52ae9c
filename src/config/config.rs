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

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow_generator::{FlowConfig, SkipFields, FIN_TIMEOUT, FLOW_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source is empty")]
    SourceEmpty,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    // device name, or a file path when `is-file` is set
    pub source: String,
    pub is_file: bool,
    pub filter: String,
    pub snaplen: u32,
    #[serde(with = "humantime_serde")]
    pub flow_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub fin_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub collect_interval: Duration,
    // how long a live capture waits for its descriptor before checking for shutdown
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    pub dump_batch_size: usize,
    // per protocol, 0 means unlimited
    pub max_flows: usize,
    pub arena_page_size: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub skip: SkipFields,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: String::new(),
            is_file: false,
            filter: "ip".to_owned(),
            snaplen: 100,
            flow_timeout: FLOW_TIMEOUT,
            fin_timeout: FIN_TIMEOUT,
            collect_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_millis(100),
            dump_batch_size: 256,
            max_flows: 0,
            arena_page_size: 1024,
            log_level: "info".to_owned(),
            log_file: None,
            skip: SkipFields::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.is_empty() {
            return Err(ConfigError::SourceEmpty);
        }
        if self.snaplen == 0 {
            return Err(ConfigError::Zero("snaplen"));
        }
        if self.collect_interval.is_zero() {
            return Err(ConfigError::Zero("collect-interval"));
        }
        if self.dump_batch_size == 0 {
            return Err(ConfigError::Zero("dump-batch-size"));
        }
        if self.arena_page_size == 0 {
            return Err(ConfigError::Zero("arena-page-size"));
        }
        Ok(())
    }

    pub fn flow_config(&self) -> FlowConfig {
        FlowConfig::new(self.flow_timeout, self.fin_timeout, self.skip)
    }
}
