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
use std::path::Path;

use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger,
    LoggerHandle, Naming,
};

pub const DEFAULT_LOG_RETENTION: usize = 7;

/// Starts the process logger. `RUST_LOG` takes precedence over `level`.
///
/// Without a writable log file location everything goes to stderr.
pub fn init_logger(level: &str, log_file: Option<&Path>) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(level)?.format(colored_opt_format);

    let log_file = log_file.filter(|path| {
        let writable = match path.parent() {
            Some(base) if base.as_os_str().is_empty() => true,
            Some(base) if base.exists() => base
                .metadata()
                .ok()
                .map(|meta| !meta.permissions().readonly())
                .unwrap_or(false),
            Some(base) => fs::create_dir_all(base).is_ok(),
            None => false,
        };
        if !writable {
            eprintln!(
                "Log file path '{}' access denied, logs will not be written to file",
                path.display()
            );
        }
        writable
    });

    let logger = match log_file {
        Some(path) => logger
            .log_to_file(FileSpec::try_from(path)?)
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(DEFAULT_LOG_RETENTION),
            )
            .append()
            .duplicate_to_stderr(Duplicate::All),
        None => logger.log_to_stderr(),
    };
    logger.start()
}
