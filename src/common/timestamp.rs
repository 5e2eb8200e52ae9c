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

// Capture timestamps are carried as plain u64 microseconds throughout the
// flow engine

use std::time::Duration;

pub const MICROS_IN_SECOND: u64 = 1_000_000;

pub fn timeval_to_micros(tv_sec: i64, tv_usec: i64) -> u64 {
    (tv_sec.max(0) as u64)
        .saturating_mul(MICROS_IN_SECOND)
        .saturating_add(tv_usec.max(0) as u64)
}

pub fn duration_to_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(timeval_to_micros(2, 500), 2_000_500);
        assert_eq!(timeval_to_micros(-1, 7), 7);
        assert_eq!(duration_to_micros(Duration::from_secs(30)), 30_000_000);
        assert_eq!(duration_to_micros(Duration::MAX), u64::MAX);
    }
}
