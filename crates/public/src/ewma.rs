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

//! Fixed-point exponentially weighted moving averages.
//!
//! Averages are kept scaled by `FIXED_1` and decay by `EXP / FIXED_1` per
//! sample, giving a smoothing factor of about 0.35 for the newest sample.

use std::sync::atomic::{AtomicU64, Ordering};

pub const FSHIFT: u32 = 11;
pub const FIXED_1: u64 = 1 << FSHIFT;
// FIXED_1 * (1 - 0.35)
pub const EXP: u64 = 1331;

#[inline]
pub fn calc_load(avg: u64, n: u64) -> u64 {
    avg.saturating_mul(EXP)
        .saturating_add(n.saturating_mul(FIXED_1 * (FIXED_1 - EXP)))
        >> FSHIFT
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ewma(u64);

impl Ewma {
    pub fn update(&mut self, n: u64) {
        self.0 = calc_load(self.0, n);
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn value(&self) -> f64 {
        self.0 as f64 / FIXED_1 as f64
    }
}

/// An [`Ewma`] shared between threads, updated with a compare and swap loop.
#[derive(Debug, Default)]
pub struct AtomicEwma(AtomicU64);

impl AtomicEwma {
    pub fn update(&self, n: u64) -> u64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = calc_load(current, n);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn load(&self) -> Ewma {
        Ewma(self.0.load(Ordering::Acquire))
    }

    pub fn value(&self) -> f64 {
        self.load().value()
    }
}

/// Lowest and highest timestamps observed by any thread.
///
/// Both ends are monotonic: `first` only decreases and `last` only increases.
#[derive(Debug)]
pub struct AtomicWindow {
    first: AtomicU64,
    last: AtomicU64,
}

impl Default for AtomicWindow {
    fn default() -> Self {
        Self {
            first: AtomicU64::new(u64::MAX),
            last: AtomicU64::new(0),
        }
    }
}

impl AtomicWindow {
    pub fn observe(&self, value: u64) {
        self.first.fetch_min(value, Ordering::AcqRel);
        self.last.fetch_max(value, Ordering::AcqRel);
    }

    pub fn first(&self) -> Option<u64> {
        match self.first.load(Ordering::Acquire) {
            u64::MAX => None,
            v => Some(v),
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.first().map(|_| self.last.load(Ordering::Acquire))
    }
}
