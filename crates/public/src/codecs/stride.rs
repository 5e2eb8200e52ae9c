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

//! Run based compression for slowly evolving header fields.
//!
//! A field is stored as a list of arithmetic progressions. Each [`Run`]
//! holds `count + 1` values `base, base + stride, ..., base + count * stride`.
//! All arithmetic wraps, so sequence numbers crossing `2^32` keep a single
//! run.

use std::fmt::Debug;
use std::mem;

pub trait StrideValue: Copy + Eq + Default + Debug + Send + Sync + 'static {
    fn wrapping_sub(self, other: Self) -> Self;
    fn wrapping_add(self, other: Self) -> Self;
    fn wrapping_scale(self, k: usize) -> Self;
}

macro_rules! impl_stride_value {
    ($($t:ty),*) => {
        $(
            impl StrideValue for $t {
                #[inline]
                fn wrapping_sub(self, other: Self) -> Self {
                    <$t>::wrapping_sub(self, other)
                }

                #[inline]
                fn wrapping_add(self, other: Self) -> Self {
                    <$t>::wrapping_add(self, other)
                }

                #[inline]
                fn wrapping_scale(self, k: usize) -> Self {
                    <$t>::wrapping_mul(self, k as $t)
                }
            }
        )*
    };
}

impl_stride_value!(u8, u16, u32, u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Run<T> {
    pub base: T,
    pub stride: T,
    pub count: usize,
}

impl<T: StrideValue> Run<T> {
    #[inline]
    fn value_at(&self, k: usize) -> T {
        self.base.wrapping_add(self.stride.wrapping_scale(k))
    }

    pub fn len(&self) -> usize {
        self.count + 1
    }
}

#[derive(Clone, Debug, Default)]
pub struct StrideField<T> {
    runs: Vec<Run<T>>,
    len: usize,
}

impl<T: StrideValue> StrideField<T> {
    pub fn new() -> Self {
        Self {
            runs: vec![],
            len: 0,
        }
    }

    pub fn append(&mut self, value: T) {
        self.len += 1;
        if let Some(last) = self.runs.last_mut() {
            if last.count == 0 {
                last.stride = value.wrapping_sub(last.base);
                last.count = 1;
                return;
            }
            if last.value_at(last.count + 1) == value {
                last.count += 1;
                return;
            }
        }
        self.runs.push(Run {
            base: value,
            stride: T::default(),
            count: 0,
        });
    }

    /// Number of logical values stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of runs.
    pub fn field_count(&self) -> usize {
        self.runs.len()
    }

    /// Number of values folded into runs beyond their base value.
    pub fn stride_count(&self) -> usize {
        self.len - self.runs.len()
    }

    pub fn runs(&self) -> &[Run<T>] {
        &self.runs
    }

    pub fn run_at(&self, index: usize) -> Option<&Run<T>> {
        self.runs.get(index)
    }

    pub fn decode_at(&self, mut index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        for run in self.runs.iter() {
            if index < run.len() {
                return Some(run.value_at(index));
            }
            index -= run.len();
        }
        None
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            runs: &self.runs,
            run: 0,
            offset: 0,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.runs.capacity() * mem::size_of::<Run<T>>()
    }

    pub fn clear(&mut self) {
        self.runs = Vec::new();
        self.len = 0;
    }
}

pub struct Iter<'a, T> {
    runs: &'a [Run<T>],
    run: usize,
    offset: usize,
}

impl<'a, T: StrideValue> Iter<'a, T> {
    pub fn reset(&mut self) {
        self.run = 0;
        self.offset = 0;
    }
}

impl<'a, T: StrideValue> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let run = self.runs.get(self.run)?;
        let value = run.value_at(self.offset);
        if self.offset == run.count {
            self.run += 1;
            self.offset = 0;
        } else {
            self.offset += 1;
        }
        Some(value)
    }
}

impl<'a, T: StrideValue> IntoIterator for &'a StrideField<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
