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

//! Variable length integer packing for inter-packet timestamp deltas.
//!
//! The top two bits of the first byte carry the encoded length:
//!
//! | tag  | bytes | value range     |
//! |------|-------|-----------------|
//! | `00` | 1     | `0..2^6`        |
//! | `01` | 2     | `0..2^14`       |
//! | `10` | 3     | `0..2^22`       |
//! | `11` | 4     | `0..2^30`       |
//!
//! The remaining bits hold the value in big endian order.

use thiserror::Error;

pub const MAX_VALUE: u64 = (1 << 30) - 1;

const TAG_SHIFT: u8 = 6;
const TAG_MASK: u8 = 0b1100_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("value {0} exceeds the varint limit of 2^30 - 1")]
    ValueTooLarge(u64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Number of bytes needed to pack `value`, `None` when it cannot be packed.
pub fn encoded_len(value: u64) -> Option<usize> {
    match value {
        v if v < 1 << 6 => Some(1),
        v if v < 1 << 14 => Some(2),
        v if v < 1 << 22 => Some(3),
        v if v <= MAX_VALUE => Some(4),
        _ => None,
    }
}

/// Appends `value` to `out`, returning the number of bytes written.
pub fn encode(value: u64, out: &mut Vec<u8>) -> Result<usize> {
    let len = encoded_len(value).ok_or(Error::ValueTooLarge(value))?;
    let tag = ((len - 1) as u8) << TAG_SHIFT;
    let bytes = (value as u32).to_be_bytes();
    let start = bytes.len() - len;
    out.push(bytes[start] | tag);
    out.extend_from_slice(&bytes[start + 1..]);
    Ok(len)
}

/// Decodes one value from the head of `buf`, returning it together with the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Option<(u32, usize)> {
    let first = *buf.first()?;
    let len = ((first & TAG_MASK) >> TAG_SHIFT) as usize + 1;
    if buf.len() < len {
        return None;
    }
    let mut value = (first & !TAG_MASK) as u32;
    for b in &buf[1..len] {
        value = value << 8 | *b as u32;
    }
    Some((value, len))
}

/// Append-only sequence of packed unsigned integers.
#[derive(Clone, Debug, Default)]
pub struct VarintDeltaCodec {
    buffer: Vec<u8>,
    count: usize,
}

impl VarintDeltaCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, value: u64) -> Result<()> {
        encode(value, &mut self.buffer)?;
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            buffer: &self.buffer,
            offset: 0,
        }
    }

    /// Drops all values and releases the backing buffer.
    pub fn clear(&mut self) {
        self.buffer = Vec::new();
        self.count = 0;
    }
}

/// Forward-only cursor over a [`VarintDeltaCodec`].
#[derive(Clone, Debug)]
pub struct Iter<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Iter<'a> {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Rewinds the cursor so the same buffer is decoded again from the start.
    pub fn reset(&mut self) {
        self.offset = 0;
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let (value, len) = decode(&self.buffer[self.offset..])?;
        self.offset += len;
        Some(value)
    }
}

impl<'a> IntoIterator for &'a VarintDeltaCodec {
    type Item = u32;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_boundaries() {
        let cases = [
            (0, 1),
            ((1 << 6) - 1, 1),
            (1 << 6, 2),
            ((1 << 14) - 1, 2),
            (1 << 14, 3),
            ((1 << 22) - 1, 3),
            (1 << 22, 4),
            (MAX_VALUE, 4),
        ];
        for (value, len) in cases {
            let mut buf = vec![];
            assert_eq!(encode(value, &mut buf), Ok(len), "value {}", value);
            assert_eq!(buf.len(), len);
            assert_eq!(decode(&buf), Some((value as u32, len)));
        }
    }

    #[test]
    fn rejects_large_values() {
        let mut buf = vec![];
        assert_eq!(
            encode(1 << 30, &mut buf),
            Err(Error::ValueTooLarge(1 << 30))
        );
        assert_eq!(
            encode(u32::MAX as u64, &mut buf),
            Err(Error::ValueTooLarge(u32::MAX as u64))
        );
        assert!(buf.is_empty());

        let mut codec = VarintDeltaCodec::new();
        assert!(codec.append(u64::MAX).is_err());
        assert!(codec.is_empty());
    }

    #[test]
    fn tag_layout() {
        let mut buf = vec![];
        encode(0x3FFF, &mut buf).unwrap();
        assert_eq!(buf, vec![0x7F, 0xFF]);
        buf.clear();
        encode(0x12_3456, &mut buf).unwrap();
        assert_eq!(buf, vec![0x92, 0x34, 0x56]);
        buf.clear();
        encode(MAX_VALUE, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn truncated_input() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0x92, 0x34]), None);
    }

    #[test]
    fn sequence_and_reset() {
        let values = [0u64, 100, 150, 10, 640, 70_000, 5_000_000, MAX_VALUE, 3];
        let mut codec = VarintDeltaCodec::new();
        for v in values {
            codec.append(v).unwrap();
        }
        assert_eq!(codec.len(), values.len());

        let mut iter = codec.iter();
        let first_pass: Vec<u64> = iter.by_ref().map(|v| v as u64).collect();
        assert_eq!(first_pass, values);
        assert_eq!(iter.offset(), codec.as_bytes().len());

        iter.reset();
        assert_eq!(iter.next(), Some(0));
        assert_eq!(iter.next(), Some(100));
    }

    #[test]
    fn sampled_round_trip() {
        let mut v = 1u64;
        while v <= MAX_VALUE {
            for candidate in [v - 1, v, v + 1] {
                if candidate > MAX_VALUE {
                    continue;
                }
                let mut buf = vec![];
                encode(candidate, &mut buf).unwrap();
                assert_eq!(decode(&buf).map(|(d, _)| d as u64), Some(candidate));
            }
            v = v * 3 + 1;
        }
    }
}
