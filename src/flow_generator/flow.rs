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

use std::mem;
use std::ops::AddAssign;

use bitflags::bitflags;
use log::debug;
use serde::Serialize;

use public::{
    arena::Recyclable,
    codecs::{
        stride::{self, Run},
        varint::{self, MAX_VALUE},
        StrideField, VarintDeltaCodec,
    },
    ewma::Ewma,
};

use super::{
    error::{Error, Result},
    flow_config::{FlowConfig, SkipFields},
};
use crate::common::{
    enums::{FlowType, TcpFlags},
    header::{HeaderFields, TcpFields, Transport},
    timestamp::MICROS_IN_SECOND,
};

bitflags! {
    #[derive(Default)]
    pub struct FlowState: u8 {
        const ACTIVE = 0b001;
        // collected and waiting for the dumper, no longer accepts packets
        const PASSIVE_TIMED_OUT = 0b010;
        // at least one external view exists, collection is deferred
        const ITERATED_OVER = 0b100;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowInfo {
    pub state: FlowState,
    pub size_pkts: u64,
    pub size_bytes: u64,
    external_refs: u32,
}

impl FlowInfo {
    pub(super) fn acquire_ref(&mut self) {
        self.external_refs += 1;
        self.state.insert(FlowState::ITERATED_OVER);
    }

    pub(super) fn release_ref(&mut self) {
        self.external_refs = self.external_refs.saturating_sub(1);
        if self.external_refs == 0 {
            self.state.remove(FlowState::ITERATED_OVER);
        }
    }

    pub fn external_refs(&self) -> u32 {
        self.external_refs
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FieldEncoding {
    // number of runs
    pub fields: usize,
    // values folded into runs
    pub stride: usize,
}

impl<T: stride::StrideValue> From<&StrideField<T>> for FieldEncoding {
    fn from(f: &StrideField<T>) -> Self {
        Self {
            fields: f.field_count(),
            stride: f.stride_count(),
        }
    }
}

impl AddAssign for FieldEncoding {
    fn add_assign(&mut self, other: Self) {
        self.fields += other.fields;
        self.stride += other.stride;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EncodingInfo {
    pub ip_id: FieldEncoding,
    pub ip_ttl: FieldEncoding,
    pub ip_len: FieldEncoding,
    pub tcp_seq: FieldEncoding,
    pub tcp_ack: FieldEncoding,
    pub tcp_flags: FieldEncoding,
    pub tcp_win: FieldEncoding,
}

impl AddAssign for EncodingInfo {
    fn add_assign(&mut self, other: Self) {
        self.ip_id += other.ip_id;
        self.ip_ttl += other.ip_ttl;
        self.ip_len += other.ip_len;
        self.tcp_seq += other.tcp_seq;
        self.tcp_ack += other.tcp_ack;
        self.tcp_flags += other.tcp_flags;
        self.tcp_win += other.tcp_win;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct FlowSummary {
    pub size_pkts: u64,
    pub size_bytes: u64,
    pub pps: f64,
    pub bps: f64,
    pub first_rx: u64,
    pub last_rx: u64,
}

/// State shared by every flow type.
#[derive(Debug)]
pub struct FlowBase {
    pub info: FlowInfo,
    first_rx: u64,
    last_rx: u64,
    expiry: u64,

    pkts_this_period: u64,
    bytes_this_period: u64,
    pps: Ewma,
    bps: Ewma,

    timestamps: VarintDeltaCodec,
    ip_id: StrideField<u16>,
    ip_ttl: StrideField<u8>,
    ip_len: StrideField<u16>,
}

impl Default for FlowBase {
    fn default() -> Self {
        Self {
            info: FlowInfo::default(),
            first_rx: 0,
            last_rx: 0,
            // never expires before its first packet
            expiry: u64::MAX,
            pkts_this_period: 0,
            bytes_this_period: 0,
            pps: Ewma::default(),
            bps: Ewma::default(),
            timestamps: VarintDeltaCodec::new(),
            ip_id: StrideField::new(),
            ip_ttl: StrideField::new(),
            ip_len: StrideField::new(),
        }
    }
}

impl FlowBase {
    // checks a packet against the flow without touching it, returns the
    // timestamp delta to record
    fn admit(&self, timestamp: u64) -> Result<u64> {
        if self.info.state.contains(FlowState::PASSIVE_TIMED_OUT) {
            return Err(Error::FlowTimedOut);
        }
        if self.info.size_pkts == 0 {
            return Ok(0);
        }
        if timestamp < self.last_rx {
            return Err(Error::OutOfOrder {
                new: timestamp,
                last: self.last_rx,
            });
        }
        let delta = timestamp - self.last_rx;
        if delta > MAX_VALUE {
            return Err(Error::DeltaTooLarge(delta));
        }
        Ok(delta)
    }

    fn record(
        &mut self,
        fields: &HeaderFields,
        timestamp: u64,
        delta: u64,
        timeout: u64,
        skip: &SkipFields,
    ) -> Result<()> {
        self.timestamps.append(delta)?;

        if self.info.size_pkts == 0 {
            self.info.state.insert(FlowState::ACTIVE);
            self.first_rx = timestamp;
        }
        self.last_rx = timestamp;
        self.expiry = timestamp.saturating_add(timeout);
        self.pkts_this_period += 1;
        self.bytes_this_period += fields.ip_len as u64;

        if !skip.ip_id {
            self.ip_id.append(fields.ip_id);
        }
        if !skip.ip_ttl {
            self.ip_ttl.append(fields.ip_ttl);
        }
        if !skip.ip_len {
            self.ip_len.append(fields.ip_len);
        }

        self.info.size_pkts += 1;
        self.info.size_bytes += fields.ip_len as u64;
        Ok(())
    }

    fn update_rates(&mut self, interval_micros: u64) {
        let scale = |n: u64| match interval_micros {
            0 => n,
            i => n.saturating_mul(MICROS_IN_SECOND) / i,
        };
        self.pps.update(scale(self.pkts_this_period));
        self.bps.update(scale(self.bytes_this_period));
        self.pkts_this_period = 0;
        self.bytes_this_period = 0;
    }

    pub fn first_rx(&self) -> u64 {
        self.first_rx
    }

    pub fn last_rx(&self) -> u64 {
        self.last_rx
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    pub fn pps(&self) -> f64 {
        self.pps.value()
    }

    pub fn bps(&self) -> f64 {
        self.bps.value()
    }

    pub fn timestamps(&self) -> &VarintDeltaCodec {
        &self.timestamps
    }

    pub fn ip_id(&self) -> &StrideField<u16> {
        &self.ip_id
    }

    pub fn ip_ttl(&self) -> &StrideField<u8> {
        &self.ip_ttl
    }

    pub fn ip_len(&self) -> &StrideField<u16> {
        &self.ip_len
    }

    pub fn ip_id_encoded(&self) -> &[Run<u16>] {
        self.ip_id.runs()
    }

    pub fn ip_ttl_encoded(&self) -> &[Run<u8>] {
        self.ip_ttl.runs()
    }

    pub fn ip_len_encoded(&self) -> &[Run<u16>] {
        self.ip_len.runs()
    }

    /// Absolute timestamps of every recorded packet.
    pub fn decoded_timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.timestamps.iter().scan(self.first_rx, |ts, delta| {
            *ts += delta as u64;
            Some(*ts)
        })
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            size_pkts: self.info.size_pkts,
            size_bytes: self.info.size_bytes,
            pps: self.pps(),
            bps: self.bps(),
            first_rx: self.first_rx,
            last_rx: self.last_rx,
        }
    }

    fn encoding_info(&self) -> EncodingInfo {
        EncodingInfo {
            ip_id: (&self.ip_id).into(),
            ip_ttl: (&self.ip_ttl).into(),
            ip_len: (&self.ip_len).into(),
            ..Default::default()
        }
    }

    fn heap_bytes(&self) -> usize {
        self.timestamps.size_bytes()
            + self.ip_id.size_bytes()
            + self.ip_ttl.size_bytes()
            + self.ip_len.size_bytes()
    }
}

#[derive(Debug, Default)]
pub struct TcpFlow {
    base: FlowBase,
    seq: StrideField<u32>,
    ack: StrideField<u32>,
    flags: StrideField<u8>,
    win: StrideField<u16>,
    fin_seen: bool,
}

impl TcpFlow {
    fn apply(
        &mut self,
        fields: &HeaderFields,
        tcp: &TcpFields,
        timestamp: u64,
        config: &FlowConfig,
    ) -> Result<()> {
        let delta = self.base.admit(timestamp)?;
        // only a packet carrying FIN gets the shorter timeout
        let fin = tcp.flags.contains(TcpFlags::FIN);
        let timeout = if fin {
            config.fin_timeout
        } else {
            config.flow_timeout
        };
        self.base
            .record(fields, timestamp, delta, timeout, &config.skip)?;
        self.fin_seen |= fin;

        let skip = &config.skip;
        if !skip.tcp_seq {
            self.seq.append(tcp.seq);
        }
        if !skip.tcp_ack {
            self.ack.append(tcp.ack);
        }
        if !skip.tcp_flags {
            self.flags.append(tcp.flags.bits());
        }
        if !skip.tcp_win {
            self.win.append(tcp.win);
        }
        Ok(())
    }

    pub fn base(&self) -> &FlowBase {
        &self.base
    }

    /// Whether any packet of the flow carried FIN.
    pub fn fin_seen(&self) -> bool {
        self.fin_seen
    }

    pub fn seq(&self) -> &StrideField<u32> {
        &self.seq
    }

    pub fn ack(&self) -> &StrideField<u32> {
        &self.ack
    }

    pub fn flags(&self) -> &StrideField<u8> {
        &self.flags
    }

    pub fn win(&self) -> &StrideField<u16> {
        &self.win
    }

    pub fn seq_encoded(&self) -> &[Run<u32>] {
        self.seq.runs()
    }

    pub fn ack_encoded(&self) -> &[Run<u32>] {
        self.ack.runs()
    }

    pub fn flags_encoded(&self) -> &[Run<u8>] {
        self.flags.runs()
    }

    pub fn win_encoded(&self) -> &[Run<u16>] {
        self.win.runs()
    }

    pub fn packets(&self) -> Packets<'_> {
        Packets::new(&self.base, Some(self))
    }

    fn encoding_info(&self) -> EncodingInfo {
        EncodingInfo {
            tcp_seq: (&self.seq).into(),
            tcp_ack: (&self.ack).into(),
            tcp_flags: (&self.flags).into(),
            tcp_win: (&self.win).into(),
            ..self.base.encoding_info()
        }
    }

    fn heap_bytes(&self) -> usize {
        self.base.heap_bytes()
            + self.seq.size_bytes()
            + self.ack.size_bytes()
            + self.flags.size_bytes()
            + self.win.size_bytes()
    }
}

#[derive(Debug, Default)]
pub struct UdpFlow {
    base: FlowBase,
}

impl UdpFlow {
    fn apply(&mut self, fields: &HeaderFields, timestamp: u64, config: &FlowConfig) -> Result<()> {
        let delta = self.base.admit(timestamp)?;
        self.base.record(
            fields,
            timestamp,
            delta,
            config.flow_timeout,
            &config.skip,
        )
    }

    pub fn base(&self) -> &FlowBase {
        &self.base
    }

    pub fn packets(&self) -> Packets<'_> {
        Packets::new(&self.base, None)
    }
}

#[derive(Debug)]
pub enum Flow {
    Tcp(TcpFlow),
    Udp(UdpFlow),
}

impl Flow {
    pub fn new(flow_type: FlowType) -> Self {
        match flow_type {
            FlowType::Tcp => Flow::Tcp(TcpFlow::default()),
            FlowType::Udp => Flow::Udp(UdpFlow::default()),
        }
    }

    pub fn flow_type(&self) -> FlowType {
        match self {
            Flow::Tcp(_) => FlowType::Tcp,
            Flow::Udp(_) => FlowType::Udp,
        }
    }

    pub fn base(&self) -> &FlowBase {
        match self {
            Flow::Tcp(f) => &f.base,
            Flow::Udp(f) => &f.base,
        }
    }

    fn base_mut(&mut self) -> &mut FlowBase {
        match self {
            Flow::Tcp(f) => &mut f.base,
            Flow::Udp(f) => &mut f.base,
        }
    }

    pub fn info(&self) -> &FlowInfo {
        &self.base().info
    }

    pub(crate) fn info_mut(&mut self) -> &mut FlowInfo {
        &mut self.base_mut().info
    }

    /// Records one packet. A rejected packet leaves the flow untouched.
    pub fn apply_packet(
        &mut self,
        fields: &HeaderFields,
        timestamp: u64,
        config: &FlowConfig,
    ) -> Result<()> {
        let result = match (self, &fields.transport) {
            (Flow::Tcp(flow), Transport::Tcp(tcp)) => flow.apply(fields, tcp, timestamp, config),
            (Flow::Udp(flow), Transport::Udp) => flow.apply(fields, timestamp, config),
            _ => Err(Error::ProtocolMismatch),
        };
        if let Err(e) = &result {
            debug!("drop packet at {}: {}", timestamp, e);
        }
        result
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.base().expiry
    }

    pub fn update_rates(&mut self, interval_micros: u64) {
        self.base_mut().update_rates(interval_micros)
    }

    pub fn summary(&self) -> FlowSummary {
        self.base().summary()
    }

    pub fn encoding_info(&self) -> EncodingInfo {
        match self {
            Flow::Tcp(f) => f.encoding_info(),
            Flow::Udp(f) => f.base.encoding_info(),
        }
    }

    /// Approximate memory held by the flow, including its encoded history.
    pub fn size_bytes(&self) -> usize {
        mem::size_of::<Self>()
            + match self {
                Flow::Tcp(f) => f.heap_bytes(),
                Flow::Udp(f) => f.base.heap_bytes(),
            }
    }

    pub fn packets(&self) -> Packets<'_> {
        match self {
            Flow::Tcp(f) => f.packets(),
            Flow::Udp(f) => f.packets(),
        }
    }
}

impl Recyclable for Flow {
    fn reset(&mut self) {
        *self = Flow::new(self.flow_type());
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpRecord {
    pub seq: Option<u32>,
    pub ack: Option<u32>,
    pub flags: Option<TcpFlags>,
    pub win: Option<u16>,
}

/// One reconstructed packet. Fields configured as skipped are `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: u64,
    pub ip_id: Option<u16>,
    pub ip_ttl: Option<u8>,
    pub ip_len: Option<u16>,
    pub tcp: Option<TcpRecord>,
}

struct TcpIters<'a> {
    seq: stride::Iter<'a, u32>,
    ack: stride::Iter<'a, u32>,
    flags: stride::Iter<'a, u8>,
    win: stride::Iter<'a, u16>,
}

pub struct Packets<'a> {
    first_rx: u64,
    current: u64,
    timestamps: varint::Iter<'a>,
    ip_id: stride::Iter<'a, u16>,
    ip_ttl: stride::Iter<'a, u8>,
    ip_len: stride::Iter<'a, u16>,
    tcp: Option<TcpIters<'a>>,
}

impl<'a> Packets<'a> {
    fn new(base: &'a FlowBase, tcp: Option<&'a TcpFlow>) -> Self {
        Self {
            first_rx: base.first_rx,
            current: base.first_rx,
            timestamps: base.timestamps.iter(),
            ip_id: base.ip_id.iter(),
            ip_ttl: base.ip_ttl.iter(),
            ip_len: base.ip_len.iter(),
            tcp: tcp.map(|f| TcpIters {
                seq: f.seq.iter(),
                ack: f.ack.iter(),
                flags: f.flags.iter(),
                win: f.win.iter(),
            }),
        }
    }

    /// Rewinds to the first packet.
    pub fn reset(&mut self) {
        self.current = self.first_rx;
        self.timestamps.reset();
        self.ip_id.reset();
        self.ip_ttl.reset();
        self.ip_len.reset();
        if let Some(tcp) = self.tcp.as_mut() {
            tcp.seq.reset();
            tcp.ack.reset();
            tcp.flags.reset();
            tcp.win.reset();
        }
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = PacketRecord;

    fn next(&mut self) -> Option<PacketRecord> {
        let delta = self.timestamps.next()?;
        self.current += delta as u64;
        Some(PacketRecord {
            timestamp: self.current,
            ip_id: self.ip_id.next(),
            ip_ttl: self.ip_ttl.next(),
            ip_len: self.ip_len.next(),
            tcp: self.tcp.as_mut().map(|tcp| TcpRecord {
                seq: tcp.seq.next(),
                ack: tcp.ack.next(),
                flags: tcp.flags.next().map(TcpFlags::from_bits_truncate),
                win: tcp.win.next(),
            }),
        })
    }
}
