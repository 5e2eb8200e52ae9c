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

use std::fmt;

use parking_lot::MutexGuard;

use public::codecs::Run;

use super::{
    flow::{EncodingInfo, Flow, FlowState, FlowSummary, PacketRecord, TcpFlow},
    flow_table::FlowRef,
};
use crate::common::flow_id::FlowId;

/// An external reference to a live flow.
///
/// While any view exists the flow is marked `ITERATED_OVER` and the collector
/// leaves it in the table. Dropping the last view makes it collectable again.
pub struct FlowView {
    id: FlowId,
    flow: FlowRef,
}

impl FlowView {
    pub(crate) fn acquire(id: FlowId, flow: FlowRef) -> Option<Self> {
        {
            let mut guard = flow.lock_live()?;
            if guard.info().state.contains(FlowState::PASSIVE_TIMED_OUT) {
                return None;
            }
            guard.info_mut().acquire_ref();
        }
        Some(Self { id, flow })
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    /// Locks the flow for reading. Returns `None` once the flow has been
    /// dumped and its storage reclaimed.
    pub fn lock(&self) -> Option<MutexGuard<'_, Flow>> {
        self.flow.lock_live()
    }

    pub fn with<R, F: FnOnce(&Flow) -> R>(&self, f: F) -> Option<R> {
        self.lock().map(|flow| f(&flow))
    }

    pub fn summary(&self) -> Option<FlowSummary> {
        self.with(Flow::summary)
    }

    pub fn encoding_info(&self) -> Option<EncodingInfo> {
        self.with(Flow::encoding_info)
    }

    pub fn size_bytes(&self) -> Option<usize> {
        self.with(Flow::size_bytes)
    }

    /// Copies out every recorded packet.
    pub fn packets(&self) -> Option<Vec<PacketRecord>> {
        self.with(|flow| flow.packets().collect())
    }

    pub fn ip_id_encoded(&self) -> Option<Vec<Run<u16>>> {
        self.with(|flow| flow.base().ip_id_encoded().to_vec())
    }

    pub fn ip_ttl_encoded(&self) -> Option<Vec<Run<u8>>> {
        self.with(|flow| flow.base().ip_ttl_encoded().to_vec())
    }

    pub fn ip_len_encoded(&self) -> Option<Vec<Run<u16>>> {
        self.with(|flow| flow.base().ip_len_encoded().to_vec())
    }

    // the tcp accessors return None for udp flows too
    fn with_tcp<R, F: FnOnce(&TcpFlow) -> R>(&self, f: F) -> Option<R> {
        self.with(|flow| match flow {
            Flow::Tcp(tcp) => Some(f(tcp)),
            Flow::Udp(_) => None,
        })
        .flatten()
    }

    pub fn seq_encoded(&self) -> Option<Vec<Run<u32>>> {
        self.with_tcp(|flow| flow.seq_encoded().to_vec())
    }

    pub fn ack_encoded(&self) -> Option<Vec<Run<u32>>> {
        self.with_tcp(|flow| flow.ack_encoded().to_vec())
    }

    pub fn flags_encoded(&self) -> Option<Vec<Run<u8>>> {
        self.with_tcp(|flow| flow.flags_encoded().to_vec())
    }

    pub fn win_encoded(&self) -> Option<Vec<Run<u16>>> {
        self.with_tcp(|flow| flow.win_encoded().to_vec())
    }
}

impl fmt::Debug for FlowView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowView")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .finish()
    }
}

impl Drop for FlowView {
    fn drop(&mut self) {
        if let Some(mut flow) = self.flow.lock_live() {
            // a flow being torn down keeps its flags
            if !flow.info().state.contains(FlowState::PASSIVE_TIMED_OUT) {
                flow.info_mut().release_ref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::{FlowType, TcpFlags};
    use crate::flow_generator::{
        flow::tests::{tcp_packet, udp_packet},
        FlowConfig, FlowTable,
    };

    fn flow_id(flow_type: FlowType) -> FlowId {
        FlowId::new(
            flow_type,
            Ipv4Addr::new(10, 1, 1, 1).into(),
            33000,
            Ipv4Addr::new(10, 1, 1, 2).into(),
            80,
        )
    }

    #[test]
    fn encoded_runs() {
        let table = FlowTable::new(4, 0);
        let key = flow_id(FlowType::Tcp);
        let flow = table.lookup_or_create(&key).unwrap();
        for i in 0..4u16 {
            flow.lock()
                .apply_packet(
                    &tcp_packet(10 + i, 64, 100 * i as u32, TcpFlags::ACK),
                    i as u64,
                    &FlowConfig::default(),
                )
                .unwrap();
        }

        let view = table.lookup(&key).unwrap();
        assert_eq!(
            view.ip_id_encoded().unwrap(),
            vec![Run {
                base: 10,
                stride: 1,
                count: 3
            }]
        );
        assert_eq!(
            view.seq_encoded().unwrap(),
            vec![Run {
                base: 0,
                stride: 100,
                count: 3
            }]
        );
        assert_eq!(view.flags_encoded().unwrap().len(), 1);
        assert_eq!(view.packets().unwrap().len(), 4);
    }

    #[test]
    fn udp_flows_have_no_tcp_runs() {
        let table = FlowTable::new(4, 0);
        let key = flow_id(FlowType::Udp);
        let flow = table.lookup_or_create(&key).unwrap();
        flow.lock()
            .apply_packet(&udp_packet(1), 1, &FlowConfig::default())
            .unwrap();

        let view = table.lookup(&key).unwrap();
        assert!(view.seq_encoded().is_none());
        assert!(view.win_encoded().is_none());
        assert_eq!(view.ip_ttl_encoded().unwrap().len(), 1);
    }

    #[test]
    fn reclaimed_flow_reads_nothing() {
        let table = FlowTable::new(4, 0);
        let key = flow_id(FlowType::Udp);
        let flow = table.lookup_or_create(&key).unwrap();
        flow.lock()
            .apply_packet(&udp_packet(1), 1, &FlowConfig::default())
            .unwrap();
        let view = table.lookup(&key).unwrap();

        let flow = table.remove(&key).unwrap();
        assert!(table.free(FlowType::Udp, &flow));
        assert!(view.summary().is_none());
        assert!(view.ip_id_encoded().is_none());
        drop(view);
    }
}
