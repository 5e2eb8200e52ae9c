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

use std::sync::atomic::{AtomicU64, Ordering};

use public::ewma::{AtomicEwma, AtomicWindow};

use crate::common::{enums::FlowType, timestamp::MICROS_IN_SECOND};

/// Parser wide packet statistics, updated lock free from the sniffer and
/// the collector.
#[derive(Debug, Default)]
pub struct ParserStats {
    rx: AtomicWindow,
    pkts_this_period: AtomicU64,
    avg_pps: AtomicEwma,
    tcp_pkts: AtomicU64,
    udp_pkts: AtomicU64,
    time_collecting: AtomicU64,
    flows_collected: AtomicU64,
}

impl ParserStats {
    pub fn record_packet(&self, timestamp: u64, flow_type: FlowType) {
        self.pkts_this_period.fetch_add(1, Ordering::Relaxed);
        self.rx.observe(timestamp);
        match flow_type {
            FlowType::Tcp => self.tcp_pkts.fetch_add(1, Ordering::Relaxed),
            FlowType::Udp => self.udp_pkts.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Folds the packets seen since the last call into the average rate.
    pub fn tick(&self, interval_micros: u64) {
        let n = self.pkts_this_period.swap(0, Ordering::AcqRel);
        let n = match interval_micros {
            0 => n,
            i => n.saturating_mul(MICROS_IN_SECOND) / i,
        };
        self.avg_pps.update(n);
    }

    pub fn record_collection(&self, micros: u64, flows: u64) {
        self.time_collecting.fetch_add(micros, Ordering::Relaxed);
        self.flows_collected.fetch_add(flows, Ordering::Relaxed);
    }

    pub fn first_rx(&self) -> Option<u64> {
        self.rx.first()
    }

    pub fn last_rx(&self) -> Option<u64> {
        self.rx.last()
    }

    pub fn avg_pps(&self) -> f64 {
        self.avg_pps.value()
    }

    pub fn tcp_pkts(&self) -> u64 {
        self.tcp_pkts.load(Ordering::Relaxed)
    }

    pub fn udp_pkts(&self) -> u64 {
        self.udp_pkts.load(Ordering::Relaxed)
    }

    pub fn time_collecting(&self) -> u64 {
        self.time_collecting.load(Ordering::Relaxed)
    }

    pub fn flows_collected(&self) -> u64 {
        self.flows_collected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_and_window() {
        let stats = ParserStats::default();
        assert_eq!(stats.first_rx(), None);
        for ts in [300, 100, 200] {
            stats.record_packet(ts, FlowType::Tcp);
        }
        stats.record_packet(250, FlowType::Udp);
        assert_eq!(stats.first_rx(), Some(100));
        assert_eq!(stats.last_rx(), Some(300));
        assert_eq!((stats.tcp_pkts(), stats.udp_pkts()), (3, 1));

        stats.tick(MICROS_IN_SECOND);
        assert!((stats.avg_pps() - 4.0 * 0.35).abs() < 0.01);
        stats.tick(MICROS_IN_SECOND);
        assert!(stats.avg_pps() < 4.0 * 0.35);

        stats.record_collection(10, 2);
        stats.record_collection(5, 1);
        assert_eq!(stats.time_collecting(), 15);
        assert_eq!(stats.flows_collected(), 3);
    }
}
