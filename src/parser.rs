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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use log::{error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use public::counter::{Countable, Counter, RefCountable};

use crate::collector::Collector;
use crate::common::{FlowId, FlowType, HeaderFields};
use crate::config::Config;
use crate::dumper::{DumpQueue, Dumper, FlowSink, SinkSlot};
use crate::error::{Error, Result};
use crate::flow_generator::{sort_flows, EncodingInfo, FlowTable, FlowView, SortOrder};
use crate::sniffer::{
    CaptureInfo, Ingest, PacketSource, PcapFileSource, PcapLiveSource, Sniffer,
};
use crate::utils::{AtomicStatus, ParserStats, Status};

fn countable<C: RefCountable + 'static>(module: &'static str, counter: &Arc<C>) -> Countable {
    let counter: Arc<dyn RefCountable> = counter.clone();
    Countable::new(module, Arc::downgrade(&counter))
}

/// Point in time statistics of a running parser.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParserInfo {
    pub status: Option<Status>,
    pub avg_pps: f64,
    pub tcp_flows: usize,
    pub udp_flows: usize,
    // slots allocated by both arenas, in use or free
    pub arena_slots: usize,
    pub tcp_pkts: u64,
    pub udp_pkts: u64,
    pub encoding: EncodingInfo,
    // approximate memory held by flows still in the table
    pub size_bytes: usize,
    // micros spent in collection passes
    pub time_collecting: u64,
    pub flows_collected: u64,
    pub first_rx: Option<u64>,
    pub last_rx: Option<u64>,
    pub capture: CaptureInfo,
}

struct Inner {
    table: Arc<FlowTable>,
    stats: Arc<ParserStats>,
    sink: Arc<SinkSlot>,
    ingest: Arc<Ingest>,
    sniffer: Option<Sniffer>,
    collector: Collector,
    dumper: Dumper,
    capture: CaptureInfo,
    countables: Vec<Countable>,
    kill: Arc<AtomicBool>,
    // held shared by injecting callers, shutdown takes it once to wait them out
    inject_gate: RwLock<()>,
    status: AtomicStatus,
    stopped: (Mutex<bool>, Condvar),
}

impl Inner {
    // returns false when another caller already owns the shutdown
    fn shutdown(&self) -> bool {
        if self
            .kill
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let started = self.status.transition(Status::Running, Status::BeingKilled);
        info!("parser stopping");
        // producers first, so the final collection sees every packet
        if let Some(sniffer) = &self.sniffer {
            sniffer.stop();
        }
        drop(self.inject_gate.write());
        self.collector.stop();
        self.dumper.stop();
        if !started && !self.table.is_empty() {
            warn!(
                "parser stopped before start, {} flows discarded",
                self.table.len()
            );
        }
        if let Some(sink) = self.sink.clear() {
            sink.on_stop();
        }
        self.status.store(Status::Killed);
        let (lock, cond) = &self.stopped;
        *lock.lock() = true;
        cond.notify_all();
        info!("parser stopped");
        true
    }

    fn wait(&self) {
        let (lock, cond) = &self.stopped;
        let mut stopped = lock.lock();
        while !*stopped {
            cond.wait(&mut stopped);
        }
    }
}

/// Owns the flow table and the sniffer, collector and dumper activities.
///
/// Dropping the context stops it.
pub struct ParserContext {
    inner: Arc<Inner>,
}

impl ParserContext {
    /// Opens the configured device or file.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let source: Box<dyn PacketSource> = if config.is_file {
            Box::new(PcapFileSource::open(&config.source, &config.filter)?)
        } else {
            Box::new(PcapLiveSource::open(
                &config.source,
                &config.filter,
                config.snaplen,
                config.poll_timeout,
            )?)
        };
        Ok(Self::build(config, Some(source)))
    }

    /// Reads packets from `source` instead of opening `config.source`.
    pub fn with_source(config: &Config, source: Box<dyn PacketSource>) -> Self {
        Self::build(config, Some(source))
    }

    /// A context fed only through [`ParserContext::handle_packet`], driven
    /// by trace time.
    pub fn without_source(config: &Config) -> Self {
        Self::build(config, None)
    }

    fn build(config: &Config, source: Option<Box<dyn PacketSource>>) -> Self {
        let table = Arc::new(FlowTable::new(config.arena_page_size, config.max_flows));
        let queue = Arc::new(DumpQueue::new());
        let stats = Arc::new(ParserStats::default());
        let sink = Arc::new(SinkSlot::default());
        let ingest = Arc::new(Ingest::new(
            table.clone(),
            stats.clone(),
            config.flow_config(),
        ));
        let kill = Arc::new(AtomicBool::new(false));

        let live_clock = source.as_ref().map(|s| !s.is_file()).unwrap_or(false);
        let capture = CaptureInfo {
            source: config.source.clone(),
            is_file: !live_clock,
            filter: config.filter.clone(),
            snaplen: config.snaplen,
            ..Default::default()
        };
        let sniffer =
            source.map(|s| Sniffer::new(s, capture.clone(), ingest.clone(), kill.clone()));
        let collector = Collector::new(
            table.clone(),
            queue.clone(),
            stats.clone(),
            config.collect_interval,
            live_clock,
        );
        let dumper = Dumper::new(queue, table.clone(), sink.clone(), config.dump_batch_size);
        let countables = vec![
            countable("flow_table", table.counter()),
            countable("tcp_arena", table.arena_counter(FlowType::Tcp)),
            countable("udp_arena", table.arena_counter(FlowType::Udp)),
            countable("sniffer", ingest.counter()),
            countable("collector", collector.counter()),
            countable("dumper", dumper.counter()),
        ];

        Self {
            inner: Arc::new(Inner {
                table,
                stats,
                sink,
                ingest,
                sniffer,
                collector,
                dumper,
                capture,
                countables,
                kill,
                inject_gate: RwLock::new(()),
                status: Default::default(),
                stopped: (Mutex::new(false), Condvar::new()),
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.kill.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        if !inner.status.transition(Status::NotStarted, Status::Running) {
            return Err(Error::AlreadyStarted("parser"));
        }
        if let Err(e) = self.start_activities() {
            error!("parser start failed: {}", e);
            // reverse order, flows stay in the table
            inner.collector.abort();
            inner.dumper.abort();
            inner.status.transition(Status::Running, Status::NotStarted);
            return Err(e);
        }
        info!("parser started");
        Ok(())
    }

    fn start_activities(&self) -> Result<()> {
        let inner = &self.inner;
        // consumers before producers
        inner.dumper.start()?;
        inner.collector.start()?;
        if let Some(sniffer) = &inner.sniffer {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            sniffer.start(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.shutdown();
                }
            })?;
        }
        Ok(())
    }

    /// Registers the consumer of completed flows. The context only keeps a
    /// weak reference, flows completed while no sink is alive are dropped.
    pub fn set_sink<S: FlowSink + 'static>(&self, sink: &Arc<S>) {
        self.inner.sink.set(sink);
    }

    pub fn clear_sink(&self) -> Option<Arc<dyn FlowSink>> {
        self.inner.sink.clear()
    }

    /// Records one already parsed packet.
    pub fn handle_packet(&self, fields: &HeaderFields, timestamp: u64) -> Result<()> {
        let _gate = self.inner.inject_gate.read();
        if self.inner.kill.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        self.inner.ingest.handle_fields(fields, timestamp)?;
        Ok(())
    }

    pub fn lookup(&self, id: &FlowId) -> Option<FlowView> {
        self.inner.table.lookup(id)
    }

    /// Every flow currently in the table. Flows stay out of collection
    /// until their views are dropped.
    pub fn snapshot(&self, order: SortOrder) -> Vec<FlowView> {
        sort_flows(self.inner.table.snapshot(), order)
    }

    /// Runs a collection pass immediately with `now` as the current time, in
    /// micros. Returns the number of flows handed to the dumper.
    pub fn collect_now(&self, now: u64) -> usize {
        self.inner.collector.collect_now(now)
    }

    pub fn stats(&self) -> ParserInfo {
        let inner = &self.inner;
        let mut encoding = EncodingInfo::default();
        let mut size_bytes = 0;
        for flow in inner.table.read().values() {
            if let Some(flow) = flow.lock_live() {
                encoding += flow.encoding_info();
                size_bytes += flow.size_bytes();
            }
        }
        let stats = &inner.stats;
        ParserInfo {
            status: Some(inner.status.load()),
            avg_pps: stats.avg_pps(),
            tcp_flows: inner.table.tcp_flows(),
            udp_flows: inner.table.udp_flows(),
            arena_slots: inner.table.arena_slots(),
            tcp_pkts: stats.tcp_pkts(),
            udp_pkts: stats.udp_pkts(),
            encoding,
            size_bytes,
            time_collecting: stats.time_collecting(),
            flows_collected: stats.flows_collected(),
            first_rx: stats.first_rx(),
            last_rx: stats.last_rx(),
            capture: match &inner.sniffer {
                Some(sniffer) => sniffer.capture_info(),
                None => inner.capture.clone(),
            },
        }
    }

    /// Counters of every module, keyed by module name. Counted values reset
    /// on each call.
    pub fn counters(&self) -> Vec<(&'static str, Vec<Counter>)> {
        self.inner
            .countables
            .iter()
            .map(|c| (c.module, c.get_counters()))
            .collect()
    }

    /// Stops capturing, hands every remaining flow to the sink and waits for
    /// the dumper to finish. Safe to call more than once and from several
    /// threads.
    pub fn stop(&self) {
        if !self.inner.shutdown() {
            self.inner.wait();
        }
    }

    /// Blocks until the parser has stopped, either through [`ParserContext::stop`]
    /// or because a file source reached its end.
    pub fn wait(&self) {
        self.inner.wait();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.0.lock()
    }

    pub fn status(&self) -> Status {
        self.inner.status.load()
    }
}

impl Drop for ParserContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::common::{LinkType, TcpFields, TcpFlags, Transport};
    use crate::dumper::RecordingSink;
    use crate::sniffer::MemorySource;
    use public::counter::{CounterType, CounterValue};
    use crate::flow_generator;

    fn udp(src_port: u16, ip_id: u16) -> HeaderFields {
        HeaderFields {
            src: Ipv4Addr::new(192, 168, 1, 1).into(),
            dst: Ipv4Addr::new(192, 168, 1, 2).into(),
            src_port,
            dst_port: 53,
            ip_id,
            ip_ttl: 64,
            ip_len: 60,
            transport: Transport::Udp,
        }
    }

    fn config() -> Config {
        Config {
            source: "test".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn injected_packets_reach_the_sink_on_stop() {
        let context = ParserContext::without_source(&config());
        let sink = Arc::new(RecordingSink::default());
        context.set_sink(&sink);
        context.start().unwrap();
        assert!(matches!(context.start(), Err(Error::AlreadyStarted(_))));

        for port in 1000..1010 {
            for i in 0..3u16 {
                context
                    .handle_packet(&udp(port, i), 1_000 + i as u64)
                    .unwrap();
            }
        }
        let info = context.stats();
        assert_eq!(info.udp_flows, 10);
        assert_eq!(info.udp_pkts, 30);
        assert_eq!(info.first_rx, Some(1_000));
        assert_eq!(info.last_rx, Some(1_002));
        assert!(info.size_bytes > 0);

        context.stop();
        assert!(context.is_stopped());
        assert_eq!(context.status(), Status::Killed);
        let flows = sink.flows.lock();
        assert_eq!(flows.len(), 10);
        assert!(flows.iter().all(|(_, pkts)| *pkts == 3));
        assert_eq!(*sink.stopped.lock(), 1);
        drop(flows);

        assert!(matches!(
            context.handle_packet(&udp(1000, 9), 2_000),
            Err(Error::Stopped)
        ));
        // a second stop is a no-op
        context.stop();
        assert_eq!(*sink.stopped.lock(), 1);
    }

    #[test]
    fn failed_start_leaves_nothing_running() {
        let source = Box::new(MemorySource::new(LinkType::Raw, vec![]));
        let context = ParserContext::with_source(&config(), source);
        let sink = Arc::new(RecordingSink::default());
        context.set_sink(&sink);
        context.handle_packet(&udp(1, 0), 10).unwrap();

        // the parser cannot start a sniffer that is already running
        let sniffer = context.inner.sniffer.as_ref().unwrap();
        sniffer.start(|| {}).unwrap();
        assert!(matches!(
            context.start(),
            Err(Error::AlreadyStarted("sniffer"))
        ));
        assert_eq!(context.status(), Status::NotStarted);
        assert_eq!(context.inner.collector.status(), Status::NotStarted);
        assert_eq!(context.inner.dumper.status(), Status::NotStarted);
        assert!(sink.flows.lock().is_empty());
        assert_eq!(context.inner.table.len(), 1);
        sniffer.stop();
    }

    #[test]
    fn packets_racing_stop_are_dumped_or_rejected() {
        let context = Arc::new(ParserContext::without_source(&config()));
        let sink = Arc::new(RecordingSink::default());
        context.set_sink(&sink);
        context.start().unwrap();

        let barrier = Arc::new(Barrier::new(5));
        let injectors: Vec<_> = (0..4u16)
            .map(|t| {
                let context = context.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut accepted = 0;
                    for i in 0..2000u16 {
                        match context.handle_packet(&udp(t * 2000 + i, 0), 10) {
                            Ok(()) => accepted += 1,
                            Err(Error::Stopped) => break,
                            Err(e) => panic!("unexpected error {}", e),
                        }
                    }
                    accepted
                })
            })
            .collect();
        barrier.wait();
        context.stop();

        let accepted: usize = injectors.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(sink.flows.lock().len(), accepted);
        assert!(context.inner.table.is_empty());
        assert_eq!(context.inner.table.udp_flows(), 0);
    }

    #[derive(Default)]
    struct StoppingSink {
        context: Mutex<Option<Arc<ParserContext>>>,
        dumped: Mutex<usize>,
    }

    impl FlowSink for StoppingSink {
        fn on_tcp_flow(&self, _: &FlowId, _: &flow_generator::TcpFlow) {}

        fn on_udp_flow(&self, _: &FlowId, _: &flow_generator::UdpFlow) {
            *self.dumped.lock() += 1;
            let context = self.context.lock().take();
            if let Some(context) = context {
                context.stop();
            }
        }
    }

    #[test]
    fn sink_can_stop_the_parser() {
        let config = Config {
            dump_batch_size: 1,
            ..config()
        };
        let context = Arc::new(ParserContext::without_source(&config));
        let sink = Arc::new(StoppingSink::default());
        *sink.context.lock() = Some(context.clone());
        context.set_sink(&sink);
        for port in 0..5 {
            context.handle_packet(&udp(port, 0), 10).unwrap();
        }
        context.start().unwrap();
        assert_eq!(context.collect_now(u64::MAX - 1), 5);

        context.wait();
        assert!(context.is_stopped());
        assert_eq!(*sink.dumped.lock(), 5);
        assert!(context.inner.table.is_empty());
    }

    #[test]
    fn rejected_packets_are_reported() {
        let context = ParserContext::without_source(&config());
        context.handle_packet(&udp(1, 0), 500).unwrap();
        assert!(matches!(
            context.handle_packet(&udp(1, 1), 400),
            Err(Error::Flow(flow_generator::Error::OutOfOrder { .. }))
        ));
        let view = context.lookup(&udp(1, 0).flow_id()).unwrap();
        assert_eq!(view.summary().unwrap().size_pkts, 1);
    }

    #[test]
    fn snapshot_is_sorted() {
        let context = ParserContext::without_source(&config());
        let tcp = HeaderFields {
            transport: Transport::Tcp(TcpFields {
                seq: 1,
                ack: 0,
                flags: TcpFlags::SYN,
                win: 100,
            }),
            ..udp(7, 0)
        };
        context.handle_packet(&tcp, 10).unwrap();
        for i in 0..5u16 {
            context.handle_packet(&udp(8, i), 10 + i as u64).unwrap();
        }
        let views = context.snapshot(SortOrder::Pkts);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].id().flow_type, FlowType::Udp);
        assert_eq!(views[1].id().flow_type, FlowType::Tcp);

        // referenced flows survive a pass that would otherwise expire them
        assert_eq!(context.collect_now(u64::MAX - 1), 0);
        drop(views);
        assert_eq!(context.collect_now(u64::MAX - 1), 2);
    }

    #[test]
    fn counters_cover_every_module() {
        let context = ParserContext::without_source(&config());
        context.handle_packet(&udp(1, 0), 10).unwrap();
        let counters = context.counters();
        let names: Vec<_> = counters.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["flow_table", "tcp_arena", "udp_arena", "sniffer", "collector", "dumper"]
        );
        assert_eq!(
            counters[0].1[0],
            ("new", CounterType::Counted, CounterValue::Unsigned(1))
        );
        assert_eq!(
            counters[2].1[0],
            ("allocated", CounterType::Counted, CounterValue::Unsigned(1))
        );
        // counted values reset once read
        assert_eq!(
            context.counters()[0].1[0].2,
            CounterValue::Unsigned(0)
        );
    }
}
