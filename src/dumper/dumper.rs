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

use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use super::dump_queue::DumpQueue;
use crate::common::flow_id::FlowId;
use crate::error::{Error, Result};
use crate::flow_generator::{Flow, FlowRef, FlowTable, TcpFlow, UdpFlow};
use crate::utils::status::{AtomicStatus, Status};

/// Consumer of completed flows.
///
/// Each flow is handed over exactly once, from the dumper thread, with the
/// flow locked. Its storage is reclaimed as soon as the call returns.
pub trait FlowSink: Send + Sync {
    fn on_tcp_flow(&self, id: &FlowId, flow: &TcpFlow);
    fn on_udp_flow(&self, id: &FlowId, flow: &UdpFlow);
    // called once after the parser has fully stopped
    fn on_stop(&self) {}
}

/// Non-owning reference to the registered sink.
#[derive(Default)]
pub struct SinkSlot(RwLock<Option<Weak<dyn FlowSink>>>);

impl SinkSlot {
    pub fn set<S: FlowSink + 'static>(&self, sink: &Arc<S>) {
        let sink: Arc<dyn FlowSink> = sink.clone();
        *self.0.write() = Some(Arc::downgrade(&sink));
    }

    pub fn clear(&self) -> Option<Arc<dyn FlowSink>> {
        self.0.write().take().and_then(|w| w.upgrade())
    }

    pub fn get(&self) -> Option<Arc<dyn FlowSink>> {
        self.0.read().as_ref().and_then(|w| w.upgrade())
    }
}

#[derive(Default)]
pub struct DumperCounter {
    dumped: AtomicU64,
    sink_missing: AtomicU64,
    batches: AtomicU64,
    sink_panicked: AtomicU64,
}

impl RefCountable for DumperCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "dumped",
                CounterType::Counted,
                CounterValue::Unsigned(self.dumped.swap(0, Ordering::Relaxed)),
            ),
            (
                "sink_missing",
                CounterType::Counted,
                CounterValue::Unsigned(self.sink_missing.swap(0, Ordering::Relaxed)),
            ),
            (
                "batches",
                CounterType::Counted,
                CounterValue::Unsigned(self.batches.swap(0, Ordering::Relaxed)),
            ),
            (
                "sink_panicked",
                CounterType::Counted,
                CounterValue::Unsigned(self.sink_panicked.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

struct DumpContext {
    queue: Arc<DumpQueue>,
    table: Arc<FlowTable>,
    sink: Arc<SinkSlot>,
    counter: Arc<DumperCounter>,
    batch_size: usize,
}

impl DumpContext {
    fn run(&self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        while self.queue.recv_batch(self.batch_size, &mut batch) {
            self.counter.batches.fetch_add(1, Ordering::Relaxed);
            for (id, flow) in batch.drain(..) {
                self.dump(&id, &flow);
            }
        }
        debug!("dump queue drained");
    }

    fn dump(&self, id: &FlowId, flow: &FlowRef) {
        let sink = self.sink.get();
        {
            let guard = flow.lock();
            match sink {
                Some(sink) => {
                    let handed = panic::catch_unwind(AssertUnwindSafe(|| match &*guard {
                        Flow::Tcp(f) => sink.on_tcp_flow(id, f),
                        Flow::Udp(f) => sink.on_udp_flow(id, f),
                    }));
                    match handed {
                        Ok(()) => {
                            self.counter.dumped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            self.counter.sink_panicked.fetch_add(1, Ordering::Relaxed);
                            warn!("flow sink panicked on {}", id);
                        }
                    }
                }
                None => {
                    self.counter.sink_missing.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.table.free(id.flow_type, flow);
    }
}

pub struct Dumper {
    context: Arc<DumpContext>,
    status: AtomicStatus,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dumper {
    pub fn new(
        queue: Arc<DumpQueue>,
        table: Arc<FlowTable>,
        sink: Arc<SinkSlot>,
        batch_size: usize,
    ) -> Self {
        Self {
            context: Arc::new(DumpContext {
                queue,
                table,
                sink,
                counter: Default::default(),
                batch_size: batch_size.max(1),
            }),
            status: Default::default(),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        if !self.status.transition(Status::NotStarted, Status::Running) {
            return Err(Error::AlreadyStarted("dumper"));
        }
        let context = self.context.clone();
        let handle = thread::Builder::new()
            .name("flow-dumper".to_owned())
            .spawn(move || context.run())
            .map_err(|e| {
                self.status.store(Status::NotStarted);
                e
            })?;
        *self.thread.lock() = Some(handle);
        info!("dumper started");
        Ok(())
    }

    /// Waits for every queued flow to be dumped. Must only be called after
    /// the last flow has been enqueued. When called from a sink, the queue
    /// is drained on the calling thread instead.
    pub fn stop(&self) {
        if !self.status.transition(Status::Running, Status::BeingKilled) {
            return;
        }
        self.halt();
        self.status.store(Status::Killed);
        info!("dumper stopped");
    }

    /// Dumps what is already queued, then leaves the dumper ready to be
    /// started again.
    pub fn abort(&self) {
        if !self.status.transition(Status::Running, Status::BeingKilled) {
            return;
        }
        self.halt();
        self.context.queue.revive();
        self.status.store(Status::NotStarted);
        info!("dumper aborted");
    }

    fn halt(&self) {
        self.context.queue.kill();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                debug!("dumper stopping from its own thread");
                self.context.run();
            } else if handle.join().is_err() {
                error!("dumper thread panicked");
            }
        }
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn counter(&self) -> &Arc<DumperCounter> {
        &self.context.counter
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::enums::FlowType;
    use crate::flow_generator::{flow::tests::udp_packet, FlowConfig, FlowState};

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) flows: Mutex<Vec<(FlowId, u64)>>,
        pub(crate) stopped: Mutex<u32>,
    }

    impl FlowSink for RecordingSink {
        fn on_tcp_flow(&self, id: &FlowId, flow: &TcpFlow) {
            self.flows.lock().push((*id, flow.base().info.size_pkts));
        }

        fn on_udp_flow(&self, id: &FlowId, flow: &UdpFlow) {
            assert!(flow.base().info.state.contains(FlowState::PASSIVE_TIMED_OUT));
            self.flows.lock().push((*id, flow.base().info.size_pkts));
        }

        fn on_stop(&self) {
            *self.stopped.lock() += 1;
        }
    }

    fn enqueue_flows(table: &FlowTable, queue: &DumpQueue, n: u16) {
        let config = FlowConfig::default();
        for port in 0..n {
            let id = FlowId::new(
                FlowType::Udp,
                Ipv4Addr::new(10, 9, 9, 9).into(),
                port,
                Ipv4Addr::new(10, 9, 9, 1).into(),
                53,
            );
            let flow = table.lookup_or_create(&id).unwrap();
            {
                let mut f = flow.lock();
                f.apply_packet(&udp_packet(port), 1, &config).unwrap();
                f.info_mut().state.insert(FlowState::PASSIVE_TIMED_OUT);
            }
            table.remove_with(&[id], |id, flow| queue.enqueue(id, flow));
        }
    }

    #[test]
    fn dumps_everything_then_frees() {
        let table = Arc::new(FlowTable::new(8, 0));
        let queue = Arc::new(DumpQueue::new());
        let slot = Arc::new(SinkSlot::default());
        let sink = Arc::new(RecordingSink::default());
        slot.set(&sink);

        let dumper = Dumper::new(queue.clone(), table.clone(), slot, 4);
        dumper.start().unwrap();
        assert!(matches!(dumper.start(), Err(Error::AlreadyStarted(_))));
        enqueue_flows(&table, &queue, 20);
        dumper.stop();

        assert_eq!(dumper.status(), Status::Killed);
        assert!(queue.is_empty());
        assert_eq!(table.udp_flows(), 0);
        let flows = sink.flows.lock();
        assert_eq!(flows.len(), 20);
        assert!(flows.iter().all(|(_, pkts)| *pkts == 1));
        let counters = dumper.counter().get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(20));
    }

    #[test]
    fn missing_sink_still_frees() {
        let table = Arc::new(FlowTable::new(8, 0));
        let queue = Arc::new(DumpQueue::new());
        let slot = Arc::new(SinkSlot::default());
        {
            let sink = Arc::new(RecordingSink::default());
            slot.set(&sink);
        }
        assert!(slot.get().is_none());

        let dumper = Dumper::new(queue.clone(), table.clone(), slot, 4);
        enqueue_flows(&table, &queue, 3);
        dumper.start().unwrap();
        dumper.stop();
        assert_eq!(table.udp_flows(), 0);
        let counters = dumper.counter().get_counters();
        assert_eq!(counters[1].2, CounterValue::Unsigned(3));
    }

    struct PanickingSink {
        dumped: Mutex<Vec<u16>>,
    }

    impl FlowSink for PanickingSink {
        fn on_tcp_flow(&self, _: &FlowId, _: &TcpFlow) {}

        fn on_udp_flow(&self, id: &FlowId, _: &UdpFlow) {
            if id.src_port == 1 {
                panic!("sink failure");
            }
            self.dumped.lock().push(id.src_port);
        }
    }

    #[test]
    fn panicking_sink_keeps_dumping() {
        let table = Arc::new(FlowTable::new(8, 0));
        let queue = Arc::new(DumpQueue::new());
        let slot = Arc::new(SinkSlot::default());
        let sink = Arc::new(PanickingSink {
            dumped: Mutex::new(vec![]),
        });
        slot.set(&sink);

        let dumper = Dumper::new(queue.clone(), table.clone(), slot, 1);
        enqueue_flows(&table, &queue, 4);
        dumper.start().unwrap();
        dumper.stop();

        assert_eq!(dumper.status(), Status::Killed);
        assert_eq!(table.udp_flows(), 0);
        assert_eq!(*sink.dumped.lock(), vec![0, 2, 3]);
        let counters = dumper.counter().get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(3));
        assert_eq!(counters[3].2, CounterValue::Unsigned(1));
    }

    #[test]
    fn abort_allows_restart() {
        let table = Arc::new(FlowTable::new(8, 0));
        let queue = Arc::new(DumpQueue::new());
        let slot = Arc::new(SinkSlot::default());
        let sink = Arc::new(RecordingSink::default());
        slot.set(&sink);

        let dumper = Dumper::new(queue.clone(), table.clone(), slot, 4);
        dumper.start().unwrap();
        enqueue_flows(&table, &queue, 2);
        dumper.abort();
        assert_eq!(dumper.status(), Status::NotStarted);
        assert!(!queue.is_killed());
        assert_eq!(sink.flows.lock().len(), 2);

        dumper.start().unwrap();
        enqueue_flows(&table, &queue, 3);
        dumper.stop();
        assert_eq!(sink.flows.lock().len(), 5);
        assert_eq!(table.udp_flows(), 0);
    }

    #[test]
    fn slot_clear() {
        let slot = SinkSlot::default();
        let sink = Arc::new(RecordingSink::default());
        slot.set(&sink);
        assert!(slot.get().is_some());
        assert!(slot.clear().is_some());
        assert!(slot.get().is_none());
    }
}
