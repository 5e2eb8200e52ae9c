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
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use crate::common::{duration_to_micros, flow_id::FlowId};
use crate::dumper::DumpQueue;
use crate::error::{Error, Result};
use crate::flow_generator::{FlowState, FlowTable};
use crate::utils::{
    stats::ParserStats,
    status::{AtomicStatus, Status},
};

#[derive(Default)]
pub struct CollectorCounter {
    passes: AtomicU64,
    overruns: AtomicU64,
    collected: AtomicU64,
    // expired but still referenced by a view
    deferred: AtomicU64,
}

impl RefCountable for CollectorCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "passes",
                CounterType::Counted,
                CounterValue::Unsigned(self.passes.swap(0, Ordering::Relaxed)),
            ),
            (
                "overruns",
                CounterType::Counted,
                CounterValue::Unsigned(self.overruns.swap(0, Ordering::Relaxed)),
            ),
            (
                "collected",
                CounterType::Counted,
                CounterValue::Unsigned(self.collected.swap(0, Ordering::Relaxed)),
            ),
            (
                "deferred",
                CounterType::Counted,
                CounterValue::Unsigned(self.deferred.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

struct Context {
    table: Arc<FlowTable>,
    queue: Arc<DumpQueue>,
    stats: Arc<ParserStats>,
    counter: Arc<CollectorCounter>,
    interval: Duration,
    // live captures advance the clock even when no packet arrives
    live_clock: bool,
    // cleared when the thread is torn down without handing flows over
    final_pass: AtomicBool,
}

impl Context {
    fn now(&self) -> u64 {
        let trace = self.stats.last_rx().unwrap_or(0);
        if !self.live_clock {
            return trace;
        }
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_to_micros)
            .unwrap_or(0);
        trace.max(wall)
    }

    fn collect(&self, now: u64, force: bool) -> usize {
        let start = Instant::now();
        let interval = duration_to_micros(self.interval);
        let mut pending: Vec<FlowId> = vec![];
        let mut referenced = 0;
        {
            let flows = self.table.read();
            for (id, flow) in flows.iter() {
                let mut flow = flow.lock();
                flow.update_rates(interval);
                let iterated = flow.info().state.contains(FlowState::ITERATED_OVER);
                if !force && !flow.is_expired(now) {
                    continue;
                }
                if iterated {
                    referenced += 1;
                    if !force {
                        continue;
                    }
                }
                flow.info_mut()
                    .state
                    .insert(FlowState::PASSIVE_TIMED_OUT);
                pending.push(*id);
            }
        }

        let collected = self
            .table
            .remove_with(&pending, |id, flow| self.queue.enqueue(id, flow));

        self.counter.passes.fetch_add(1, Ordering::Relaxed);
        self.counter
            .collected
            .fetch_add(collected as u64, Ordering::Relaxed);
        if force {
            if referenced > 0 {
                warn!(
                    "{} flows still referenced externally were force collected",
                    referenced
                );
            }
        } else {
            self.counter
                .deferred
                .fetch_add(referenced as u64, Ordering::Relaxed);
        }
        self.stats
            .record_collection(duration_to_micros(start.elapsed()), collected as u64);
        if collected > 0 {
            debug!("collected {} flows at {}", collected, now);
        }
        collected
    }

    fn run(&self, running: &(Mutex<bool>, Condvar)) {
        let interval_micros = duration_to_micros(self.interval);
        loop {
            let start = Instant::now();
            self.stats.tick(interval_micros);
            self.collect(self.now(), false);
            let elapsed = start.elapsed();

            let (lock, timer) = running;
            let mut guard = lock.lock();
            if !*guard {
                break;
            }
            if elapsed >= self.interval {
                self.counter.overruns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "collection took {:?}, longer than interval {:?}",
                    elapsed, self.interval
                );
                continue;
            }
            timer.wait_for(&mut guard, self.interval - elapsed);
            if !*guard {
                break;
            }
        }

        if !self.final_pass.load(Ordering::Acquire) {
            debug!("collector aborted, final collection skipped");
            return;
        }
        let collected = self.collect(u64::MAX, true);
        info!("final collection moved {} flows to the dumper", collected);
    }
}

/// Periodically moves expired flows from the table to the dump queue.
pub struct Collector {
    context: Arc<Context>,
    running: Arc<(Mutex<bool>, Condvar)>,
    status: AtomicStatus,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(
        table: Arc<FlowTable>,
        queue: Arc<DumpQueue>,
        stats: Arc<ParserStats>,
        interval: Duration,
        live_clock: bool,
    ) -> Self {
        Self {
            context: Arc::new(Context {
                table,
                queue,
                stats,
                counter: Default::default(),
                interval,
                live_clock,
                final_pass: AtomicBool::new(true),
            }),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            status: Default::default(),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        if !self.status.transition(Status::NotStarted, Status::Running) {
            return Err(Error::AlreadyStarted("collector"));
        }
        *self.running.0.lock() = true;

        let context = self.context.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("flow-collector".to_owned())
            .spawn(move || context.run(&running))
            .map_err(|e| {
                *self.running.0.lock() = false;
                self.status.store(Status::NotStarted);
                e
            })?;
        *self.thread.lock() = Some(handle);
        info!("collector started");
        Ok(())
    }

    /// Stops the periodic passes and runs the final pass, which hands every
    /// remaining flow to the dump queue.
    pub fn stop(&self) {
        if !self.status.transition(Status::Running, Status::BeingKilled) {
            return;
        }
        if !self.halt() {
            // the periodic pass died, make sure nothing is left behind
            self.context.collect(u64::MAX, true);
        }
        self.status.store(Status::Killed);
        info!("collector stopped");
    }

    /// Stops the thread without the final pass, leaving every flow in the
    /// table. The collector can be started again afterwards.
    pub fn abort(&self) {
        if !self.status.transition(Status::Running, Status::BeingKilled) {
            return;
        }
        self.context.final_pass.store(false, Ordering::Release);
        self.halt();
        self.context.final_pass.store(true, Ordering::Release);
        self.status.store(Status::NotStarted);
        info!("collector aborted");
    }

    // returns false if the thread panicked
    fn halt(&self) -> bool {
        {
            let (lock, timer) = &*self.running;
            *lock.lock() = false;
            timer.notify_one();
        }
        match self.thread.lock().take() {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("collector thread panicked");
                    false
                } else {
                    true
                }
            }
            None => true,
        }
    }

    /// Runs one pass immediately, treating `now` as the current time.
    pub fn collect_now(&self, now: u64) -> usize {
        self.context.collect(now, false)
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn counter(&self) -> &Arc<CollectorCounter> {
        &self.context.counter
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::enums::FlowType;
    use crate::flow_generator::{flow::tests::udp_packet, FlowConfig};

    const TIMEOUT: u64 = 1_000;

    struct Fixture {
        table: Arc<FlowTable>,
        queue: Arc<DumpQueue>,
        stats: Arc<ParserStats>,
        config: FlowConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                table: Arc::new(FlowTable::new(8, 0)),
                queue: Arc::new(DumpQueue::new()),
                stats: Arc::new(ParserStats::default()),
                config: FlowConfig {
                    flow_timeout: TIMEOUT,
                    ..Default::default()
                },
            }
        }

        fn collector(&self, interval: Duration) -> Collector {
            Collector::new(
                self.table.clone(),
                self.queue.clone(),
                self.stats.clone(),
                interval,
                false,
            )
        }

        fn feed(&self, port: u16, ts: u64) -> FlowId {
            let id = FlowId::new(
                FlowType::Udp,
                Ipv4Addr::new(192, 0, 2, 1).into(),
                port,
                Ipv4Addr::new(192, 0, 2, 2).into(),
                53,
            );
            let flow = self.table.lookup_or_create(&id).unwrap();
            flow.lock()
                .apply_packet(&udp_packet(port), ts, &self.config)
                .unwrap();
            self.stats.record_packet(ts, FlowType::Udp);
            id
        }
    }

    #[test]
    fn expired_flows_move_to_queue() {
        let fx = Fixture::new();
        let collector = fx.collector(Duration::from_secs(1));
        let early = fx.feed(1, 0);
        let late = fx.feed(2, 500);

        assert_eq!(collector.collect_now(TIMEOUT), 0);
        assert_eq!(collector.collect_now(TIMEOUT + 1), 1);
        assert!(fx.table.find(&early).is_none());
        assert!(fx.table.find(&late).is_some());
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.stats.flows_collected(), 1);
    }

    #[test]
    fn referenced_flows_are_deferred() {
        let fx = Fixture::new();
        let collector = fx.collector(Duration::from_secs(1));
        let id = fx.feed(1, 0);

        let view = fx.table.lookup(&id).unwrap();
        assert_eq!(collector.collect_now(TIMEOUT * 10), 0);
        assert!(fx.table.find(&id).is_some());
        assert_eq!(collector.counter().get_counters()[3].2, CounterValue::Unsigned(1));

        drop(view);
        assert_eq!(collector.collect_now(TIMEOUT * 10), 1);
        assert!(fx.table.is_empty());
    }

    #[test]
    fn collected_flows_reject_packets() {
        let fx = Fixture::new();
        let collector = fx.collector(Duration::from_secs(1));
        let id = fx.feed(1, 0);
        let flow = fx.table.find(&id).unwrap();
        collector.collect_now(TIMEOUT + 1);
        assert!(flow
            .lock()
            .apply_packet(&udp_packet(1), TIMEOUT + 2, &fx.config)
            .is_err());
    }

    #[test]
    fn stop_runs_final_pass() {
        let fx = Fixture::new();
        let collector = fx.collector(Duration::from_millis(10));
        for port in 0..5 {
            fx.feed(port, port as u64);
        }
        // a referenced flow is force collected too
        let view = fx.table.lookup(&FlowId::new(
            FlowType::Udp,
            Ipv4Addr::new(192, 0, 2, 1).into(),
            0,
            Ipv4Addr::new(192, 0, 2, 2).into(),
            53,
        ));
        assert!(view.is_some());

        collector.start().unwrap();
        assert!(matches!(collector.start(), Err(Error::AlreadyStarted(_))));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fx.queue.len(), 0);
        collector.stop();

        assert_eq!(collector.status(), Status::Killed);
        assert!(fx.table.is_empty());
        assert_eq!(fx.queue.len(), 5);
        // the view outlives the flow's place in the table and releases nothing
        drop(view);
    }

    #[test]
    fn abort_keeps_flows_and_allows_restart() {
        let fx = Fixture::new();
        let collector = fx.collector(Duration::from_millis(10));
        for port in 0..3 {
            fx.feed(port, port as u64);
        }
        collector.start().unwrap();
        collector.abort();
        assert_eq!(collector.status(), Status::NotStarted);
        assert_eq!(fx.table.len(), 3);
        assert_eq!(fx.queue.len(), 0);

        collector.start().unwrap();
        collector.stop();
        assert!(fx.table.is_empty());
        assert_eq!(fx.queue.len(), 3);
    }
}
