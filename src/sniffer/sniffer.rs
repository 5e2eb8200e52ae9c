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

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use super::source::{Next, Packet, PacketSource, SourceStats};
use crate::common::{header, HeaderFields};
use crate::error::{Error, Result};
use crate::flow_generator::{self, FlowConfig, FlowTable};
use crate::utils::{stats::ParserStats, status::AtomicStatus, status::Status};

// refresh the capture statistics snapshot every this many packets
const STATS_REFRESH_PACKETS: u64 = 1024;

#[derive(Default)]
pub struct SnifferCounter {
    rx: AtomicU64,
    rx_bytes: AtomicU64,
    parse_failed: AtomicU64,
    unsupported: AtomicU64,
    dropped: AtomicU64,
    idle: AtomicU64,
}

impl RefCountable for SnifferCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "rx_bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx_bytes.swap(0, Ordering::Relaxed)),
            ),
            (
                "parse_failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.parse_failed.swap(0, Ordering::Relaxed)),
            ),
            (
                "unsupported",
                CounterType::Counted,
                CounterValue::Unsigned(self.unsupported.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.dropped.swap(0, Ordering::Relaxed)),
            ),
            (
                "idle",
                CounterType::Counted,
                CounterValue::Unsigned(self.idle.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// Description of the capture plus the last statistics read from it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureInfo {
    pub source: String,
    pub is_file: bool,
    pub filter: String,
    pub snaplen: u32,
    #[serde(flatten)]
    pub stats: SourceStats,
}

/// Routes packets into the flow table.
pub struct Ingest {
    table: Arc<FlowTable>,
    stats: Arc<ParserStats>,
    config: FlowConfig,
    counter: Arc<SnifferCounter>,
}

impl Ingest {
    pub fn new(table: Arc<FlowTable>, stats: Arc<ParserStats>, config: FlowConfig) -> Self {
        Self {
            table,
            stats,
            config,
            counter: Default::default(),
        }
    }

    pub fn handle_raw(&self, packet: &Packet) -> bool {
        self.counter.rx.fetch_add(1, Ordering::Relaxed);
        self.counter
            .rx_bytes
            .fetch_add(packet.data.len() as u64, Ordering::Relaxed);
        let fields = match header::parse(packet.data, packet.link_type) {
            Ok(fields) => fields,
            Err(header::Error::Truncated) => {
                self.counter.parse_failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            Err(e) => {
                self.counter.unsupported.fetch_add(1, Ordering::Relaxed);
                debug!("skip packet at {}: {}", packet.timestamp, e);
                return false;
            }
        };
        self.handle_fields(&fields, packet.timestamp).is_ok()
    }

    /// Looks up or creates the flow for `fields` and records the packet.
    pub fn handle_fields(
        &self,
        fields: &HeaderFields,
        timestamp: u64,
    ) -> flow_generator::Result<()> {
        let id = fields.flow_id();
        let result = self.table.lookup_or_create(&id).and_then(|flow| {
            match flow.lock_live() {
                Some(mut flow) => flow.apply_packet(fields, timestamp, &self.config),
                // reclaimed between lookup and lock
                None => Err(flow_generator::Error::FlowTimedOut),
            }
        });
        match result {
            Ok(()) => {
                self.stats.record_packet(timestamp, id.flow_type);
                Ok(())
            }
            Err(e) => {
                self.counter.dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn counter(&self) -> &Arc<SnifferCounter> {
        &self.counter
    }
}

/// Owns the packet source and feeds it to [`Ingest`] from its own thread.
pub struct Sniffer {
    // taken by the capture thread once it runs
    source: Arc<Mutex<Option<Box<dyn PacketSource>>>>,
    ingest: Arc<Ingest>,
    kill: Arc<AtomicBool>,
    capture: Arc<Mutex<CaptureInfo>>,
    status: AtomicStatus,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Sniffer {
    pub fn new(
        source: Box<dyn PacketSource>,
        capture: CaptureInfo,
        ingest: Arc<Ingest>,
        kill: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(Some(source))),
            ingest,
            kill,
            capture: Arc::new(Mutex::new(capture)),
            status: Default::default(),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the capture thread. `on_exhausted` runs on that thread once
    /// the source has no more packets or fails.
    pub fn start<F>(&self, on_exhausted: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.status.transition(Status::NotStarted, Status::Running) {
            return Err(Error::AlreadyStarted("sniffer"));
        }
        if self.source.lock().is_none() {
            self.status.store(Status::NotStarted);
            return Err(Error::AlreadyStarted("sniffer"));
        }
        let slot = self.source.clone();
        let ingest = self.ingest.clone();
        let kill = self.kill.clone();
        let capture = self.capture.clone();
        let handle = thread::Builder::new()
            .name("flow-sniffer".to_owned())
            .spawn(move || {
                let source = slot.lock().take();
                if let Some(mut source) = source {
                    if Self::run(source.as_mut(), &ingest, &kill, &capture) {
                        on_exhausted();
                    }
                }
            })
            .map_err(|e| {
                self.status.store(Status::NotStarted);
                e
            })?;
        *self.thread.lock() = Some(handle);
        info!("sniffer started");
        Ok(())
    }

    // returns true when the loop ended because the source ran dry
    fn run(
        source: &mut dyn PacketSource,
        ingest: &Ingest,
        kill: &AtomicBool,
        capture: &Mutex<CaptureInfo>,
    ) -> bool {
        let mut packets = 0u64;
        let exhausted = loop {
            if kill.load(Ordering::Acquire) {
                break false;
            }
            match source.next_packet() {
                Ok(Next::Packet(packet)) => {
                    ingest.handle_raw(&packet);
                    packets += 1;
                    if packets % STATS_REFRESH_PACKETS == 0 {
                        Self::refresh_stats(source, capture);
                    }
                }
                Ok(Next::Idle) => {
                    ingest.counter.idle.fetch_add(1, Ordering::Relaxed);
                    Self::refresh_stats(source, capture);
                }
                Ok(Next::Exhausted) => break true,
                Err(e) => {
                    error!("packet source failed: {}", e);
                    break true;
                }
            }
        };
        Self::refresh_stats(source, capture);
        if exhausted {
            info!("packet source exhausted after {} packets", packets);
        }
        exhausted
    }

    fn refresh_stats(source: &mut dyn PacketSource, capture: &Mutex<CaptureInfo>) {
        match source.stats() {
            Ok(stats) => capture.lock().stats = stats,
            Err(e) => warn!("read capture stats failed: {}", e),
        }
    }

    /// Joins the capture thread. The kill flag must already be set. When
    /// called from the capture thread itself the handle is only released.
    pub fn stop(&self) {
        if !self.status.transition(Status::Running, Status::BeingKilled) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                debug!("sniffer stopping from its own thread");
            } else if handle.join().is_err() {
                error!("sniffer thread panicked");
            }
        }
        self.status.store(Status::Killed);
        info!("sniffer stopped");
    }

    pub fn capture_info(&self) -> CaptureInfo {
        self.capture.lock().clone()
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn counter(&self) -> &Arc<SnifferCounter> {
        self.ingest.counter()
    }
}
