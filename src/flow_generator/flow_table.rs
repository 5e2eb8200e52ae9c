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
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use log::warn;
use parking_lot::{RwLock, RwLockReadGuard};

use public::{
    arena::{ArenaCounter, Chunk, ChunkArena},
    counter::{Counter, CounterType, CounterValue, RefCountable},
};

use super::{
    error::Result,
    flow::Flow,
    view::FlowView,
};
use crate::common::{enums::FlowType, flow_id::FlowId};

pub type FlowRef = Chunk<Flow>;
pub type FlowMap = AHashMap<FlowId, FlowRef>;

#[derive(Default)]
pub struct FlowTableCounter {
    new: AtomicU64,          // flows created
    closed: AtomicU64,       // flows returned to their arena
    alloc_failed: AtomicU64, // flows refused by the arena
    concurrent: AtomicU64,   // flows currently in the table
}

impl RefCountable for FlowTableCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "new",
                CounterType::Counted,
                CounterValue::Unsigned(self.new.swap(0, Ordering::Relaxed)),
            ),
            (
                "closed",
                CounterType::Counted,
                CounterValue::Unsigned(self.closed.swap(0, Ordering::Relaxed)),
            ),
            (
                "alloc_failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.alloc_failed.swap(0, Ordering::Relaxed)),
            ),
            (
                "concurrent",
                CounterType::Gauged,
                CounterValue::Unsigned(self.concurrent.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Map of live flows backed by one arena per protocol.
///
/// The table lock is always taken before any flow lock.
pub struct FlowTable {
    flows: RwLock<FlowMap>,
    tcp_arena: ChunkArena<Flow>,
    udp_arena: ChunkArena<Flow>,
    counter: Arc<FlowTableCounter>,
}

impl FlowTable {
    pub fn new(page_size: usize, max_flows: usize) -> Self {
        Self {
            flows: RwLock::new(FlowMap::new()),
            tcp_arena: ChunkArena::new(page_size, max_flows),
            udp_arena: ChunkArena::new(page_size, max_flows),
            counter: Default::default(),
        }
    }

    fn arena(&self, flow_type: FlowType) -> &ChunkArena<Flow> {
        match flow_type {
            FlowType::Tcp => &self.tcp_arena,
            FlowType::Udp => &self.udp_arena,
        }
    }

    pub fn lookup_or_create(&self, id: &FlowId) -> Result<FlowRef> {
        if let Some(flow) = self.flows.read().get(id) {
            return Ok(flow.clone());
        }

        let mut flows = self.flows.write();
        // another thread may have created it between the two locks
        if let Some(flow) = flows.get(id) {
            return Ok(flow.clone());
        }
        let flow = match self
            .arena(id.flow_type)
            .allocate(|| Flow::new(id.flow_type))
        {
            Ok(flow) => flow,
            Err(e) => {
                self.counter.alloc_failed.fetch_add(1, Ordering::Relaxed);
                warn!("cannot create flow {}: {}", id, e);
                return Err(e.into());
            }
        };
        flows.insert(*id, flow.clone());
        self.counter.new.fetch_add(1, Ordering::Relaxed);
        self.counter
            .concurrent
            .store(flows.len() as u64, Ordering::Relaxed);
        Ok(flow)
    }

    pub fn find(&self, id: &FlowId) -> Option<FlowRef> {
        self.flows.read().get(id).cloned()
    }

    /// Returns a view of the flow, or `None` if it is unknown or being
    /// torn down.
    pub fn lookup(&self, id: &FlowId) -> Option<FlowView> {
        let flows = self.flows.read();
        let flow = flows.get(id)?;
        FlowView::acquire(*id, flow.clone())
    }

    /// Views of every flow not already being torn down, in table order.
    pub fn snapshot(&self) -> Vec<FlowView> {
        let flows = self.flows.read();
        flows
            .iter()
            .filter_map(|(id, flow)| FlowView::acquire(*id, flow.clone()))
            .collect()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FlowMap> {
        self.flows.read()
    }

    /// Removes the given flows under a single write lock, passing each
    /// removed flow to `f` before the lock is released.
    pub fn remove_with<F>(&self, ids: &[FlowId], mut f: F) -> usize
    where
        F: FnMut(FlowId, FlowRef),
    {
        if ids.is_empty() {
            return 0;
        }
        let mut flows = self.flows.write();
        let mut removed = 0;
        for id in ids {
            if let Some(flow) = flows.remove(id) {
                f(*id, flow);
                removed += 1;
            }
        }
        self.counter
            .concurrent
            .store(flows.len() as u64, Ordering::Relaxed);
        removed
    }

    pub fn remove(&self, id: &FlowId) -> Option<FlowRef> {
        let mut removed = None;
        self.remove_with(std::slice::from_ref(id), |_, flow| removed = Some(flow));
        removed
    }

    /// Returns the flow storage to its arena. The flow must already be out of
    /// the table.
    pub fn free(&self, flow_type: FlowType, flow: &FlowRef) -> bool {
        let freed = self.arena(flow_type).free(flow);
        if freed {
            self.counter.closed.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TCP flows held in memory, including those waiting to be dumped.
    pub fn tcp_flows(&self) -> usize {
        self.tcp_arena.len()
    }

    pub fn udp_flows(&self) -> usize {
        self.udp_arena.len()
    }

    pub fn arena_slots(&self) -> usize {
        self.tcp_arena.capacity() + self.udp_arena.capacity()
    }

    pub fn counter(&self) -> &Arc<FlowTableCounter> {
        &self.counter
    }

    pub fn arena_counter(&self, flow_type: FlowType) -> &Arc<ArenaCounter> {
        self.arena(flow_type).counter()
    }
}
