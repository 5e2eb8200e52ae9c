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

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::common::flow_id::FlowId;
use crate::flow_generator::FlowRef;

struct QueueState {
    items: VecDeque<(FlowId, FlowRef)>,
    // set once every remaining flow has been enqueued
    killed: bool,
}

/// FIFO of collected flows waiting for the dumper.
pub struct DumpQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

impl Default for DumpQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                killed: false,
            }),
            not_empty: Condvar::new(),
        }
    }
}

impl DumpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: FlowId, flow: FlowRef) {
        self.state.lock().items.push_back((id, flow));
        self.not_empty.notify_one();
    }

    /// Lets the consumer exit once the queue is empty.
    pub fn kill(&self) {
        self.state.lock().killed = true;
        self.not_empty.notify_all();
    }

    /// Undoes [`DumpQueue::kill`] so a new consumer can be started.
    pub fn revive(&self) {
        self.state.lock().killed = false;
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }

    /// Blocks until at least one flow is queued, then moves up to `max` of
    /// them into `out`. Returns false when the queue is empty and killed.
    pub fn recv_batch(&self, max: usize, out: &mut Vec<(FlowId, FlowRef)>) -> bool {
        let mut state = self.state.lock();
        loop {
            if !state.items.is_empty() {
                let n = state.items.len().min(max.max(1));
                out.extend(state.items.drain(..n));
                return true;
            }
            if state.killed {
                return false;
            }
            self.not_empty.wait(&mut state);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
