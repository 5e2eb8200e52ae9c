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

//! Slab storage for long lived, lock guarded records.
//!
//! Slots are handed out from fixed capacity pages and recycled through a free
//! list. Every slot owns its value behind a mutex, so the lock and the data it
//! guards share one allocation. While any [`ArenaIter`] is alive, freed slots
//! are never recycled and the arena grows instead; this keeps every slot an
//! iterator may still visit from being handed to a new owner.

use std::collections::TryReserveError;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use log::warn;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::counter::{Counter, CounterType, CounterValue, RefCountable};

pub const DEFAULT_PAGE_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("arena slot limit {limit} reached")]
    Exhausted { limit: usize },
    #[error("arena page allocation failed: {0}")]
    PageAlloc(#[from] TryReserveError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub trait Recyclable {
    // releases everything the value owns, called when its slot is freed
    fn reset(&mut self);
}

struct Slot<T> {
    index: usize,
    generation: AtomicU64,
    in_use: AtomicBool,
    value: Mutex<T>,
}

/// Handle to an allocated slot.
///
/// A handle stays valid storage for as long as it is held. Once the slot is
/// freed the handle becomes stale, which [`Chunk::lock_live`] detects.
pub struct Chunk<T> {
    slot: Arc<Slot<T>>,
    generation: u64,
}

impl<T> Clone for Chunk<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            generation: self.generation,
        }
    }
}

impl<T> fmt::Debug for Chunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.slot.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> Chunk<T> {
    pub fn index(&self) -> usize {
        self.slot.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.slot.in_use.load(Ordering::Acquire)
            && self.slot.generation.load(Ordering::Acquire) == self.generation
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.slot.value.lock()
    }

    /// Locks the value only if the slot still belongs to this handle.
    pub fn lock_live(&self) -> Option<MutexGuard<'_, T>> {
        let guard = self.slot.value.lock();
        if self.is_live() {
            Some(guard)
        } else {
            None
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot) && self.generation == other.generation
    }
}

#[derive(Default)]
pub struct ArenaCounter {
    allocated: AtomicU64,
    recycled: AtomicU64,
    freed: AtomicU64,
    exhausted: AtomicU64,
}

struct Inner<T> {
    pages: Vec<Vec<Arc<Slot<T>>>>,
    free_list: Vec<usize>,
    total: usize,
}

impl<T> Inner<T> {
    fn slot(&self, index: usize, page_size: usize) -> &Arc<Slot<T>> {
        &self.pages[index / page_size][index % page_size]
    }
}

pub struct ChunkArena<T> {
    page_size: usize,
    // 0 means unlimited
    max_slots: usize,
    inner: Mutex<Inner<T>>,
    in_use: AtomicUsize,
    iterators: AtomicUsize,
    counter: Arc<ArenaCounter>,
}

impl<T: Recyclable> ChunkArena<T> {
    pub fn new(page_size: usize, max_slots: usize) -> Self {
        assert!(page_size > 0, "arena page size must be positive");
        Self {
            page_size,
            max_slots,
            inner: Mutex::new(Inner {
                pages: vec![],
                free_list: vec![],
                total: 0,
            }),
            in_use: AtomicUsize::new(0),
            iterators: AtomicUsize::new(0),
            counter: Default::default(),
        }
    }

    pub fn allocate<F: FnOnce() -> T>(&self, init: F) -> Result<Chunk<T>> {
        let mut inner = self.inner.lock();

        let recycled = if self.iterators.load(Ordering::Acquire) == 0 {
            inner
                .free_list
                .pop()
                .map(|index| inner.slot(index, self.page_size).clone())
        } else {
            None
        };

        let slot = match recycled {
            Some(slot) => {
                *slot.value.lock() = init();
                slot.in_use.store(true, Ordering::Release);
                self.counter.recycled.fetch_add(1, Ordering::Relaxed);
                slot
            }
            None => {
                if self.max_slots > 0 && inner.total >= self.max_slots {
                    self.counter.exhausted.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::Exhausted {
                        limit: self.max_slots,
                    });
                }
                let needs_page = inner
                    .pages
                    .last()
                    .map(|page| page.len() == self.page_size)
                    .unwrap_or(true);
                if needs_page {
                    let mut page = Vec::new();
                    page.try_reserve_exact(self.page_size)?;
                    inner.pages.try_reserve(1)?;
                    inner.pages.push(page);
                }
                let slot = Arc::new(Slot {
                    index: inner.total,
                    generation: AtomicU64::new(0),
                    in_use: AtomicBool::new(true),
                    value: Mutex::new(init()),
                });
                // a page was pushed above whenever the last one was full
                if let Some(page) = inner.pages.last_mut() {
                    page.push(slot.clone());
                }
                inner.total += 1;
                slot
            }
        };
        drop(inner);

        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.counter.allocated.fetch_add(1, Ordering::Relaxed);
        let generation = slot.generation.load(Ordering::Acquire);
        Ok(Chunk { slot, generation })
    }

    /// Returns the slot to the free list, resetting its value. Freeing a
    /// stale handle is a no-op and returns false.
    pub fn free(&self, chunk: &Chunk<T>) -> bool {
        {
            let mut value = chunk.slot.value.lock();
            if chunk.slot.generation.load(Ordering::Acquire) != chunk.generation
                || !chunk.slot.in_use.swap(false, Ordering::AcqRel)
            {
                warn!("double free of arena slot {}", chunk.slot.index);
                return false;
            }
            chunk.slot.generation.fetch_add(1, Ordering::AcqRel);
            value.reset();
        }
        self.inner.lock().free_list.push(chunk.slot.index);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.counter.freed.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl<T> ChunkArena<T> {
    /// Iterates live slots in allocation order. Slot recycling is suspended
    /// until the iterator is dropped.
    pub fn iter(&self) -> ArenaIter<'_, T> {
        // registering under the arena lock orders it against allocate()
        let _guard = self.inner.lock();
        self.iterators.fetch_add(1, Ordering::AcqRel);
        ArenaIter {
            arena: self,
            next: 0,
        }
    }

    pub fn iterators(&self) -> usize {
        self.iterators.load(Ordering::Acquire)
    }

    /// Number of slots currently allocated.
    pub fn len(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever created, live or free.
    pub fn capacity(&self) -> usize {
        self.inner.lock().total
    }

    pub fn pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    pub fn counter(&self) -> &Arc<ArenaCounter> {
        &self.counter
    }

    fn slot_at(&self, index: usize) -> Option<Arc<Slot<T>>> {
        let inner = self.inner.lock();
        if index < inner.total {
            Some(inner.slot(index, self.page_size).clone())
        } else {
            None
        }
    }
}

pub struct ArenaIter<'a, T> {
    arena: &'a ChunkArena<T>,
    next: usize,
}

impl<'a, T> Iterator for ArenaIter<'a, T> {
    type Item = Chunk<T>;

    fn next(&mut self) -> Option<Chunk<T>> {
        loop {
            let slot = self.arena.slot_at(self.next)?;
            self.next += 1;
            if slot.in_use.load(Ordering::Acquire) {
                let generation = slot.generation.load(Ordering::Acquire);
                return Some(Chunk { slot, generation });
            }
        }
    }
}

impl<'a, T> Drop for ArenaIter<'a, T> {
    fn drop(&mut self) {
        self.arena.iterators.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RefCountable for ArenaCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "allocated",
                CounterType::Counted,
                CounterValue::Unsigned(self.allocated.swap(0, Ordering::Relaxed)),
            ),
            (
                "recycled",
                CounterType::Counted,
                CounterValue::Unsigned(self.recycled.swap(0, Ordering::Relaxed)),
            ),
            (
                "freed",
                CounterType::Counted,
                CounterValue::Unsigned(self.freed.swap(0, Ordering::Relaxed)),
            ),
            (
                "exhausted",
                CounterType::Counted,
                CounterValue::Unsigned(self.exhausted.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}
