//  Copyright 2025 Cellar Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use cellar_common::{resource::ResourceUsage, strict_assert, strict_assert_eq};
use parking_lot::Mutex;

use crate::lru::node::{CellState, ListNode};

/// Touching a node moves it to the head of the list, which takes the list
/// mutex. The refresh window rate-limits reordering to keep the hottest
/// lock off the read path.
#[derive(Debug, Clone)]
pub struct TouchConfig {
    pub refresh_window: Duration,
}

impl Default for TouchConfig {
    fn default() -> Self {
        Self {
            refresh_window: Duration::from_secs(10),
        }
    }
}

/// Process-wide LRU list over every resident cell, and the byte budget
/// they are charged against.
///
/// Lock order is strictly list mutex before node lock. The evictor only
/// ever try-locks nodes; paths that hold a node lock release it before
/// calling back in here.
pub struct DList {
    inner: Mutex<Inner>,
    touch_config: TouchConfig,
    evictions: AtomicUsize,
}

struct Inner {
    head: Option<NonNull<ListNode>>,
    tail: Option<NonNull<ListNode>>,
    used: ResourceUsage,
    max: ResourceUsage,
}

// Raw node pointers are only dereferenced under the mutex.
unsafe impl Send for Inner {}

impl DList {
    pub fn new(limit: ResourceUsage, touch_config: TouchConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                head: None,
                tail: None,
                used: ResourceUsage::default(),
                max: limit,
            }),
            touch_config,
            evictions: AtomicUsize::new(0),
        }
    }

    /// Bytes currently charged, per tier.
    pub fn usage(&self) -> ResourceUsage {
        self.inner.lock().used
    }

    /// Configured budget, per tier.
    pub fn capacity(&self) -> ResourceUsage {
        self.inner.lock().max
    }

    /// Cells evicted so far.
    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Replace the budget. Does not evict synchronously; the next
    /// [`DList::reserve`] brings usage back within the new bound.
    pub fn update_limit(&self, limit: ResourceUsage) {
        self.inner.lock().max = limit;
    }

    /// Make room for `size` bytes of new residency, evicting unpinned
    /// cells from the tail if needed.
    ///
    /// Returns `false` iff the budget cannot fit the request even with
    /// every unpinned cell evicted; nothing is changed in that case. On
    /// `true` the bytes are charged and the caller is obligated to install
    /// the node.
    pub(crate) fn reserve(&self, size: ResourceUsage) -> bool {
        if size.is_zero() {
            return true;
        }

        let mut inner = self.inner.lock();
        if (inner.used + size).within(&inner.max) {
            inner.used += size;
            return true;
        }

        // Walk from the LRU tail. Nodes are try-locked only: a contended
        // lock means the cell is about to be used again, so it is skipped,
        // as are pinned cells.
        let mut victims = Vec::new();
        let mut freed = ResourceUsage::default();
        let mut cursor = inner.tail;
        while let Some(ptr) = cursor {
            let node = unsafe { ptr.as_ref() };
            cursor = unsafe { node.link() }.prev;
            if let Some(guard) = node.state_lock().try_write_arc() {
                if node.pin_count() == 0 {
                    strict_assert_eq!(guard.state, CellState::Loaded);
                    freed += guard.reserved;
                    victims.push((ptr, guard));
                    if (inner.used + size).within(&(inner.max + freed)) {
                        break;
                    }
                }
            }
        }
        if (inner.used + size).exceeds(&(inner.max + freed)) {
            // insufficient even with everything unpinned gone; the victim
            // locks release untouched as the guards drop
            return false;
        }

        // unsigned counters: apply the charge and the credit together
        // under the lock
        inner.used += size;
        inner.used -= freed;

        let mut unloaded = Vec::with_capacity(victims.len());
        for (ptr, mut guard) in victims {
            let node = unsafe { ptr.as_ref() };
            guard.state = CellState::NotLoaded;
            guard.reserved = ResourceUsage::default();
            // SAFETY: node write lock held, pin count checked above.
            unloaded.push(unsafe { node.take_payload() });
            Self::unlink_locked(&mut inner, ptr);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        drop(inner);
        // payload destructors run outside both locks
        drop(unloaded);
        true
    }

    /// Return a reservation that was never installed. Only the loader's
    /// error path calls this; the node is not in the list.
    pub(crate) fn release_on_load_failure(&self, size: ResourceUsage) {
        if size.is_zero() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.used -= size;
    }

    /// Refresh a node's LRU position.
    ///
    /// A `Loaded` node that is not in the list is always linked at the
    /// head; reordering of nodes already in the list is rate-limited by
    /// the refresh window. Advisory: skipping an update is harmless.
    pub(crate) fn touch(&self, node: &ListNode) {
        let mut inner = self.inner.lock();
        // List mutex first, node lock second. Nothing holds a node lock
        // while waiting on the list mutex.
        let state = node.state_lock().read();
        if state.state != CellState::Loaded {
            return;
        }
        let now = Instant::now();
        let ptr = NonNull::from(node);
        let in_list = {
            let link = unsafe { node.link() };
            if link.in_list
                && now.duration_since(link.last_touch) <= self.touch_config.refresh_window
            {
                return;
            }
            link.in_list
        };
        if in_list {
            Self::unlink_locked(&mut inner, ptr);
        }
        Self::push_head_locked(&mut inner, ptr);
        unsafe { node.link() }.last_touch = now;
    }

    /// Remove a node from the list and return its charge to the budget.
    /// Idempotent; called on eviction-independent teardown.
    pub(crate) fn unlink(&self, node: &ListNode) {
        let mut inner = self.inner.lock();
        if unsafe { node.link() }.in_list {
            let reserved = node.state_lock().read().reserved;
            inner.used -= reserved;
            Self::unlink_locked(&mut inner, NonNull::from(node));
        }
    }

    /// Must be called with the list mutex held.
    fn push_head_locked(inner: &mut Inner, ptr: NonNull<ListNode>) {
        {
            let link = unsafe { ptr.as_ref().link() };
            strict_assert!(!link.in_list);
            link.prev = None;
            link.next = inner.head;
            link.in_list = true;
        }
        match inner.head {
            Some(head) => unsafe { head.as_ref().link() }.prev = Some(ptr),
            None => inner.tail = Some(ptr),
        }
        inner.head = Some(ptr);
    }

    /// Must be called with the list mutex held. No-op if the node is not
    /// in the list.
    fn unlink_locked(inner: &mut Inner, ptr: NonNull<ListNode>) {
        let (prev, next) = {
            let link = unsafe { ptr.as_ref().link() };
            if !link.in_list {
                return;
            }
            let neighbors = (link.prev, link.next);
            link.prev = None;
            link.next = None;
            link.in_list = false;
            neighbors
        };
        match prev {
            Some(prev) => unsafe { prev.as_ref().link() }.next = next,
            None => inner.head = next,
        }
        match next {
            Some(next) => unsafe { next.as_ref().link() }.prev = prev,
            None => inner.tail = prev,
        }
    }

    /// Cell ids in the list, tail (LRU) to head (MRU).
    #[cfg(test)]
    pub(crate) fn dump_cids(&self) -> Vec<cellar_common::code::CellId> {
        let inner = self.inner.lock();
        let mut cids = vec![];
        let mut cursor = inner.tail;
        while let Some(ptr) = cursor {
            let node = unsafe { ptr.as_ref() };
            cids.push(node.cid());
            cursor = unsafe { node.link() }.prev;
        }
        cids
    }

    /// Sum of the charges of every node in the list.
    #[cfg(test)]
    pub(crate) fn reserved_sum(&self) -> ResourceUsage {
        let inner = self.inner.lock();
        let mut sum = ResourceUsage::default();
        let mut cursor = inner.tail;
        while let Some(ptr) = cursor {
            let node = unsafe { ptr.as_ref() };
            sum += node.state_lock().read().reserved;
            cursor = unsafe { node.link() }.prev;
        }
        sum
    }
}
