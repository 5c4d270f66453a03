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
    any::Any,
    cell::UnsafeCell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use cellar_common::{
    code::CellId, promise::SharedPromise, resource::ResourceUsage, strict_assert,
    strict_assert_eq,
};
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    lru::dlist::DList,
};

/// Residency state of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    NotLoaded,
    Loading,
    Loaded,
    Error,
}

pub(crate) type LoadPromise = Arc<SharedPromise<Result<()>>>;

/// Mutable per-cell state, guarded by the node's reader/writer lock.
pub(crate) struct NodeState {
    pub(crate) state: CellState,
    /// Bytes currently accounted against the budget for this node.
    pub(crate) reserved: ResourceUsage,
    /// Present iff `state == Loading`.
    pub(crate) promise: Option<LoadPromise>,
    /// Present iff `state == Error`.
    pub(crate) error: Option<Error>,
}

/// LRU linkage, guarded by the eviction list's mutex.
///
/// `prev` points toward the MRU head, `next` toward the LRU tail.
pub(crate) struct Link {
    pub(crate) prev: Option<NonNull<ListNode>>,
    pub(crate) next: Option<NonNull<ListNode>>,
    pub(crate) in_list: bool,
    pub(crate) last_touch: Instant,
}

/// One cached cell: payload owner, load coordination point and LRU entry.
///
/// Nodes live in their slot's cell vector, which is never resized, so a
/// node's address is stable for the slot's lifetime. The eviction list
/// refers to nodes by raw pointer and only ever borrows them.
pub(crate) struct ListNode {
    cid: CellId,
    key: Arc<str>,
    estimated: ResourceUsage,
    dlist: Option<Arc<DList>>,
    pins: AtomicUsize,
    state: Arc<RwLock<NodeState>>,
    /// Written only under the node write lock; read lock-free by accessors
    /// holding a pin on this node.
    payload: UnsafeCell<Option<Box<dyn Any + Send + Sync>>>,
    /// Guarded by the eviction list's mutex.
    link: UnsafeCell<Link>,
}

// Interior pointers and the payload cell are coordinated by the lock
// discipline above.
unsafe impl Send for ListNode {}
unsafe impl Sync for ListNode {}

/// Outcome of a pin attempt against the node state machine.
pub(crate) enum PinAttempt {
    /// Cell is materialized; a pin was taken.
    Hit(NodePin),
    /// Cell is loading elsewhere; wait for the promise, then re-check.
    Wait(oneshot::Receiver<Result<()>>),
    /// Caller moved the cell to `Loading` and now owns the load.
    Miss,
    /// Cell sits in its sticky error state.
    Fail(Error),
}

/// Disposition of an opportunistically delivered payload.
pub(crate) enum ExtraInstall {
    /// Installed; the node adopted the caller's reservation.
    Fresh,
    /// Installed over a concurrent load request; the requester's
    /// reservation stands, the caller's duplicate must be released.
    Raced,
    /// Cell was already materialized; the payload was dropped and the
    /// caller's reservation must be released.
    Duplicate,
}

impl ListNode {
    pub(crate) fn new(
        cid: CellId,
        key: Arc<str>,
        estimated: ResourceUsage,
        dlist: Option<Arc<DList>>,
    ) -> Self {
        Self {
            cid,
            key,
            estimated,
            dlist,
            pins: AtomicUsize::new(0),
            state: Arc::new(RwLock::new(NodeState {
                state: CellState::NotLoaded,
                reserved: ResourceUsage::default(),
                promise: None,
                error: None,
            })),
            payload: UnsafeCell::new(None),
            link: UnsafeCell::new(Link {
                prev: None,
                next: None,
                in_list: false,
                last_touch: Instant::now(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn cid(&self) -> CellId {
        self.cid
    }

    pub(crate) fn estimated_size(&self) -> ResourceUsage {
        self.estimated
    }

    pub(crate) fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Relaxed)
    }

    pub(crate) fn cell_state(&self) -> CellState {
        self.state.read().state
    }

    pub(crate) fn state_lock(&self) -> &Arc<RwLock<NodeState>> {
        &self.state
    }

    /// LRU linkage of this node.
    ///
    /// # Safety
    ///
    /// The caller must hold the eviction list's mutex, and must not let two
    /// returned borrows of the same node overlap.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn link(&self) -> &mut Link {
        &mut *self.link.get()
    }

    /// Drive the cell toward `Loaded` as far as possible without blocking.
    ///
    /// Exactly one caller observes [`PinAttempt::Miss`] per
    /// `NotLoaded -> Loading` transition and becomes responsible for
    /// reserving budget and requesting the load.
    pub(crate) fn try_pin(&self) -> PinAttempt {
        let read_op = |s: &NodeState| -> Option<PinAttempt> {
            match s.state {
                CellState::NotLoaded => None,
                CellState::Error => {
                    // error is present iff state is Error
                    Some(PinAttempt::Fail(s.error.clone().unwrap()))
                }
                CellState::Loaded => {
                    self.pins.fetch_add(1, Ordering::Relaxed);
                    Some(PinAttempt::Hit(NodePin::new(self)))
                }
                CellState::Loading => {
                    // promise is present iff state is Loading
                    Some(PinAttempt::Wait(s.promise.as_ref().unwrap().subscribe()))
                }
            }
        };

        {
            let guard = self.state.read();
            if let Some(attempt) = read_op(&guard) {
                return attempt;
            }
        }
        let mut guard = self.state.write();
        if let Some(attempt) = read_op(&guard) {
            return attempt;
        }
        guard.state = CellState::Loading;
        guard.error = None;
        guard.promise = Some(Arc::new(SharedPromise::new()));
        PinAttempt::Miss
    }

    /// Record the bytes a successful reservation charged for this node.
    pub(crate) fn note_reserved(&self, size: ResourceUsage) {
        let mut guard = self.state.write();
        strict_assert_eq!(guard.state, CellState::Loading);
        guard.reserved = size;
    }

    /// Install the payload of a requested load.
    ///
    /// The requesting pin is owed, so the pin count is raised here; the
    /// node stays out of the eviction list until that pin is dropped.
    pub(crate) fn install_requested(&self, payload: Box<dyn Any + Send + Sync>) {
        let mut guard = self.state.write();
        match guard.state {
            CellState::Loading => {
                // SAFETY: write lock held; no pin exists yet.
                unsafe { *self.payload.get() = Some(payload) };
                guard.state = CellState::Loaded;
                self.pins.fetch_add(1, Ordering::Relaxed);
                // promise is present iff state is Loading
                let promise = guard.promise.take().unwrap();
                drop(guard);
                promise.set(Ok(()));
            }
            CellState::Loaded => {
                // an overlapping batch materialized this cell first
                self.pins.fetch_add(1, Ordering::Relaxed);
            }
            state => {
                drop(guard);
                tracing::error!(
                    "cell {}:{} marked loaded by its requester while {:?}",
                    self.key,
                    self.cid,
                    state
                );
            }
        }
    }

    /// Install a payload the translator produced without any pinner asking
    /// for it. `charged` is the reservation the caller already made on the
    /// node's behalf, if any.
    ///
    /// The returned disposition tells the caller how to settle the charge
    /// and the LRU linkage; both happen outside the node lock.
    pub(crate) fn install_extra(
        &self,
        payload: Box<dyn Any + Send + Sync>,
        charged: ResourceUsage,
    ) -> ExtraInstall {
        let mut guard = self.state.write();
        match guard.state {
            CellState::NotLoaded | CellState::Error => {
                // SAFETY: write lock held; the cell is not resident, so no
                // pinned reader exists.
                unsafe { *self.payload.get() = Some(payload) };
                guard.state = CellState::Loaded;
                guard.error = None;
                guard.reserved = charged;
                ExtraInstall::Fresh
            }
            CellState::Loading => {
                // SAFETY: as above.
                unsafe { *self.payload.get() = Some(payload) };
                guard.state = CellState::Loaded;
                // promise is present iff state is Loading
                let promise = guard.promise.take().unwrap();
                drop(guard);
                promise.set(Ok(()));
                ExtraInstall::Raced
            }
            CellState::Loaded => ExtraInstall::Duplicate,
        }
    }

    /// A requested load failed. Moves the cell to its sticky error state,
    /// wakes every waiter with the error and hands the reservation back to
    /// the caller for release.
    pub(crate) fn fail_load(&self, error: Error) -> ResourceUsage {
        let mut guard = self.state.write();
        if guard.state != CellState::Loading {
            // an overlapping batch materialized this cell before the
            // failing one reported back
            return ResourceUsage::default();
        }
        let reserved = std::mem::take(&mut guard.reserved);
        guard.state = CellState::Error;
        guard.error = Some(error.clone());
        // promise is present iff state is Loading
        let promise = guard.promise.take().unwrap();
        drop(guard);
        promise.set(Err(error));
        reserved
    }

    /// Verdict for the requesting pinner once its batch has completed.
    pub(crate) fn load_outcome(&self) -> Result<()> {
        let guard = self.state.read();
        match guard.state {
            CellState::Loaded => Ok(()),
            // error is present iff state is Error
            CellState::Error => Err(guard.error.clone().unwrap()),
            state => Err(Error::programming(format!(
                "cell {}:{} still {:?} after its batch completed",
                self.key, self.cid, state
            ))),
        }
    }

    /// Payload reference for accessors.
    ///
    /// # Safety
    ///
    /// The caller must hold a pin on this node: the pin keeps the payload
    /// resident and the `Loaded` state frozen.
    pub(crate) unsafe fn payload_ref<C: 'static>(&self) -> &C {
        let payload = (*self.payload.get())
            .as_deref()
            .expect("cell payload accessed while not resident");
        payload
            .downcast_ref::<C>()
            .expect("cell payload type mismatch")
    }

    /// Move the payload out during eviction.
    ///
    /// # Safety
    ///
    /// The caller must hold the node write lock and have verified
    /// `pin_count() == 0`.
    pub(crate) unsafe fn take_payload(&self) -> Option<Box<dyn Any + Send + Sync>> {
        (*self.payload.get()).take()
    }

    fn unpin(&self) {
        let guard = self.state.write();
        let previous = self.pins.fetch_sub(1, Ordering::Relaxed);
        strict_assert!(previous >= 1);
        let touch = previous == 1 && guard.state == CellState::Loaded;
        drop(guard);
        // the lock is released first: touch acquires the list mutex
        if touch {
            if let Some(dlist) = self.dlist.as_ref() {
                dlist.touch(self);
            }
        }
    }
}

impl Drop for ListNode {
    fn drop(&mut self) {
        if self.state.read().state == CellState::Loading {
            tracing::error!("cell {}:{} destroyed while loading", self.key, self.cid);
        }
        if let Some(dlist) = self.dlist.as_ref() {
            dlist.unlink(self);
        }
    }
}

/// RAII token proving its cell stays resident. Dropping it releases the
/// pin and, once the cell is unpinned, makes it eligible for eviction
/// again.
pub struct NodePin {
    node: NonNull<ListNode>,
}

// A pin is only reachable through an accessor, which keeps the owning slot
// (and with it the node) alive.
unsafe impl Send for NodePin {}
unsafe impl Sync for NodePin {}

impl NodePin {
    /// The pin count must already account for this pin.
    pub(crate) fn new(node: &ListNode) -> Self {
        Self {
            node: NonNull::from(node),
        }
    }
}

impl Drop for NodePin {
    fn drop(&mut self) {
        unsafe { self.node.as_ref() }.unpin();
    }
}
