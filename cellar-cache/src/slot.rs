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
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use cellar_common::{
    code::{Cell, CellId, StorageType, Uid},
    promise::SharedPromise,
    resource::ResourceUsage,
    strict_assert,
};
use futures::future::join_all;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
    accessor::CellAccessor,
    error::{Error, Result},
    lru::{
        dlist::DList,
        node::{CellState, ExtraInstall, ListNode, LoadPromise, NodePin, PinAttempt},
    },
    metrics::Metrics,
    translator::Translator,
};

/// Per-slot tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSlotOptions {
    /// How long a batch opener waits before snapshotting the load queue,
    /// letting concurrent pinners pile onto the same translator call.
    /// Zero disables the debounce.
    pub load_delay: Duration,
}

impl Default for CacheSlotOptions {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(2),
        }
    }
}

/// Pending cell requests for the next batched translator call.
struct LoadState {
    queue: Vec<CellId>,
    /// Present iff `queue` is non-empty; fulfilled when that batch
    /// finishes.
    promise: Option<LoadPromise>,
}

/// One dataset's cells plus the translator that materializes them.
///
/// Pinning returns lazy futures: nothing happens until they are polled on
/// the caller's executor. The returned [`CellAccessor`] holds the slot
/// alive, so payload references stay valid for as long as the accessor
/// does.
pub struct CacheSlot<T>
where
    T: Translator,
{
    /// Indexed by cell id; never resized, so node addresses are stable.
    cells: Vec<ListNode>,
    translator: T,
    key: Arc<str>,
    load: Mutex<LoadState>,
    inflight: AtomicUsize,
    dlist: Option<Arc<DList>>,
    options: CacheSlotOptions,
    metrics: Metrics,
}

impl<T> CacheSlot<T>
where
    T: Translator,
{
    pub fn new(translator: T, dlist: Option<Arc<DList>>, options: CacheSlotOptions) -> Arc<Self> {
        let key: Arc<str> = Arc::from(translator.key());
        let cells = (0..translator.num_cells())
            .map(|cid| {
                ListNode::new(
                    cid,
                    key.clone(),
                    translator.estimated_byte_size_of_cell(cid),
                    dlist.clone(),
                )
            })
            .collect_vec();
        Arc::new(Self {
            cells,
            translator,
            key,
            load: Mutex::new(LoadState {
                queue: vec![],
                promise: None,
            }),
            inflight: AtomicUsize::new(0),
            dlist,
            options,
            metrics: Metrics::default(),
        })
    }

    /// Pin the cells owning `uids` and return an accessor over them.
    ///
    /// Uids are deduplicated to cell ids first; concurrent misses are
    /// coalesced into a single translator call per slot. If any requested
    /// cell fails, the whole operation fails with the first observed error
    /// and no pins are handed out.
    pub async fn pin_cells(self: &Arc<Self>, uids: &[Uid]) -> Result<CellAccessor<T>> {
        let mut seen = vec![false; self.cells.len()];
        let mut involved = Vec::with_capacity(uids.len().min(self.cells.len()));
        for &uid in uids {
            let cid = self.translator.cell_id_of(uid);
            if cid >= self.cells.len() {
                return Err(Error::InvalidCellId {
                    key: self.key.clone(),
                    uid,
                    cid,
                    cells: self.cells.len(),
                });
            }
            if !seen[cid] {
                seen[cid] = true;
                involved.push(cid);
            }
        }

        // every pin runs to completion: aborting siblings early could tear
        // down a batch other pinners joined
        let results = join_all(involved.iter().map(|&cid| self.pin_cell(cid))).await;

        let mut pins = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(pin) => pins.push(pin),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        match first_error {
            // acquired pins release as `pins` drops
            Some(e) => Err(e),
            None => Ok(CellAccessor::new(self.clone(), pins)),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.translator.num_cells()
    }

    pub fn size_of_cell(&self, cid: CellId) -> ResourceUsage {
        self.translator.estimated_byte_size_of_cell(cid)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage_type(&self) -> StorageType {
        self.translator.storage_type()
    }

    /// Translator-provided attachment, surfaced unchanged.
    pub fn meta(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.translator.meta()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Batched translator calls currently running.
    pub fn inflight_loads(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Cell ids queued for the next batch.
    pub fn queued_cells(&self) -> Vec<CellId> {
        self.load.lock().queue.clone()
    }

    pub fn cell_state(&self, cid: CellId) -> CellState {
        self.cells[cid].cell_state()
    }

    pub fn cell_pins(&self, cid: CellId) -> usize {
        self.cells[cid].pin_count()
    }

    pub(crate) fn cell_id_of(&self, uid: Uid) -> CellId {
        self.translator.cell_id_of(uid)
    }

    pub(crate) fn cell(&self, cid: CellId) -> &ListNode {
        &self.cells[cid]
    }

    async fn pin_cell(self: &Arc<Self>, cid: CellId) -> Result<NodePin> {
        let node = &self.cells[cid];
        loop {
            match node.try_pin() {
                PinAttempt::Hit(pin) => {
                    self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                    return Ok(pin);
                }
                PinAttempt::Fail(e) => return Err(e),
                PinAttempt::Wait(rx) => match rx.await {
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(())) => continue,
                    Err(_) => {
                        return Err(Error::programming(format!(
                            "cell {}:{} load abandoned without completion",
                            self.key, cid
                        )))
                    }
                },
                PinAttempt::Miss => {
                    self.metrics.miss.fetch_add(1, Ordering::Relaxed);
                    let size = node.estimated_size();
                    if let Some(dlist) = self.dlist.as_ref() {
                        if !dlist.reserve(size) {
                            let error = Error::InsufficientResource {
                                key: self.key.clone(),
                                cid,
                                needed: size,
                            };
                            let released = node.fail_load(error.clone());
                            strict_assert!(released.is_zero());
                            return Err(error);
                        }
                        node.note_reserved(size);
                    }
                    let rx = self.join_batch(cid);
                    // the batch promise only signals completion; the node
                    // holds the per-cell verdict
                    let _ = rx.await;
                    return match node.load_outcome() {
                        Ok(()) => Ok(NodePin::new(node)),
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    /// Queue `cid` for the next batch. The pinner that finds the queue
    /// empty opens the batch and schedules [`CacheSlot::run_load`];
    /// everyone shares the batch promise.
    fn join_batch(self: &Arc<Self>, cid: CellId) -> oneshot::Receiver<Result<()>> {
        let mut load = self.load.lock();
        let first = load.queue.is_empty();
        load.queue.push(cid);
        if first {
            strict_assert!(load.promise.is_none());
            load.promise = Some(Arc::new(SharedPromise::new()));
            let slot = self.clone();
            // the spawned task owns the batch: dropping a pin future
            // cannot abort a load other pinners joined
            tokio::spawn(slot.run_load());
        }
        // present: installed above or by the batch opener
        load.promise.as_ref().unwrap().subscribe()
    }

    #[tracing::instrument(skip(self), fields(key = %self.key))]
    async fn run_load(self: Arc<Self>) {
        if !self.options.load_delay.is_zero() {
            tokio::time::sleep(self.options.load_delay).await;
        }

        let (cids, promise) = {
            let mut load = self.load.lock();
            strict_assert!(!load.queue.is_empty());
            let cids = std::mem::take(&mut load.queue);
            // the batch opener installed it
            let promise = load.promise.take().unwrap();
            (cids, promise)
        };
        // once the queue is released, new pin requests open the next batch
        self.inflight.fetch_add(1, Ordering::Relaxed);
        self.metrics.load.fetch_add(1, Ordering::Relaxed);

        let mut requested = vec![false; self.cells.len()];
        for &cid in &cids {
            requested[cid] = true;
        }

        match self.translator.get_cells(&cids).await {
            Ok(results) => {
                let mut delivered = vec![false; self.cells.len()];
                for (cid, payload) in results {
                    if cid >= self.cells.len() {
                        tracing::warn!(
                            "slot {}: translator produced out-of-range cell id {}",
                            self.key,
                            cid
                        );
                        continue;
                    }
                    if requested[cid] {
                        delivered[cid] = true;
                        self.install_requested(cid, payload);
                    } else {
                        self.install_extra(cid, payload);
                    }
                }
                for &cid in &cids {
                    if !delivered[cid] {
                        tracing::error!(
                            "slot {}: cell {} missing from batch result",
                            self.key,
                            cid
                        );
                        self.fail_cell(
                            cid,
                            Error::TranslatorLoadFailed {
                                key: self.key.clone(),
                                cid,
                                reason: Arc::new(anyhow::anyhow!(
                                    "cell missing from batch result"
                                )),
                            },
                        );
                    }
                }
                promise.set(Ok(()));
            }
            Err(e) => {
                tracing::error!("slot {}: error loading cells: {}", self.key, e);
                self.metrics.load_error.fetch_add(1, Ordering::Relaxed);
                let reason = Arc::new(e);
                let mut batch_error = None;
                for &cid in &cids {
                    let error = Error::TranslatorLoadFailed {
                        key: self.key.clone(),
                        cid,
                        reason: reason.clone(),
                    };
                    batch_error = batch_error.or_else(|| Some(error.clone()));
                    self.fail_cell(cid, error);
                }
                // the snapshot is never empty
                promise.set(Err(batch_error.unwrap()));
            }
        }
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    fn install_requested(&self, cid: CellId, payload: T::Cell) {
        let node = &self.cells[cid];
        let actual = payload.cell_byte_size();
        if actual != node.estimated_size() {
            tracing::debug!(
                "slot {}: cell {} materialized at {}, estimated {}",
                self.key,
                cid,
                actual,
                node.estimated_size()
            );
        }
        node.install_requested(Box::new(payload));
    }

    /// Install a cell nobody asked for. Charged best effort: opportunistic
    /// data never displaces what reservations could not.
    fn install_extra(&self, cid: CellId, payload: T::Cell) {
        let node = &self.cells[cid];
        let size = node.estimated_size();
        let charged = match self.dlist.as_ref() {
            Some(dlist) => {
                if !dlist.reserve(size) {
                    tracing::debug!(
                        "slot {}: discarding opportunistic cell {} ({})",
                        self.key,
                        cid,
                        size
                    );
                    return;
                }
                size
            }
            None => ResourceUsage::default(),
        };
        match node.install_extra(Box::new(payload), charged) {
            ExtraInstall::Fresh => {
                if let Some(dlist) = self.dlist.as_ref() {
                    dlist.touch(node);
                }
            }
            ExtraInstall::Raced => {
                // a pinner reserved for this cell concurrently; return the
                // duplicate charge
                if let Some(dlist) = self.dlist.as_ref() {
                    dlist.release_on_load_failure(charged);
                    dlist.touch(node);
                }
            }
            ExtraInstall::Duplicate => {
                if let Some(dlist) = self.dlist.as_ref() {
                    dlist.release_on_load_failure(charged);
                }
            }
        }
    }

    fn fail_cell(&self, cid: CellId, error: Error) {
        let released = self.cells[cid].fail_load(error);
        if let Some(dlist) = self.dlist.as_ref() {
            dlist.release_on_load_failure(released);
        }
    }
}
