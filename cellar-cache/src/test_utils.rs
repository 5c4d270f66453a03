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

//! Test utilities.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use cellar_common::{
    code::{Cell, CellId, StorageType, Uid},
    resource::ResourceUsage,
};
use parking_lot::Mutex;

use crate::translator::Translator;

/// Payload used across the test suites.
#[derive(Debug, PartialEq, Eq)]
pub struct TestCell {
    pub data: i64,
    pub cid: CellId,
    size: ResourceUsage,
}

impl Cell for TestCell {
    fn cell_byte_size(&self) -> ResourceUsage {
        self.size
    }
}

struct MockState {
    requested: Vec<Vec<CellId>>,
    extra_cids: Vec<CellId>,
    load_delay: Duration,
}

/// Scripted translator: records every batch, and can be told to fail, to
/// stall, or to return cells nobody asked for.
///
/// Clones share state, so a test can keep one handle for assertions after
/// moving the other into a slot.
#[derive(Clone)]
pub struct MockTranslator {
    inner: Arc<MockInner>,
}

struct MockInner {
    key: String,
    cell_sizes: Vec<ResourceUsage>,
    uid_to_cid: Option<HashMap<Uid, CellId>>,
    calls: AtomicUsize,
    fail_loads: AtomicBool,
    state: Mutex<MockState>,
}

impl MockTranslator {
    /// Uids resolve through the given map; unknown uids map out of range.
    pub fn new(
        cell_sizes: Vec<ResourceUsage>,
        uid_to_cid: HashMap<Uid, CellId>,
        key: impl Into<String>,
    ) -> Self {
        Self::build(cell_sizes, Some(uid_to_cid), key)
    }

    /// Uids are cell ids; out-of-range uids map out of range.
    pub fn identity(cell_sizes: Vec<ResourceUsage>, key: impl Into<String>) -> Self {
        Self::build(cell_sizes, None, key)
    }

    fn build(
        cell_sizes: Vec<ResourceUsage>,
        uid_to_cid: Option<HashMap<Uid, CellId>>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(MockInner {
                key: key.into(),
                cell_sizes,
                uid_to_cid,
                calls: AtomicUsize::new(0),
                fail_loads: AtomicBool::new(false),
                state: Mutex::new(MockState {
                    requested: vec![],
                    extra_cids: vec![],
                    load_delay: Duration::ZERO,
                }),
            }),
        }
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.inner.fail_loads.store(fail, Ordering::Relaxed);
    }

    pub fn set_extra_cids(&self, cids: Vec<CellId>) {
        self.inner.state.lock().extra_cids = cids;
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.inner.state.lock().load_delay = delay;
    }

    /// Number of `get_cells` calls so far.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::Relaxed)
    }

    /// Requested cid batches, in call order.
    pub fn requested(&self) -> Vec<Vec<CellId>> {
        self.inner.state.lock().requested.clone()
    }

    pub fn reset(&self) {
        self.inner.calls.store(0, Ordering::Relaxed);
        self.inner.state.lock().requested.clear();
    }

    fn cell(&self, cid: CellId) -> TestCell {
        TestCell {
            data: cid as i64 * 10,
            cid,
            size: self.inner.cell_sizes[cid],
        }
    }
}

impl Translator for MockTranslator {
    type Cell = TestCell;

    fn key(&self) -> &str {
        &self.inner.key
    }

    fn num_cells(&self) -> usize {
        self.inner.cell_sizes.len()
    }

    fn cell_id_of(&self, uid: Uid) -> CellId {
        match self.inner.uid_to_cid.as_ref() {
            Some(map) => map.get(&uid).copied().unwrap_or(self.num_cells()),
            None => uid as CellId,
        }
    }

    fn estimated_byte_size_of_cell(&self, cid: CellId) -> ResourceUsage {
        self.inner.cell_sizes[cid]
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    async fn get_cells(&self, cids: &[CellId]) -> anyhow::Result<Vec<(CellId, TestCell)>> {
        self.inner.calls.fetch_add(1, Ordering::Relaxed);
        let (delay, extras) = {
            let mut state = self.inner.state.lock();
            state.requested.push(cids.to_vec());
            (state.load_delay, state.extra_cids.clone())
        };

        if self.inner.fail_loads.load(Ordering::Relaxed) {
            anyhow::bail!("simulated load error");
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut results = cids
            .iter()
            .map(|&cid| (cid, self.cell(cid)))
            .collect::<Vec<_>>();
        for extra in extras {
            if !cids.contains(&extra) {
                results.push((extra, self.cell(extra)));
            }
        }
        Ok(results)
    }
}
