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

use std::{any::Any, future::Future};

use cellar_common::{
    code::{Cell, CellId, StorageType, Uid},
    resource::ResourceUsage,
};

/// External loader that knows how to materialize cells for one dataset.
///
/// A translator is owned by its [`crate::slot::CacheSlot`] and must be
/// cheap to query: everything except [`Translator::get_cells`] sits on hot
/// paths.
pub trait Translator: Send + Sync + 'static {
    /// Payload type of the cells this translator produces.
    type Cell: Cell;

    /// Stable identifier of the dataset, used in errors and logs.
    fn key(&self) -> &str;

    /// Number of cells in the dataset. Fixed for the slot's lifetime.
    fn num_cells(&self) -> usize;

    /// Map a caller-facing uid to its cell id.
    ///
    /// A result `>= num_cells()` makes the caller's pin fail with
    /// [`crate::error::Error::InvalidCellId`].
    fn cell_id_of(&self, uid: Uid) -> CellId;

    /// Pre-load size estimate used for budget reservation.
    fn estimated_byte_size_of_cell(&self, cid: CellId) -> ResourceUsage;

    /// Storage tier the cells are served from.
    fn storage_type(&self) -> StorageType;

    /// Load a batch of cells.
    ///
    /// The result must cover at least the requested cells and may include
    /// extra ones when fetching adjacent cells is cheaper (e.g. they share
    /// a remote object). Extra cells are installed best-effort and never
    /// displace pinned residents.
    fn get_cells(
        &self,
        cids: &[CellId],
    ) -> impl Future<Output = anyhow::Result<Vec<(CellId, Self::Cell)>>> + Send;

    /// Opaque per-dataset attachment (e.g. row-count prefix sums),
    /// surfaced unchanged through the slot.
    fn meta(&self) -> Option<&(dyn Any + Send + Sync)> {
        None
    }
}
