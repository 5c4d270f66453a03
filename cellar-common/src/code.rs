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

use serde::{Deserialize, Serialize};

use crate::resource::ResourceUsage;

/// Caller-facing logical identifier (e.g. a row offset). Opaque to the
/// cache; the translator maps it to a cell id.
pub type Uid = u64;

/// Dense 0-based index of a cell within its slot.
pub type CellId = usize;

/// Storage tier a slot's cells live on before materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Memory,
    FileMmap,
    File,
}

/// Payload held by a cache cell.
pub trait Cell: Send + Sync + 'static {
    /// Byte footprint of the materialized payload.
    fn cell_byte_size(&self) -> ResourceUsage;
}
