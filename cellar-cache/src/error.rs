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

use std::sync::Arc;

use cellar_common::{
    code::{CellId, Uid},
    resource::ResourceUsage,
};

/// Errors produced by the cache core.
///
/// Errors are clonable so that a single load failure can be delivered to
/// every pinner waiting on the same cell.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The translator mapped a uid to a cell id outside the slot.
    #[error("slot {key}: translator returned cell id {cid} for uid {uid}, out of range of {cells} cells")]
    InvalidCellId {
        key: Arc<str>,
        uid: Uid,
        cid: CellId,
        cells: usize,
    },

    /// The budget cannot make room even after evicting everything unpinned.
    #[error("slot {key}: insufficient resource to load cell {cid}, need {needed}")]
    InsufficientResource {
        key: Arc<str>,
        cid: CellId,
        needed: ResourceUsage,
    },

    /// The translator failed; the original error is attached.
    #[error("slot {key}: failed to load cell {cid}: {reason}")]
    TranslatorLoadFailed {
        key: Arc<str>,
        cid: CellId,
        reason: Arc<anyhow::Error>,
    },

    /// Invariant violation observed at runtime.
    #[error("programming error: {0}")]
    Programming(String),
}

impl Error {
    pub(crate) fn programming(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("{}", message);
        Self::Programming(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
