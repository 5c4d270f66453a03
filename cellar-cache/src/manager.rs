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

use std::{sync::Arc, time::Duration};

use cellar_common::resource::ResourceUsage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    lru::dlist::{DList, TouchConfig},
    slot::{CacheSlot, CacheSlotOptions},
    translator::Translator,
};

const DEFAULT_TOUCH_REFRESH_WINDOW: Duration = Duration::from_secs(10);

/// Runtime configuration surface of the caching layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredCacheConfig {
    pub enabled: bool,
    pub memory_limit_bytes: usize,
    pub disk_limit_bytes: usize,
    /// Applied when the eviction list is first created.
    pub touch_refresh_window_secs: Option<u64>,
}

/// Process-scoped owner of the eviction list.
///
/// Created once at startup; slots take a handle to the current eviction
/// list at creation time. Disabling the cache drops the manager's handle:
/// existing slots and accessors keep theirs and stay valid, new slots run
/// without a budget.
#[derive(Default)]
pub struct Manager {
    dlist: RwLock<Option<Arc<DList>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a configuration. Re-configuring an enabled manager only
    /// updates the budget; the next reservation enforces it.
    pub fn configure(&self, config: &TieredCacheConfig) {
        if config.enabled {
            let limit = ResourceUsage::new(config.memory_limit_bytes, config.disk_limit_bytes);
            let mut dlist = self.dlist.write();
            match dlist.as_ref() {
                Some(list) => list.update_limit(limit),
                None => {
                    let touch_config = TouchConfig {
                        refresh_window: config
                            .touch_refresh_window_secs
                            .map(Duration::from_secs)
                            .unwrap_or(DEFAULT_TOUCH_REFRESH_WINDOW),
                    };
                    *dlist = Some(Arc::new(DList::new(limit, touch_config)));
                }
            }
            tracing::info!("configured tiered storage cache, limits: {}", limit);
        } else {
            *self.dlist.write() = None;
            tracing::info!("tiered storage cache disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dlist.read().is_some()
    }

    /// Bytes charged against the budget, per tier. Zero while disabled.
    pub fn usage(&self) -> ResourceUsage {
        self.dlist
            .read()
            .as_ref()
            .map(|dlist| dlist.usage())
            .unwrap_or_default()
    }

    pub fn create_slot<T>(&self, translator: T) -> Arc<CacheSlot<T>>
    where
        T: Translator,
    {
        self.create_slot_with_options(translator, CacheSlotOptions::default())
    }

    pub fn create_slot_with_options<T>(
        &self,
        translator: T,
        options: CacheSlotOptions,
    ) -> Arc<CacheSlot<T>>
    where
        T: Translator,
    {
        CacheSlot::new(translator, self.dlist.read().clone(), options)
    }
}
