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

//! Concurrent, pin-aware caching layer for tiered-storage segment engines.
//!
//! A [`slot::CacheSlot`] maps logical identifiers to cells materialized on
//! demand through a [`translator::Translator`], while one process-wide LRU
//! list bounds resident memory and disk bytes across every slot.

pub mod accessor;
pub mod error;
pub mod lru;
pub mod manager;
pub mod metrics;
pub mod prelude;
pub mod slot;
pub mod translator;

pub mod test_utils;
