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

use std::sync::atomic::AtomicUsize;

/// Per-slot counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Pins that found the cell already materialized or in flight.
    pub hit: AtomicUsize,
    /// Pins that had to request a load.
    pub miss: AtomicUsize,
    /// Batched translator calls issued.
    pub load: AtomicUsize,
    /// Batched translator calls that failed.
    pub load_error: AtomicUsize,
}
