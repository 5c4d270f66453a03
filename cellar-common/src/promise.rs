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

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::strict_assert;

/// One-shot broadcast: fulfilled exactly once, observed by every
/// subscriber. Subscribers that arrive after fulfillment receive the stored
/// value immediately.
#[derive(Debug)]
pub struct SharedPromise<T>
where
    T: Clone + Send + 'static,
{
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    value: Option<T>,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T> Default for SharedPromise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedPromise<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                value: None,
                waiters: vec![],
            }),
        }
    }

    /// Register a waiter. The receiver resolves when [`Self::set`] is
    /// called, or immediately if it already was.
    pub fn subscribe(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        match inner.value.as_ref() {
            Some(value) => {
                // The receiver is fresh, the send cannot fail.
                let _ = tx.send(value.clone());
            }
            None => inner.waiters.push(tx),
        }
        rx
    }

    /// Fulfill the promise and wake every waiter. Must be called at most
    /// once.
    pub fn set(&self, value: T) {
        let waiters = {
            let mut inner = self.inner.lock();
            strict_assert!(inner.value.is_none());
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            // A dropped receiver stopped waiting, which is fine.
            let _ = waiter.send(value.clone());
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.inner.lock().value.is_some()
    }
}
