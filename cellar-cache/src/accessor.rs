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

use std::{any::Any, sync::Arc};

use cellar_common::code::{CellId, Uid};

use crate::{lru::node::NodePin, slot::CacheSlot, translator::Translator};

/// Bundle of pins handed to a caller by
/// [`CacheSlot::pin_cells`](crate::slot::CacheSlot::pin_cells).
///
/// While the accessor lives, its cells stay resident; cell access takes no
/// lock. Dropping the accessor releases every pin, then the slot handle.
///
/// Looking up a uid or cell id that was not part of the pin request is a
/// contract violation and panics.
pub struct CellAccessor<T>
where
    T: Translator,
{
    // declaration order: pins unpin before the slot handle drops
    pins: Vec<NodePin>,
    slot: Arc<CacheSlot<T>>,
}

impl<T> CellAccessor<T>
where
    T: Translator,
{
    pub(crate) fn new(slot: Arc<CacheSlot<T>>, pins: Vec<NodePin>) -> Self {
        Self { pins, slot }
    }

    /// Payload of the cell owning `uid`.
    pub fn get(&self, uid: Uid) -> &T::Cell {
        let cid = self.slot.cell_id_of(uid);
        self.cell(cid)
    }

    /// Payload of the `cid`-th cell.
    pub fn cell(&self, cid: CellId) -> &T::Cell {
        // SAFETY: the accessor's pins keep its cells resident for the
        // lifetime of `&self`.
        unsafe { self.slot.cell(cid).payload_ref() }
    }

    /// Number of pins held.
    pub fn pinned_cells(&self) -> usize {
        self.pins.len()
    }

    pub fn slot(&self) -> &Arc<CacheSlot<T>> {
        &self.slot
    }
}

/// Content plus an opaque RAII token keeping it resident.
///
/// Lets downstream code hold a pinned payload without carrying the cache's
/// generic parameters: the token is type-erased, and dropping the wrapper
/// releases the pin with it.
pub struct PinWrapper<T> {
    raii: Option<Arc<dyn Any + Send + Sync>>,
    content: T,
}

impl<T> PinWrapper<T> {
    pub fn new(raii: Arc<dyn Any + Send + Sync>, content: T) -> Self {
        Self {
            raii: Some(raii),
            content,
        }
    }

    /// For content that needs no pin, e.g. views that copy the data out.
    pub fn unpinned(content: T) -> Self {
        Self {
            raii: None,
            content,
        }
    }

    pub fn get(&self) -> &T {
        &self.content
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.content
    }

    /// Map the content while carrying the token along.
    pub fn transform<U>(self, f: impl FnOnce(T) -> U) -> PinWrapper<U> {
        PinWrapper {
            raii: self.raii,
            content: f(self.content),
        }
    }
}

impl<T> Clone for PinWrapper<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            raii: self.raii.clone(),
            content: self.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_wrapper_transform() {
        let raii: Arc<dyn Any + Send + Sync> = Arc::new("token".to_string());
        let wrapper = PinWrapper::new(raii.clone(), vec![1, 2, 3]);
        assert_eq!(Arc::strong_count(&raii), 2);

        let wrapper = wrapper.transform(|v| v.len());
        assert_eq!(*wrapper.get(), 3);
        // the token survives the transform
        assert_eq!(Arc::strong_count(&raii), 2);

        drop(wrapper);
        assert_eq!(Arc::strong_count(&raii), 1);
    }

    #[test]
    fn test_pin_wrapper_unpinned() {
        let mut wrapper = PinWrapper::unpinned(7);
        *wrapper.get_mut() += 1;
        assert_eq!(*wrapper.get(), 8);
    }
}
