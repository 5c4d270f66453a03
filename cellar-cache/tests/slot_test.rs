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

use std::{collections::HashMap, sync::Arc, time::Duration};

use cellar_cache::{
    error::Error,
    lru::{
        dlist::{DList, TouchConfig},
        node::CellState,
    },
    manager::{Manager, TieredCacheConfig},
    slot::{CacheSlot, CacheSlotOptions},
    test_utils::MockTranslator,
};
use cellar_common::resource::ResourceUsage;
use rand::{rngs::SmallRng, Rng, SeedableRng};

fn mem(bytes: usize) -> ResourceUsage {
    ResourceUsage::memory(bytes)
}

/// Five cells of 50, 150, 100, 200 and 75 bytes, with several uids per
/// cell.
fn translator() -> MockTranslator {
    MockTranslator::new(
        vec![mem(50), mem(150), mem(100), mem(200), mem(75)],
        HashMap::from([
            (10, 0),
            (11, 0),
            (20, 1),
            (30, 2),
            (31, 2),
            (32, 2),
            (40, 3),
            (50, 4),
            (51, 4),
        ]),
        "test_slot",
    )
}

#[allow(clippy::type_complexity)]
fn fixture(
    memory_limit: usize,
) -> (MockTranslator, Arc<DList>, Arc<CacheSlot<MockTranslator>>) {
    let translator = translator();
    let dlist = Arc::new(DList::new(mem(memory_limit), TouchConfig::default()));
    let slot = CacheSlot::new(
        translator.clone(),
        Some(dlist.clone()),
        CacheSlotOptions::default(),
    );
    (translator, dlist, slot)
}

fn sorted(mut cids: Vec<usize>) -> Vec<usize> {
    cids.sort_unstable();
    cids
}

#[tokio::test]
async fn test_initialization() {
    let (_translator, dlist, slot) = fixture(1150);
    assert_eq!(slot.num_cells(), 5);
    assert_eq!(slot.size_of_cell(3), mem(200));
    assert_eq!(slot.key(), "test_slot");
    for cid in 0..5 {
        assert_eq!(slot.cell_state(cid), CellState::NotLoaded);
        assert_eq!(slot.cell_pins(cid), 0);
    }
    assert_eq!(dlist.usage(), ResourceUsage::default());
    assert!(slot.queued_cells().is_empty());
    assert_eq!(slot.inflight_loads(), 0);
}

#[tokio::test]
async fn test_pin_single_cell() {
    let (translator, dlist, slot) = fixture(1150);

    let accessor = slot.pin_cells(&[30]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(translator.requested(), vec![vec![2]]);
    assert_eq!(dlist.usage(), mem(100));

    let cell = accessor.get(30);
    assert_eq!(cell.cid, 2);
    assert_eq!(cell.data, 20);
    assert!(std::ptr::eq(cell, accessor.cell(2)));
    assert_eq!(slot.cell_state(2), CellState::Loaded);
    assert_eq!(slot.cell_pins(2), 1);
}

#[tokio::test]
async fn test_pin_multiple_cells() {
    let (translator, dlist, slot) = fixture(1150);

    let accessor = slot.pin_cells(&[10, 40, 51]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(sorted(translator.requested().remove(0)), vec![0, 3, 4]);
    assert_eq!(dlist.usage(), mem(50 + 200 + 75));

    for (uid, cid) in [(10, 0), (40, 3), (51, 4)] {
        let cell = accessor.get(uid);
        assert_eq!(cell.cid, cid);
        assert_eq!(cell.data, cid as i64 * 10);
    }
}

#[tokio::test]
async fn test_uids_deduplicate_to_cells() {
    let (translator, dlist, slot) = fixture(1150);

    let accessor = slot.pin_cells(&[30, 50, 31, 51, 32]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(sorted(translator.requested().remove(0)), vec![2, 4]);
    assert_eq!(dlist.usage(), mem(100 + 75));
    assert_eq!(accessor.pinned_cells(), 2);

    // uids of one cell resolve to one payload
    assert!(std::ptr::eq(accessor.get(30), accessor.get(31)));
    assert!(std::ptr::eq(accessor.get(50), accessor.get(51)));
    assert_eq!(slot.cell_pins(2), 1);
}

#[tokio::test]
async fn test_invalid_uid_fails_without_loading() {
    let (translator, dlist, slot) = fixture(1150);

    match slot.pin_cells(&[10, 999]).await {
        Err(Error::InvalidCellId { uid, cid, cells, .. }) => {
            assert_eq!(uid, 999);
            assert_eq!(cid, 5);
            assert_eq!(cells, 5);
        }
        Err(e) => panic!("expected InvalidCellId, got {e:?}"),
        Ok(_) => panic!("expected InvalidCellId, got an accessor"),
    }
    assert_eq!(translator.calls(), 0);
    assert_eq!(dlist.usage(), ResourceUsage::default());
}

#[tokio::test]
async fn test_load_failure_restores_budget() {
    let (translator, dlist, slot) = fixture(1150);
    translator.set_fail_loads(true);

    let result = slot.pin_cells(&[20]).await;
    assert!(matches!(result, Err(Error::TranslatorLoadFailed { cid: 1, .. })));
    assert_eq!(translator.calls(), 1);
    assert_eq!(translator.requested(), vec![vec![1]]);
    assert_eq!(dlist.usage(), ResourceUsage::default());
    assert_eq!(slot.cell_state(1), CellState::Error);

    // the error is sticky: later pins observe it without retrying
    translator.set_fail_loads(false);
    let result = slot.pin_cells(&[20]).await;
    assert!(matches!(result, Err(Error::TranslatorLoadFailed { cid: 1, .. })));
    assert_eq!(translator.calls(), 1);
}

#[tokio::test]
async fn test_pin_loaded_cell_is_a_hit() {
    let (translator, dlist, slot) = fixture(1150);

    let accessor1 = slot.pin_cells(&[40]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(dlist.usage(), mem(200));

    let accessor2 = slot.pin_cells(&[40]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(dlist.usage(), mem(200));
    assert_eq!(slot.cell_pins(3), 2);

    // same resident payload for both accessors
    assert!(std::ptr::eq(accessor1.get(40), accessor2.get(40)));

    drop(accessor1);
    assert_eq!(slot.cell_pins(3), 1);
    assert_eq!(dlist.usage(), mem(200));
    assert_eq!(accessor2.get(40).cid, 3);

    drop(accessor2);
    assert_eq!(slot.cell_pins(3), 0);
    assert_eq!(slot.cell_state(3), CellState::Loaded);
}

#[tokio::test]
async fn test_pin_loaded_cell_via_different_uid() {
    let (translator, _dlist, slot) = fixture(1150);

    let accessor1 = slot.pin_cells(&[30]).await.unwrap();
    let accessor2 = slot.pin_cells(&[31]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert!(std::ptr::eq(accessor1.get(30), accessor2.get(31)));
}

#[tokio::test]
async fn test_translator_returns_extra_cells() {
    let (translator, dlist, slot) = fixture(1150);
    translator.set_extra_cids(vec![1]);

    let accessor = slot.pin_cells(&[10]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(translator.requested(), vec![vec![0]]);
    // the extra cell is charged too
    assert_eq!(dlist.usage(), mem(50 + 150));
    assert_eq!(accessor.pinned_cells(), 1);
    assert_eq!(slot.cell_state(0), CellState::Loaded);
    assert_eq!(slot.cell_state(1), CellState::Loaded);
    assert_eq!(slot.cell_pins(1), 0);

    // pinning the opportunistically loaded cell is a cache hit
    translator.set_extra_cids(vec![]);
    let accessor_extra = slot.pin_cells(&[20]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(dlist.usage(), mem(50 + 150));
    assert_eq!(accessor_extra.get(20).cid, 1);
}

#[tokio::test]
async fn test_eviction_under_pressure() {
    let (translator, dlist, slot) = fixture(300);

    let accessor = slot.pin_cells(&[10, 20, 30]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(sorted(translator.requested().remove(0)), vec![0, 1, 2]);
    assert_eq!(dlist.usage(), mem(300));
    drop(accessor);
    // unpinned cells stay resident
    assert_eq!(dlist.usage(), mem(300));

    let accessor = slot.pin_cells(&[40]).await.unwrap();
    assert_eq!(translator.calls(), 2);
    assert_eq!(translator.requested().remove(1), vec![3]);

    // the two tail-most cells were evicted to fit 200 bytes
    assert_eq!(dlist.usage(), mem(300));
    assert_eq!(slot.cell_state(0), CellState::NotLoaded);
    assert_eq!(slot.cell_state(1), CellState::NotLoaded);
    assert_eq!(slot.cell_state(2), CellState::Loaded);
    assert_eq!(accessor.get(40).cid, 3);
    assert_eq!(dlist.evictions(), 2);
}

#[tokio::test]
async fn test_pinned_cells_are_never_evicted() {
    let (_translator, dlist, slot) = fixture(300);

    let accessor = slot.pin_cells(&[20]).await.unwrap();
    assert_eq!(dlist.usage(), mem(150));

    dlist.update_limit(mem(100));
    let result = slot.pin_cells(&[40]).await;
    assert!(matches!(
        result,
        Err(Error::InsufficientResource { cid: 3, .. })
    ));

    // the pinned cell is untouched and still readable
    assert_eq!(slot.cell_state(1), CellState::Loaded);
    assert_eq!(dlist.usage(), mem(150));
    assert_eq!(accessor.get(20).cid, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pins_share_one_load() {
    let (translator, dlist, slot) = fixture(1150);
    translator.set_load_delay(Duration::from_millis(20));

    let s1 = slot.clone();
    let s2 = slot.clone();
    let (a1, a2) = tokio::join!(
        tokio::spawn(async move { s1.pin_cells(&[20]).await }),
        tokio::spawn(async move { s2.pin_cells(&[20]).await }),
    );
    let a1 = a1.unwrap().unwrap();
    let a2 = a2.unwrap().unwrap();

    assert_eq!(translator.calls(), 1);
    assert_eq!(dlist.usage(), mem(150));
    assert_eq!(slot.cell_pins(1), 2);
    assert_eq!(a1.get(20).data, 10);
    assert_eq!(a2.get(20).data, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_observability() {
    let translator = translator();
    translator.set_load_delay(Duration::from_millis(200));
    let slot = CacheSlot::new(
        translator.clone(),
        None,
        CacheSlotOptions {
            load_delay: Duration::from_millis(20),
        },
    );

    let pinner = {
        let slot = slot.clone();
        tokio::spawn(async move { slot.pin_cells(&[30]).await })
    };

    // the cell queues during the debounce window
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while slot.queued_cells() != vec![2] && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(slot.queued_cells(), vec![2]);
    assert_eq!(slot.cell_state(2), CellState::Loading);

    // then moves to the in-flight batch
    while slot.inflight_loads() != 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(slot.inflight_loads(), 1);
    assert!(slot.queued_cells().is_empty());

    let accessor = pinner.await.unwrap().unwrap();
    assert_eq!(slot.inflight_loads(), 0);
    assert_eq!(accessor.get(30).cid, 2);
}

#[tokio::test]
async fn test_slot_without_budget() {
    let translator = translator();
    let slot = CacheSlot::new(translator.clone(), None, CacheSlotOptions::default());

    let accessor = slot.pin_cells(&[10, 20, 30, 40, 50]).await.unwrap();
    assert_eq!(translator.calls(), 1);
    assert_eq!(accessor.pinned_cells(), 5);
    drop(accessor);

    // nothing evicts without a budget
    let _accessor = slot.pin_cells(&[10]).await.unwrap();
    assert_eq!(translator.calls(), 1);
}

#[tokio::test]
async fn test_slot_metrics() {
    use std::sync::atomic::Ordering;

    let (_translator, _dlist, slot) = fixture(1150);

    let accessor = slot.pin_cells(&[30]).await.unwrap();
    drop(accessor);
    let _accessor = slot.pin_cells(&[30, 40]).await.unwrap();

    let metrics = slot.metrics();
    assert_eq!(metrics.miss.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.hit.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.load.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.load_error.load(Ordering::Relaxed), 0);
}

#[test_log::test(tokio::test)]
async fn test_manager_reconfiguration() {
    let manager = Manager::new();
    manager.configure(&TieredCacheConfig {
        enabled: true,
        memory_limit_bytes: 1150,
        disk_limit_bytes: 0,
        touch_refresh_window_secs: None,
    });
    assert!(manager.is_enabled());

    let slot = manager.create_slot(translator());
    let accessor = slot.pin_cells(&[30]).await.unwrap();
    assert_eq!(manager.usage(), mem(100));

    // raising the limits keeps the existing list and its contents
    manager.configure(&TieredCacheConfig {
        enabled: true,
        memory_limit_bytes: 4096,
        disk_limit_bytes: 1024,
        touch_refresh_window_secs: Some(1),
    });
    assert_eq!(manager.usage(), mem(100));

    // disabling must not invalidate outstanding accessors
    manager.configure(&TieredCacheConfig {
        enabled: false,
        memory_limit_bytes: 0,
        disk_limit_bytes: 0,
        touch_refresh_window_secs: None,
    });
    assert!(!manager.is_enabled());
    assert_eq!(manager.usage(), ResourceUsage::default());
    assert_eq!(accessor.get(30).cid, 2);

    // slots created while disabled run without a budget
    let slot = manager.create_slot(translator());
    let _accessor = slot.pin_cells(&[40]).await.unwrap();
    assert_eq!(manager.usage(), ResourceUsage::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fuzzy() {
    const CELLS: usize = 32;
    const LIMIT: usize = 256;

    let sizes = (0..CELLS).map(|cid| mem((cid % 7 + 1) * 8)).collect();
    let translator = MockTranslator::identity(sizes, "fuzz_slot");
    let dlist = Arc::new(DList::new(mem(LIMIT), TouchConfig::default()));
    let slot = CacheSlot::new(
        translator.clone(),
        Some(dlist.clone()),
        CacheSlotOptions::default(),
    );

    let tasks = (0..4)
        .map(|seed| {
            let slot = slot.clone();
            tokio::spawn(async move {
                let mut rng = SmallRng::seed_from_u64(114514 + seed);
                for _ in 0..100 {
                    let uids = (0..rng.gen_range(1..4))
                        .map(|_| rng.gen_range(0..CELLS as u64))
                        .collect::<Vec<_>>();
                    match slot.pin_cells(&uids).await {
                        Ok(accessor) => {
                            for &uid in &uids {
                                assert_eq!(accessor.get(uid).cid, uid as usize);
                            }
                        }
                        // budget pressure from concurrently pinned cells
                        Err(Error::InsufficientResource { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                    if rng.gen_bool(0.2) {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(dlist.usage().within(&mem(LIMIT)));
}
