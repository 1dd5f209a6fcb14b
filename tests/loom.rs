#![allow(missing_docs)]
#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicUsize, Ordering};
use rtf::{
    ForestConfig, RegionTreeForest,
    domain::Domain,
    types::{ContextId, LogicalRegion},
};
use std::sync::Arc;

fn forest_with_region() -> (Arc<RegionTreeForest>, LogicalRegion, ContextId) {
    let forest = RegionTreeForest::new(ForestConfig::default());
    let shape = forest.shape();
    let space = shape.create_index_space(Domain::rect1(0, 15));
    let fs = shape.create_field_space();
    shape.allocate_field(fs, 0, 8).unwrap();
    let region = shape.create_logical_region(space, fs).unwrap();
    let ctx = forest.allocate_context();
    (Arc::new(forest), region, ctx)
}

#[test]
fn loom_physical_state_lock_is_exclusive() {
    loom::model(|| {
        let (forest, region, ctx) = forest_with_region();
        let node = forest.region_node(region).unwrap();
        let holders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let forest = Arc::clone(&forest);
                let holders = Arc::clone(&holders);
                loom::thread::spawn(move || {
                    if let Some(granted) = forest.acquire_physical_state(ctx, node, true) {
                        while !forest.events().has_triggered(granted) {
                            loom::thread::yield_now();
                        }
                    }
                    // Nobody else may hold the state in between.
                    assert_eq!(holders.fetch_add(1, Ordering::AcqRel), 0);
                    assert_eq!(holders.fetch_sub(1, Ordering::AcqRel), 1);
                    forest.release_physical_state(ctx, node);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Both holds were released.
        assert!(forest.acquire_physical_state(ctx, node, true).is_none());
        forest.release_physical_state(ctx, node);
    });
}

#[test]
fn loom_continuations_run_once() {
    loom::model(|| {
        let (forest, _, _) = forest_with_region();
        let event = forest.events().create_user_event();
        let runs = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let forest = Arc::clone(&forest);
            let runs = Arc::clone(&runs);
            loom::thread::spawn(move || {
                forest.events().on_trigger(event, move || {
                    runs.fetch_add(1, Ordering::AcqRel);
                });
            })
        };
        let trigger = {
            let forest = Arc::clone(&forest);
            loom::thread::spawn(move || forest.events().trigger(event))
        };
        waiter.join().unwrap();
        trigger.join().unwrap();

        assert!(forest.events().has_triggered(event));
        assert_eq!(runs.load(Ordering::Acquire), 1);
    });
}

#[test]
fn loom_readers_share_the_state() {
    loom::model(|| {
        let (forest, region, ctx) = forest_with_region();
        let node = forest.region_node(region).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let forest = Arc::clone(&forest);
                loom::thread::spawn(move || {
                    let waited = forest.acquire_physical_state(ctx, node, false);
                    forest.release_physical_state(ctx, node);
                    waited
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_none(), "shared holds never queue behind each other");
        }
    });
}
