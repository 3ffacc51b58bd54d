// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]
use phase_core::config::{ConfigService, TrackerConfig};
use phase_core::{
    BlockState, ChangeFlags, PhaseKind, PhaseSource, Proposal, SpawnType, TileEntityOp,
};
use phase_dry_tests::{InMemoryConfigStore, MemoryWorld, TrackerTestBuilder};
mod common;
use common::{at, chest, mob, ORIGIN};

fn tracker_from_store(store: InMemoryConfigStore) -> (phase_core::PhaseTracker, MemoryWorld) {
    let config = ConfigService::new(store).tracker_config().unwrap();
    TrackerTestBuilder::new().with_config(config).build_with_world()
}

#[test]
fn disabled_kinds_apply_block_and_tile_changes_immediately() {
    let store = InMemoryConfigStore::with_tracker_config(&TrackerConfig {
        disabled_capture_kinds: vec![PhaseKind::Explosion],
        ..TrackerConfig::default()
    })
    .unwrap();
    let (mut t, world) = tracker_from_store(store);

    let h = t.begin_phase(PhaseKind::Explosion, PhaseSource::Block(ORIGIN));
    assert_eq!(
        t.propose_block_change(ORIGIN, BlockState(1), ChangeFlags::NONE),
        Proposal::Applied { changed: true }
    );
    assert!(t
        .propose_tile_entity_op(at(1), TileEntityOp::Set(chest(1)))
        .is_applied());
    // Spawns are not governed by bulk block capture.
    assert!(t
        .propose_entity_spawn(mob(1, "creeper", at(2)), SpawnType::Placement)
        .is_captured());
    assert_eq!(world.block(ORIGIN), BlockState(1));
    assert_eq!(world.tile(at(1)), Some(chest(1)));
    t.close(h).unwrap();
    assert_eq!(world.entity_count(), 1);

    // Other kinds still capture.
    t.scoped(PhaseKind::Command, PhaseSource::World, |t, _| {
        assert!(t
            .propose_block_change(at(3), BlockState(1), ChangeFlags::NONE)
            .is_captured());
    });
}

#[test]
fn missing_config_uses_defaults() {
    let store = InMemoryConfigStore::new();
    let (t, _world) = tracker_from_store(store.clone());
    assert_eq!(t.config(), &TrackerConfig::default());
    assert_eq!(store.load_count(), 1);
}

#[test]
fn saved_config_is_picked_up_by_the_next_tracker() {
    let store = InMemoryConfigStore::new();
    let service = ConfigService::new(store.clone());
    let config = TrackerConfig {
        verbose: false,
        max_unwind_depth: 16,
        stack_warning_depth: 4,
        fire_neighbor_events: false,
        disabled_capture_kinds: vec![PhaseKind::BlockWorker],
    };
    service.save_tracker_config(&config).unwrap();
    let (t, _world) = tracker_from_store(store);
    assert_eq!(t.config(), &config);
}

#[test]
fn deep_stacks_still_balance_past_the_warning_depth() {
    let mut t = TrackerTestBuilder::new()
        .with_config(TrackerConfig {
            stack_warning_depth: 2,
            ..TrackerConfig::default()
        })
        .build();
    let handles: Vec<_> = (0..6)
        .map(|x| {
            let kind = if x % 2 == 0 {
                PhaseKind::Command
            } else {
                PhaseKind::EntityTick
            };
            t.begin_phase(kind, PhaseSource::Block(at(x)))
        })
        .collect();
    assert_eq!(t.depth(), 6);
    assert_eq!(t.frame_summaries().len(), 6);
    for h in handles.into_iter().rev() {
        t.close(h).unwrap();
    }
    assert_eq!(t.depth(), 0);
}
