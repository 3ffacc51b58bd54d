// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tracker builder wiring the doubles together.

use phase_core::config::TrackerConfig;
use phase_core::PhaseTracker;

use crate::attribution::StaticAttribution;
use crate::listeners::EventLog;
use crate::world::MemoryWorld;

/// Builder for trackers over a [`MemoryWorld`].
///
/// # Example
///
/// ```
/// use phase_dry_tests::{EventLog, TrackerTestBuilder};
///
/// let log = EventLog::new();
/// let (tracker, world) = TrackerTestBuilder::new()
///     .with_max_unwind_depth(8)
///     .recording(&log)
///     .build_with_world();
/// assert_eq!(tracker.depth(), 0);
/// assert!(world.journal().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct TrackerTestBuilder {
    world: Option<MemoryWorld>,
    config: TrackerConfig,
    attribution: Option<StaticAttribution>,
    logs: Vec<EventLog>,
}

impl TrackerTestBuilder {
    /// Builder with a fresh world and default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `world` (or a clone sharing its state).
    pub fn with_world(mut self, world: MemoryWorld) -> Self {
        self.world = Some(world);
        self
    }

    /// Replace the whole config.
    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound child unwind nesting.
    pub fn with_max_unwind_depth(mut self, depth: usize) -> Self {
        self.config.max_unwind_depth = depth;
        self
    }

    /// Switch the neighbor event on or off.
    pub fn with_neighbor_events(mut self, enabled: bool) -> Self {
        self.config.fire_neighbor_events = enabled;
        self
    }

    /// Install an attribution table.
    pub fn with_attribution(mut self, attribution: StaticAttribution) -> Self {
        self.attribution = Some(attribution);
        self
    }

    /// Subscribe a recorder for `log` before anything else.
    pub fn recording(mut self, log: &EventLog) -> Self {
        self.logs.push(log.clone());
        self
    }

    /// Build the tracker.
    pub fn build(self) -> PhaseTracker {
        self.build_with_world().0
    }

    /// Build the tracker and return a handle to its world.
    pub fn build_with_world(self) -> (PhaseTracker, MemoryWorld) {
        let world = self.world.unwrap_or_default();
        let mut tracker = PhaseTracker::with_config(world.clone(), self.config);
        if let Some(attribution) = self.attribution {
            tracker = tracker.with_attribution(attribution);
        }
        for log in &self.logs {
            tracker.subscribe(log.listener());
        }
        (tracker, world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phase_core::{BlockPos, BlockState, ChangeFlags, PhaseKind, PhaseSource, UserId};

    #[test]
    fn builder_wires_attribution_and_recorder() {
        let p = BlockPos::new(0, 64, 0);
        let attribution = StaticAttribution::new().with_owner(p, UserId(9));
        let log = EventLog::new();
        let (mut tracker, world) = TrackerTestBuilder::new()
            .with_attribution(attribution.clone())
            .recording(&log)
            .build_with_world();
        tracker.scoped(PhaseKind::PlayerInteraction, PhaseSource::Block(p), |t, _| {
            assert_eq!(t.get_owner(), Some(UserId(9)));
            t.propose_block_change(p, BlockState(3), ChangeFlags::NONE);
        });
        assert_eq!(world.block(p), BlockState(3));
        assert_eq!(attribution.changes()[0].owner, Some(UserId(9)));
        assert_eq!(log.names(), vec!["change_block_pre", "change_block_post"]);
    }

    #[test]
    fn config_knobs_apply() {
        let tracker = TrackerTestBuilder::new()
            .with_max_unwind_depth(3)
            .with_neighbor_events(false)
            .build();
        assert_eq!(tracker.config().max_unwind_depth, 3);
        assert!(!tracker.config().fire_neighbor_events);
    }
}
