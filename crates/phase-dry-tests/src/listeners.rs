// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Event listeners for tests: recording, vetoing and trimming.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use phase_core::{
    BlockPos, Cause, DirectionSet, EventListener, EventPayload, PhaseEvent, PhaseKind,
    PhaseTracker,
};

/// One event as a [`RecordingListener`] saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Event name.
    pub name: &'static str,
    /// Payload at the time the listener ran.
    pub payload: EventPayload,
    /// Cause chain.
    pub cause: Cause,
    /// Whether an earlier listener had already cancelled it.
    pub cancelled: bool,
    /// Stack depth when the event fired.
    pub depth: usize,
}

impl RecordedEvent {
    /// Innermost phase kind of the cause chain.
    pub fn phase(&self) -> Option<PhaseKind> {
        self.cause.first().map(|f| f.kind)
    }
}

/// Shared, cloneable event log.
///
/// # Example
///
/// ```
/// use phase_core::{BlockPos, BlockState, ChangeFlags, PhaseTracker};
/// use phase_dry_tests::{EventLog, MemoryWorld};
///
/// let log = EventLog::new();
/// let mut tracker = PhaseTracker::new(MemoryWorld::new());
/// tracker.subscribe(log.listener());
/// tracker.propose_block_change(BlockPos::new(0, 64, 0), BlockState(1), ChangeFlags::NONE);
/// assert_eq!(log.names(), vec!["change_block_pre", "change_block_post"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecordedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listener that appends to this log.
    pub fn listener(&self) -> RecordingListener {
        RecordingListener { log: self.clone() }
    }

    /// Every recorded event, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.lock().clone()
    }

    /// Names of every recorded event, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.lock().iter().map(|e| e.name).collect()
    }

    /// Recorded events named `name`.
    pub fn named(&self, name: &str) -> Vec<RecordedEvent> {
        self.lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Appends every event to an [`EventLog`].
#[derive(Debug, Clone)]
pub struct RecordingListener {
    log: EventLog,
}

impl EventListener for RecordingListener {
    fn on_event(&mut self, event: &mut PhaseEvent, tracker: &mut PhaseTracker) {
        let recorded = RecordedEvent {
            name: event.name(),
            payload: event.payload().clone(),
            cause: event.cause().clone(),
            cancelled: event.is_cancelled(),
            depth: tracker.depth(),
        };
        self.log.lock().push(recorded);
    }
}

/// Cancels every event the predicate accepts.
#[derive(Debug, Clone)]
pub struct VetoListener<F> {
    predicate: F,
}

impl<F> VetoListener<F>
where
    F: FnMut(&PhaseEvent) -> bool + Send,
{
    /// Listener cancelling events for which `predicate` returns true.
    pub const fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> EventListener for VetoListener<F>
where
    F: FnMut(&PhaseEvent) -> bool + Send,
{
    fn on_event(&mut self, event: &mut PhaseEvent, _tracker: &mut PhaseTracker) {
        if (self.predicate)(event) {
            event.cancel();
        }
    }
}

/// Vetoes the pre-change event of every block change at `pos`.
pub fn veto_block_changes_at(
    pos: BlockPos,
) -> VetoListener<impl FnMut(&PhaseEvent) -> bool + Send> {
    VetoListener::new(move |event: &PhaseEvent| {
        matches!(event.payload(), EventPayload::ChangeBlockPre(tx) if tx.pos == pos)
    })
}

/// Vetoes every event named `name`.
pub fn veto_named(name: &'static str) -> VetoListener<impl FnMut(&PhaseEvent) -> bool + Send> {
    VetoListener::new(move |event: &PhaseEvent| event.name() == name)
}

/// Removes directions from every neighbor event.
#[derive(Debug, Clone, Copy)]
pub struct DirectionFilter {
    remove: DirectionSet,
}

impl DirectionFilter {
    /// Filter stripping `remove` from each notification.
    pub const fn removing(remove: DirectionSet) -> Self {
        Self { remove }
    }
}

impl EventListener for DirectionFilter {
    fn on_event(&mut self, event: &mut PhaseEvent, _tracker: &mut PhaseTracker) {
        if let EventPayload::NotifyNeighbor { directions, .. } = event.payload_mut() {
            for direction in self.remove.iter() {
                directions.remove(direction);
            }
        }
    }
}

/// Drops entities of one type from every spawn event.
#[derive(Debug, Clone)]
pub struct SpawnFilter {
    reject: String,
}

impl SpawnFilter {
    /// Filter rejecting entities whose kind is `kind`.
    pub fn rejecting(kind: impl Into<String>) -> Self {
        Self {
            reject: kind.into(),
        }
    }
}

impl EventListener for SpawnFilter {
    fn on_event(&mut self, event: &mut PhaseEvent, _tracker: &mut PhaseTracker) {
        if let EventPayload::SpawnEntity { entities, .. } = event.payload_mut() {
            entities.retain(|e| e.kind != self.reject);
        }
    }
}

/// Drops stacks of one item type from every drop event.
#[derive(Debug, Clone)]
pub struct DropFilter {
    reject: String,
}

impl DropFilter {
    /// Filter rejecting stacks whose item is `item`.
    pub fn rejecting(item: impl Into<String>) -> Self {
        Self {
            reject: item.into(),
        }
    }
}

impl EventListener for DropFilter {
    fn on_event(&mut self, event: &mut PhaseEvent, _tracker: &mut PhaseTracker) {
        if let EventPayload::DropItem { items, .. } = event.payload_mut() {
            items.retain(|i| i.item != self.reject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryWorld;
    use phase_core::{BlockState, ChangeFlags, Direction, PhaseSource};

    #[test]
    fn log_records_depth_and_phase() {
        let log = EventLog::new();
        let mut tracker = PhaseTracker::new(MemoryWorld::new());
        tracker.subscribe(log.listener());
        let p = BlockPos::new(0, 64, 0);
        tracker.scoped(PhaseKind::Command, PhaseSource::World, |t, _| {
            t.propose_block_change(p, BlockState(2), ChangeFlags::NONE);
        });
        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase(), Some(PhaseKind::Command));
        assert_eq!(events[0].depth, 1);
    }

    #[test]
    fn veto_blocks_single_position() {
        let world = MemoryWorld::new();
        let mut tracker = PhaseTracker::new(world.clone());
        let p = BlockPos::new(0, 64, 0);
        let q = BlockPos::new(1, 64, 0);
        tracker.subscribe(veto_block_changes_at(p));
        tracker.propose_block_change(p, BlockState(2), ChangeFlags::NONE);
        tracker.propose_block_change(q, BlockState(2), ChangeFlags::NONE);
        assert_eq!(world.block(p), BlockState::AIR);
        assert_eq!(world.block(q), BlockState(2));
    }

    #[test]
    fn direction_filter_trims_notifications() {
        let mut tracker = PhaseTracker::new(MemoryWorld::new());
        tracker.subscribe(DirectionFilter::removing(DirectionSet::only(Direction::Up)));
        let surviving = tracker.notify_neighbors(
            BlockPos::new(0, 64, 0),
            BlockState(1),
            DirectionSet::ALL,
        );
        assert_eq!(surviving.len(), 5);
        assert!(!surviving.contains(Direction::Up));
    }
}
