// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cancellable events and the listener bus.
//!
//! Events are plain data. Listeners receive the event mutably (to cancel it
//! or trim its "allowed" sub-fields) together with the tracker, so they may
//! propose further mutations; the router reads the event back after firing.

use serde::Serialize;

use crate::context::{BlockTransaction, PhaseSource};
use crate::ident::{BlockPos, DirectionSet, UserId};
use crate::phase::PhaseKind;
use crate::record::{BlockState, Entity, ItemDrop, SpawnType};
use crate::tracker::PhaseTracker;

/// One frame of a cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CauseFrame {
    /// Phase kind of the frame.
    pub kind: PhaseKind,
    /// Source of the frame.
    pub source: PhaseSource,
}

/// Why an event fired: the visible phase stack plus attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Cause {
    /// Frames, top of stack first.
    pub frames: Vec<CauseFrame>,
    /// Nearest owner attribution.
    pub owner: Option<UserId>,
    /// Nearest notifier attribution.
    pub notifier: Option<UserId>,
}

impl Cause {
    /// Innermost frame.
    pub fn first(&self) -> Option<&CauseFrame> {
        self.frames.first()
    }

    /// Outermost frame.
    pub fn root(&self) -> Option<&CauseFrame> {
        self.frames.last()
    }

    /// Whether any frame in the chain is of `kind`.
    pub fn contains(&self, kind: PhaseKind) -> bool {
        self.frames.iter().any(|f| f.kind == kind)
    }
}

/// Event-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Before a block change is written. Cancelling skips the write.
    ChangeBlockPre(BlockTransaction),
    /// After a block change was written.
    ChangeBlockPost(BlockTransaction),
    /// Neighbor notification. Listeners may remove directions.
    NotifyNeighbor {
        /// Changed position.
        source: BlockPos,
        /// Block now at `source`.
        block: BlockState,
        /// Directions that will be notified.
        directions: DirectionSet,
    },
    /// Bulk spawn for one cause group. Listeners may drop entities.
    SpawnEntity {
        /// Cause shared by every entity in the group.
        spawn_type: SpawnType,
        /// Entities that will be added.
        entities: Vec<Entity>,
    },
    /// Items dropping at one position. Listeners may drop stacks.
    DropItem {
        /// Drop position.
        pos: BlockPos,
        /// Stacks that will be spawned.
        items: Vec<ItemDrop>,
    },
}

impl EventPayload {
    /// Stable event name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ChangeBlockPre(_) => "change_block_pre",
            Self::ChangeBlockPost(_) => "change_block_post",
            Self::NotifyNeighbor { .. } => "notify_neighbor",
            Self::SpawnEntity { .. } => "spawn_entity",
            Self::DropItem { .. } => "drop_item",
        }
    }
}

/// An event in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    cause: Cause,
    payload: EventPayload,
    cancelled: bool,
}

impl PhaseEvent {
    /// Builds an uncancelled event.
    #[must_use]
    pub const fn new(cause: Cause, payload: EventPayload) -> Self {
        Self {
            cause,
            payload,
            cancelled: false,
        }
    }

    /// Cause chain.
    pub const fn cause(&self) -> &Cause {
        &self.cause
    }

    /// Event data.
    pub const fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Mutable event data.
    pub fn payload_mut(&mut self) -> &mut EventPayload {
        &mut self.payload
    }

    /// Consumes the event and returns its data.
    #[must_use]
    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    /// Whether a listener cancelled the event.
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Marks the event cancelled. Post events ignore cancellation.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Event name.
    pub const fn name(&self) -> &'static str {
        self.payload.name()
    }
}

/// Receives every event fired through the tracker.
pub trait EventListener: Send {
    /// Handles one event. Nested events fired while this call runs are not
    /// delivered back to the same listener.
    fn on_event(&mut self, event: &mut PhaseEvent, tracker: &mut PhaseTracker);
}

impl<F> EventListener for F
where
    F: FnMut(&mut PhaseEvent, &mut PhaseTracker) + Send,
{
    fn on_event(&mut self, event: &mut PhaseEvent, tracker: &mut PhaseTracker) {
        self(event, tracker);
    }
}

/// Registration token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A registered listener. `listener` is `None` while it is running.
struct Slot {
    id: ListenerId,
    listener: Option<Box<dyn EventListener>>,
}

/// Ordered listener registry.
///
/// The bus only stores listeners; [`PhaseTracker`] performs delivery so that
/// listeners can borrow the tracker mutably. A listener is checked out of its
/// slot for the duration of its call, which keeps nested events away from it
/// without any locking.
#[derive(Default)]
pub struct EventBus {
    slots: Vec<Slot>,
    next_id: u64,
    fired: u64,
}

impl EventBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` after every existing one.
    pub fn subscribe<L>(&mut self, listener: L) -> ListenerId
    where
        L: EventListener + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot {
            id,
            listener: Some(Box::new(listener)),
        });
        id
    }

    /// Removes a listener; returns whether it was registered. A listener
    /// removed while it runs is dropped once its call returns.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);
        before != self.slots.len()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total events fired through this bus.
    pub const fn fired(&self) -> u64 {
        self.fired
    }

    /// Counts one event and returns the listeners it goes to, in
    /// registration order.
    pub(crate) fn begin_dispatch(&mut self) -> Vec<ListenerId> {
        self.fired += 1;
        self.slots.iter().map(|slot| slot.id).collect()
    }

    /// Takes the listener out of its slot; `None` when it is already running
    /// or was removed.
    pub(crate) fn check_out(&mut self, id: ListenerId) -> Option<Box<dyn EventListener>> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.listener.take())
    }

    /// Puts a listener back after its call.
    pub(crate) fn check_in(&mut self, id: ListenerId, listener: Box<dyn EventListener>) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == id) {
            slot.listener = Some(listener);
        }
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.slots.len())
            .field("fired", &self.fired)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_unsubscribe() {
        let mut bus = EventBus::new();
        let a = bus.subscribe(|_: &mut PhaseEvent, _: &mut PhaseTracker| {});
        let b = bus.subscribe(|e: &mut PhaseEvent, _: &mut PhaseTracker| e.cancel());
        assert_ne!(a, b);
        assert_eq!(bus.len(), 2);
        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn dispatch_counts_fires() {
        let mut bus = EventBus::new();
        bus.subscribe(|_: &mut PhaseEvent, _: &mut PhaseTracker| {});
        assert_eq!(bus.begin_dispatch().len(), 1);
        assert_eq!(bus.begin_dispatch().len(), 1);
        assert_eq!(bus.fired(), 2);
    }

    #[test]
    fn running_listener_cannot_be_checked_out_twice() {
        let mut bus = EventBus::new();
        let id = bus.subscribe(|_: &mut PhaseEvent, _: &mut PhaseTracker| {});
        let listener = bus.check_out(id).unwrap();
        assert!(bus.check_out(id).is_none());
        bus.check_in(id, listener);
        assert!(bus.check_out(id).is_some());
    }

    #[test]
    fn listener_removed_while_running_stays_removed() {
        let mut bus = EventBus::new();
        let id = bus.subscribe(|_: &mut PhaseEvent, _: &mut PhaseTracker| {});
        let listener = bus.check_out(id).unwrap();
        assert!(bus.unsubscribe(id));
        bus.check_in(id, listener);
        assert!(bus.is_empty());
        assert!(bus.check_out(id).is_none());
    }

    #[test]
    fn cause_reports_innermost_and_root() {
        let cause = Cause {
            frames: vec![
                CauseFrame {
                    kind: PhaseKind::BlockDrops,
                    source: PhaseSource::None,
                },
                CauseFrame {
                    kind: PhaseKind::Explosion,
                    source: PhaseSource::World,
                },
            ],
            owner: None,
            notifier: None,
        };
        assert_eq!(cause.first().map(|f| f.kind), Some(PhaseKind::BlockDrops));
        assert_eq!(cause.root().map(|f| f.kind), Some(PhaseKind::Explosion));
        assert!(cause.contains(PhaseKind::Explosion));
        assert!(!cause.contains(PhaseKind::Command));
    }

    #[test]
    fn cancel_is_sticky() {
        let mut event = PhaseEvent::new(
            Cause::default(),
            EventPayload::DropItem {
                pos: BlockPos::new(0, 0, 0),
                items: vec![ItemDrop::new("stone", 1)],
            },
        );
        assert!(!event.is_cancelled());
        event.cancel();
        assert!(event.is_cancelled());
        assert_eq!(event.name(), "drop_item");
    }
}
