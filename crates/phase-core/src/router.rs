// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mutation entry points: capture into the top frame or apply immediately.
//!
//! Each proposal consults the visible top frame's descriptor. When the
//! matching capture predicate holds the mutation is buffered and reported as
//! [`Proposal::Captured`]; otherwise it is applied now, firing its events.

use tracing::{debug, warn};

use crate::context::{
    BlockTransaction, CapturedSpawn, NeighborNotification, PhaseContext, PhaseSource,
    TileEntityChange,
};
use crate::error::InvalidMutation;
use crate::event::{EventPayload, PhaseEvent};
use crate::ident::{BlockPos, DirectionSet};
use crate::phase::{lookup, PhaseKind, PhaseStateDescriptor};
use crate::record::{BlockState, ChangeFlags, Entity, ItemDrop, SpawnType, TileEntity};
use crate::tracker::PhaseTracker;

/// Outcome of a proposed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    /// Applied now. `changed` is false when an event vetoed the mutation or
    /// it had no effect.
    Applied {
        /// Whether world storage changed.
        changed: bool,
    },
    /// Buffered in the active context; applied when the frame unwinds.
    Captured,
    /// Rejected by a validity check; nothing was buffered or applied.
    Invalid(InvalidMutation),
}

impl Proposal {
    /// Whether the mutation was buffered.
    pub const fn is_captured(self) -> bool {
        matches!(self, Self::Captured)
    }

    /// Whether the mutation changed world storage right away.
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied { changed: true })
    }
}

/// Tile-entity operation for [`PhaseTracker::propose_tile_entity_op`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileEntityOp {
    /// Install (or replace) the tile at the position.
    Set(TileEntity),
    /// Remove the tile at the position.
    Remove,
}

type CapturePredicate = fn(&PhaseStateDescriptor, &PhaseContext) -> bool;

impl PhaseTracker {
    /// Proposes writing `state` at `pos`.
    pub fn propose_block_change(
        &mut self,
        pos: BlockPos,
        state: BlockState,
        flags: ChangeFlags,
    ) -> Proposal {
        if !self.world.is_valid(pos) {
            debug!(%pos, "block change out of bounds");
            return Proposal::Invalid(InvalidMutation::OutOfBounds(pos));
        }
        let mut tx = BlockTransaction {
            pos,
            previous: self.block_at(pos),
            proposed: state,
            flags,
            owner: self.get_owner(),
            notifier: self.get_notifier(),
        };
        if let Some(ctx) = self.capture_context(PhaseStateDescriptor::does_bulk_block_capture) {
            ctx.push_block_transaction(tx);
            return Proposal::Captured;
        }
        // Buffered changes of enclosing frames have not landed yet; an
        // immediate write compares against storage.
        tx.previous = self.world.read_block(pos);
        self.apply_block_now(tx)
    }

    /// Proposes adding `entity` for the given cause.
    pub fn propose_entity_spawn(&mut self, entity: Entity, spawn_type: SpawnType) -> Proposal {
        if !self.world.is_valid(entity.pos) {
            debug!(pos = %entity.pos, id = %entity.id, "spawn out of bounds");
            return Proposal::Invalid(InvalidMutation::OutOfBounds(entity.pos));
        }
        if self.world.contains_entity(entity.id)
            || self.stack.iter().any(|f| f.context.contains_spawn(entity.id))
        {
            debug!(id = %entity.id, "duplicate spawn rejected");
            return Proposal::Invalid(InvalidMutation::DuplicateEntity(entity.id));
        }
        let owner = self.get_owner();
        let notifier = self.get_notifier();
        if let Some(ctx) = self.capture_context(PhaseStateDescriptor::does_capture_entity_spawns) {
            ctx.push_spawn(CapturedSpawn {
                entity,
                spawn_type,
                owner,
                notifier,
            });
            return Proposal::Captured;
        }

        let mut event = PhaseEvent::new(
            self.cause(),
            EventPayload::SpawnEntity {
                spawn_type,
                entities: vec![entity],
            },
        );
        self.fire(&mut event);
        if event.is_cancelled() {
            return Proposal::Applied { changed: false };
        }
        let EventPayload::SpawnEntity { entities, .. } = event.into_payload() else {
            return Proposal::Applied { changed: false };
        };
        let mut changed = false;
        for entity in entities {
            let id = entity.id;
            match self.world.add_entity(entity) {
                Ok(()) => changed = true,
                Err(err) => warn!(%id, %err, "entity spawn failed"),
            }
        }
        Proposal::Applied { changed }
    }

    /// Proposes dropping `item` at `pos`.
    pub fn propose_item_drop(&mut self, pos: BlockPos, item: ItemDrop) -> Proposal {
        if !self.world.is_valid(pos) {
            debug!(%pos, "item drop out of bounds");
            return Proposal::Invalid(InvalidMutation::OutOfBounds(pos));
        }
        if let Some(ctx) = self.capture_context(PhaseStateDescriptor::does_capture_item_drops) {
            ctx.push_drop(pos, item);
            return Proposal::Captured;
        }

        let mut event = PhaseEvent::new(
            self.cause(),
            EventPayload::DropItem {
                pos,
                items: vec![item],
            },
        );
        self.fire(&mut event);
        if event.is_cancelled() {
            return Proposal::Applied { changed: false };
        }
        let EventPayload::DropItem { items, .. } = event.into_payload() else {
            return Proposal::Applied { changed: false };
        };
        let mut changed = false;
        for item in &items {
            match self.world.spawn_item(pos, item) {
                Ok(_) => changed = true,
                Err(err) => warn!(%pos, item = %item.item, %err, "item drop failed"),
            }
        }
        Proposal::Applied { changed }
    }

    /// Proposes installing or removing the tile entity at `pos`.
    pub fn propose_tile_entity_op(&mut self, pos: BlockPos, op: TileEntityOp) -> Proposal {
        if !self.world.is_valid(pos) {
            debug!(%pos, "tile change out of bounds");
            return Proposal::Invalid(InvalidMutation::OutOfBounds(pos));
        }
        let new = match op {
            TileEntityOp::Set(tile) => Some(tile),
            TileEntityOp::Remove => None,
        };
        let previous = self.tile_at(pos);
        if let Some(ctx) = self.capture_context(PhaseStateDescriptor::tracks_tile_entity_changes) {
            if previous.is_none() && new.is_none() {
                return Proposal::Applied { changed: false };
            }
            ctx.push_tile_change(TileEntityChange { pos, previous, new });
            return Proposal::Captured;
        }
        if new.is_none() && self.world.tile_entity(pos).is_none() {
            return Proposal::Applied { changed: false };
        }
        match self.world.set_tile_entity(pos, new) {
            Ok(displaced) => {
                if let Some(old) = displaced {
                    self.world.invalidate_tile_entity(pos, &old);
                }
                Proposal::Applied { changed: true }
            }
            Err(err) => {
                warn!(%pos, %err, "tile change failed");
                Proposal::Applied { changed: false }
            }
        }
    }

    /// Notifies the neighbors of `source` in `directions`.
    ///
    /// Unless the current phase ignores block events, a neighbor event fires
    /// first and listeners may remove directions. Surviving directions are
    /// delivered now, or recorded in the active context when block changes
    /// are being captured. Returns the surviving set.
    pub fn notify_neighbors(
        &mut self,
        source: BlockPos,
        block: BlockState,
        directions: DirectionSet,
    ) -> DirectionSet {
        if directions.is_empty() {
            return DirectionSet::EMPTY;
        }
        let surviving = if self.neighbor_events_suppressed() {
            directions
        } else {
            let mut event = PhaseEvent::new(
                self.cause(),
                EventPayload::NotifyNeighbor {
                    source,
                    block,
                    directions,
                },
            );
            self.fire(&mut event);
            if event.is_cancelled() {
                return DirectionSet::EMPTY;
            }
            match event.payload() {
                EventPayload::NotifyNeighbor { directions, .. } => *directions,
                _ => directions,
            }
        };
        if surviving.is_empty() {
            return surviving;
        }
        if let Some(ctx) = self.capture_context(PhaseStateDescriptor::does_bulk_block_capture) {
            ctx.push_notification(NeighborNotification {
                source,
                block,
                directions: surviving,
            });
            return surviving;
        }
        self.deliver_neighbors(source, block, surviving);
        surviving
    }

    /// Runs a block update for `pos`.
    ///
    /// Inside a ticking phase that already captures block ticks the body runs
    /// inline and its mutations join that phase; otherwise it runs in a fresh
    /// [`PhaseKind::BlockTick`] phase.
    pub fn tick_block<R>(&mut self, pos: BlockPos, body: impl FnOnce(&mut Self) -> R) -> R {
        let inline = self.current_frame().is_some_and(|f| {
            f.descriptor.already_capturing && f.descriptor.is_ticking && !f.is_unwinding()
        });
        if inline {
            return body(self);
        }
        self.scoped(PhaseKind::BlockTick, PhaseSource::Block(pos), |t, _| body(t))
    }

    /// Whether scheduled block updates may be queued right now.
    pub fn should_schedule_update(&self) -> bool {
        self.current_frame()
            .is_none_or(|f| !f.descriptor.ignores_scheduled_updates)
    }

    /// Block at `pos` as it will be once pending captures apply: the latest
    /// captured proposal on the stack, else storage.
    pub fn block_at(&self, pos: BlockPos) -> BlockState {
        if self.is_owner_thread() {
            if let Some(state) = self.frames().find_map(|f| f.context.projected_block(pos)) {
                return state;
            }
        }
        self.world.read_block(pos)
    }

    /// Tile at `pos` as it will be once pending captures apply.
    pub fn tile_at(&self, pos: BlockPos) -> Option<TileEntity> {
        if self.is_owner_thread() {
            if let Some(tile) = self.frames().find_map(|f| f.context.projected_tile(pos)) {
                return tile;
            }
        }
        self.world.tile_entity(pos)
    }

    /// Context that should buffer a mutation, if any.
    ///
    /// While the top frame unwinds its own buffers are closed, so writes go
    /// to its implicit [`PhaseKind::Unwinding`] child.
    fn capture_context(&mut self, wants: CapturePredicate) -> Option<&mut PhaseContext> {
        if !self.is_owner_thread() {
            return None;
        }
        let frame = self.stack.last_mut()?;
        if frame.context.is_closed() {
            let child = frame.context.unwinding_child();
            return if wants(lookup(PhaseKind::Unwinding), child) {
                Some(child)
            } else {
                None
            };
        }
        if wants(frame.descriptor, &frame.context) {
            Some(&mut frame.context)
        } else {
            None
        }
    }

    fn apply_block_now(&mut self, tx: BlockTransaction) -> Proposal {
        if tx.previous == tx.proposed {
            return Proposal::Applied { changed: false };
        }
        let fire = self.current_frame().is_none_or(|f| f.descriptor.fires_change_events);
        if fire {
            let mut pre = PhaseEvent::new(self.cause(), EventPayload::ChangeBlockPre(tx.clone()));
            self.fire(&mut pre);
            if pre.is_cancelled() {
                debug!(pos = %tx.pos, "block change vetoed");
                return Proposal::Applied { changed: false };
            }
        }
        if let Err(err) = self.world.write_block(tx.pos, tx.proposed) {
            warn!(pos = %tx.pos, %err, "block write failed");
            return Proposal::Applied { changed: false };
        }
        self.attribution.record_change(tx.pos, tx.owner, tx.notifier);
        if fire {
            let mut post = PhaseEvent::new(self.cause(), EventPayload::ChangeBlockPost(tx.clone()));
            self.fire(&mut post);
        }
        self.apply_side_effects(tx.pos, tx.flags);
        if tx.flags.contains(ChangeFlags::NEIGHBORS) {
            self.notify_neighbors(tx.pos, tx.proposed, DirectionSet::ALL);
        }
        Proposal::Applied { changed: true }
    }

    /// Lighting, observer and client obligations. Neighbors are handled by
    /// the caller because their timing differs between paths.
    pub(crate) fn apply_side_effects(&mut self, pos: BlockPos, flags: ChangeFlags) {
        if flags.contains(ChangeFlags::LIGHTING) {
            self.world.update_lighting(pos);
        }
        if flags.contains(ChangeFlags::OBSERVERS) {
            self.world.notify_observers(pos);
        }
        if flags.contains(ChangeFlags::CLIENTS) {
            self.world.mark_for_clients(pos);
        }
    }

    pub(crate) fn neighbor_events_suppressed(&self) -> bool {
        !self.config.fire_neighbor_events
            || !self.is_owner_thread()
            || self
                .current_frame()
                .is_some_and(|f| f.descriptor.ignores_block_events)
    }

    /// Delivers `directions` to storage in notification order.
    pub(crate) fn deliver_neighbors(
        &mut self,
        source: BlockPos,
        block: BlockState,
        directions: DirectionSet,
    ) {
        for direction in directions.iter() {
            self.world
                .neighbor_changed(source.offset(direction), block, source);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ident::{Direction, EntityId};
    use crate::world::grid::GridWorld;

    fn tracker() -> PhaseTracker {
        PhaseTracker::new(GridWorld::default())
    }

    #[test]
    fn no_frame_applies_immediately() {
        let mut t = tracker();
        let p = BlockPos::new(0, 10, 0);
        let out = t.propose_block_change(p, BlockState(3), ChangeFlags::NONE);
        assert_eq!(out, Proposal::Applied { changed: true });
        assert_eq!(t.world().read_block(p), BlockState(3));
    }

    #[test]
    fn unchanged_state_reports_no_change() {
        let mut t = tracker();
        let p = BlockPos::new(0, 10, 0);
        let out = t.propose_block_change(p, BlockState::AIR, ChangeFlags::ALL);
        assert_eq!(out, Proposal::Applied { changed: false });
    }

    #[test]
    fn capturing_phase_defers_write_and_projects() {
        let mut t = tracker();
        let p = BlockPos::new(1, 10, 1);
        let h = t.begin_phase(PhaseKind::PlayerInteraction, PhaseSource::None);
        assert!(t.propose_block_change(p, BlockState(5), ChangeFlags::ALL).is_captured());
        assert_eq!(t.world().read_block(p), BlockState::AIR);
        assert_eq!(t.block_at(p), BlockState(5));
        t.close(h).unwrap();
        assert_eq!(t.world().read_block(p), BlockState(5));
    }

    #[test]
    fn out_of_bounds_is_invalid() {
        let mut t = tracker();
        let p = BlockPos::new(0, -5, 0);
        assert_eq!(
            t.propose_block_change(p, BlockState(1), ChangeFlags::ALL),
            Proposal::Invalid(InvalidMutation::OutOfBounds(p))
        );
        assert_eq!(
            t.propose_item_drop(p, ItemDrop::new("stone", 1)),
            Proposal::Invalid(InvalidMutation::OutOfBounds(p))
        );
    }

    #[test]
    fn duplicate_spawn_in_context_is_invalid() {
        let mut t = tracker();
        let p = BlockPos::new(0, 64, 0);
        let h = t.begin_phase(PhaseKind::EntityTick, PhaseSource::None);
        let e = Entity::new(EntityId(9), "pig", p);
        assert!(t.propose_entity_spawn(e.clone(), SpawnType::Breeding).is_captured());
        assert_eq!(
            t.propose_entity_spawn(e, SpawnType::Breeding),
            Proposal::Invalid(InvalidMutation::DuplicateEntity(EntityId(9)))
        );
        t.close(h).unwrap();
        assert!(t.world().contains_entity(EntityId(9)));
    }

    #[test]
    fn schedule_gate_follows_descriptor() {
        let mut t = tracker();
        assert!(t.should_schedule_update());
        let h = t.begin_phase(PhaseKind::TerrainGeneration, PhaseSource::World);
        assert!(!t.should_schedule_update());
        t.close(h).unwrap();
        assert!(t.should_schedule_update());
    }

    #[test]
    fn tick_block_runs_inline_inside_block_tick() {
        let mut t = tracker();
        let p = BlockPos::new(0, 1, 0);
        let depth = t.scoped(PhaseKind::RandomBlockTick, PhaseSource::Block(p), |t, _| {
            t.tick_block(p.offset(Direction::Up), |t| t.depth())
        });
        assert_eq!(depth, 1);
        let nested = t.scoped(PhaseKind::EntityTick, PhaseSource::None, |t, _| {
            t.tick_block(p, |t| t.current_kind())
        });
        assert_eq!(nested, Some(PhaseKind::BlockTick));
    }

    #[test]
    fn tile_removal_of_nothing_is_a_no_op() {
        let mut t = tracker();
        let p = BlockPos::new(0, 1, 0);
        assert_eq!(
            t.propose_tile_entity_op(p, TileEntityOp::Remove),
            Proposal::Applied { changed: false }
        );
    }
}
