// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unwind processor: deterministic replay of a closed frame's captures.
//!
//! Replay order is fixed:
//! 1. block transactions in insertion order (neighbor obligations queued),
//! 2. queued then captured neighbor notifications in [`crate::NOTIFY_ORDER`],
//! 3. entity spawns, one bulk event per spawn cause in first-seen order,
//! 4. item drops per position,
//! 5. tile-entity changes per position, adds before removes,
//! 6. child contexts in append order, each under its own descriptor.
//!
//! Every item runs isolated: a storage error or panic is recorded as an
//! [`UnwindItemFailure`] and the remaining items still run. The frame being
//! unwound stays on the stack, closed for writes, until replay finishes.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{error, warn};

use crate::context::{BlockTransaction, CaptureSet, PhaseContext, TileEntityChange};
use crate::diagnostics::panic_message;
use crate::error::{PhaseError, WorldError};
use crate::event::{EventPayload, PhaseEvent};
use crate::ident::{BlockPos, DirectionSet};
use crate::phase::PhaseKind;
use crate::record::{BlockState, ChangeFlags, Entity, ItemDrop, SpawnType};
use crate::tracker::{FrameHandle, FrameId, PhaseFrame, PhaseTracker};

/// Replay step an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindStage {
    /// Block transactions.
    Blocks,
    /// Neighbor notifications.
    Neighbors,
    /// Entity spawns.
    Spawns,
    /// Item drops.
    Drops,
    /// Tile-entity changes.
    Tiles,
}

impl core::fmt::Display for UnwindStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Blocks => "blocks",
            Self::Neighbors => "neighbors",
            Self::Spawns => "spawns",
            Self::Drops => "drops",
            Self::Tiles => "tiles",
        })
    }
}

/// A single captured item that failed to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnwindItemFailure {
    /// Step the item belonged to.
    pub stage: UnwindStage,
    /// Position involved, when the item has one.
    pub pos: Option<BlockPos>,
    /// Storage error or panic message.
    pub reason: String,
}

/// Per-step outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Items written to storage.
    pub applied: usize,
    /// Items vetoed by a listener.
    pub cancelled: usize,
    /// Items that had nothing left to do.
    pub skipped: usize,
    /// Items that failed.
    pub failed: usize,
}

impl StageCounts {
    /// All counters at zero.
    pub const ZERO: Self = Self {
        applied: 0,
        cancelled: 0,
        skipped: 0,
        failed: 0,
    };
}

/// Outcome of closing one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnwindReport {
    /// Kind of the closed frame.
    pub kind: PhaseKind,
    /// Block transactions.
    pub blocks: StageCounts,
    /// Neighbor notifications.
    pub neighbors: StageCounts,
    /// Spawns (per entity; vetoes count each removed entity).
    pub spawns: StageCounts,
    /// Drops (per stack).
    pub drops: StageCounts,
    /// Tile-entity changes.
    pub tiles: StageCounts,
    /// Failures in this frame's own items.
    pub failures: Vec<UnwindItemFailure>,
    /// Reports of child contexts, in replay order.
    pub children: Vec<UnwindReport>,
    /// Captured items dropped without being applied.
    pub discarded: usize,
    /// The close only ended a merged re-entrant activation.
    pub merged: bool,
    /// The frame was handed to its parent instead of unwinding.
    pub deferred: bool,
}

impl UnwindReport {
    /// Empty report for `kind`.
    #[must_use]
    pub const fn new(kind: PhaseKind) -> Self {
        Self {
            kind,
            blocks: StageCounts::ZERO,
            neighbors: StageCounts::ZERO,
            spawns: StageCounts::ZERO,
            drops: StageCounts::ZERO,
            tiles: StageCounts::ZERO,
            failures: Vec::new(),
            children: Vec::new(),
            discarded: 0,
            merged: false,
            deferred: false,
        }
    }

    /// Counters for `stage`.
    pub const fn stage(&self, stage: UnwindStage) -> &StageCounts {
        match stage {
            UnwindStage::Blocks => &self.blocks,
            UnwindStage::Neighbors => &self.neighbors,
            UnwindStage::Spawns => &self.spawns,
            UnwindStage::Drops => &self.drops,
            UnwindStage::Tiles => &self.tiles,
        }
    }

    fn stage_mut(&mut self, stage: UnwindStage) -> &mut StageCounts {
        match stage {
            UnwindStage::Blocks => &mut self.blocks,
            UnwindStage::Neighbors => &mut self.neighbors,
            UnwindStage::Spawns => &mut self.spawns,
            UnwindStage::Drops => &mut self.drops,
            UnwindStage::Tiles => &mut self.tiles,
        }
    }

    fn stages(&self) -> [&StageCounts; 5] {
        [
            &self.blocks,
            &self.neighbors,
            &self.spawns,
            &self.drops,
            &self.tiles,
        ]
    }

    /// Applied items here and in every child.
    pub fn total_applied(&self) -> usize {
        self.stages().iter().map(|s| s.applied).sum::<usize>()
            + self.children.iter().map(Self::total_applied).sum::<usize>()
    }

    /// Vetoed items here and in every child.
    pub fn total_cancelled(&self) -> usize {
        self.stages().iter().map(|s| s.cancelled).sum::<usize>()
            + self.children.iter().map(Self::total_cancelled).sum::<usize>()
    }

    /// Failed items here and in every child.
    pub fn total_failures(&self) -> usize {
        self.failures.len() + self.children.iter().map(Self::total_failures).sum::<usize>()
    }

    /// Discarded items here and in every child.
    pub fn total_discarded(&self) -> usize {
        self.discarded + self.children.iter().map(Self::total_discarded).sum::<usize>()
    }

    /// No failures and nothing discarded anywhere in the tree.
    pub fn is_clean(&self) -> bool {
        self.total_failures() == 0 && self.total_discarded() == 0
    }
}

/// The frame being replayed and the stack length to restore after each item.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    idx: usize,
    id: FrameId,
    events: bool,
}

impl Cursor {
    const fn keep(self) -> usize {
        self.idx + 1
    }
}

/// One frame being drained on the unwind work list.
#[derive(Debug)]
struct Level {
    cursor: Cursor,
    nesting: usize,
    report: UnwindReport,
    pending: VecDeque<PhaseContext>,
}

impl PhaseTracker {
    /// Hands the buffered captures of the frame `handle` refers to over to
    /// the caller. Used by phases that handle their own completion.
    ///
    /// # Errors
    /// [`PhaseError::UnknownHandle`] when the frame is not on the stack.
    pub fn take_captures(&mut self, handle: FrameHandle) -> Result<CaptureSet, PhaseError> {
        let idx = self
            .position_of(handle.frame())
            .ok_or(PhaseError::UnknownHandle(handle))?;
        Ok(self.stack[idx].context.take_captures())
    }

    /// Writes `captures` straight to storage without firing events or
    /// delivering neighbor notifications. Lighting, observer and client
    /// obligations still apply.
    pub fn apply_captures_silently(&mut self, captures: CaptureSet) -> UnwindReport {
        let mut report = UnwindReport::new(self.current_kind().unwrap_or(PhaseKind::Unwinding));
        let keep = self.stack.len();

        for tx in captures.block_transactions {
            let done = self.guarded(UnwindStage::Blocks, Some(tx.pos), keep, &mut report, |t| {
                t.world.write_block(tx.pos, tx.proposed)?;
                t.attribution.record_change(tx.pos, tx.owner, tx.notifier);
                t.apply_side_effects(tx.pos, tx.flags);
                Ok(())
            });
            if done.is_some() {
                report.blocks.applied += 1;
            }
        }
        report.neighbors.skipped += captures.neighbor_notifications.len();
        for spawn in captures.entity_spawns {
            let pos = spawn.entity.pos;
            let entity = spawn.entity;
            if self
                .guarded(UnwindStage::Spawns, Some(pos), keep, &mut report, |t| {
                    t.world.add_entity(entity)
                })
                .is_some()
            {
                report.spawns.applied += 1;
            }
        }
        for (pos, items) in captures.item_drops {
            for item in items {
                if self
                    .guarded(UnwindStage::Drops, Some(pos), keep, &mut report, |t| {
                        t.world.spawn_item(pos, &item)
                    })
                    .is_some()
                {
                    report.drops.applied += 1;
                }
            }
        }
        self.replay_tiles(captures.tile_entity_changes, keep, &mut report);
        report
    }

    /// Replays the top frame, which the caller has already closed, then its
    /// children depth-first.
    ///
    /// Child levels are kept on an explicit work list rather than the call
    /// stack, so nesting is bounded only by `max_unwind_depth`.
    pub(crate) fn unwind_top(&mut self, nesting: usize) -> UnwindReport {
        let Some(root) = self.open_level(nesting) else {
            return UnwindReport::new(PhaseKind::Unwinding);
        };
        let mut levels = vec![root];
        loop {
            let Some(level) = levels.last_mut() else {
                return UnwindReport::new(PhaseKind::Unwinding);
            };
            let (cursor, nesting) = (level.cursor, level.nesting);
            match self.next_child(level) {
                Some(mut child) => {
                    child.close();
                    if nesting >= self.config.max_unwind_depth {
                        error!(
                            kind = %child.kind(),
                            nesting,
                            limit = self.config.max_unwind_depth,
                            "unwind depth exceeded; discarding child captures"
                        );
                        level.report.discarded += child.pending_items();
                        continue;
                    }
                    if !self.frame_alive(cursor) {
                        level.report.discarded += child.pending_items();
                        continue;
                    }
                    self.truncate_stack(cursor.keep());
                    let id = self.alloc_frame_id();
                    self.stack.push(PhaseFrame::new(id, child));
                    if let Some(next) = self.open_level(nesting + 1) {
                        levels.push(next);
                    }
                }
                None => {
                    let Some(done) = levels.pop() else {
                        return UnwindReport::new(PhaseKind::Unwinding);
                    };
                    let Some(parent) = levels.last_mut() else {
                        return done.report;
                    };
                    let child_idx = parent.cursor.keep();
                    if self.frame_alive(done.cursor) && done.cursor.idx == child_idx {
                        self.truncate_stack(child_idx + 1);
                        self.stack.pop();
                    } else {
                        error!(
                            frame = done.cursor.id.value(),
                            "child frame vanished during unwind"
                        );
                    }
                    parent.report.children.push(done.report);
                }
            }
        }
    }

    /// Replays the top frame's own captures and returns the level that
    /// drains its children.
    fn open_level(&mut self, nesting: usize) -> Option<Level> {
        let idx = self.stack.len().checked_sub(1)?;
        let frame = &mut self.stack[idx];
        let descriptor = frame.descriptor;
        let cursor = Cursor {
            idx,
            id: frame.id,
            events: descriptor.fires_change_events,
        };
        let captures = frame.context.take_captures();
        let mut report = UnwindReport::new(descriptor.kind);

        if descriptor.handles_own_completion {
            if !captures.is_empty() {
                warn!(
                    kind = %descriptor.kind,
                    discarded = captures.len(),
                    "phase closed with undrained captures"
                );
                report.discarded += captures.len();
            }
        } else {
            self.replay(cursor, captures, &mut report);
        }
        Some(Level {
            cursor,
            nesting,
            report,
            pending: VecDeque::new(),
        })
    }

    /// Next child of `level`, refilling from the frame once the current
    /// batch is exhausted. Children of a frame that is gone are discarded.
    fn next_child(&mut self, level: &mut Level) -> Option<PhaseContext> {
        loop {
            if let Some(child) = level.pending.pop_front() {
                return Some(child);
            }
            if !self.frame_alive(level.cursor) {
                return None;
            }
            let children = self.stack[level.cursor.idx].context.take_children();
            if children.is_empty() {
                return None;
            }
            level.pending.extend(children);
        }
    }

    fn frame_alive(&self, cursor: Cursor) -> bool {
        self.stack.get(cursor.idx).is_some_and(|f| f.id == cursor.id)
    }

    /// Runs one item with panic isolation and restores the stack to `keep`
    /// frames afterwards. Failures are logged and recorded; `None` means the
    /// item failed.
    fn guarded<T>(
        &mut self,
        stage: UnwindStage,
        pos: Option<BlockPos>,
        keep: usize,
        report: &mut UnwindReport,
        item: impl FnOnce(&mut Self) -> Result<T, WorldError>,
    ) -> Option<T> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| item(&mut *self)));
        self.truncate_stack(keep);
        let reason = match result {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        warn!(%stage, ?pos, %reason, "unwind item failed");
        report.stage_mut(stage).failed += 1;
        report.failures.push(UnwindItemFailure {
            stage,
            pos,
            reason,
        });
        None
    }

    fn replay(&mut self, cursor: Cursor, captures: CaptureSet, report: &mut UnwindReport) {
        let keep = cursor.keep();

        let mut queued: Vec<(BlockPos, BlockState)> = Vec::new();
        for tx in captures.block_transactions {
            if !self.frame_alive(cursor) {
                report.discarded += 1;
                continue;
            }
            let applied = self.guarded(UnwindStage::Blocks, Some(tx.pos), keep, report, |t| {
                t.replay_block(&tx, cursor.events)
            });
            match applied {
                Some(true) => {
                    report.blocks.applied += 1;
                    if tx.flags.contains(ChangeFlags::NEIGHBORS) {
                        queued.push((tx.pos, tx.proposed));
                    }
                }
                Some(false) => report.blocks.cancelled += 1,
                None => {}
            }
        }

        for (pos, block) in queued {
            if !self.frame_alive(cursor) {
                report.discarded += 1;
                continue;
            }
            let delivered = self.guarded(UnwindStage::Neighbors, Some(pos), keep, report, |t| {
                Ok(t.replay_neighbors(pos, block))
            });
            match delivered {
                Some(true) => report.neighbors.applied += 1,
                Some(false) => report.neighbors.cancelled += 1,
                None => {}
            }
        }
        for n in captures.neighbor_notifications {
            if !self.frame_alive(cursor) {
                report.discarded += 1;
                continue;
            }
            let delivered = self.guarded(UnwindStage::Neighbors, Some(n.source), keep, report, |t| {
                t.deliver_neighbors(n.source, n.block, n.directions);
                Ok(())
            });
            if delivered.is_some() {
                report.neighbors.applied += 1;
            }
        }

        let mut groups: Vec<(SpawnType, Vec<Entity>)> = Vec::new();
        let mut slots: FxHashMap<SpawnType, usize> = FxHashMap::default();
        for spawn in captures.entity_spawns {
            let slot = *slots.entry(spawn.spawn_type).or_insert_with(|| {
                groups.push((spawn.spawn_type, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(spawn.entity);
        }
        for (spawn_type, entities) in groups {
            if !self.frame_alive(cursor) {
                report.discarded += entities.len();
                continue;
            }
            let proposed = entities.len();
            let fired = self.guarded(UnwindStage::Spawns, None, keep, report, |t| {
                Ok(t.fire_spawn_group(spawn_type, entities))
            });
            let Some(survivors) = fired else { continue };
            report.spawns.cancelled += proposed.saturating_sub(survivors.len());
            for entity in survivors {
                let pos = entity.pos;
                if self
                    .guarded(UnwindStage::Spawns, Some(pos), keep, report, |t| {
                        t.world.add_entity(entity)
                    })
                    .is_some()
                {
                    report.spawns.applied += 1;
                }
            }
        }

        for (pos, items) in captures.item_drops {
            if !self.frame_alive(cursor) {
                report.discarded += items.len();
                continue;
            }
            let proposed = items.len();
            let fired = self.guarded(UnwindStage::Drops, Some(pos), keep, report, |t| {
                Ok(t.fire_drop(pos, items))
            });
            let Some(survivors) = fired else { continue };
            report.drops.cancelled += proposed.saturating_sub(survivors.len());
            for item in survivors {
                if self
                    .guarded(UnwindStage::Drops, Some(pos), keep, report, |t| {
                        t.world.spawn_item(pos, &item)
                    })
                    .is_some()
                {
                    report.drops.applied += 1;
                }
            }
        }

        if self.frame_alive(cursor) {
            self.replay_tiles(captures.tile_entity_changes, keep, report);
        } else {
            report.discarded += captures.tile_entity_changes.len();
        }
    }

    /// Returns whether the write happened (false when vetoed).
    fn replay_block(&mut self, tx: &BlockTransaction, events: bool) -> Result<bool, WorldError> {
        if events {
            let mut pre = PhaseEvent::new(self.cause(), EventPayload::ChangeBlockPre(tx.clone()));
            self.fire(&mut pre);
            if pre.is_cancelled() {
                return Ok(false);
            }
        }
        self.world.write_block(tx.pos, tx.proposed)?;
        self.attribution.record_change(tx.pos, tx.owner, tx.notifier);
        if events {
            let mut post =
                PhaseEvent::new(self.cause(), EventPayload::ChangeBlockPost(tx.clone()));
            self.fire(&mut post);
        }
        self.apply_side_effects(tx.pos, tx.flags);
        Ok(true)
    }

    /// Notification obligation left by a replayed block change.
    fn replay_neighbors(&mut self, source: BlockPos, block: BlockState) -> bool {
        let mut directions = DirectionSet::ALL;
        if !self.neighbor_events_suppressed() {
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
                return false;
            }
            if let EventPayload::NotifyNeighbor { directions: d, .. } = event.payload() {
                directions = *d;
            }
        }
        if directions.is_empty() {
            return false;
        }
        self.deliver_neighbors(source, block, directions);
        true
    }

    fn fire_spawn_group(&mut self, spawn_type: SpawnType, entities: Vec<Entity>) -> Vec<Entity> {
        let mut event = PhaseEvent::new(
            self.cause(),
            EventPayload::SpawnEntity {
                spawn_type,
                entities,
            },
        );
        self.fire(&mut event);
        if event.is_cancelled() {
            return Vec::new();
        }
        match event.into_payload() {
            EventPayload::SpawnEntity { entities, .. } => entities,
            _ => Vec::new(),
        }
    }

    fn fire_drop(&mut self, pos: BlockPos, items: Vec<ItemDrop>) -> Vec<ItemDrop> {
        let mut event = PhaseEvent::new(self.cause(), EventPayload::DropItem { pos, items });
        self.fire(&mut event);
        if event.is_cancelled() {
            return Vec::new();
        }
        match event.into_payload() {
            EventPayload::DropItem { items, .. } => items,
            _ => Vec::new(),
        }
    }

    /// Tile changes grouped per position (first-seen order), adds first.
    fn replay_tiles(
        &mut self,
        changes: Vec<TileEntityChange>,
        keep: usize,
        report: &mut UnwindReport,
    ) {
        let mut groups: Vec<(BlockPos, Vec<TileEntityChange>)> = Vec::new();
        let mut slots: FxHashMap<BlockPos, usize> = FxHashMap::default();
        for change in changes {
            let slot = *slots.entry(change.pos).or_insert_with(|| {
                groups.push((change.pos, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(change);
        }
        for (pos, changes) in groups {
            let (adds, removes): (Vec<_>, Vec<_>) =
                changes.into_iter().partition(TileEntityChange::is_add);
            for change in adds.into_iter().chain(removes) {
                match self.guarded(UnwindStage::Tiles, Some(pos), keep, report, |t| {
                    t.replay_tile(change)
                }) {
                    Some(true) => report.tiles.applied += 1,
                    Some(false) => report.tiles.skipped += 1,
                    None => {}
                }
            }
        }
    }

    /// Removals only apply while the tile they saw at capture time is still
    /// in place; a replacing add in the same batch supersedes them.
    fn replay_tile(&mut self, change: TileEntityChange) -> Result<bool, WorldError> {
        let pos = change.pos;
        if let Some(tile) = change.new {
            if let Some(old) = self.world.set_tile_entity(pos, Some(tile))? {
                self.world.invalidate_tile_entity(pos, &old);
            }
            return Ok(true);
        }
        let expected = change.previous.as_ref().map(|t| t.id);
        let current = self.world.tile_entity(pos).map(|t| t.id);
        if current.is_none() || current != expected {
            return Ok(false);
        }
        if let Some(old) = self.world.set_tile_entity(pos, None)? {
            self.world.invalidate_tile_entity(pos, &old);
        }
        Ok(true)
    }
}
