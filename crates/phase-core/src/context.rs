// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-activation capture buffers and attribution metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ident::{BlockPos, DirectionSet, EntityId, UserId};
use crate::phase::PhaseKind;
use crate::record::{BlockState, ChangeFlags, Entity, ItemDrop, SpawnType, TileEntity};

/// Object that initiated a phase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSource {
    /// No identifiable source.
    #[default]
    None,
    /// A block at a position.
    Block(BlockPos),
    /// A live entity.
    Entity(EntityId),
    /// The tile entity at a position.
    TileEntity(BlockPos),
    /// A connected player.
    Player(UserId),
    /// A plugin, by name.
    Plugin(String),
    /// The world itself (weather, spawner passes).
    World,
}

impl PhaseSource {
    /// Position associated with the source, if any.
    #[must_use]
    pub const fn position(&self) -> Option<BlockPos> {
        match self {
            Self::Block(pos) | Self::TileEntity(pos) => Some(*pos),
            _ => None,
        }
    }
}

impl core::fmt::Display for PhaseSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Block(pos) => write!(f, "block@{pos}"),
            Self::Entity(id) => write!(f, "{id}"),
            Self::TileEntity(pos) => write!(f, "tile@{pos}"),
            Self::Player(user) => write!(f, "player {user}"),
            Self::Plugin(name) => write!(f, "plugin:{name}"),
            Self::World => f.write_str("world"),
        }
    }
}

/// One buffered block change.
///
/// `previous` is the projected state at capture time, so repeated changes to
/// one position chain their snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    /// Target position.
    pub pos: BlockPos,
    /// State before this change.
    pub previous: BlockState,
    /// State this change writes.
    pub proposed: BlockState,
    /// Side-effect obligations.
    pub flags: ChangeFlags,
    /// Owner attributed at capture time.
    pub owner: Option<UserId>,
    /// Notifier attributed at capture time.
    pub notifier: Option<UserId>,
}

/// One buffered entity spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSpawn {
    /// Entity to add.
    pub entity: Entity,
    /// Spawn cause; the replay grouping key.
    pub spawn_type: SpawnType,
    /// Owner attributed at capture time.
    pub owner: Option<UserId>,
    /// Notifier attributed at capture time.
    pub notifier: Option<UserId>,
}

/// One buffered tile-entity add, remove or replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEntityChange {
    /// Target position.
    pub pos: BlockPos,
    /// Tile projected at the position when the change was captured.
    pub previous: Option<TileEntity>,
    /// Tile to install, or `None` for a removal.
    pub new: Option<TileEntity>,
}

impl TileEntityChange {
    /// Whether this change installs a tile.
    #[must_use]
    pub const fn is_add(&self) -> bool {
        self.new.is_some()
    }
}

/// Neighbor notification whose direction set already survived its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborNotification {
    /// Changed position.
    pub source: BlockPos,
    /// Block now at `source`.
    pub block: BlockState,
    /// Directions still to notify.
    pub directions: DirectionSet,
}

/// Buffer sizes for one context, as reported by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureCounts {
    /// Block transactions.
    pub blocks: usize,
    /// Entity spawns.
    pub spawns: usize,
    /// Dropped item stacks across all positions.
    pub drops: usize,
    /// Tile-entity changes.
    pub tiles: usize,
    /// Neighbor notifications.
    pub notifications: usize,
    /// Child contexts awaiting unwind.
    pub children: usize,
}

impl CaptureCounts {
    /// Sum of all buffered items, children excluded.
    #[must_use]
    pub const fn items(&self) -> usize {
        self.blocks + self.spawns + self.drops + self.tiles + self.notifications
    }
}

/// Buffers drained out of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSet {
    /// Block transactions in insertion order.
    pub block_transactions: Vec<BlockTransaction>,
    /// Spawns in insertion order.
    pub entity_spawns: Vec<CapturedSpawn>,
    /// Drops keyed by position.
    pub item_drops: BTreeMap<BlockPos, Vec<ItemDrop>>,
    /// Tile changes in insertion order.
    pub tile_entity_changes: Vec<TileEntityChange>,
    /// Neighbor notifications in insertion order.
    pub neighbor_notifications: Vec<NeighborNotification>,
}

impl CaptureSet {
    /// Total number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block_transactions.len()
            + self.entity_spawns.len()
            + self.item_drops.values().map(Vec::len).sum::<usize>()
            + self.tile_entity_changes.len()
            + self.neighbor_notifications.len()
    }

    /// Whether nothing was buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capture buffers plus metadata for one phase activation.
///
/// Owned by exactly one frame. Once closed, the buffers accept no further
/// writes; mutations proposed while the owning frame unwinds land in an
/// implicit [`PhaseKind::Unwinding`] child instead.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    kind: PhaseKind,
    source: PhaseSource,
    owner: Option<UserId>,
    notifier: Option<UserId>,
    captures: CaptureSet,
    children: Vec<PhaseContext>,
    closed: bool,
    reentry: u32,
    bulk_capture_disabled: bool,
}

impl PhaseContext {
    /// Fresh, open, unattributed context.
    #[must_use]
    pub fn new(kind: PhaseKind, source: PhaseSource) -> Self {
        Self {
            kind,
            source,
            owner: None,
            notifier: None,
            captures: CaptureSet::default(),
            children: Vec::new(),
            closed: false,
            reentry: 0,
            bulk_capture_disabled: false,
        }
    }

    /// Attaches owner/notifier attribution.
    #[must_use]
    pub fn with_attribution(mut self, owner: Option<UserId>, notifier: Option<UserId>) -> Self {
        self.owner = owner;
        self.notifier = notifier;
        self
    }

    /// Phase kind this context was created for.
    pub const fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Initiating object.
    pub const fn source(&self) -> &PhaseSource {
        &self.source
    }

    /// Owner attribution, if any.
    pub const fn owner(&self) -> Option<UserId> {
        self.owner
    }

    /// Notifier attribution, if any.
    pub const fn notifier(&self) -> Option<UserId> {
        self.notifier
    }

    /// Buffered block transactions.
    pub fn block_transactions(&self) -> &[BlockTransaction] {
        &self.captures.block_transactions
    }

    /// Buffered spawns.
    pub fn entity_spawns(&self) -> &[CapturedSpawn] {
        &self.captures.entity_spawns
    }

    /// Buffered drops keyed by position.
    pub const fn item_drops(&self) -> &BTreeMap<BlockPos, Vec<ItemDrop>> {
        &self.captures.item_drops
    }

    /// Buffered tile changes.
    pub fn tile_entity_changes(&self) -> &[TileEntityChange] {
        &self.captures.tile_entity_changes
    }

    /// Buffered neighbor notifications.
    pub fn neighbor_notifications(&self) -> &[NeighborNotification] {
        &self.captures.neighbor_notifications
    }

    /// Child contexts awaiting unwind, in append order.
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Whether the context stopped accepting writes.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of merged same-kind activations still open.
    pub const fn reentry(&self) -> u32 {
        self.reentry
    }

    /// Whether bulk block capture was switched off for this activation.
    pub const fn bulk_capture_disabled(&self) -> bool {
        self.bulk_capture_disabled
    }

    /// Switches bulk block capture off; block and tile changes then apply
    /// immediately even under a capturing descriptor.
    pub fn disable_bulk_capture(&mut self) {
        self.bulk_capture_disabled = true;
    }

    /// Last state proposed for `pos` by this context or its children.
    ///
    /// Children are consulted first because they replay after the
    /// context's own buffers.
    pub fn projected_block(&self, pos: BlockPos) -> Option<BlockState> {
        self.children
            .iter()
            .rev()
            .find_map(|child| child.projected_block(pos))
            .or_else(|| {
                self.captures
                    .block_transactions
                    .iter()
                    .rev()
                    .find(|tx| tx.pos == pos)
                    .map(|tx| tx.proposed)
            })
    }

    /// Last tile change captured for `pos`: `Some(None)` means a pending
    /// removal, `None` means no pending change.
    pub fn projected_tile(&self, pos: BlockPos) -> Option<Option<TileEntity>> {
        self.children
            .iter()
            .rev()
            .find_map(|child| child.projected_tile(pos))
            .or_else(|| {
                self.captures
                    .tile_entity_changes
                    .iter()
                    .rev()
                    .find(|change| change.pos == pos)
                    .map(|change| change.new.clone())
            })
    }

    /// Whether an entity with `id` is already buffered here or in a child.
    pub fn contains_spawn(&self, id: EntityId) -> bool {
        self.captures
            .entity_spawns
            .iter()
            .any(|spawn| spawn.entity.id == id)
            || self.children.iter().any(|child| child.contains_spawn(id))
    }

    /// Buffer sizes.
    pub fn capture_counts(&self) -> CaptureCounts {
        CaptureCounts {
            blocks: self.captures.block_transactions.len(),
            spawns: self.captures.entity_spawns.len(),
            drops: self.captures.item_drops.values().map(Vec::len).sum(),
            tiles: self.captures.tile_entity_changes.len(),
            notifications: self.captures.neighbor_notifications.len(),
            children: self.children.len(),
        }
    }

    /// Items buffered here and in every descendant.
    pub fn pending_items(&self) -> usize {
        self.captures.len() + self.children.iter().map(Self::pending_items).sum::<usize>()
    }

    /// Whether nothing is buffered here or in any child.
    pub fn is_empty(&self) -> bool {
        self.pending_items() == 0 && self.children.is_empty()
    }

    /// Moves the buffers out, leaving them empty. Children stay in place.
    pub fn take_captures(&mut self) -> CaptureSet {
        std::mem::take(&mut self.captures)
    }

    pub(crate) fn push_block_transaction(&mut self, tx: BlockTransaction) {
        debug_assert!(!self.closed, "write into closed context");
        self.captures.block_transactions.push(tx);
    }

    pub(crate) fn push_spawn(&mut self, spawn: CapturedSpawn) {
        debug_assert!(!self.closed, "write into closed context");
        self.captures.entity_spawns.push(spawn);
    }

    pub(crate) fn push_drop(&mut self, pos: BlockPos, item: ItemDrop) {
        debug_assert!(!self.closed, "write into closed context");
        self.captures.item_drops.entry(pos).or_default().push(item);
    }

    pub(crate) fn push_tile_change(&mut self, change: TileEntityChange) {
        debug_assert!(!self.closed, "write into closed context");
        self.captures.tile_entity_changes.push(change);
    }

    pub(crate) fn push_notification(&mut self, notification: NeighborNotification) {
        debug_assert!(!self.closed, "write into closed context");
        self.captures.neighbor_notifications.push(notification);
    }

    pub(crate) fn push_child(&mut self, child: Self) {
        self.children.push(child);
    }

    pub(crate) fn take_children(&mut self) -> Vec<Self> {
        std::mem::take(&mut self.children)
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn enter_reentrant(&mut self) -> u32 {
        self.reentry += 1;
        self.reentry
    }

    pub(crate) fn leave_reentrant(&mut self) {
        self.reentry = self.reentry.saturating_sub(1);
    }

    /// Open implicit child collecting writes made while this context unwinds.
    pub(crate) fn unwinding_child(&mut self) -> &mut Self {
        let reuse = self
            .children
            .last()
            .is_some_and(|c| c.kind == PhaseKind::Unwinding && !c.closed);
        if !reuse {
            let child = Self::new(PhaseKind::Unwinding, self.source.clone())
                .with_attribution(self.owner, self.notifier);
            self.children.push(child);
        }
        let idx = self.children.len() - 1;
        &mut self.children[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(pos: BlockPos, previous: u32, proposed: u32) -> BlockTransaction {
        BlockTransaction {
            pos,
            previous: BlockState(previous),
            proposed: BlockState(proposed),
            flags: ChangeFlags::ALL,
            owner: None,
            notifier: None,
        }
    }

    #[test]
    fn projection_returns_last_write() {
        let p = BlockPos::new(1, 2, 3);
        let mut ctx = PhaseContext::new(PhaseKind::BlockTick, PhaseSource::Block(p));
        assert_eq!(ctx.projected_block(p), None);
        ctx.push_block_transaction(tx(p, 0, 5));
        ctx.push_block_transaction(tx(p, 5, 9));
        assert_eq!(ctx.projected_block(p), Some(BlockState(9)));
        assert_eq!(ctx.projected_block(BlockPos::new(0, 0, 0)), None);
    }

    #[test]
    fn children_shadow_own_projection() {
        let p = BlockPos::new(0, 10, 0);
        let mut ctx = PhaseContext::new(PhaseKind::Explosion, PhaseSource::World);
        ctx.push_block_transaction(tx(p, 0, 1));
        let mut child = PhaseContext::new(PhaseKind::BlockDrops, PhaseSource::Block(p));
        child.push_block_transaction(tx(p, 1, 2));
        ctx.push_child(child);
        assert_eq!(ctx.projected_block(p), Some(BlockState(2)));
        assert_eq!(ctx.capture_counts().children, 1);
        assert_eq!(ctx.pending_items(), 2);
    }

    #[test]
    fn take_captures_empties_buffers() {
        let p = BlockPos::new(0, 0, 0);
        let mut ctx = PhaseContext::new(PhaseKind::Command, PhaseSource::None);
        ctx.push_block_transaction(tx(p, 0, 1));
        ctx.push_drop(p, ItemDrop::new("stone", 2));
        ctx.push_drop(p, ItemDrop::new("dirt", 1));
        let counts = ctx.capture_counts();
        assert_eq!(counts.blocks, 1);
        assert_eq!(counts.drops, 2);
        let taken = ctx.take_captures();
        assert_eq!(taken.len(), 3);
        assert!(ctx.is_empty());
    }

    #[test]
    fn unwinding_child_is_reused_while_open() {
        let mut ctx = PhaseContext::new(PhaseKind::EntityTick, PhaseSource::Entity(EntityId(4)))
            .with_attribution(Some(UserId(1)), None);
        ctx.close();
        ctx.unwinding_child()
            .push_block_transaction(tx(BlockPos::new(0, 0, 0), 0, 1));
        ctx.unwinding_child()
            .push_block_transaction(tx(BlockPos::new(1, 0, 0), 0, 1));
        assert_eq!(ctx.children().len(), 1);
        let child = &ctx.children()[0];
        assert_eq!(child.kind(), PhaseKind::Unwinding);
        assert_eq!(child.owner(), Some(UserId(1)));
        assert_eq!(child.block_transactions().len(), 2);
    }

    #[test]
    fn pending_tile_removal_projects_as_empty() {
        let p = BlockPos::new(2, 2, 2);
        let mut ctx = PhaseContext::new(PhaseKind::PlayerInteraction, PhaseSource::None);
        ctx.push_tile_change(TileEntityChange {
            pos: p,
            previous: Some(TileEntity::new(1, "chest")),
            new: None,
        });
        assert_eq!(ctx.projected_tile(p), Some(None));
        assert!(!ctx.tile_entity_changes()[0].is_add());
    }

    #[test]
    fn source_exposes_position() {
        let p = BlockPos::new(3, 4, 5);
        assert_eq!(PhaseSource::Block(p).position(), Some(p));
        assert_eq!(PhaseSource::TileEntity(p).position(), Some(p));
        assert_eq!(PhaseSource::Player(UserId(2)).position(), None);
        assert_eq!(PhaseSource::Block(p).to_string(), "block@(3, 4, 5)");
    }
}
