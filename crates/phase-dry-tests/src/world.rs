// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory world storage with an operation journal.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use phase_core::{
    BlockPos, BlockState, Entity, EntityId, ItemDrop, TileEntity, WorldError, WorldStorage,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// First id handed out to dropped item entities.
pub const FIRST_ITEM_ENTITY: u64 = 1_000_000;

/// Valid region of a [`MemoryWorld`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldBounds {
    /// Maximum `|x|` and `|z|`.
    pub horizontal_radius: u32,
    /// Lowest valid `y`.
    pub min_y: i32,
    /// Highest valid `y`.
    pub max_y: i32,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            horizontal_radius: 30_000_000,
            min_y: 0,
            max_y: 255,
        }
    }
}

impl WorldBounds {
    /// Whether `pos` lies inside the bounds.
    pub const fn contains(&self, pos: BlockPos) -> bool {
        pos.x.unsigned_abs() <= self.horizontal_radius
            && pos.z.unsigned_abs() <= self.horizontal_radius
            && pos.y >= self.min_y
            && pos.y <= self.max_y
    }
}

/// One storage operation, in the order it reached the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorldOp {
    /// Block write.
    WriteBlock {
        /// Target.
        pos: BlockPos,
        /// New state.
        state: BlockState,
    },
    /// Entity added.
    AddEntity {
        /// Entity id.
        id: EntityId,
        /// Entity type.
        kind: String,
    },
    /// Entity removed.
    RemoveEntity {
        /// Entity id.
        id: EntityId,
    },
    /// Item entity spawned.
    SpawnItem {
        /// Drop position.
        pos: BlockPos,
        /// Item type.
        item: String,
        /// Stack size.
        count: u32,
    },
    /// Tile entity installed or removed.
    SetTile {
        /// Position.
        pos: BlockPos,
        /// Id of the new tile, `None` for removal.
        tile: Option<u64>,
    },
    /// Displaced tile invalidated.
    InvalidateTile {
        /// Position.
        pos: BlockPos,
        /// Id of the invalidated tile.
        tile: u64,
    },
    /// Neighbor update delivered.
    NeighborChanged {
        /// Notified position.
        target: BlockPos,
        /// Changed position.
        source: BlockPos,
    },
    /// Lighting recomputed.
    Lighting {
        /// Position.
        pos: BlockPos,
    },
    /// Observers notified.
    Observers {
        /// Position.
        pos: BlockPos,
    },
    /// Change marked for clients.
    Clients {
        /// Position.
        pos: BlockPos,
    },
}

/// A dropped item as it landed in the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedItem {
    /// Entity id assigned by storage.
    pub id: EntityId,
    /// Drop position.
    pub pos: BlockPos,
    /// The stack.
    pub item: ItemDrop,
}

/// In-memory [`WorldStorage`].
///
/// Clones share state, so a test can keep a handle after moving a clone into
/// a tracker. Writes at positions registered with
/// [`MemoryWorld::fail_writes_at`] return an error; writes at positions
/// registered with [`MemoryWorld::panic_on_write_at`] panic.
///
/// # Example
///
/// ```
/// use phase_core::{BlockPos, BlockState, ChangeFlags, PhaseTracker};
/// use phase_dry_tests::MemoryWorld;
///
/// let world = MemoryWorld::new();
/// let mut tracker = PhaseTracker::new(world.clone());
/// tracker.propose_block_change(BlockPos::new(0, 64, 0), BlockState(1), ChangeFlags::NONE);
/// assert_eq!(world.block(BlockPos::new(0, 64, 0)), BlockState(1));
/// ```
#[derive(Clone, Default)]
pub struct MemoryWorld {
    inner: Arc<Mutex<MemoryWorldInner>>,
}

#[derive(Default)]
struct MemoryWorldInner {
    bounds: WorldBounds,
    blocks: FxHashMap<BlockPos, BlockState>,
    entities: BTreeMap<EntityId, Entity>,
    items: Vec<DroppedItem>,
    tiles: FxHashMap<BlockPos, TileEntity>,
    journal: Vec<WorldOp>,
    failing_writes: FxHashSet<BlockPos>,
    panicking_writes: FxHashSet<BlockPos>,
    next_item: u64,
}

impl core::fmt::Debug for MemoryWorld {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryWorld")
            .field("bounds", &inner.bounds)
            .field("blocks", &inner.blocks.len())
            .field("entities", &inner.entities.len())
            .field("items", &inner.items.len())
            .field("tiles", &inner.tiles.len())
            .field("journal", &inner.journal.len())
            .finish()
    }
}

impl MemoryWorld {
    /// Empty world with default bounds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty world with the given bounds.
    pub fn with_bounds(bounds: WorldBounds) -> Self {
        let world = Self::new();
        world.lock().bounds = bounds;
        world
    }

    fn lock(&self) -> MutexGuard<'_, MemoryWorldInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Valid region.
    pub fn bounds(&self) -> WorldBounds {
        self.lock().bounds
    }

    /// Stored block at `pos` (air when unset).
    pub fn block(&self, pos: BlockPos) -> BlockState {
        self.lock().blocks.get(&pos).copied().unwrap_or_default()
    }

    /// Seeds a block without journaling it.
    pub fn set_block(&self, pos: BlockPos, state: BlockState) {
        let mut inner = self.lock();
        if state.is_air() {
            inner.blocks.remove(&pos);
        } else {
            inner.blocks.insert(pos, state);
        }
    }

    /// Seeds a tile entity without journaling it.
    pub fn set_tile(&self, pos: BlockPos, tile: TileEntity) {
        self.lock().tiles.insert(pos, tile);
    }

    /// Tile entity at `pos`.
    pub fn tile(&self, pos: BlockPos) -> Option<TileEntity> {
        self.lock().tiles.get(&pos).cloned()
    }

    /// Live entity ids in ascending order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.lock().entities.keys().copied().collect()
    }

    /// Number of live entities (items excluded).
    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    /// Dropped items in spawn order.
    pub fn items(&self) -> Vec<DroppedItem> {
        self.lock().items.clone()
    }

    /// Every operation so far, oldest first.
    pub fn journal(&self) -> Vec<WorldOp> {
        self.lock().journal.clone()
    }

    /// Forgets the journal.
    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Block writes from the journal, oldest first.
    pub fn writes(&self) -> Vec<(BlockPos, BlockState)> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                WorldOp::WriteBlock { pos, state } => Some((*pos, *state)),
                _ => None,
            })
            .collect()
    }

    /// Delivered neighbor updates as `(target, source)`, oldest first.
    pub fn neighbor_updates(&self) -> Vec<(BlockPos, BlockPos)> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                WorldOp::NeighborChanged { target, source } => Some((*target, *source)),
                _ => None,
            })
            .collect()
    }

    /// Makes block writes at `pos` fail with [`WorldError::Rejected`].
    pub fn fail_writes_at(&self, pos: BlockPos) {
        self.lock().failing_writes.insert(pos);
    }

    /// Makes block writes at `pos` panic.
    pub fn panic_on_write_at(&self, pos: BlockPos) {
        self.lock().panicking_writes.insert(pos);
    }

    fn record(&self, op: WorldOp) {
        self.lock().journal.push(op);
    }
}

impl WorldStorage for MemoryWorld {
    fn is_valid(&self, pos: BlockPos) -> bool {
        self.lock().bounds.contains(pos)
    }

    fn read_block(&self, pos: BlockPos) -> BlockState {
        self.block(pos)
    }

    #[allow(clippy::panic)]
    fn write_block(&mut self, pos: BlockPos, state: BlockState) -> Result<BlockState, WorldError> {
        let mut inner = self.lock();
        if !inner.bounds.contains(pos) {
            return Err(WorldError::OutOfBounds(pos));
        }
        if inner.panicking_writes.contains(&pos) {
            drop(inner);
            panic!("simulated storage panic at {pos}");
        }
        if inner.failing_writes.contains(&pos) {
            return Err(WorldError::Rejected(format!("write refused at {pos}")));
        }
        let previous = if state.is_air() {
            inner.blocks.remove(&pos)
        } else {
            inner.blocks.insert(pos, state)
        };
        inner.journal.push(WorldOp::WriteBlock { pos, state });
        Ok(previous.unwrap_or_default())
    }

    fn contains_entity(&self, id: EntityId) -> bool {
        self.lock().entities.contains_key(&id)
    }

    fn entity(&self, id: EntityId) -> Option<Entity> {
        self.lock().entities.get(&id).cloned()
    }

    fn add_entity(&mut self, entity: Entity) -> Result<(), WorldError> {
        let mut inner = self.lock();
        if !inner.bounds.contains(entity.pos) {
            return Err(WorldError::OutOfBounds(entity.pos));
        }
        if inner.entities.contains_key(&entity.id) {
            return Err(WorldError::DuplicateEntity(entity.id));
        }
        inner.journal.push(WorldOp::AddEntity {
            id: entity.id,
            kind: entity.kind.clone(),
        });
        inner.entities.insert(entity.id, entity);
        Ok(())
    }

    fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        let removed = self.lock().entities.remove(&id);
        if removed.is_some() {
            self.record(WorldOp::RemoveEntity { id });
        }
        removed
    }

    fn spawn_item(&mut self, pos: BlockPos, item: &ItemDrop) -> Result<EntityId, WorldError> {
        let mut inner = self.lock();
        if !inner.bounds.contains(pos) {
            return Err(WorldError::OutOfBounds(pos));
        }
        let id = EntityId(FIRST_ITEM_ENTITY + inner.next_item);
        inner.next_item += 1;
        inner.items.push(DroppedItem {
            id,
            pos,
            item: item.clone(),
        });
        inner.journal.push(WorldOp::SpawnItem {
            pos,
            item: item.item.clone(),
            count: item.count,
        });
        Ok(id)
    }

    fn tile_entity(&self, pos: BlockPos) -> Option<TileEntity> {
        self.tile(pos)
    }

    fn set_tile_entity(
        &mut self,
        pos: BlockPos,
        tile: Option<TileEntity>,
    ) -> Result<Option<TileEntity>, WorldError> {
        let mut inner = self.lock();
        if !inner.bounds.contains(pos) {
            return Err(WorldError::OutOfBounds(pos));
        }
        inner.journal.push(WorldOp::SetTile {
            pos,
            tile: tile.as_ref().map(|t| t.id),
        });
        Ok(match tile {
            Some(tile) => inner.tiles.insert(pos, tile),
            None => inner.tiles.remove(&pos),
        })
    }

    fn invalidate_tile_entity(&mut self, pos: BlockPos, tile: &TileEntity) {
        self.record(WorldOp::InvalidateTile { pos, tile: tile.id });
    }

    fn neighbor_changed(&mut self, target: BlockPos, _source_block: BlockState, source: BlockPos) {
        self.record(WorldOp::NeighborChanged { target, source });
    }

    fn update_lighting(&mut self, pos: BlockPos) {
        self.record(WorldOp::Lighting { pos });
    }

    fn notify_observers(&mut self, pos: BlockPos) {
        self.record(WorldOp::Observers { pos });
    }

    fn mark_for_clients(&mut self, pos: BlockPos) {
        self.record(WorldOp::Clients { pos });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bounds_reject_out_of_range() {
        let mut world = MemoryWorld::with_bounds(WorldBounds {
            horizontal_radius: 8,
            min_y: 0,
            max_y: 15,
        });
        assert!(world.is_valid(BlockPos::new(-8, 0, 8)));
        assert!(!world.is_valid(BlockPos::new(9, 0, 0)));
        assert!(!world.is_valid(BlockPos::new(0, 16, 0)));
        let err = world
            .write_block(BlockPos::new(0, -1, 0), BlockState(1))
            .unwrap_err();
        assert_eq!(err, WorldError::OutOfBounds(BlockPos::new(0, -1, 0)));
    }

    #[test]
    fn writes_return_previous_and_journal() {
        let mut world = MemoryWorld::new();
        let p = BlockPos::new(1, 2, 3);
        assert_eq!(world.write_block(p, BlockState(4)).unwrap(), BlockState::AIR);
        assert_eq!(world.write_block(p, BlockState(5)).unwrap(), BlockState(4));
        assert_eq!(world.writes(), vec![(p, BlockState(4)), (p, BlockState(5))]);
    }

    #[test]
    fn clones_share_state() {
        let world = MemoryWorld::new();
        let mut handle = world.clone();
        handle
            .add_entity(Entity::new(EntityId(1), "pig", BlockPos::new(0, 64, 0)))
            .unwrap();
        assert_eq!(world.entity_ids(), vec![EntityId(1)]);
    }

    #[test]
    fn failing_writes_are_rejected() {
        let mut world = MemoryWorld::new();
        let p = BlockPos::new(0, 10, 0);
        world.fail_writes_at(p);
        assert!(matches!(
            world.write_block(p, BlockState(1)),
            Err(WorldError::Rejected(_))
        ));
        assert!(world.journal().is_empty());
    }

    #[test]
    fn item_ids_are_sequential() {
        let mut world = MemoryWorld::new();
        let p = BlockPos::new(0, 10, 0);
        let a = world.spawn_item(p, &ItemDrop::new("stone", 1)).unwrap();
        let b = world.spawn_item(p, &ItemDrop::new("dirt", 2)).unwrap();
        assert_eq!(a, EntityId(FIRST_ITEM_ENTITY));
        assert_eq!(b, EntityId(FIRST_ITEM_ENTITY + 1));
        assert_eq!(world.items().len(), 2);
    }

    #[test]
    fn journal_serializes_with_op_tag() {
        let world = MemoryWorld::new();
        world.record(WorldOp::Lighting {
            pos: BlockPos::new(0, 1, 0),
        });
        let json = serde_json::to_value(world.journal()).unwrap();
        assert_eq!(json[0]["op"], "lighting");
    }
}
