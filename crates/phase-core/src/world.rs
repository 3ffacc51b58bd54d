// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Collaborator ports: world storage and owner attribution.
//!
//! The tracker never touches storage except through [`WorldStorage`]; hosts
//! plug in their chunk store, tests plug in an in-memory grid.

use crate::error::WorldError;
use crate::ident::{BlockPos, EntityId, UserId};
use crate::record::{BlockState, Entity, ItemDrop, TileEntity};

/// Synchronous world storage.
///
/// Every method is expected to succeed for positions accepted by
/// [`WorldStorage::is_valid`]; failures surface as [`WorldError`] and are
/// recorded per item by the unwind processor.
pub trait WorldStorage: Send {
    /// Whether `pos` lies inside the world.
    fn is_valid(&self, pos: BlockPos) -> bool;

    /// Current block at `pos`. Positions outside the world read as air.
    fn read_block(&self, pos: BlockPos) -> BlockState;

    /// Writes `state` at `pos` and returns the state it replaced.
    fn write_block(&mut self, pos: BlockPos, state: BlockState) -> Result<BlockState, WorldError>;

    /// Whether an entity with `id` is live.
    fn contains_entity(&self, id: EntityId) -> bool;

    /// Live entity with `id`.
    fn entity(&self, id: EntityId) -> Option<Entity>;

    /// Adds a live entity.
    fn add_entity(&mut self, entity: Entity) -> Result<(), WorldError>;

    /// Removes a live entity, returning it.
    fn remove_entity(&mut self, id: EntityId) -> Option<Entity>;

    /// Spawns an item entity for a dropped stack.
    fn spawn_item(&mut self, pos: BlockPos, item: &ItemDrop) -> Result<EntityId, WorldError>;

    /// Tile entity at `pos`.
    fn tile_entity(&self, pos: BlockPos) -> Option<TileEntity>;

    /// Installs (`Some`) or removes (`None`) the tile at `pos`; returns the
    /// tile that was there before.
    fn set_tile_entity(
        &mut self,
        pos: BlockPos,
        tile: Option<TileEntity>,
    ) -> Result<Option<TileEntity>, WorldError>;

    /// Called once for every tile entity displaced or removed.
    fn invalidate_tile_entity(&mut self, _pos: BlockPos, _tile: &TileEntity) {}

    /// Delivers one neighbor notification to the block at `target`.
    fn neighbor_changed(&mut self, target: BlockPos, source_block: BlockState, source: BlockPos);

    /// Recomputes lighting at `pos`.
    fn update_lighting(&mut self, _pos: BlockPos) {}

    /// Notifies observer blocks watching `pos`.
    fn notify_observers(&mut self, _pos: BlockPos) {}

    /// Queues `pos` for client synchronization.
    fn mark_for_clients(&mut self, _pos: BlockPos) {}
}

/// Owner/notifier lookup. A missing answer means "unattributed".
pub trait AttributionSource: Send {
    /// User that owns the block at `pos`.
    fn owner_of(&self, pos: BlockPos) -> Option<UserId>;

    /// User that last caused an update at `pos`.
    fn notifier_of(&self, pos: BlockPos) -> Option<UserId>;

    /// Records attribution for a change that was just applied.
    fn record_change(
        &mut self,
        _pos: BlockPos,
        _owner: Option<UserId>,
        _notifier: Option<UserId>,
    ) {
    }
}

/// Attribution source that never attributes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttribution;

impl AttributionSource for NoAttribution {
    fn owner_of(&self, _pos: BlockPos) -> Option<UserId> {
        None
    }

    fn notifier_of(&self, _pos: BlockPos) -> Option<UserId> {
        None
    }
}

#[cfg(test)]
pub(crate) mod grid {
    //! Minimal storage used by unit tests inside this crate.

    use super::{WorldError, WorldStorage};
    use crate::ident::{BlockPos, EntityId};
    use crate::record::{BlockState, Entity, ItemDrop, TileEntity};
    use rustc_hash::FxHashMap;

    #[derive(Debug, Default)]
    pub(crate) struct GridWorld {
        pub(crate) blocks: FxHashMap<BlockPos, BlockState>,
        pub(crate) entities: FxHashMap<EntityId, Entity>,
        pub(crate) tiles: FxHashMap<BlockPos, TileEntity>,
        pub(crate) next_item: u64,
    }

    impl WorldStorage for GridWorld {
        fn is_valid(&self, pos: BlockPos) -> bool {
            (0..256).contains(&pos.y)
        }

        fn read_block(&self, pos: BlockPos) -> BlockState {
            self.blocks.get(&pos).copied().unwrap_or(BlockState::AIR)
        }

        fn write_block(
            &mut self,
            pos: BlockPos,
            state: BlockState,
        ) -> Result<BlockState, WorldError> {
            Ok(self.blocks.insert(pos, state).unwrap_or(BlockState::AIR))
        }

        fn contains_entity(&self, id: EntityId) -> bool {
            self.entities.contains_key(&id)
        }

        fn entity(&self, id: EntityId) -> Option<Entity> {
            self.entities.get(&id).cloned()
        }

        fn add_entity(&mut self, entity: Entity) -> Result<(), WorldError> {
            if self.entities.contains_key(&entity.id) {
                return Err(WorldError::DuplicateEntity(entity.id));
            }
            self.entities.insert(entity.id, entity);
            Ok(())
        }

        fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
            self.entities.remove(&id)
        }

        fn spawn_item(&mut self, pos: BlockPos, item: &ItemDrop) -> Result<EntityId, WorldError> {
            self.next_item += 1;
            let id = EntityId(1_000_000 + self.next_item);
            self.entities.insert(id, Entity::new(id, item.item.clone(), pos));
            Ok(id)
        }

        fn tile_entity(&self, pos: BlockPos) -> Option<TileEntity> {
            self.tiles.get(&pos).cloned()
        }

        fn set_tile_entity(
            &mut self,
            pos: BlockPos,
            tile: Option<TileEntity>,
        ) -> Result<Option<TileEntity>, WorldError> {
            Ok(match tile {
                Some(tile) => self.tiles.insert(pos, tile),
                None => self.tiles.remove(&pos),
            })
        }

        fn neighbor_changed(&mut self, _target: BlockPos, _block: BlockState, _source: BlockPos) {}
    }
}
