// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use phase_core::{BlockPos, Entity, EntityId, ItemDrop, TileEntity};

/// Block every test starts from.
pub const ORIGIN: BlockPos = BlockPos::new(0, 64, 0);

/// Position `x` blocks east of [`ORIGIN`].
pub const fn at(x: i32) -> BlockPos {
    BlockPos::new(x, 64, 0)
}

pub fn mob(id: u64, kind: &str, pos: BlockPos) -> Entity {
    Entity::new(EntityId(id), kind, pos)
}

pub fn stack(item: &str, count: u32) -> ItemDrop {
    ItemDrop::new(item, count)
}

pub fn chest(id: u64) -> TileEntity {
    TileEntity::new(id, "chest")
}
