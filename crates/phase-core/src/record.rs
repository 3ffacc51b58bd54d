// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Plain world records carried through capture buffers and events.

use serde::{Deserialize, Serialize};

use crate::ident::{BlockPos, EntityId};

/// Opaque block state identifier as understood by world storage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockState(pub u32);

impl BlockState {
    /// The empty block.
    pub const AIR: Self = Self(0);

    /// Whether this is [`BlockState::AIR`].
    #[must_use]
    pub const fn is_air(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for BlockState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// Side-effect obligations attached to a block change.
///
/// Bit layout (low to high): neighbors, observers, lighting, clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeFlags(u8);

impl ChangeFlags {
    /// No side effects beyond the write itself.
    pub const NONE: Self = Self(0);
    /// Notify the six neighbors after the change lands.
    pub const NEIGHBORS: Self = Self(1);
    /// Notify observer blocks watching the position.
    pub const OBSERVERS: Self = Self(1 << 1);
    /// Recompute lighting at the position.
    pub const LIGHTING: Self = Self(1 << 2);
    /// Mark the position for client synchronization.
    pub const CLIENTS: Self = Self(1 << 3);
    /// Every obligation.
    pub const ALL: Self = Self(0b1111);

    /// Whether every bit in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` without the bits in `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Rebuilds flags from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }
}

impl core::ops::BitOr for ChangeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ChangeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A live entity as handed to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique id within the world.
    pub id: EntityId,
    /// Entity type name (e.g. `"zombie"`).
    pub kind: String,
    /// Block the entity occupies.
    pub pos: BlockPos,
}

impl Entity {
    /// Convenience constructor.
    #[must_use]
    pub fn new(id: EntityId, kind: impl Into<String>, pos: BlockPos) -> Self {
        Self {
            id,
            kind: kind.into(),
            pos,
        }
    }
}

/// An item stack proposed to be dropped into the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDrop {
    /// Item type name.
    pub item: String,
    /// Stack size.
    pub count: u32,
}

impl ItemDrop {
    /// Convenience constructor.
    #[must_use]
    pub fn new(item: impl Into<String>, count: u32) -> Self {
        Self {
            item: item.into(),
            count,
        }
    }
}

/// A block-attached entity (chest contents, furnace state, ...).
///
/// `id` distinguishes instances so removals can tell whether the tile at a
/// position is still the one they meant to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileEntity {
    /// Instance id.
    pub id: u64,
    /// Tile type name.
    pub kind: String,
}

impl TileEntity {
    /// Convenience constructor.
    #[must_use]
    pub fn new(id: u64, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
        }
    }
}

/// Why an entity spawn happened. Captured spawns are grouped by this value
/// when they are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnType {
    /// Placed by a player or block.
    Placement,
    /// Item entity produced by a drop.
    DropItem,
    /// Experience orb.
    Experience,
    /// Offspring.
    Breeding,
    /// Natural world spawning.
    WorldSpawner,
    /// Entity restored from a loading chunk.
    ChunkLoad,
    /// Spawned by an entity's own behavior.
    Passive,
    /// Spawned on behalf of a plugin.
    Plugin,
}

impl SpawnType {
    /// Stable lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Placement => "placement",
            Self::DropItem => "drop_item",
            Self::Experience => "experience",
            Self::Breeding => "breeding",
            Self::WorldSpawner => "world_spawner",
            Self::ChunkLoad => "chunk_load",
            Self::Passive => "passive",
            Self::Plugin => "plugin",
        }
    }
}

impl core::fmt::Display for SpawnType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
