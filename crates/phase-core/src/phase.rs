// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Phase taxonomy: the closed set of phase kinds and their capability table.
//!
//! Every behavioral difference between phases is expressed as data in a
//! [`PhaseStateDescriptor`]. Descriptors live in a static table indexed by
//! [`PhaseKind`]; nothing mutates them after construction.

use serde::{Deserialize, Serialize};

use crate::context::PhaseContext;
use crate::record::SpawnType;

/// Logical operation currently driving world mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Base terrain generation for a fresh chunk.
    TerrainGeneration,
    /// Feature population (trees, ores, structures) after terrain.
    Populator,
    /// Restoring a saved chunk and its entities.
    ChunkLoading,
    /// Natural mob spawning pass.
    WorldSpawner,
    /// Scheduled block update.
    BlockTick,
    /// Random block update.
    RandomBlockTick,
    /// Per-entity update.
    EntityTick,
    /// Per-tile-entity update.
    TileEntityTick,
    /// Weather pass (lightning, snow, ice).
    WeatherTick,
    /// Neighbor notification cascade.
    NeighborNotification,
    /// Queued block events (pistons, note blocks).
    BlockEventQueue,
    /// Dropping items from a broken block.
    BlockDrops,
    /// Writing back block snapshots; captures nothing.
    RestoringBlocks,
    /// Packet-driven player action.
    PlayerInteraction,
    /// Explosion resolution.
    Explosion,
    /// Legacy map data conversion.
    MapConversion,
    /// Console or player command.
    Command,
    /// Plugin scheduled task.
    ScheduledTask,
    /// Plugin-requested spawn.
    CustomSpawn,
    /// Plugin bulk block worker.
    BlockWorker,
    /// Implicit context collecting mutations made while a frame unwinds.
    Unwinding,
}

impl PhaseKind {
    /// Every kind, in declaration order (also the descriptor table order).
    pub const ALL: [Self; 21] = [
        Self::TerrainGeneration,
        Self::Populator,
        Self::ChunkLoading,
        Self::WorldSpawner,
        Self::BlockTick,
        Self::RandomBlockTick,
        Self::EntityTick,
        Self::TileEntityTick,
        Self::WeatherTick,
        Self::NeighborNotification,
        Self::BlockEventQueue,
        Self::BlockDrops,
        Self::RestoringBlocks,
        Self::PlayerInteraction,
        Self::Explosion,
        Self::MapConversion,
        Self::Command,
        Self::ScheduledTask,
        Self::CustomSpawn,
        Self::BlockWorker,
        Self::Unwinding,
    ];

    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TerrainGeneration => "terrain_generation",
            Self::Populator => "populator",
            Self::ChunkLoading => "chunk_loading",
            Self::WorldSpawner => "world_spawner",
            Self::BlockTick => "block_tick",
            Self::RandomBlockTick => "random_block_tick",
            Self::EntityTick => "entity_tick",
            Self::TileEntityTick => "tile_entity_tick",
            Self::WeatherTick => "weather_tick",
            Self::NeighborNotification => "neighbor_notification",
            Self::BlockEventQueue => "block_event_queue",
            Self::BlockDrops => "block_drops",
            Self::RestoringBlocks => "restoring_blocks",
            Self::PlayerInteraction => "player_interaction",
            Self::Explosion => "explosion",
            Self::MapConversion => "map_conversion",
            Self::Command => "command",
            Self::ScheduledTask => "scheduled_task",
            Self::CustomSpawn => "custom_spawn",
            Self::BlockWorker => "block_worker",
            Self::Unwinding => "unwinding",
        }
    }

    /// Capability descriptor for this kind.
    #[must_use]
    pub fn descriptor(self) -> &'static PhaseStateDescriptor {
        lookup(self)
    }
}

impl core::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable capability record for one [`PhaseKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct PhaseStateDescriptor {
    /// Kind this descriptor belongs to.
    pub kind: PhaseKind,
    /// Block changes are buffered instead of applied.
    pub captures_block_changes: bool,
    /// Entity spawns are buffered instead of applied.
    pub captures_entity_spawns: bool,
    /// Item drops are buffered instead of applied.
    pub captures_item_drops: bool,
    /// Tile-entity adds/removes are buffered instead of applied.
    pub captures_tile_entity_changes: bool,
    /// A nested activation of the same kind appends into the open frame
    /// instead of pushing a new one.
    pub already_capturing: bool,
    /// Neighbor notifications skip the notification event.
    pub ignores_block_events: bool,
    /// Scheduled block updates are not queued while active.
    pub ignores_scheduled_updates: bool,
    /// The phase's caller drains its captures; the tracker does not unwind them.
    pub handles_own_completion: bool,
    /// Part of world generation.
    pub is_world_generation: bool,
    /// Part of the regular simulation tick.
    pub is_ticking: bool,
    /// Writing back previously captured state.
    pub is_restoring: bool,
    /// Per-change pre/post events fire while the frame unwinds.
    pub fires_change_events: bool,
    /// On close, hand captures to a parent frame of a different kind instead
    /// of unwinding immediately.
    pub defers_to_parent: bool,
    /// Spawn cause recorded when a caller does not supply one.
    pub default_spawn_type: SpawnType,
}

impl PhaseStateDescriptor {
    /// Block changes made under `ctx` are buffered.
    #[must_use]
    pub const fn does_bulk_block_capture(&self, ctx: &PhaseContext) -> bool {
        self.captures_block_changes && !ctx.bulk_capture_disabled()
    }

    /// Tile-entity changes made under `ctx` are buffered.
    ///
    /// Tile changes ride with block changes: when bulk block capture is off
    /// for a context, tile changes apply immediately too.
    #[must_use]
    pub const fn tracks_tile_entity_changes(&self, ctx: &PhaseContext) -> bool {
        self.captures_tile_entity_changes && self.does_bulk_block_capture(ctx)
    }

    /// Entity spawns made under `ctx` are buffered.
    #[must_use]
    pub const fn does_capture_entity_spawns(&self, _ctx: &PhaseContext) -> bool {
        self.captures_entity_spawns
    }

    /// Item drops made under `ctx` are buffered.
    #[must_use]
    pub const fn does_capture_item_drops(&self, _ctx: &PhaseContext) -> bool {
        self.captures_item_drops
    }

    /// Whether any buffer is active under this descriptor.
    #[must_use]
    pub const fn captures_anything(&self) -> bool {
        self.captures_block_changes
            || self.captures_entity_spawns
            || self.captures_item_drops
            || self.captures_tile_entity_changes
    }
}

const fn capture_all(kind: PhaseKind) -> PhaseStateDescriptor {
    PhaseStateDescriptor {
        kind,
        captures_block_changes: true,
        captures_entity_spawns: true,
        captures_item_drops: true,
        captures_tile_entity_changes: true,
        already_capturing: false,
        ignores_block_events: false,
        ignores_scheduled_updates: false,
        handles_own_completion: false,
        is_world_generation: false,
        is_ticking: false,
        is_restoring: false,
        fires_change_events: true,
        defers_to_parent: false,
        default_spawn_type: SpawnType::Placement,
    }
}

const fn capture_none(kind: PhaseKind) -> PhaseStateDescriptor {
    PhaseStateDescriptor {
        captures_block_changes: false,
        captures_entity_spawns: false,
        captures_item_drops: false,
        captures_tile_entity_changes: false,
        ..capture_all(kind)
    }
}

const fn ticking(kind: PhaseKind) -> PhaseStateDescriptor {
    PhaseStateDescriptor {
        is_ticking: true,
        ..capture_all(kind)
    }
}

const fn generation(kind: PhaseKind) -> PhaseStateDescriptor {
    PhaseStateDescriptor {
        captures_item_drops: false,
        ignores_block_events: true,
        ignores_scheduled_updates: true,
        handles_own_completion: true,
        is_world_generation: true,
        fires_change_events: false,
        default_spawn_type: SpawnType::WorldSpawner,
        ..capture_all(kind)
    }
}

const fn spawns_only(kind: PhaseKind, spawn: SpawnType) -> PhaseStateDescriptor {
    PhaseStateDescriptor {
        captures_entity_spawns: true,
        default_spawn_type: spawn,
        ..capture_none(kind)
    }
}

// Indexed by `PhaseKind as usize`; order must match `PhaseKind::ALL`.
static DESCRIPTORS: [PhaseStateDescriptor; 21] = [
    generation(PhaseKind::TerrainGeneration),
    generation(PhaseKind::Populator),
    PhaseStateDescriptor {
        ignores_block_events: true,
        ignores_scheduled_updates: true,
        is_world_generation: true,
        fires_change_events: false,
        ..spawns_only(PhaseKind::ChunkLoading, SpawnType::ChunkLoad)
    },
    PhaseStateDescriptor {
        is_world_generation: true,
        ..spawns_only(PhaseKind::WorldSpawner, SpawnType::WorldSpawner)
    },
    PhaseStateDescriptor {
        already_capturing: true,
        ..ticking(PhaseKind::BlockTick)
    },
    PhaseStateDescriptor {
        already_capturing: true,
        ..ticking(PhaseKind::RandomBlockTick)
    },
    PhaseStateDescriptor {
        default_spawn_type: SpawnType::Passive,
        ..ticking(PhaseKind::EntityTick)
    },
    ticking(PhaseKind::TileEntityTick),
    PhaseStateDescriptor {
        captures_item_drops: false,
        captures_tile_entity_changes: false,
        ..ticking(PhaseKind::WeatherTick)
    },
    PhaseStateDescriptor {
        already_capturing: true,
        defers_to_parent: true,
        ..ticking(PhaseKind::NeighborNotification)
    },
    ticking(PhaseKind::BlockEventQueue),
    PhaseStateDescriptor {
        captures_item_drops: true,
        captures_entity_spawns: true,
        defers_to_parent: true,
        default_spawn_type: SpawnType::DropItem,
        ..capture_none(PhaseKind::BlockDrops)
    },
    PhaseStateDescriptor {
        ignores_block_events: true,
        ignores_scheduled_updates: true,
        is_restoring: true,
        fires_change_events: false,
        ..capture_none(PhaseKind::RestoringBlocks)
    },
    capture_all(PhaseKind::PlayerInteraction),
    PhaseStateDescriptor {
        default_spawn_type: SpawnType::DropItem,
        ..capture_all(PhaseKind::Explosion)
    },
    PhaseStateDescriptor {
        ignores_block_events: true,
        ignores_scheduled_updates: true,
        fires_change_events: false,
        ..capture_none(PhaseKind::MapConversion)
    },
    capture_all(PhaseKind::Command),
    PhaseStateDescriptor {
        default_spawn_type: SpawnType::Plugin,
        ..capture_all(PhaseKind::ScheduledTask)
    },
    spawns_only(PhaseKind::CustomSpawn, SpawnType::Plugin),
    PhaseStateDescriptor {
        captures_block_changes: true,
        default_spawn_type: SpawnType::Plugin,
        ..capture_none(PhaseKind::BlockWorker)
    },
    capture_all(PhaseKind::Unwinding),
];

/// Returns the descriptor for `kind`. Total over the closed kind set.
#[must_use]
pub fn lookup(kind: PhaseKind) -> &'static PhaseStateDescriptor {
    &DESCRIPTORS[kind as usize]
}

/// Iterates the whole descriptor table in [`PhaseKind::ALL`] order.
pub fn descriptors() -> impl Iterator<Item = &'static PhaseStateDescriptor> {
    DESCRIPTORS.iter()
}
