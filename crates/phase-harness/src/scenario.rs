// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scenario format and replay.
//!
//! ```json
//! {
//!   "world": { "horizontal_radius": 64, "min_y": 0, "max_y": 255 },
//!   "ticks": [
//!     [
//!       { "op": "begin", "kind": "block_tick", "source": { "block": [0, 64, 0] } },
//!       { "op": "set_block", "pos": [0, 65, 0], "state": 7, "flags": "all" },
//!       { "op": "end" }
//!     ]
//!   ]
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use phase_core::config::TrackerConfig;
use phase_core::{
    BlockPos, BlockState, ChangeFlags, Direction, DirectionSet, Entity, EntityId, FailureReport,
    FrameHandle, ItemDrop, PhaseError, PhaseEvent, PhaseKind, PhaseSource, PhaseTracker,
    Proposal, SpawnType, TileEntity, TileEntityOp, UnwindReport, UserId,
};
use phase_dry_tests::{DroppedItem, MemoryWorld, WorldBounds, WorldOp};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// `[x, y, z]` block coordinate as written in scenario files.
pub type Coord = [i32; 3];

const fn at([x, y, z]: Coord) -> BlockPos {
    BlockPos::new(x, y, z)
}

const fn one() -> u32 {
    1
}

/// A parsed scenario file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Bounds of the in-memory world.
    #[serde(default)]
    pub world: WorldBounds,
    /// Operations per tick, in order.
    #[serde(default)]
    pub ticks: Vec<Vec<ScenarioOp>>,
}

impl Scenario {
    /// Parses a scenario from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid scenario JSON")
    }

    /// Reads and parses a scenario file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in scenario {}", path.display()))
    }
}

/// Phase source as written in scenario files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSpec {
    /// No source.
    #[default]
    None,
    /// A block.
    Block(Coord),
    /// An entity id.
    Entity(u64),
    /// A tile entity's position.
    TileEntity(Coord),
    /// A player id.
    Player(u64),
    /// A plugin name.
    Plugin(String),
    /// The world.
    World,
}

impl From<SourceSpec> for PhaseSource {
    fn from(spec: SourceSpec) -> Self {
        match spec {
            SourceSpec::None => Self::None,
            SourceSpec::Block(pos) => Self::Block(at(pos)),
            SourceSpec::Entity(id) => Self::Entity(EntityId(id)),
            SourceSpec::TileEntity(pos) => Self::TileEntity(at(pos)),
            SourceSpec::Player(id) => Self::Player(UserId(id)),
            SourceSpec::Plugin(name) => Self::Plugin(name),
            SourceSpec::World => Self::World,
        }
    }
}

/// One named change flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagName {
    /// Every obligation.
    All,
    /// No obligation.
    None,
    /// Neighbor updates.
    Neighbors,
    /// Observer updates.
    Observers,
    /// Lighting.
    Lighting,
    /// Client sync.
    Clients,
}

impl FlagName {
    const fn flags(self) -> ChangeFlags {
        match self {
            Self::All => ChangeFlags::ALL,
            Self::None => ChangeFlags::NONE,
            Self::Neighbors => ChangeFlags::NEIGHBORS,
            Self::Observers => ChangeFlags::OBSERVERS,
            Self::Lighting => ChangeFlags::LIGHTING,
            Self::Clients => ChangeFlags::CLIENTS,
        }
    }
}

/// Change flags: a single name (`"all"`) or a list (`["neighbors", "lighting"]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FlagsSpec {
    /// One name.
    One(FlagName),
    /// Union of names.
    Many(Vec<FlagName>),
}

impl Default for FlagsSpec {
    fn default() -> Self {
        Self::One(FlagName::None)
    }
}

impl FlagsSpec {
    /// Resolved flag set.
    pub fn to_flags(&self) -> ChangeFlags {
        match self {
            Self::One(name) => name.flags(),
            Self::Many(names) => names
                .iter()
                .fold(ChangeFlags::NONE, |acc, name| acc | name.flags()),
        }
    }
}

/// A single scenario operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScenarioOp {
    /// Push a phase.
    Begin {
        /// Phase kind.
        kind: PhaseKind,
        /// Initiating object.
        #[serde(default)]
        source: SourceSpec,
    },
    /// Close the most recent phase begun in this tick that is still open.
    End,
    /// Close the phase opened by the `begin`-th `begin` of this tick,
    /// whether or not it is on top.
    Close {
        /// Zero-based index among this tick's `begin` operations.
        begin: usize,
    },
    /// Propose a block change.
    SetBlock {
        /// Target.
        pos: Coord,
        /// New state id.
        state: u32,
        /// Side-effect obligations.
        #[serde(default)]
        flags: FlagsSpec,
    },
    /// Propose an entity spawn.
    Spawn {
        /// Entity id.
        id: u64,
        /// Entity type name.
        kind: String,
        /// Spawn position.
        pos: Coord,
        /// Spawn cause; defaults to the current phase's cause.
        #[serde(default)]
        cause: Option<SpawnType>,
    },
    /// Propose an item drop.
    Drop {
        /// Drop position.
        pos: Coord,
        /// Item name.
        item: String,
        /// Stack size.
        #[serde(default = "one")]
        count: u32,
    },
    /// Propose installing a tile entity.
    SetTile {
        /// Position.
        pos: Coord,
        /// Tile id.
        id: u64,
        /// Tile type name.
        kind: String,
    },
    /// Propose removing a tile entity.
    RemoveTile {
        /// Position.
        pos: Coord,
    },
    /// Notify the neighbors of a block.
    Notify {
        /// Notifying block.
        pos: Coord,
        /// Directions to notify; all six when absent.
        #[serde(default)]
        directions: Option<Vec<Direction>>,
    },
    /// Panic inside the tick body.
    Panic {
        /// Panic message.
        message: String,
    },
}

impl ScenarioOp {
    /// The operation's `op` tag.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Begin { .. } => "begin",
            Self::End => "end",
            Self::Close { .. } => "close",
            Self::SetBlock { .. } => "set_block",
            Self::Spawn { .. } => "spawn",
            Self::Drop { .. } => "drop",
            Self::SetTile { .. } => "set_tile",
            Self::RemoveTile { .. } => "remove_tile",
            Self::Notify { .. } => "notify",
            Self::Panic { .. } => "panic",
        }
    }
}

/// What one operation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OpOutcome {
    /// A phase was pushed, or merged into an open frame of the same kind.
    Opened {
        /// Handle returned by the tracker.
        handle: FrameHandle,
    },
    /// A phase was closed.
    Closed {
        /// What the close replayed.
        report: UnwindReport,
    },
    /// The mutation was buffered.
    Captured,
    /// The mutation was applied immediately.
    Applied {
        /// Whether storage changed.
        changed: bool,
    },
    /// The mutation was rejected.
    Invalid {
        /// Rejection reason.
        reason: String,
    },
    /// Neighbor notification survived for these directions.
    Notified {
        /// Surviving directions, in notification order.
        directions: Vec<Direction>,
    },
    /// The tick body is about to panic.
    Panicking,
    /// The operation failed.
    Error {
        /// Error text.
        message: String,
    },
}

impl From<Proposal> for OpOutcome {
    fn from(proposal: Proposal) -> Self {
        match proposal {
            Proposal::Applied { changed } => Self::Applied { changed },
            Proposal::Captured => Self::Captured,
            Proposal::Invalid(reason) => Self::Invalid {
                reason: reason.to_string(),
            },
        }
    }
}

impl fmt::Display for OpOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { handle } => write!(
                f,
                "opened frame at depth {} (re-entry {})",
                handle.depth(),
                handle.reentry()
            ),
            Self::Closed { report } if report.merged => {
                write!(f, "closed merged {} activation", report.kind)
            }
            Self::Closed { report } if report.deferred => {
                write!(f, "closed {}, deferred to parent", report.kind)
            }
            Self::Closed { report } => write!(
                f,
                "closed {}: applied {}, cancelled {}, failed {}, discarded {}, children {}",
                report.kind,
                report.total_applied(),
                report.total_cancelled(),
                report.total_failures(),
                report.total_discarded(),
                report.children.len()
            ),
            Self::Captured => f.write_str("captured"),
            Self::Applied { changed: true } => f.write_str("applied"),
            Self::Applied { changed: false } => f.write_str("applied (no change)"),
            Self::Invalid { reason } => write!(f, "invalid: {reason}"),
            Self::Notified { directions } => {
                f.write_str("notified")?;
                for direction in directions {
                    write!(f, " {direction:?}")?;
                }
                Ok(())
            }
            Self::Panicking => f.write_str("panicking"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

/// One operation and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpRecord {
    /// Position in the tick.
    pub index: usize,
    /// The `op` tag.
    pub op: &'static str,
    /// Outcome.
    pub outcome: OpOutcome,
}

/// Everything one tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Tick number.
    pub tick: u64,
    /// Operations that ran, in order.
    pub ops: Vec<OpRecord>,
    /// Events fired during the tick.
    pub events: u64,
    /// Storage operations performed during the tick.
    pub world_ops: usize,
    /// Stack dump taken after the last operation, before the tick boundary
    /// cleared any dangling frames.
    pub dump: String,
    /// Frames the tick boundary found still open and cleared.
    pub dangling: usize,
    /// Diagnostics when the tick failed.
    pub failure: Option<FailureReport>,
}

impl TickSummary {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            ops: Vec::new(),
            events: 0,
            world_ops: 0,
            dump: String::new(),
            dangling: 0,
            failure: None,
        }
    }

    /// Whether the tick panicked or aborted.
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Reports of every close in the tick, in order.
    pub fn closes(&self) -> impl Iterator<Item = &UnwindReport> {
        self.ops.iter().filter_map(|record| match &record.outcome {
            OpOutcome::Closed { report } => Some(report),
            _ => None,
        })
    }
}

/// Final world contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorldSummary {
    /// Block writes, in order.
    pub writes: Vec<(BlockPos, BlockState)>,
    /// Live entity ids.
    pub entities: Vec<EntityId>,
    /// Dropped items.
    pub items: Vec<DroppedItem>,
    /// Every storage operation, in order.
    pub journal: Vec<WorldOp>,
}

impl WorldSummary {
    fn of(world: &MemoryWorld) -> Self {
        Self {
            writes: world.writes(),
            entities: world.entity_ids(),
            items: world.items(),
            journal: world.journal(),
        }
    }
}

/// Result of replaying a whole scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Effective tracker configuration.
    pub config: TrackerConfig,
    /// Per-tick summaries.
    pub ticks: Vec<TickSummary>,
    /// World contents after the last tick.
    pub world: WorldSummary,
}

impl RunReport {
    /// First tick that panicked or aborted.
    pub fn first_failure(&self) -> Option<&TickSummary> {
        self.ticks.iter().find(|tick| tick.is_failed())
    }

    /// Whether every tick completed.
    pub fn is_success(&self) -> bool {
        self.first_failure().is_none()
    }
}

/// Replays `scenario` against a fresh in-memory world.
pub fn run(scenario: &Scenario, config: TrackerConfig) -> RunReport {
    let world = MemoryWorld::with_bounds(scenario.world);
    let mut tracker = PhaseTracker::with_config(world.clone(), config.clone());
    let events = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&events);
    tracker.subscribe(move |event: &mut PhaseEvent, _tracker: &mut PhaseTracker| {
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(event = event.name(), "event fired");
    });

    let mut ticks = Vec::with_capacity(scenario.ticks.len());
    for ops in &scenario.ticks {
        let mut summary = TickSummary::new(tracker.tick());
        let events_before = events.load(Ordering::Relaxed);
        let journal_before = world.journal().len();

        if let Err(err) = tracker.run_tick(|t| replay_tick(t, ops, &mut summary)) {
            warn!(tick = summary.tick, %err, "tick failed");
            summary.failure = Some(err.report().clone());
        }
        summary.dangling = tracker
            .take_dangling()
            .iter()
            .map(|err| match err {
                PhaseError::DanglingPhase { frames, .. } => *frames,
                _ => 0,
            })
            .sum();

        summary.events = events.load(Ordering::Relaxed) - events_before;
        summary.world_ops = world.journal().len() - journal_before;
        debug!(
            tick = summary.tick,
            ops = summary.ops.len(),
            events = summary.events,
            world_ops = summary.world_ops,
            "tick replayed"
        );
        ticks.push(summary);
    }

    let report = RunReport {
        config,
        ticks,
        world: WorldSummary::of(&world),
    };
    info!(
        ticks = report.ticks.len(),
        failed = report.ticks.iter().filter(|t| t.is_failed()).count(),
        "scenario replayed"
    );
    report
}

fn replay_tick(t: &mut PhaseTracker, ops: &[ScenarioOp], summary: &mut TickSummary) {
    // Handles in `begin` order, and the subset still open in push order.
    let mut begun: Vec<FrameHandle> = Vec::new();
    let mut open: Vec<FrameHandle> = Vec::new();

    for (index, op) in ops.iter().enumerate() {
        let outcome = match op {
            ScenarioOp::Begin { kind, source } => {
                let handle = t.begin_phase(*kind, source.clone().into());
                begun.push(handle);
                open.push(handle);
                OpOutcome::Opened { handle }
            }
            ScenarioOp::End => match open.pop() {
                Some(handle) => close(t, handle),
                None => OpOutcome::Error {
                    message: "end without an open phase".to_owned(),
                },
            },
            ScenarioOp::Close { begin } => match begun.get(*begin) {
                Some(&handle) => {
                    open.retain(|h| *h != handle);
                    close(t, handle)
                }
                None => OpOutcome::Error {
                    message: format!("no begin #{begin} in this tick"),
                },
            },
            ScenarioOp::SetBlock { pos, state, flags } => t
                .propose_block_change(at(*pos), BlockState(*state), flags.to_flags())
                .into(),
            ScenarioOp::Spawn {
                id,
                kind,
                pos,
                cause,
            } => {
                let cause = cause.unwrap_or_else(|| t.default_spawn_type());
                t.propose_entity_spawn(Entity::new(EntityId(*id), kind.clone(), at(*pos)), cause)
                    .into()
            }
            ScenarioOp::Drop { pos, item, count } => t
                .propose_item_drop(at(*pos), ItemDrop::new(item.clone(), *count))
                .into(),
            ScenarioOp::SetTile { pos, id, kind } => t
                .propose_tile_entity_op(
                    at(*pos),
                    TileEntityOp::Set(TileEntity::new(*id, kind.clone())),
                )
                .into(),
            ScenarioOp::RemoveTile { pos } => {
                t.propose_tile_entity_op(at(*pos), TileEntityOp::Remove).into()
            }
            ScenarioOp::Notify { pos, directions } => {
                let pos = at(*pos);
                let requested = directions
                    .as_ref()
                    .map_or(DirectionSet::ALL, |list| list.iter().copied().collect());
                let block = t.block_at(pos);
                let surviving = t.notify_neighbors(pos, block, requested);
                OpOutcome::Notified {
                    directions: surviving.iter().collect(),
                }
            }
            ScenarioOp::Panic { message } => {
                summary.ops.push(OpRecord {
                    index,
                    op: op.name(),
                    outcome: OpOutcome::Panicking,
                });
                summary.dump = t.diagnostics_dump();
                std::panic::panic_any(message.clone());
            }
        };
        summary.ops.push(OpRecord {
            index,
            op: op.name(),
            outcome,
        });
    }
    summary.dump = t.diagnostics_dump();
}

fn close(t: &mut PhaseTracker, handle: FrameHandle) -> OpOutcome {
    match t.close(handle) {
        Ok(report) => OpOutcome::Closed { report },
        Err(err) => OpOutcome::Error {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn scenario(json: &str) -> Scenario {
        Scenario::from_json(json).unwrap()
    }

    #[test]
    fn parses_sources_and_flags() {
        let s = scenario(
            r#"{ "ticks": [[
                { "op": "begin", "kind": "explosion", "source": { "block": [1, 2, 3] } },
                { "op": "begin", "kind": "weather_tick", "source": "world" },
                { "op": "set_block", "pos": [0, 64, 0], "state": 3, "flags": ["neighbors", "lighting"] },
                { "op": "drop", "pos": [0, 64, 0], "item": "dirt" },
                { "op": "end" }
            ]] }"#,
        );
        assert_eq!(s.world, WorldBounds::default());
        let ops = &s.ticks[0];
        assert_eq!(
            ops[0],
            ScenarioOp::Begin {
                kind: PhaseKind::Explosion,
                source: SourceSpec::Block([1, 2, 3]),
            }
        );
        assert_eq!(
            PhaseSource::from(SourceSpec::Block([1, 2, 3])),
            PhaseSource::Block(BlockPos::new(1, 2, 3))
        );
        assert!(matches!(
            ops[1],
            ScenarioOp::Begin {
                source: SourceSpec::World,
                ..
            }
        ));
        let ScenarioOp::SetBlock { flags, .. } = &ops[2] else {
            panic!("expected set_block");
        };
        assert_eq!(
            flags.to_flags(),
            ChangeFlags::NEIGHBORS | ChangeFlags::LIGHTING
        );
        assert!(matches!(ops[3], ScenarioOp::Drop { count: 1, .. }));
        assert_eq!(ops[4].name(), "end");
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        assert!(Scenario::from_json(r#"{ "tick": [] }"#).is_err());
        assert!(Scenario::from_json(r#"{ "ticks": [[{ "op": "teleport" }]] }"#).is_err());
    }

    #[test]
    fn captured_changes_land_on_close() {
        let s = scenario(
            r#"{ "ticks": [[
                { "op": "begin", "kind": "command", "source": { "plugin": "worldedit" } },
                { "op": "set_block", "pos": [0, 64, 0], "state": 9 },
                { "op": "end" },
                { "op": "set_block", "pos": [1, 64, 0], "state": 4 }
            ]] }"#,
        );
        let report = run(&s, TrackerConfig::default());
        assert!(report.is_success());
        let tick = &report.ticks[0];
        assert_eq!(tick.ops[1].outcome, OpOutcome::Captured);
        assert_eq!(tick.ops[3].outcome, OpOutcome::Applied { changed: true });
        let closes: Vec<_> = tick.closes().collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].blocks.applied, 1);
        assert_eq!(tick.events, 4);
        assert_eq!(tick.dump, "Phase stack (empty)");
        assert_eq!(
            report.world.writes,
            vec![
                (BlockPos::new(0, 64, 0), BlockState(9)),
                (BlockPos::new(1, 64, 0), BlockState(4)),
            ]
        );
    }

    #[test]
    fn stray_end_is_reported_not_fatal() {
        let s = scenario(r#"{ "ticks": [[{ "op": "end" }]] }"#);
        let report = run(&s, TrackerConfig::default());
        assert!(report.is_success());
        assert!(matches!(
            report.ticks[0].ops[0].outcome,
            OpOutcome::Error { .. }
        ));
    }

    #[test]
    fn unclosed_phases_are_counted_at_the_boundary() {
        let s = scenario(
            r#"{ "ticks": [
                [
                    { "op": "begin", "kind": "explosion", "source": "world" },
                    { "op": "begin", "kind": "command", "source": "world" },
                    { "op": "set_block", "pos": [0, 64, 0], "state": 2 }
                ],
                [ { "op": "set_block", "pos": [0, 64, 0], "state": 3 } ]
            ] }"#,
        );
        let report = run(&s, TrackerConfig::default());
        assert!(report.is_success());
        assert_eq!(report.ticks[0].dangling, 2);
        assert_eq!(report.ticks[1].dangling, 0);
        assert_eq!(
            report.world.writes,
            vec![(BlockPos::new(0, 64, 0), BlockState(3))]
        );
    }

    #[test]
    fn panic_op_fails_the_tick_with_a_dump() {
        let s = scenario(
            r#"{ "ticks": [
                [
                    { "op": "begin", "kind": "entity_tick", "source": { "entity": 12 } },
                    { "op": "panic", "message": "zombie ai blew up" }
                ],
                [ { "op": "set_block", "pos": [0, 64, 0], "state": 1 } ]
            ] }"#,
        );
        let report = run(&s, TrackerConfig::default());
        let failed = report.first_failure().unwrap();
        assert_eq!(failed.tick, 0);
        assert_eq!(failed.ops.last().unwrap().outcome, OpOutcome::Panicking);
        let failure = failed.failure.as_ref().unwrap();
        assert_eq!(failure.message, "zombie ai blew up");
        assert!(failure.dump.contains("entity_tick source=entity#12"));
        assert!(!report.ticks[1].is_failed());
        assert_eq!(report.ticks[1].tick, 1);
    }

    #[test]
    fn outcome_text_is_readable() {
        assert_eq!(OpOutcome::Captured.to_string(), "captured");
        assert_eq!(
            OpOutcome::Applied { changed: false }.to_string(),
            "applied (no change)"
        );
        let mut report = UnwindReport::new(PhaseKind::BlockDrops);
        report.deferred = true;
        assert_eq!(
            OpOutcome::Closed { report }.to_string(),
            "closed block_drops, deferred to parent"
        );
    }
}
