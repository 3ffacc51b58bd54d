// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! phase-core: phase tracking and transactional mutation capture.
//!
//! A [`PhaseTracker`] keeps a LIFO stack of active phases. Every world
//! mutation goes through the router, which either buffers it in the top
//! frame's [`PhaseContext`] or applies it immediately, depending on the
//! frame's [`PhaseStateDescriptor`]. Closing a frame replays its buffers in
//! a fixed order while firing cancellable events.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

/// Tracker configuration and the config service/store port.
pub mod config;
mod context;
mod diagnostics;
mod error;
mod event;
mod ident;
mod phase;
mod record;
mod router;
mod tracker;
mod unwind;
mod world;

// Re-exports for stable public API
/// Capture buffers and the records they hold.
pub use context::{
    BlockTransaction, CaptureCounts, CaptureSet, CapturedSpawn, NeighborNotification,
    PhaseContext, PhaseSource, TileEntityChange,
};
/// Stack dumps and failure reports.
pub use diagnostics::{FailureReport, FrameSummary};
/// Error taxonomy.
pub use error::{InvalidMutation, PhaseError, TickError, WorldError};
/// Events and the listener bus.
pub use event::{Cause, CauseFrame, EventBus, EventListener, EventPayload, ListenerId, PhaseEvent};
/// Positions, directions and identifiers.
pub use ident::{BlockPos, Direction, DirectionSet, EntityId, UserId, NOTIFY_ORDER};
/// Phase taxonomy.
pub use phase::{descriptors, lookup, PhaseKind, PhaseStateDescriptor};
/// World records.
pub use record::{BlockState, ChangeFlags, Entity, ItemDrop, SpawnType, TileEntity};
/// Mutation proposals.
pub use router::{Proposal, TileEntityOp};
/// The phase stack.
pub use tracker::{Attribution, FrameHandle, FrameId, PhaseFrame, PhaseGuard, PhaseTracker};
/// Replay outcomes.
pub use unwind::{StageCounts, UnwindItemFailure, UnwindReport, UnwindStage};
/// Collaborator ports.
pub use world::{AttributionSource, NoAttribution, WorldStorage};
