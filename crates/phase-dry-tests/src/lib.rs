// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for phase tracker crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`attribution`] - Fixed owner/notifier tables that log applied changes
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`listeners`] - Recording, vetoing and trimming event listeners
//! - [`tracker`] - Tracker builder over the in-memory world
//! - [`world`] - In-memory world storage with an operation journal

pub mod attribution;
pub mod config;
pub mod listeners;
pub mod tracker;
pub mod world;

// Re-export commonly used items at crate root for convenience
pub use attribution::{AttributedChange, StaticAttribution};
pub use config::InMemoryConfigStore;
pub use listeners::{
    veto_block_changes_at, veto_named, DirectionFilter, DropFilter, EventLog, RecordedEvent,
    RecordingListener, SpawnFilter, VetoListener,
};
pub use tracker::TrackerTestBuilder;
pub use world::{DroppedItem, MemoryWorld, WorldBounds, WorldOp, FIRST_ITEM_ENTITY};
