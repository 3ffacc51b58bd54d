// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Phase harness: replays JSON tick scenarios against an in-memory world.
//!
//! A scenario lists world bounds and, per tick, the phase operations to run
//! (`begin`, `set_block`, `spawn`, `drop`, `end`, ...). The harness feeds
//! them through a [`phase_core::PhaseTracker`] and reports what every close
//! replayed, which ticks failed, and what reached storage.

pub mod cli;
pub mod scenario;
