// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types for the phase tracker and its collaborators.

use thiserror::Error;

use crate::diagnostics::FailureReport;
use crate::ident::{BlockPos, EntityId};
use crate::tracker::FrameHandle;

/// Stack discipline violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    /// `close` was called with a handle that is not the top frame.
    ///
    /// When the handle's frame was still on the stack it and every frame
    /// above it were force-popped (`recovered`). Otherwise the tick must
    /// abort.
    #[error("stack corruption: closed {handle} while top was {top:?} (recovered: {recovered})")]
    StackCorruption {
        /// Handle passed to `close`.
        handle: FrameHandle,
        /// Top frame at the time of the call.
        top: Option<FrameHandle>,
        /// Whether force-popping restored a consistent stack.
        recovered: bool,
        /// Stack dump taken before recovery.
        dump: String,
    },
    /// Frames were still open at a tick boundary; the stack was cleared.
    #[error("{frames} dangling phase(s) at tick boundary: {sources:?}")]
    DanglingPhase {
        /// Number of frames cleared.
        frames: usize,
        /// `kind source` per cleared frame, top first.
        sources: Vec<String>,
        /// Captured items discarded with them.
        discarded: usize,
    },
    /// The handle does not name a frame on the stack.
    #[error("unknown frame handle {0}")]
    UnknownHandle(FrameHandle),
}

/// A proposal failed a phase-independent validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidMutation {
    /// Target position is outside the world.
    #[error("position {0} is out of bounds")]
    OutOfBounds(BlockPos),
    /// An entity with this id is already live or already captured.
    #[error("{0} already exists")]
    DuplicateEntity(EntityId),
}

/// Failure reported by world storage for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    /// Position outside the world.
    #[error("position {0} is out of bounds")]
    OutOfBounds(BlockPos),
    /// Entity id already live.
    #[error("{0} already exists")]
    DuplicateEntity(EntityId),
    /// Storage refused the write.
    #[error("storage rejected the operation: {0}")]
    Rejected(String),
}

/// A simulation tick could not complete.
#[derive(Debug, Clone, Error)]
pub enum TickError {
    /// A stack corruption could not be recovered.
    #[error("tick {} aborted: {}", .report.tick, .report.message)]
    Aborted {
        /// Diagnostics captured before the stack was cleared.
        report: FailureReport,
    },
    /// The tick body panicked.
    #[error("tick {} panicked: {}", .report.tick, .report.message)]
    Panicked {
        /// Diagnostics captured before the stack was cleared.
        report: FailureReport,
    },
}

impl TickError {
    /// Attached failure report.
    pub const fn report(&self) -> &FailureReport {
        match self {
            Self::Aborted { report } | Self::Panicked { report } => report,
        }
    }
}
