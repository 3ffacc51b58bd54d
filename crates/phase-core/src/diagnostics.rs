// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Read-only stack dumps for logs and failure reports.
//!
//! Nothing here mutates tracker state, and building a dump never fails: a
//! frame whose summary cannot be built is replaced by a placeholder line.

use std::any::Any;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;

use crate::context::CaptureCounts;
use crate::phase::PhaseKind;
use crate::tracker::{PhaseFrame, PhaseTracker};

/// One frame as shown in a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSummary {
    /// Position in the dump; 0 is the top of the stack.
    pub index: usize,
    /// Phase kind.
    pub kind: PhaseKind,
    /// Rendered source.
    pub source: String,
    /// Buffer sizes.
    pub counts: CaptureCounts,
    /// Frame is closed and draining.
    pub unwinding: bool,
}

impl FrameSummary {
    fn of(index: usize, frame: &PhaseFrame) -> Self {
        Self {
            index,
            kind: frame.kind(),
            source: frame.context().source().to_string(),
            counts: frame.context().capture_counts(),
            unwinding: frame.is_unwinding(),
        }
    }
}

impl core::fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let c = &self.counts;
        write!(
            f,
            "#{} {} source={} blocks={} spawns={} drops={} tiles={} notifications={} children={}",
            self.index,
            self.kind,
            self.source,
            c.blocks,
            c.spawns,
            c.drops,
            c.tiles,
            c.notifications,
            c.children
        )?;
        if self.unwinding {
            f.write_str(" [unwinding]")?;
        }
        Ok(())
    }
}

/// Diagnostics attached to a failed tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    /// Tick number that failed.
    pub tick: u64,
    /// Panic message or abort reason.
    pub message: String,
    /// Frames at the time of failure, top first.
    pub frames: Vec<FrameSummary>,
    /// Rendered stack dump.
    pub dump: String,
}

impl PhaseTracker {
    /// Renders the stack, top first, one line per frame.
    pub fn diagnostics_dump(&self) -> String {
        if self.stack.is_empty() {
            return "Phase stack (empty)".to_owned();
        }
        let mut out = format!("Phase stack (depth {}, top first):", self.stack.len());
        for (index, frame) in self.frames().enumerate() {
            let line = panic::catch_unwind(AssertUnwindSafe(|| {
                FrameSummary::of(index, frame).to_string()
            }))
            .unwrap_or_else(|_| format!("#{index} <unavailable>"));
            let _ = write!(out, "\n  {line}");
        }
        out
    }

    /// Structured form of [`PhaseTracker::diagnostics_dump`]. Frames whose
    /// summary cannot be built are left out.
    pub fn frame_summaries(&self) -> Vec<FrameSummary> {
        self.frames()
            .enumerate()
            .filter_map(|(index, frame)| {
                panic::catch_unwind(AssertUnwindSafe(|| FrameSummary::of(index, frame))).ok()
            })
            .collect()
    }

    /// Builds the report attached to a failed tick.
    pub fn failure_report(&self, tick: u64, message: String) -> FailureReport {
        FailureReport {
            tick,
            message,
            frames: self.frame_summaries(),
            dump: self.diagnostics_dump(),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
