// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The phase stack: push, close, scoped activation and tick boundaries.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::TrackerConfig;
use crate::context::{PhaseContext, PhaseSource};
use crate::diagnostics::panic_message;
use crate::error::{PhaseError, TickError};
use crate::event::{Cause, CauseFrame, EventBus, EventListener, ListenerId, PhaseEvent};
use crate::ident::UserId;
use crate::phase::{lookup, PhaseKind, PhaseStateDescriptor};
use crate::record::SpawnType;
use crate::unwind::UnwindReport;
use crate::world::{AttributionSource, NoAttribution, WorldStorage};

/// Identifier of one pushed frame. Never reused within a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameId(u64);

impl FrameId {
    /// Raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Opaque token returned by [`PhaseTracker::begin_phase`].
///
/// Bound to the frame and the stack depth at push time. A handle returned by
/// a merged same-kind activation carries the re-entry level it opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameHandle {
    frame: FrameId,
    depth: usize,
    reentry: u32,
}

impl FrameHandle {
    /// Frame this handle refers to.
    pub const fn frame(self) -> FrameId {
        self.frame
    }

    /// Stack index of the frame at push time (0 = bottom).
    pub const fn depth(self) -> usize {
        self.depth
    }

    /// Re-entry level; 0 for the activation that pushed the frame.
    pub const fn reentry(self) -> u32 {
        self.reentry
    }
}

impl core::fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "frame#{}@{}", self.frame.0, self.depth)?;
        if self.reentry > 0 {
            write!(f, "+{}", self.reentry)?;
        }
        Ok(())
    }
}

/// Explicit owner/notifier attribution for a new phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attribution {
    /// Owning user.
    pub owner: Option<UserId>,
    /// Notifying user.
    pub notifier: Option<UserId>,
}

/// One `(descriptor, context)` pair on the stack.
#[derive(Debug)]
pub struct PhaseFrame {
    pub(crate) id: FrameId,
    pub(crate) descriptor: &'static PhaseStateDescriptor,
    pub(crate) context: PhaseContext,
}

impl PhaseFrame {
    pub(crate) fn new(id: FrameId, context: PhaseContext) -> Self {
        Self {
            id,
            descriptor: lookup(context.kind()),
            context,
        }
    }

    /// Frame id.
    pub const fn id(&self) -> FrameId {
        self.id
    }

    /// Phase kind.
    pub const fn kind(&self) -> PhaseKind {
        self.descriptor.kind
    }

    /// Capability descriptor.
    pub const fn descriptor(&self) -> &'static PhaseStateDescriptor {
        self.descriptor
    }

    /// Capture buffers.
    pub const fn context(&self) -> &PhaseContext {
        &self.context
    }

    /// Whether the frame was closed and is draining its buffers.
    pub const fn is_unwinding(&self) -> bool {
        self.context.is_closed()
    }
}

/// Owner of the phase stack and the collaborators mutations flow into.
///
/// One tracker drives one simulation thread. It is `Send` so it can move to
/// that thread, but frames are only visible on the thread it is bound to:
/// elsewhere [`PhaseTracker::current_frame`] is `None` and every mutation
/// applies immediately.
pub struct PhaseTracker {
    pub(crate) stack: Vec<PhaseFrame>,
    pub(crate) world: Box<dyn WorldStorage>,
    pub(crate) attribution: Box<dyn AttributionSource>,
    pub(crate) bus: EventBus,
    pub(crate) config: TrackerConfig,
    owner_thread: ThreadId,
    next_frame: u64,
    tick: u64,
    abort_requested: bool,
    dangling: Vec<PhaseError>,
}

impl core::fmt::Debug for PhaseTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhaseTracker")
            .field("depth", &self.stack.len())
            .field("tick", &self.tick)
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PhaseTracker {
    /// Tracker over `world` with default config and no attribution, bound to
    /// the calling thread.
    pub fn new(world: impl WorldStorage + 'static) -> Self {
        Self::with_config(world, TrackerConfig::default())
    }

    /// Tracker over `world` with explicit config.
    pub fn with_config(world: impl WorldStorage + 'static, config: TrackerConfig) -> Self {
        Self {
            stack: Vec::new(),
            world: Box::new(world),
            attribution: Box::new(NoAttribution),
            bus: EventBus::new(),
            config,
            owner_thread: thread::current().id(),
            next_frame: 1,
            tick: 0,
            abort_requested: false,
            dangling: Vec::new(),
        }
    }

    /// Replaces the attribution collaborator.
    #[must_use]
    pub fn with_attribution(mut self, source: impl AttributionSource + 'static) -> Self {
        self.attribution = Box::new(source);
        self
    }

    /// Active configuration.
    pub const fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Read access to world storage.
    pub fn world(&self) -> &dyn WorldStorage {
        &*self.world
    }

    /// Direct storage access, bypassing capture entirely.
    pub fn world_mut(&mut self) -> &mut dyn WorldStorage {
        &mut *self.world
    }

    /// Registers an event listener.
    pub fn subscribe<L>(&mut self, listener: L) -> ListenerId
    where
        L: EventListener + 'static,
    {
        self.bus.subscribe(listener)
    }

    /// Removes an event listener.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Listener registry.
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Ticks completed through [`PhaseTracker::run_tick`].
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Drains the [`PhaseError::DanglingPhase`] reports
    /// [`PhaseTracker::run_tick`] collected at tick boundaries.
    pub fn take_dangling(&mut self) -> Vec<PhaseError> {
        std::mem::take(&mut self.dangling)
    }

    /// Makes the calling thread the simulation thread.
    pub fn bind_to_current_thread(&mut self) {
        self.owner_thread = thread::current().id();
    }

    /// Whether the caller runs on the simulation thread.
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner_thread
    }

    /// Top frame, or `None` between ticks and on foreign threads.
    pub fn current_frame(&self) -> Option<&PhaseFrame> {
        if !self.is_owner_thread() {
            return None;
        }
        self.stack.last()
    }

    /// Kind of the top frame.
    pub fn current_kind(&self) -> Option<PhaseKind> {
        self.current_frame().map(PhaseFrame::kind)
    }

    /// Number of frames on the stack.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Frames from top to bottom.
    pub fn frames(&self) -> impl Iterator<Item = &PhaseFrame> {
        self.stack.iter().rev()
    }

    /// Nearest enclosing owner attribution.
    pub fn get_owner(&self) -> Option<UserId> {
        if !self.is_owner_thread() {
            return None;
        }
        self.frames().find_map(|f| f.context.owner())
    }

    /// Nearest enclosing notifier attribution.
    pub fn get_notifier(&self) -> Option<UserId> {
        if !self.is_owner_thread() {
            return None;
        }
        self.frames().find_map(|f| f.context.notifier())
    }

    /// Pushes a phase of `kind`; attribution is looked up from the source
    /// position when it has one.
    pub fn begin_phase(&mut self, kind: PhaseKind, source: PhaseSource) -> FrameHandle {
        self.begin_attributed(kind, source, Attribution::default())
    }

    /// Pushes a phase with explicit attribution.
    ///
    /// A kind whose descriptor is `already_capturing` merges into an open top
    /// frame of the same kind instead of growing the stack.
    pub fn begin_attributed(
        &mut self,
        kind: PhaseKind,
        source: PhaseSource,
        attribution: Attribution,
    ) -> FrameHandle {
        let descriptor = lookup(kind);
        let depth = self.stack.len();
        if descriptor.already_capturing {
            if let Some(top) = self.stack.last_mut() {
                if top.kind() == kind && !top.context.is_closed() {
                    let reentry = top.context.enter_reentrant();
                    debug!(kind = %kind, reentry, "merged re-entrant phase");
                    return FrameHandle {
                        frame: top.id,
                        depth: depth - 1,
                        reentry,
                    };
                }
            }
        }

        if !self.is_owner_thread() {
            warn!(kind = %kind, "phase begun off the simulation thread; mutations apply immediately");
        }

        let position = source.position();
        let owner = attribution
            .owner
            .or_else(|| position.and_then(|p| self.attribution.owner_of(p)));
        let notifier = attribution
            .notifier
            .or_else(|| position.and_then(|p| self.attribution.notifier_of(p)));
        let mut context = PhaseContext::new(kind, source).with_attribution(owner, notifier);
        if self.config.disabled_capture_kinds.contains(&kind) {
            context.disable_bulk_capture();
        }

        let id = self.alloc_frame_id();
        self.stack.push(PhaseFrame::new(id, context));
        if self.stack.len() > self.config.stack_warning_depth {
            warn!(
                kind = %kind,
                depth = self.stack.len(),
                limit = self.config.stack_warning_depth,
                "phase stack unusually deep"
            );
        }
        debug!(kind = %kind, depth, frame = id.0, "phase pushed");
        FrameHandle {
            frame: id,
            depth,
            reentry: 0,
        }
    }

    /// Closes the frame `handle` refers to.
    ///
    /// The frame must be the top of the stack. It is unwound (or handed to
    /// its parent when it defers) and popped.
    ///
    /// # Errors
    /// [`PhaseError::StackCorruption`] when `handle` is not the top frame.
    /// The stack is repaired before returning; see the variant docs.
    pub fn close(&mut self, handle: FrameHandle) -> Result<UnwindReport, PhaseError> {
        let is_top = self
            .stack
            .last()
            .is_some_and(|top| top.id == handle.frame && top.context.reentry() == handle.reentry);
        if !is_top {
            return Err(self.recover_corruption(handle));
        }
        let idx = self.stack.len() - 1;
        let kind = self.stack[idx].kind();

        if handle.reentry > 0 {
            self.stack[idx].context.leave_reentrant();
            debug!(kind = %kind, reentry = handle.reentry, "closed re-entrant phase");
            let mut report = UnwindReport::new(kind);
            report.merged = true;
            return Ok(report);
        }

        if self.should_defer(idx) {
            if let Some(mut frame) = self.stack.pop() {
                frame.context.close();
                let items = frame.context.pending_items();
                if let Some(parent) = self.stack.last_mut() {
                    parent.context.push_child(frame.context);
                }
                debug!(kind = %kind, items, "phase deferred to parent");
            }
            let mut report = UnwindReport::new(kind);
            report.deferred = true;
            return Ok(report);
        }

        self.stack[idx].context.close();
        let report = self.unwind_top(0);
        self.pop_unwound(handle.frame, idx);
        debug!(
            kind = %kind,
            depth = idx,
            applied = report.total_applied(),
            failed = report.total_failures(),
            "phase closed"
        );
        Ok(report)
    }

    /// Runs `body` inside a phase and closes it on every exit path,
    /// including panics, which are resumed after the close.
    pub fn scoped<R>(
        &mut self,
        kind: PhaseKind,
        source: PhaseSource,
        body: impl FnOnce(&mut Self, FrameHandle) -> R,
    ) -> R {
        let handle = self.begin_phase(kind, source);
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self, handle)));
        if let Err(err) = self.close(handle) {
            debug!(%err, "scoped phase closed with error");
        }
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Pushes a phase and returns a guard that closes it when dropped.
    pub fn enter(&mut self, kind: PhaseKind, source: PhaseSource) -> PhaseGuard<'_> {
        let handle = self.begin_phase(kind, source);
        PhaseGuard {
            tracker: self,
            handle,
            closed: false,
        }
    }

    /// Runs one simulation tick.
    ///
    /// The stack is checked empty before and after `body`. A panic in
    /// `body` or an unrecovered stack corruption fails the tick with a
    /// [`crate::FailureReport`]; the stack is cleared either way so the next
    /// tick starts clean.
    ///
    /// Frames left open at either boundary do not fail the tick; they are
    /// cleared and kept for [`PhaseTracker::take_dangling`].
    ///
    /// # Errors
    /// [`TickError::Panicked`] or [`TickError::Aborted`].
    pub fn run_tick<R>(&mut self, body: impl FnOnce(&mut Self) -> R) -> Result<R, TickError> {
        self.check_boundary();
        self.abort_requested = false;
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self)));
        let tick = self.tick;
        self.tick += 1;
        match result {
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let report = self.failure_report(tick, message);
                error!(tick, message = %report.message, dump = %report.dump, "tick panicked");
                self.discard_stack();
                self.abort_requested = false;
                Err(TickError::Panicked { report })
            }
            Ok(_) if self.abort_requested => {
                let report =
                    self.failure_report(tick, "unrecovered stack corruption".to_owned());
                error!(tick, dump = %report.dump, "tick aborted");
                self.discard_stack();
                self.abort_requested = false;
                Err(TickError::Aborted { report })
            }
            Ok(value) => {
                self.check_boundary();
                Ok(value)
            }
        }
    }

    /// Checks the tick-boundary invariant.
    ///
    /// A no-op on an empty stack. Otherwise logs a warning naming the
    /// offending frames, clears the stack and reports what was discarded.
    ///
    /// # Errors
    /// [`PhaseError::DanglingPhase`] when frames were still open.
    pub fn ensure_empty(&mut self) -> Result<(), PhaseError> {
        if self.stack.is_empty() {
            return Ok(());
        }
        let frames = self.stack.len();
        let sources: Vec<String> = self
            .frames()
            .map(|f| format!("{} {}", f.kind(), f.context.source()))
            .collect();
        if self.config.verbose {
            warn!(frames, ?sources, dump = %self.diagnostics_dump(), "dangling phase at tick boundary");
        } else {
            warn!(frames, ?sources, "dangling phase at tick boundary");
        }
        let discarded = self.discard_stack();
        Err(PhaseError::DanglingPhase {
            frames,
            sources,
            discarded,
        })
    }

    /// Captured spawn cause default for the current phase.
    pub fn default_spawn_type(&self) -> SpawnType {
        self.current_frame()
            .map_or(SpawnType::Placement, |f| f.descriptor.default_spawn_type)
    }

    pub(crate) fn alloc_frame_id(&mut self) -> FrameId {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        id
    }

    pub(crate) fn handle_of(&self, idx: usize) -> Option<FrameHandle> {
        self.stack.get(idx).map(|f| FrameHandle {
            frame: f.id,
            depth: idx,
            reentry: f.context.reentry(),
        })
    }

    pub(crate) fn position_of(&self, frame: FrameId) -> Option<usize> {
        self.stack.iter().rposition(|f| f.id == frame)
    }

    /// Cause chain for events fired now.
    pub(crate) fn cause(&self) -> Cause {
        if !self.is_owner_thread() {
            return Cause::default();
        }
        Cause {
            frames: self
                .frames()
                .map(|f| CauseFrame {
                    kind: f.kind(),
                    source: f.context.source().clone(),
                })
                .collect(),
            owner: self.get_owner(),
            notifier: self.get_notifier(),
        }
    }

    /// Delivers `event` to every listener not already running.
    ///
    /// A panicking listener is put back before the panic continues.
    pub(crate) fn fire(&mut self, event: &mut PhaseEvent) {
        for id in self.bus.begin_dispatch() {
            let Some(mut listener) = self.bus.check_out(id) else {
                continue;
            };
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event, &mut *self)));
            self.bus.check_in(id, listener);
            if let Err(payload) = outcome {
                panic::resume_unwind(payload);
            }
        }
    }

    /// Drops frames above `len`, warning about each one. Used to restore
    /// the stack after an unwind item left phases open.
    pub(crate) fn truncate_stack(&mut self, len: usize) {
        while self.stack.len() > len {
            if let Some(frame) = self.stack.pop() {
                warn!(
                    kind = %frame.kind(),
                    source = %frame.context.source(),
                    discarded = frame.context.pending_items(),
                    "discarded phase left open during unwind"
                );
            }
        }
    }

    fn check_boundary(&mut self) {
        if let Err(err) = self.ensure_empty() {
            self.dangling.push(err);
        }
    }

    fn should_defer(&self, idx: usize) -> bool {
        let Some(parent_idx) = idx.checked_sub(1) else {
            return false;
        };
        let frame = &self.stack[idx];
        let parent = &self.stack[parent_idx];
        parent.kind() != frame.kind()
            && (frame.descriptor.defers_to_parent || parent.context.is_closed())
    }

    fn pop_unwound(&mut self, frame: FrameId, idx: usize) {
        match self.stack.get(idx) {
            Some(f) if f.id == frame => {
                self.truncate_stack(idx + 1);
                self.stack.pop();
            }
            _ => {
                error!(frame = frame.0, "unwound frame vanished from the stack");
                self.abort_requested = true;
            }
        }
    }

    fn recover_corruption(&mut self, handle: FrameHandle) -> PhaseError {
        let dump = self.diagnostics_dump();
        let top = self.stack.len().checked_sub(1).and_then(|i| self.handle_of(i));
        let recovered = if let Some(idx) = self.position_of(handle.frame) {
            let popped = self.stack.split_off(idx);
            let discarded: usize = popped.iter().map(|f| f.context.pending_items()).sum();
            warn!(frames = popped.len(), discarded, "force-popped frames after stack corruption");
            true
        } else {
            self.abort_requested = true;
            false
        };
        if self.config.verbose {
            error!(%handle, ?top, recovered, %dump, "stack corruption");
        } else {
            error!(%handle, ?top, recovered, "stack corruption");
        }
        PhaseError::StackCorruption {
            handle,
            top,
            recovered,
            dump,
        }
    }

    fn discard_stack(&mut self) -> usize {
        let discarded = self.stack.iter().map(|f| f.context.pending_items()).sum();
        self.stack.clear();
        discarded
    }
}

/// Scope guard returned by [`PhaseTracker::enter`].
///
/// Dereferences to the tracker so mutations can be proposed through it.
/// Dropping the guard closes the phase; [`PhaseGuard::finish`] closes it
/// and returns the report.
#[derive(Debug)]
pub struct PhaseGuard<'a> {
    tracker: &'a mut PhaseTracker,
    handle: FrameHandle,
    closed: bool,
}

impl PhaseGuard<'_> {
    /// Handle of the guarded frame.
    pub const fn handle(&self) -> FrameHandle {
        self.handle
    }

    /// Closes the phase now.
    ///
    /// # Errors
    /// See [`PhaseTracker::close`].
    pub fn finish(mut self) -> Result<UnwindReport, PhaseError> {
        self.closed = true;
        self.tracker.close(self.handle)
    }
}

impl core::ops::Deref for PhaseGuard<'_> {
    type Target = PhaseTracker;

    fn deref(&self) -> &PhaseTracker {
        self.tracker
    }
}

impl core::ops::DerefMut for PhaseGuard<'_> {
    fn deref_mut(&mut self) -> &mut PhaseTracker {
        self.tracker
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(err) = self.tracker.close(self.handle) {
                debug!(%err, "guarded phase closed with error");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ident::BlockPos;
    use crate::world::grid::GridWorld;

    fn tracker() -> PhaseTracker {
        PhaseTracker::new(GridWorld::default())
    }

    #[test]
    fn push_and_close_restore_depth() {
        let mut t = tracker();
        let a = t.begin_phase(PhaseKind::EntityTick, PhaseSource::World);
        let b = t.begin_phase(PhaseKind::Explosion, PhaseSource::World);
        assert_eq!(t.depth(), 2);
        assert_eq!(t.current_kind(), Some(PhaseKind::Explosion));
        assert!(t.close(b).is_ok());
        assert!(t.close(a).is_ok());
        assert_eq!(t.depth(), 0);
        assert_eq!(t.current_kind(), None);
    }

    #[test]
    fn same_kind_block_ticks_merge() {
        let mut t = tracker();
        let outer = t.begin_phase(PhaseKind::BlockTick, PhaseSource::None);
        let inner = t.begin_phase(PhaseKind::BlockTick, PhaseSource::None);
        assert_eq!(t.depth(), 1);
        assert_eq!(inner.frame(), outer.frame());
        assert_eq!(inner.reentry(), 1);
        let report = t.close(inner).unwrap();
        assert!(report.merged);
        assert_eq!(t.depth(), 1);
        t.close(outer).unwrap();
        assert_eq!(t.depth(), 0);
    }

    #[test]
    fn closing_a_lower_frame_force_pops() {
        let mut t = tracker();
        let a = t.begin_phase(PhaseKind::Command, PhaseSource::None);
        let _b = t.begin_phase(PhaseKind::EntityTick, PhaseSource::None);
        let err = t.close(a).unwrap_err();
        match err {
            PhaseError::StackCorruption { recovered, dump, .. } => {
                assert!(recovered);
                assert!(dump.contains("entity_tick"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(t.depth(), 0);
    }

    #[test]
    fn ensure_empty_is_silent_when_empty() {
        let mut t = tracker();
        assert!(t.ensure_empty().is_ok());
        t.begin_phase(PhaseKind::Command, PhaseSource::Block(BlockPos::new(0, 1, 0)));
        let err = t.ensure_empty().unwrap_err();
        assert!(matches!(err, PhaseError::DanglingPhase { frames: 1, .. }));
        assert!(t.ensure_empty().is_ok());
    }

    #[test]
    fn frame_handle_display_marks_reentry() {
        let h = FrameHandle {
            frame: FrameId(7),
            depth: 2,
            reentry: 1,
        };
        assert_eq!(h.to_string(), "frame#7@2+1");
    }

    #[test]
    fn listener_is_not_handed_its_own_nested_events() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use crate::event::EventPayload;
        use crate::record::{BlockState, ChangeFlags};

        let mut t = tracker();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        t.subscribe(move |event: &mut PhaseEvent, tracker: &mut PhaseTracker| {
            seen.fetch_add(1, Ordering::Relaxed);
            if let EventPayload::ChangeBlockPost(tx) = event.payload() {
                if tx.pos == BlockPos::new(0, 1, 0) {
                    tracker.propose_block_change(
                        BlockPos::new(1, 1, 0),
                        BlockState(2),
                        ChangeFlags::NONE,
                    );
                }
            }
        });
        t.propose_block_change(BlockPos::new(0, 1, 0), BlockState(1), ChangeFlags::NONE);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(t.world().read_block(BlockPos::new(1, 1, 0)), BlockState(2));
        assert_eq!(t.bus().fired(), 4);
    }

    #[test]
    fn tracker_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<PhaseTracker>();
    }
}
