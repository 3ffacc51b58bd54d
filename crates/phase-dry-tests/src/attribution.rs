// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fixed attribution table that records every applied change.

use std::sync::{Arc, Mutex, PoisonError};

use phase_core::{AttributionSource, BlockPos, UserId};
use rustc_hash::FxHashMap;

/// A change reported through [`AttributionSource::record_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributedChange {
    /// Changed position.
    pub pos: BlockPos,
    /// Owner carried by the change.
    pub owner: Option<UserId>,
    /// Notifier carried by the change.
    pub notifier: Option<UserId>,
}

/// [`AttributionSource`] answering from fixed per-position tables.
///
/// Clones share the change log.
#[derive(Debug, Clone, Default)]
pub struct StaticAttribution {
    owners: FxHashMap<BlockPos, UserId>,
    notifiers: FxHashMap<BlockPos, UserId>,
    changes: Arc<Mutex<Vec<AttributedChange>>>,
}

impl StaticAttribution {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes `pos` to owner `user`.
    pub fn with_owner(mut self, pos: BlockPos, user: UserId) -> Self {
        self.owners.insert(pos, user);
        self
    }

    /// Attributes `pos` to notifier `user`.
    pub fn with_notifier(mut self, pos: BlockPos, user: UserId) -> Self {
        self.notifiers.insert(pos, user);
        self
    }

    /// Changes recorded so far, oldest first.
    pub fn changes(&self) -> Vec<AttributedChange> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AttributionSource for StaticAttribution {
    fn owner_of(&self, pos: BlockPos) -> Option<UserId> {
        self.owners.get(&pos).copied()
    }

    fn notifier_of(&self, pos: BlockPos) -> Option<UserId> {
        self.notifiers.get(&pos).copied()
    }

    fn record_change(&mut self, pos: BlockPos, owner: Option<UserId>, notifier: Option<UserId>) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AttributedChange {
                pos,
                owner,
                notifier,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_answer_from_tables() {
        let p = BlockPos::new(0, 64, 0);
        let source = StaticAttribution::new()
            .with_owner(p, UserId(1))
            .with_notifier(p, UserId(2));
        assert_eq!(source.owner_of(p), Some(UserId(1)));
        assert_eq!(source.notifier_of(p), Some(UserId(2)));
        assert_eq!(source.owner_of(BlockPos::new(1, 64, 0)), None);
    }

    #[test]
    fn clones_share_change_log() {
        let source = StaticAttribution::new();
        let mut handle = source.clone();
        handle.record_change(BlockPos::new(0, 1, 0), Some(UserId(3)), None);
        assert_eq!(source.changes().len(), 1);
        assert_eq!(source.changes()[0].owner, Some(UserId(3)));
    }
}
