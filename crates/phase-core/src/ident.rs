// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Positions, directions and identifiers shared by every tracker component.

use serde::{Deserialize, Serialize};

/// Integer block coordinate in world space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockPos {
    /// East/west axis.
    pub x: i32,
    /// Vertical axis.
    pub y: i32,
    /// North/south axis.
    pub z: i32,
}

impl BlockPos {
    /// Constructs a position from its three coordinates.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the adjacent position one step in `direction`.
    ///
    /// Coordinates wrap on overflow; storage rejects such positions through
    /// its bounds check.
    #[must_use]
    pub const fn offset(self, direction: Direction) -> Self {
        let (dx, dy, dz) = direction.delta();
        Self {
            x: self.x.wrapping_add(dx),
            y: self.y.wrapping_add(dy),
            z: self.z.wrapping_add(dz),
        }
    }
}

impl core::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One of the six axis-aligned neighbor directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Negative x.
    West,
    /// Positive x.
    East,
    /// Negative y.
    Down,
    /// Positive y.
    Up,
    /// Negative z.
    North,
    /// Positive z.
    South,
}

/// Order in which neighbor notifications are delivered.
///
/// Listeners and block behaviors observe notifications in exactly this order;
/// changing it is a compatibility break.
pub const NOTIFY_ORDER: [Direction; 6] = [
    Direction::West,
    Direction::East,
    Direction::Down,
    Direction::Up,
    Direction::North,
    Direction::South,
];

impl Direction {
    /// Unit offset `(dx, dy, dz)` for this direction.
    #[must_use]
    pub const fn delta(self) -> (i32, i32, i32) {
        match self {
            Self::West => (-1, 0, 0),
            Self::East => (1, 0, 0),
            Self::Down => (0, -1, 0),
            Self::Up => (0, 1, 0),
            Self::North => (0, 0, -1),
            Self::South => (0, 0, 1),
        }
    }

    /// The direction pointing the other way.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::West => Self::East,
            Self::East => Self::West,
            Self::Down => Self::Up,
            Self::Up => Self::Down,
            Self::North => Self::South,
            Self::South => Self::North,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::West => 1,
            Self::East => 1 << 1,
            Self::Down => 1 << 2,
            Self::Up => 1 << 3,
            Self::North => 1 << 4,
            Self::South => 1 << 5,
        }
    }
}

/// Compact set of directions. Iteration always follows [`NOTIFY_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DirectionSet(u8);

impl DirectionSet {
    /// No directions.
    pub const EMPTY: Self = Self(0);
    /// All six directions.
    pub const ALL: Self = Self(0b0011_1111);

    /// Returns a set holding exactly `direction`.
    #[must_use]
    pub const fn only(direction: Direction) -> Self {
        Self(direction.bit())
    }

    /// Returns a copy of the set with `direction` added.
    #[must_use]
    pub const fn with(self, direction: Direction) -> Self {
        Self(self.0 | direction.bit())
    }

    /// Returns a copy of the set with `direction` removed.
    #[must_use]
    pub const fn without(self, direction: Direction) -> Self {
        Self(self.0 & !direction.bit())
    }

    /// Adds `direction` in place.
    pub fn insert(&mut self, direction: Direction) {
        self.0 |= direction.bit();
    }

    /// Removes `direction` in place; returns whether it was present.
    pub fn remove(&mut self, direction: Direction) -> bool {
        let present = self.contains(direction);
        self.0 &= !direction.bit();
        present
    }

    /// Whether `direction` is a member.
    #[must_use]
    pub const fn contains(self, direction: Direction) -> bool {
        self.0 & direction.bit() != 0
    }

    /// Number of members.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set has no members.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in notification order.
    pub fn iter(self) -> impl Iterator<Item = Direction> {
        NOTIFY_ORDER.into_iter().filter(move |d| self.contains(*d))
    }
}

impl FromIterator<Direction> for DirectionSet {
    fn from_iter<I: IntoIterator<Item = Direction>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// Identifier of a live entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityId(pub u64);

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Identifier of a user that owns or triggered a change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UserId(pub u64);

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_follows_direction_delta() {
        let origin = BlockPos::new(0, 64, 0);
        assert_eq!(origin.offset(Direction::Up), BlockPos::new(0, 65, 0));
        assert_eq!(origin.offset(Direction::West), BlockPos::new(-1, 64, 0));
        assert_eq!(origin.offset(Direction::South), BlockPos::new(0, 64, 1));
    }

    #[test]
    fn opposite_is_an_involution() {
        for d in NOTIFY_ORDER {
            assert_eq!(d.opposite().opposite(), d);
            assert_ne!(d.opposite(), d);
        }
    }

    #[test]
    fn direction_set_iterates_in_notify_order() {
        let set: DirectionSet = [Direction::South, Direction::West, Direction::Up]
            .into_iter()
            .collect();
        let order: Vec<_> = set.iter().collect();
        assert_eq!(order, vec![Direction::West, Direction::Up, Direction::South]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn all_contains_every_direction_once() {
        assert_eq!(DirectionSet::ALL.len(), 6);
        let order: Vec<_> = DirectionSet::ALL.iter().collect();
        assert_eq!(order, NOTIFY_ORDER.to_vec());
    }

    #[test]
    fn remove_reports_membership() {
        let mut set = DirectionSet::ALL;
        assert!(set.remove(Direction::Down));
        assert!(!set.remove(Direction::Down));
        assert!(!set.contains(Direction::Down));
        assert_eq!(set.len(), 5);
        assert!(DirectionSet::EMPTY.is_empty());
    }
}
