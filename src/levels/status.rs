//! Claimed key ranges of in-flight compactions.
//!
//! Before a compaction runs, its planned top and bottom ranges are claimed
//! here under one lock. `compare_and_add` is the only admission point, so two
//! compactions can never touch overlapping ranges at the same pair of levels.
//! Critical sections are short: claims are ranges and sizes, never table
//! handles or I/O.

use std::fmt;
use std::sync::RwLock;

use crate::format::Key;
use crate::table::Table;

use super::plan::CompactDef;

/// An inclusive key range, or the `inf` sentinel covering the whole keyspace.
///
/// Ranges built from tables widen their endpoints over all versions of the
/// boundary user keys, so overlap checks cannot miss a range that shares only
/// a boundary user key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub left: Key,
    pub right: Key,
    pub inf: bool,
}

impl KeyRange {
    pub fn infinite() -> Self {
        Self {
            inf: true,
            ..Default::default()
        }
    }

    /// Smallest range covering every table in `tables`; `None` when empty.
    pub fn from_tables(tables: &[Table]) -> Option<Self> {
        let mut iter = tables.iter();
        let first = iter.next()?;
        let mut smallest = first.smallest().clone();
        let mut biggest = first.biggest().clone();
        for t in iter {
            if *t.smallest() < smallest {
                smallest = t.smallest().clone();
            }
            if *t.biggest() > biggest {
                biggest = t.biggest().clone();
            }
        }
        Some(Self {
            left: smallest.min_version(),
            right: biggest.max_version(),
            inf: false,
        })
    }

    pub fn is_empty(&self) -> bool {
        !self.inf && self.left.is_empty() && self.right.is_empty()
    }

    pub fn overlaps_with(&self, other: &KeyRange) -> bool {
        if self.inf || other.inf {
            return true;
        }
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.left <= other.right && other.left <= self.right
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inf {
            write!(f, "[inf]")
        } else {
            write!(f, "[{:?}, {:?}]", self.left, self.right)
        }
    }
}

#[derive(Default)]
struct LevelCompactStatus {
    ranges: Vec<KeyRange>,
    /// Total size of top tables being moved away from this level by running
    /// compactions; the picker subtracts it from the level size.
    delta_size: i64,
}

impl LevelCompactStatus {
    fn overlaps_with(&self, kr: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps_with(kr))
    }

    fn remove(&mut self, kr: &KeyRange) -> bool {
        match self.ranges.iter().position(|r| r == kr) {
            Some(idx) => {
                self.ranges.remove(idx);
                true
            }
            None => false,
        }
    }

    fn debug(&self) -> String {
        self.ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct CompactStatus {
    levels: RwLock<Vec<LevelCompactStatus>>,
}

impl CompactStatus {
    pub fn new(max_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(max_levels);
        levels.resize_with(max_levels, LevelCompactStatus::default);
        Self {
            levels: RwLock::new(levels),
        }
    }

    pub fn overlaps_with(&self, level: usize, kr: &KeyRange) -> bool {
        self.levels.read().unwrap()[level].overlaps_with(kr)
    }

    pub fn delta_size(&self, level: usize) -> i64 {
        self.levels.read().unwrap()[level].delta_size
    }

    /// Atomically claim `cd`'s ranges. Fails without side effects when either
    /// range conflicts with a claim already held at its level.
    pub fn compare_and_add(&self, cd: &CompactDef) -> bool {
        let mut levels = self.levels.write().unwrap();

        if levels[cd.this_level].overlaps_with(&cd.this_range) {
            return false;
        }
        if levels[cd.next_level].overlaps_with(&cd.next_range) {
            return false;
        }

        levels[cd.this_level].ranges.push(cd.this_range.clone());
        levels[cd.next_level].ranges.push(cd.next_range.clone());
        levels[cd.this_level].delta_size += cd.top_size;
        true
    }

    /// Release the ranges claimed for `cd`.
    pub fn delete(&self, cd: &CompactDef) {
        let mut levels = self.levels.write().unwrap();

        levels[cd.this_level].delta_size -= cd.top_size;
        let found_this = levels[cd.this_level].remove(&cd.this_range);
        let found_next = levels[cd.next_level].remove(&cd.next_range);
        if !found_this || !found_next {
            tracing::error!(
                this_level = cd.this_level,
                next_level = cd.next_level,
                "removing a compaction range that was never claimed"
            );
            debug_assert!(found_this && found_next);
        }
    }

    /// Claimed ranges of one level, for stall diagnostics.
    pub fn debug_level(&self, level: usize) -> String {
        self.levels.read().unwrap()[level].debug()
    }
}
