//! Compaction planning: scoring levels and choosing table sets.
//!
//! A plan ([`CompactDef`]) names a contiguous run of `top` tables at the
//! source level and the `bot` tables they overlap at the next level. For
//! non-zero source levels the seed is the single table with the best
//! `top_size / bot_size` ratio, then the run is grown left and right while
//! the ratio keeps improving and the total stays under the expansion cap.
//! Overlapping next-level tables that no top table actually intersects, and
//! that are at least `min_skipped_table_size`, are left in place to save
//! write amplification.

use std::fmt;

use crate::table::Table;

use super::controller::Core;
use super::handler::LevelHandler;
use super::status::KeyRange;
use crate::error::Result;
use crate::format::Key;

/// A level eligible for compaction and how urgent it is.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPriority {
    pub level: usize,
    pub score: f64,
}

/// One planned compaction from `this_level` into `next_level`.
pub struct CompactDef {
    pub this_level: usize,
    pub next_level: usize,

    pub top: Vec<Table>,
    pub bot: Vec<Table>,
    /// Next-level tables inside the overlap window that no top table
    /// actually intersects; left in place, but they fence output files.
    pub skipped: Vec<Table>,

    pub this_range: KeyRange,
    pub next_range: KeyRange,

    pub top_size: i64,
    pub top_left_idx: usize,
    pub top_right_idx: usize,
    pub bot_size: i64,
    pub bot_left_idx: usize,
    pub bot_right_idx: usize,
}

impl CompactDef {
    pub fn new(this_level: usize, next_level: usize) -> Self {
        Self {
            this_level,
            next_level,
            top: Vec::new(),
            bot: Vec::new(),
            skipped: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            top_size: 0,
            top_left_idx: 0,
            top_right_idx: 0,
            bot_size: 0,
            bot_left_idx: 0,
            bot_right_idx: 0,
        }
    }

    /// Smallest key across the top and bottom ranges.
    pub fn smallest(&self) -> Key {
        if !self.bot.is_empty() && self.next_range.left < self.this_range.left {
            self.next_range.left.clone()
        } else {
            self.this_range.left.clone()
        }
    }

    /// Biggest key across the top and bottom ranges.
    pub fn biggest(&self) -> Key {
        if !self.bot.is_empty() && self.next_range.right > self.this_range.right {
            self.next_range.right.clone()
        } else {
            self.this_range.right.clone()
        }
    }

    pub fn mark_tables_compacting(&self, v: bool) {
        for t in self.top.iter().chain(&self.bot).chain(&self.skipped) {
            t.mark_compacting(v);
        }
    }
}

impl fmt::Display for CompactDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} top:[{}:{}]({}), bot:[{}:{}]({}), skip:{}, write_amp:{:.2}",
            self.this_level,
            self.top_left_idx,
            self.top_right_idx,
            self.top_size,
            self.bot_left_idx,
            self.bot_right_idx,
            self.bot_size,
            self.skipped.len(),
            (self.top_size + self.bot_size) as f64 / self.top_size.max(1) as f64,
        )
    }
}

fn sum_table_size(tables: &[Table]) -> i64 {
    tables.iter().map(|t| t.size()).sum()
}

fn calc_ratio(top_size: i64, bot_size: i64) -> f64 {
    if bot_size == 0 {
        return top_size as f64;
    }
    top_size as f64 / bot_size as f64
}

/// `[left, right)` window of `tables` (sorted, disjoint) whose ranges
/// intersect `[smallest, biggest]`, version-widened on both ends.
fn tables_in_range(tables: &[Table], smallest: &Key, biggest: &Key) -> (usize, usize) {
    let lo = smallest.min_version();
    let hi = biggest.max_version();
    let left = tables.partition_point(|t| *t.biggest() < lo);
    let right = tables.partition_point(|t| *t.smallest() <= hi);
    (left, right.max(left))
}

impl Core {
    /// Whether L0 has enough tables to compact, ignoring running compactions.
    pub(crate) fn is_l0_compactable(&self) -> bool {
        self.levels[0].num_tables() >= self.opts.num_level_zero_tables
    }

    /// Compute per-level compaction priorities, level-ascending.
    ///
    /// The same criteria gate the stall loop in `add_level_0_table`, which is
    /// what guarantees forward progress for stalled writers.
    pub(crate) fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        let mut prios = Vec::new();

        // L0 is scored by table count, and only if the whole-keyspace claim
        // is free.
        if !self.cstatus.overlaps_with(0, &KeyRange::infinite()) && self.is_l0_compactable() {
            prios.push(CompactionPriority {
                level: 0,
                score: self.levels[0].num_tables() as f64
                    / self.opts.num_level_zero_tables as f64,
            });
        }

        for (level, handler) in self.levels.iter().enumerate().skip(1) {
            // Treat bytes claimed by running compactions as already gone.
            let delta_size = self.cstatus.delta_size(level);
            if handler.is_compactable(delta_size) {
                prios.push(CompactionPriority {
                    level,
                    score: (handler.total_size() - delta_size) as f64
                        / handler.max_total_size as f64,
                });
            }
        }
        prios
    }

    fn is_compacting(&self, level: usize, tables: &[Table]) -> bool {
        if tables.is_empty() {
            return false;
        }
        let kr = KeyRange {
            left: tables[0].smallest().min_version(),
            right: tables[tables.len() - 1].biggest().max_version(),
            inf: false,
        };
        self.cstatus.overlaps_with(level, &kr)
    }

    /// Plan an L0 compaction: every L0 table becomes `top`, claiming the
    /// whole keyspace; `bot` is L1's overlap window.
    pub(crate) fn fill_tables_l0(&self, cd: &mut CompactDef) -> Result<bool> {
        let this = self.levels[cd.this_level].read();
        let next = self.levels[cd.next_level].read();

        if this.tables.is_empty() {
            return Ok(false);
        }

        cd.top = this.tables.clone();
        cd.top_size = sum_table_size(&cd.top);
        cd.top_right_idx = cd.top.len();
        cd.this_range = KeyRange::infinite();

        let kr = KeyRange::from_tables(&cd.top).expect("top is non-empty");
        let (left, right) = LevelHandler::overlapping_tables(&next, &kr);
        cd.bot_left_idx = left;
        cd.bot_right_idx = right;
        let overlapping = &next.tables[left..right];
        self.fill_bottom_tables(cd, overlapping)?;
        cd.bot_size = sum_table_size(&cd.bot);

        cd.next_range = if overlapping.is_empty() {
            // Bottom-most occupied span: claim the top range itself.
            kr
        } else {
            KeyRange::from_tables(overlapping).expect("overlapping is non-empty")
        };

        Ok(self.cstatus.compare_and_add(cd))
    }

    /// Plan a compaction from a non-zero level: seed with the best-ratio
    /// table, expand while the ratio improves, then split the overlap window
    /// into rewritten and skipped tables.
    pub(crate) fn fill_tables(&self, cd: &mut CompactDef) -> Result<bool> {
        let this_guard = self.levels[cd.this_level].read();
        let next_guard = self.levels[cd.next_level].read();

        if this_guard.tables.is_empty() {
            return Ok(false);
        }
        let this = this_guard.tables.clone();
        let next = next_guard.tables.clone();

        // Seed: the single top table with the highest top/bot size ratio
        // whose ranges are not already claimed.
        let mut candidate_ratio = 0.0f64;
        for (i, t) in this.iter().enumerate() {
            if self.is_compacting(cd.this_level, std::slice::from_ref(t)) {
                continue;
            }
            let (left, right) = tables_in_range(&next, t.smallest(), t.biggest());
            if self.is_compacting(cd.next_level, &next[left..right]) {
                continue;
            }
            let bot_size = sum_table_size(&next[left..right]);
            let ratio = calc_ratio(t.size(), bot_size);
            if ratio > candidate_ratio {
                candidate_ratio = ratio;
                cd.top_left_idx = i;
                cd.top_right_idx = i + 1;
                cd.top = vec![t.clone()];
                cd.top_size = t.size();
                cd.bot_left_idx = left;
                cd.bot_right_idx = right;
                cd.bot_size = bot_size;
            }
        }
        if cd.top.is_empty() {
            return Ok(false);
        }

        // Expand left while the ratio strictly improves and the plan stays
        // under the expansion cap.
        for i in (0..cd.top_left_idx).rev() {
            let t = &this[i];
            if self.is_compacting(cd.this_level, std::slice::from_ref(t)) {
                break;
            }
            let (left, right) = tables_in_range(&next, t.smallest(), t.biggest());
            if right < cd.bot_left_idx {
                // A bottom table would be skipped over; compact it in
                // another run.
                break;
            }
            if self.is_compacting(cd.next_level, &next[left..cd.bot_left_idx]) {
                break;
            }
            let new_top_size = t.size() + cd.top_size;
            let new_bot_size = sum_table_size(&next[left..cd.bot_left_idx]) + cd.bot_size;
            let new_ratio = calc_ratio(new_top_size, new_bot_size);
            if new_ratio > candidate_ratio
                && (new_top_size + new_bot_size) < self.opts.max_compaction_expand_size
            {
                cd.top.insert(0, t.clone());
                cd.top_left_idx = i;
                cd.bot_left_idx = left;
                cd.top_size = new_top_size;
                cd.bot_size = new_bot_size;
            } else {
                break;
            }
        }

        // Expand right, symmetrically.
        for i in cd.top_right_idx..this.len() {
            let t = &this[i];
            if self.is_compacting(cd.this_level, std::slice::from_ref(t)) {
                break;
            }
            let (left, right) = tables_in_range(&next, t.smallest(), t.biggest());
            if left > cd.bot_right_idx {
                break;
            }
            let right = right.max(cd.bot_right_idx);
            if self.is_compacting(cd.next_level, &next[cd.bot_right_idx..right]) {
                break;
            }
            let new_top_size = t.size() + cd.top_size;
            let new_bot_size = sum_table_size(&next[cd.bot_right_idx..right]) + cd.bot_size;
            let new_ratio = calc_ratio(new_top_size, new_bot_size);
            if new_ratio > candidate_ratio
                && (new_top_size + new_bot_size) < self.opts.max_compaction_expand_size
            {
                cd.top.push(t.clone());
                cd.top_right_idx = i + 1;
                cd.bot_right_idx = right;
                cd.top_size = new_top_size;
                cd.bot_size = new_bot_size;
            } else {
                break;
            }
        }

        cd.this_range = KeyRange {
            left: cd.top[0].smallest().min_version(),
            right: cd.top[cd.top.len() - 1].biggest().max_version(),
            inf: false,
        };
        let bots = &next[cd.bot_left_idx..cd.bot_right_idx];
        cd.next_range = if bots.is_empty() {
            cd.this_range.clone()
        } else {
            KeyRange::from_tables(bots).expect("bots is non-empty")
        };

        self.fill_bottom_tables(cd, bots)?;
        for t in &cd.skipped {
            cd.bot_size -= t.size();
        }

        Ok(self.cstatus.compare_and_add(cd))
    }

    /// Partition the overlap window into `bot` (rewritten) and `skipped`
    /// (left in place).
    fn fill_bottom_tables(&self, cd: &mut CompactDef, overlapping: &[Table]) -> Result<()> {
        for t in overlapping {
            let mut intersects = false;
            for top in &cd.top {
                if top.has_overlap(t.smallest(), t.biggest(), true)? {
                    intersects = true;
                    break;
                }
            }
            if intersects {
                // Key collision: the table must be rewritten.
                cd.bot.push(t.clone());
            } else if t.size() >= self.opts.min_skipped_table_size {
                cd.skipped.push(t.clone());
            } else {
                // Small tables are folded in anyway, or the level's table
                // count would grow without bound.
                cd.bot.push(t.clone());
            }
        }
        Ok(())
    }
}
