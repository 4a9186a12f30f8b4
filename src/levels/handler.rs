//! Per-level table set.
//!
//! A handler owns one level's sorted tables behind a reader-writer lock.
//! Mutations (`init_tables`, `try_add_l0_table`, `replace_tables`,
//! `delete_tables`) take the lock exclusively; reads take it shared and work
//! on a cloned snapshot of the table handles, so no lock is held across I/O.
//! Tables dropped from a level are released through the caller's epoch guard.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::epoch;
use crate::error::Result;
use crate::format::{Key, ValueStruct};
use crate::table::iterator::{ConcatIterator, KvIterator};
use crate::table::Table;

use super::plan::CompactDef;
use super::status::KeyRange;

pub struct LevelHandler {
    pub(crate) level: usize,
    /// Size target for this level; 0 for L0, which is counted in tables.
    pub(crate) max_total_size: i64,
    num_level_zero_tables_stall: usize,
    pub(crate) state: RwLock<LevelState>,
}

pub(crate) struct LevelState {
    /// L0: sorted by table id ascending (flush order). L1+: sorted by
    /// smallest key, ranges pairwise disjoint.
    pub(crate) tables: Vec<Table>,
    pub(crate) total_size: i64,
}

impl LevelHandler {
    pub(crate) fn new(level: usize, max_total_size: i64, num_level_zero_tables_stall: usize) -> Self {
        Self {
            level,
            max_total_size,
            num_level_zero_tables_stall,
            state: RwLock::new(LevelState {
                tables: Vec::new(),
                total_size: 0,
            }),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, LevelState> {
        self.state.read().unwrap()
    }

    fn write(&self) -> RwLockWriteGuard<'_, LevelState> {
        self.state.write().unwrap()
    }

    /// Replace the level's contents, typically at open.
    pub(crate) fn init_tables(&self, tables: Vec<Table>) {
        let mut state = self.write();
        state.total_size = tables.iter().map(|t| t.size()).sum();
        state.tables = tables;
        if self.level == 0 {
            state.tables.sort_by_key(|t| t.id());
        } else {
            state.tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));
        }
    }

    pub(crate) fn num_tables(&self) -> usize {
        self.read().tables.len()
    }

    pub(crate) fn total_size(&self) -> i64 {
        self.read().total_size
    }

    /// Whether this non-zero level exceeds its target, treating `delta_size`
    /// (bytes already claimed by in-flight compactions) as removed.
    pub(crate) fn is_compactable(&self, delta_size: i64) -> bool {
        self.total_size() >= self.max_total_size + delta_size
    }

    /// Append a freshly flushed table to L0. Refusal (at the stall limit) is
    /// not an error; it is the backpressure signal for foreground writers.
    pub(crate) fn try_add_l0_table(&self, t: Table) -> bool {
        debug_assert_eq!(self.level, 0);
        let mut state = self.write();
        if state.tables.len() >= self.num_level_zero_tables_stall {
            return false;
        }
        state.total_size += t.size();
        state.tables.push(t);
        true
    }

    /// Install compaction output: drop the tables in `cd.bot` and insert
    /// `new_tables` in sorted position. Dropped tables are marked for file
    /// removal and released through `guard` once no reader can hold them.
    pub(crate) fn replace_tables(
        &self,
        new_tables: &[Table],
        cd: &CompactDef,
        guard: &epoch::Guard,
    ) {
        let mut state = self.write();

        let del_ids: std::collections::HashSet<u64> = cd.bot.iter().map(|t| t.id()).collect();
        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(state.tables.len() + new_tables.len());
        for t in state.tables.drain(..) {
            if del_ids.contains(&t.id()) {
                dropped.push(t);
            } else {
                kept.push(t);
            }
        }
        kept.extend(new_tables.iter().cloned());
        kept.sort_by(|a, b| a.smallest().cmp(b.smallest()));

        state.total_size += new_tables.iter().map(|t| t.size()).sum::<i64>();
        state.total_size -= dropped.iter().map(|t| t.size()).sum::<i64>();
        state.tables = kept;

        for t in &dropped {
            t.delete();
        }
        guard.delete(dropped);
    }

    /// Remove `top` from this level. With `move_only` the tables were
    /// promoted to the next level: they are de-referenced here but their
    /// files must stay.
    pub(crate) fn delete_tables(&self, top: &[Table], guard: &epoch::Guard, move_only: bool) {
        let mut state = self.write();

        let del_ids: std::collections::HashSet<u64> = top.iter().map(|t| t.id()).collect();
        let mut dropped = Vec::new();
        state.tables.retain(|t| {
            if del_ids.contains(&t.id()) {
                dropped.push(t.clone());
                false
            } else {
                true
            }
        });
        state.total_size -= dropped.iter().map(|t| t.size()).sum::<i64>();

        if !move_only {
            for t in &dropped {
                t.delete();
            }
        }
        guard.delete(dropped);
    }

    /// Point lookup. L0 scans tables newest to oldest with a bloom pre-check;
    /// deeper levels binary-search the single table whose disjoint range can
    /// hold the user key.
    pub(crate) fn get(&self, key: &Key, hash: u64) -> Result<Option<ValueStruct>> {
        let tables = {
            let state = self.read();
            if self.level == 0 {
                state.tables.clone()
            } else {
                let idx = state
                    .tables
                    .partition_point(|t| t.biggest().user_key < key.user_key);
                match state.tables.get(idx) {
                    Some(t) if t.smallest().user_key <= key.user_key => vec![t.clone()],
                    _ => return Ok(None),
                }
            }
        };

        for t in tables.iter().rev() {
            if !t.may_contain_hash(hash) {
                continue;
            }
            if let Some(vs) = t.get(key)? {
                return Ok(Some(vs));
            }
        }
        Ok(None)
    }

    /// `[left, right)` window of tables whose ranges intersect `kr`.
    /// Only meaningful for levels with disjoint ranges (level >= 1).
    pub(crate) fn overlapping_tables(state: &LevelState, kr: &KeyRange) -> (usize, usize) {
        if kr.inf {
            return (0, state.tables.len());
        }
        if kr.is_empty() {
            return (0, 0);
        }
        let left = state
            .tables
            .partition_point(|t| *t.biggest() < kr.left);
        let right = state
            .tables
            .partition_point(|t| *t.smallest() <= kr.right);
        (left, right.max(left))
    }

    /// Append this level's read iterators: one per table (newest first) for
    /// L0, a single concat iterator for deeper levels.
    pub(crate) fn append_iterators(&self, out: &mut Vec<Box<dyn KvIterator>>, reversed: bool) {
        let state = self.read();
        if self.level == 0 {
            for t in state.tables.iter().rev() {
                out.push(Box::new(t.iter(reversed)));
            }
        } else if !state.tables.is_empty() {
            out.push(Box::new(ConcatIterator::new(state.tables.clone(), reversed)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::epoch::ResourceManager;
    use crate::format::hash_user_key;
    use crate::table::test_util::{build_table, kv};
    use tempfile::TempDir;

    fn table(
        dir: &std::path::Path,
        id: u64,
        opts: &Options,
        entries: &[(Key, ValueStruct)],
    ) -> Table {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        build_table(dir, id, opts, 1, &sorted).unwrap()
    }

    #[test]
    fn test_init_sorts_by_smallest() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        let t1 = table(dir.path(), 1, &opts, &[kv("m", 1, "v"), kv("p", 1, "v")]);
        let t2 = table(dir.path(), 2, &opts, &[kv("a", 1, "v"), kv("c", 1, "v")]);

        let handler = LevelHandler::new(1, 1 << 20, 0);
        handler.init_tables(vec![t1, t2]);
        let state = handler.read();
        assert_eq!(state.tables[0].id(), 2);
        assert_eq!(state.tables[1].id(), 1);
    }

    #[test]
    fn test_l0_init_sorts_by_id() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        let t1 = table(dir.path(), 9, &opts, &[kv("a", 1, "v")]);
        let t2 = table(dir.path(), 3, &opts, &[kv("b", 1, "v")]);

        let handler = LevelHandler::new(0, 0, 10);
        handler.init_tables(vec![t1, t2]);
        let state = handler.read();
        assert_eq!(state.tables[0].id(), 3);
        assert_eq!(state.tables[1].id(), 9);
    }

    #[test]
    fn test_try_add_l0_table_stall_boundary() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        let handler = LevelHandler::new(0, 0, 2);

        let t1 = table(dir.path(), 1, &opts, &[kv("a", 1, "v")]);
        let t2 = table(dir.path(), 2, &opts, &[kv("b", 1, "v")]);
        let t3 = table(dir.path(), 3, &opts, &[kv("c", 1, "v")]);

        assert!(handler.try_add_l0_table(t1));
        assert!(handler.try_add_l0_table(t2));
        // Exactly at the stall limit: refused.
        assert!(!handler.try_add_l0_table(t3));
        assert_eq!(handler.num_tables(), 2);
    }

    #[test]
    fn test_get_deeper_level_binary_search() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        let t1 = table(dir.path(), 1, &opts, &[kv("a", 1, "va"), kv("c", 1, "vc")]);
        let t2 = table(dir.path(), 2, &opts, &[kv("m", 1, "vm"), kv("p", 1, "vp")]);

        let handler = LevelHandler::new(1, 1 << 20, 0);
        handler.init_tables(vec![t1, t2]);

        let lookup = |k: &str| {
            handler.get(
                &Key::new(k.as_bytes().to_vec(), u64::MAX),
                hash_user_key(k.as_bytes()),
            )
        };
        assert_eq!(lookup("m")?.unwrap().value.as_ref(), b"vm");
        assert_eq!(lookup("c")?.unwrap().value.as_ref(), b"vc");
        assert!(lookup("z")?.is_none());
        // Falls in the gap between tables.
        assert!(lookup("e")?.is_none());
        Ok(())
    }

    #[test]
    fn test_l0_get_newest_table_wins() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        // Same user key in two L0 tables; higher id is the newer flush.
        let t_old = table(dir.path(), 1, &opts, &[kv("k", 1, "old")]);
        let t_new = table(dir.path(), 2, &opts, &[kv("k", 2, "new")]);

        let handler = LevelHandler::new(0, 0, 10);
        handler.init_tables(vec![t_old, t_new]);

        let vs = handler
            .get(&Key::new(&b"k"[..], u64::MAX), hash_user_key(b"k"))?
            .unwrap();
        assert_eq!(vs.value.as_ref(), b"new");
        Ok(())
    }

    #[test]
    fn test_overlapping_tables_window() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        let t1 = table(dir.path(), 1, &opts, &[kv("a", 1, "v"), kv("c", 1, "v")]);
        let t2 = table(dir.path(), 2, &opts, &[kv("e", 1, "v"), kv("g", 1, "v")]);
        let t3 = table(dir.path(), 3, &opts, &[kv("i", 1, "v"), kv("k", 1, "v")]);

        let handler = LevelHandler::new(1, 1 << 20, 0);
        handler.init_tables(vec![t1, t2, t3]);
        let state = handler.read();

        let range = |l: &str, r: &str| KeyRange {
            left: Key::new(l.as_bytes().to_vec(), u64::MAX),
            right: Key::new(r.as_bytes().to_vec(), 0),
            inf: false,
        };
        assert_eq!(
            LevelHandler::overlapping_tables(&state, &range("b", "f")),
            (0, 2)
        );
        assert_eq!(
            LevelHandler::overlapping_tables(&state, &range("f", "f")),
            (1, 2)
        );
        assert_eq!(
            LevelHandler::overlapping_tables(&state, &range("z", "zz")),
            (3, 3)
        );
        assert_eq!(
            LevelHandler::overlapping_tables(&state, &KeyRange::infinite()),
            (0, 3)
        );
    }

    #[test]
    fn test_replace_and_delete_tables() {
        let dir = TempDir::new().unwrap();
        let opts = Options::new(dir.path());
        let bot = table(dir.path(), 1, &opts, &[kv("a", 1, "v"), kv("c", 1, "v")]);
        let keepme = table(dir.path(), 2, &opts, &[kv("x", 1, "v"), kv("z", 1, "v")]);
        let merged = table(dir.path(), 3, &opts, &[kv("a", 2, "v"), kv("d", 2, "v")]);
        let bot_path = bot.path().to_path_buf();

        let handler = LevelHandler::new(1, 1 << 20, 0);
        handler.init_tables(vec![bot.clone(), keepme.clone()]);

        let mgr = ResourceManager::new();
        let mut cd = CompactDef::new(0, 1);
        cd.bot = vec![bot.clone()];
        drop(bot);

        let guard = mgr.acquire();
        handler.replace_tables(&[merged.clone()], &cd, &guard);
        {
            let state = handler.read();
            let ids: Vec<u64> = state.tables.iter().map(|t| t.id()).collect();
            assert_eq!(ids, vec![3, 2]);
        }
        drop(cd);
        guard.done();
        assert!(!bot_path.exists(), "replaced table file must be reclaimed");

        // Move-only delete keeps files on disk.
        let guard = mgr.acquire();
        let keep_path = keepme.path().to_path_buf();
        handler.delete_tables(&[keepme.clone()], &guard, true);
        drop(keepme);
        guard.done();
        assert_eq!(handler.num_tables(), 1);
        assert!(keep_path.exists());
    }
}
