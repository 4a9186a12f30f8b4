//! Cursor-style iterators over tables.
//!
//! All iterators share the [`KvIterator`] contract: position with `rewind` or
//! `seek`, inspect the current entry with `key`/`value`, advance with `next`.
//! The compaction loop depends on inspecting the current entry repeatedly
//! before deciding to advance, which is why these are cursors rather than
//! `std::iter::Iterator`s.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::format::{Key, ValueStruct};

use super::Table;

pub trait KvIterator: Send {
    /// Position at the first entry (last when reversed).
    fn rewind(&mut self) -> Result<()>;

    /// Position at the first entry >= `key` (last entry <= `key` when
    /// reversed).
    fn seek(&mut self, key: &Key) -> Result<()>;

    fn valid(&self) -> bool;

    /// Current key. Must only be called while `valid()`.
    fn key(&self) -> &Key;

    /// Current value, with its version filled in.
    fn value(&self) -> ValueStruct;

    fn next(&mut self) -> Result<()>;
}

/// Iterates one table, loading data blocks on demand.
pub struct TableIterator {
    table: Table,
    reversed: bool,
    block_idx: usize,
    entries: Vec<(Key, ValueStruct)>,
    entry_idx: usize,
    ok: bool,
}

impl TableIterator {
    pub(crate) fn new(table: Table, reversed: bool) -> Self {
        Self {
            table,
            reversed,
            block_idx: 0,
            entries: Vec::new(),
            entry_idx: 0,
            ok: false,
        }
    }

    fn load_block(&mut self, idx: usize) -> Result<()> {
        self.entries = self.table.read_block(idx)?;
        self.block_idx = idx;
        Ok(())
    }

    fn step_forward(&mut self) -> Result<()> {
        if self.entry_idx + 1 < self.entries.len() {
            self.entry_idx += 1;
            return Ok(());
        }
        if self.block_idx + 1 >= self.table.num_blocks() {
            self.ok = false;
            return Ok(());
        }
        self.load_block(self.block_idx + 1)?;
        self.entry_idx = 0;
        self.ok = !self.entries.is_empty();
        Ok(())
    }

    fn step_back(&mut self) -> Result<()> {
        if self.entry_idx > 0 {
            self.entry_idx -= 1;
            return Ok(());
        }
        if self.block_idx == 0 {
            self.ok = false;
            return Ok(());
        }
        self.load_block(self.block_idx - 1)?;
        if self.entries.is_empty() {
            self.ok = false;
        } else {
            self.entry_idx = self.entries.len() - 1;
        }
        Ok(())
    }

    /// Position at the first entry >= `key`, regardless of direction.
    fn seek_forward(&mut self, key: &Key) -> Result<()> {
        let num_blocks = self.table.num_blocks();
        if num_blocks == 0 {
            self.ok = false;
            return Ok(());
        }
        // Last block whose first key is <= the target may contain it.
        let mut lo = 0;
        let mut hi = num_blocks;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.table.block_handle(mid).first_key <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let start = lo.saturating_sub(1);

        self.load_block(start)?;
        let idx = self.entries.partition_point(|(k, _)| k < key);
        if idx < self.entries.len() {
            self.entry_idx = idx;
            self.ok = true;
            return Ok(());
        }
        // Past the end of this block; the next block starts >= key.
        if start + 1 < num_blocks {
            self.load_block(start + 1)?;
            self.entry_idx = 0;
            self.ok = !self.entries.is_empty();
        } else {
            self.ok = false;
        }
        Ok(())
    }
}

impl KvIterator for TableIterator {
    fn rewind(&mut self) -> Result<()> {
        let num_blocks = self.table.num_blocks();
        if num_blocks == 0 {
            self.ok = false;
            return Ok(());
        }
        if self.reversed {
            self.load_block(num_blocks - 1)?;
            self.ok = !self.entries.is_empty();
            self.entry_idx = self.entries.len().saturating_sub(1);
        } else {
            self.load_block(0)?;
            self.ok = !self.entries.is_empty();
            self.entry_idx = 0;
        }
        Ok(())
    }

    fn seek(&mut self, key: &Key) -> Result<()> {
        self.seek_forward(key)?;
        if !self.reversed {
            return Ok(());
        }
        // Reversed wants the last entry <= key.
        if self.ok && self.entries[self.entry_idx].0 == *key {
            return Ok(());
        }
        if self.ok {
            self.step_back()?;
        } else {
            // Everything is < key (or the table is empty): last entry.
            let num_blocks = self.table.num_blocks();
            if num_blocks == 0 {
                return Ok(());
            }
            self.load_block(num_blocks - 1)?;
            if self.entries.is_empty() {
                self.ok = false;
            } else {
                self.entry_idx = self.entries.len() - 1;
                self.ok = true;
            }
        }
        Ok(())
    }

    fn valid(&self) -> bool {
        self.ok
    }

    fn key(&self) -> &Key {
        &self.entries[self.entry_idx].0
    }

    fn value(&self) -> ValueStruct {
        self.entries[self.entry_idx].1.clone()
    }

    fn next(&mut self) -> Result<()> {
        if !self.ok {
            return Ok(());
        }
        if self.reversed {
            self.step_back()
        } else {
            self.step_forward()
        }
    }
}

/// Concatenation of tables with pairwise-disjoint key ranges, in range order.
pub struct ConcatIterator {
    tables: Vec<Table>,
    reversed: bool,
    cur: Option<TableIterator>,
    table_idx: usize,
}

impl ConcatIterator {
    pub fn new(tables: Vec<Table>, reversed: bool) -> Self {
        Self {
            tables,
            reversed,
            cur: None,
            table_idx: 0,
        }
    }

    fn use_table(&mut self, idx: usize) -> Result<&mut TableIterator> {
        self.table_idx = idx;
        self.cur = Some(self.tables[idx].iter(self.reversed));
        Ok(self.cur.as_mut().unwrap())
    }

    /// Move into the adjacent table in iteration order until one yields.
    fn advance_table(&mut self) -> Result<()> {
        loop {
            let next_idx = if self.reversed {
                if self.table_idx == 0 {
                    self.cur = None;
                    return Ok(());
                }
                self.table_idx - 1
            } else {
                if self.table_idx + 1 >= self.tables.len() {
                    self.cur = None;
                    return Ok(());
                }
                self.table_idx + 1
            };
            let it = self.use_table(next_idx)?;
            it.rewind()?;
            if it.valid() {
                return Ok(());
            }
        }
    }
}

impl KvIterator for ConcatIterator {
    fn rewind(&mut self) -> Result<()> {
        if self.tables.is_empty() {
            self.cur = None;
            return Ok(());
        }
        let start = if self.reversed {
            self.tables.len() - 1
        } else {
            0
        };
        let it = self.use_table(start)?;
        it.rewind()?;
        if !it.valid() {
            self.advance_table()?;
        }
        Ok(())
    }

    fn seek(&mut self, key: &Key) -> Result<()> {
        if self.tables.is_empty() {
            self.cur = None;
            return Ok(());
        }
        if !self.reversed {
            // First table that can hold an entry >= key.
            let idx = self.tables.partition_point(|t| *t.biggest() < *key);
            if idx == self.tables.len() {
                self.cur = None;
                return Ok(());
            }
            let it = self.use_table(idx)?;
            it.seek(key)?;
            if !it.valid() {
                self.advance_table()?;
            }
        } else {
            // Last table that can hold an entry <= key.
            let idx = self.tables.partition_point(|t| *t.smallest() <= *key);
            if idx == 0 {
                self.cur = None;
                return Ok(());
            }
            let it = self.use_table(idx - 1)?;
            it.seek(key)?;
            if !it.valid() {
                self.advance_table()?;
            }
        }
        Ok(())
    }

    fn valid(&self) -> bool {
        self.cur.as_ref().map_or(false, |it| it.valid())
    }

    fn key(&self) -> &Key {
        self.cur.as_ref().unwrap().key()
    }

    fn value(&self) -> ValueStruct {
        self.cur.as_ref().unwrap().value()
    }

    fn next(&mut self) -> Result<()> {
        let Some(it) = self.cur.as_mut() else {
            return Ok(());
        };
        it.next()?;
        if !it.valid() {
            self.advance_table()?;
        }
        Ok(())
    }
}

struct HeapEntry {
    key: Key,
    source: usize,
    reversed: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: make the entry that must come out first
        // compare greatest. Ties go to the smaller source index (newer
        // source), in both directions.
        let key_order = if self.reversed {
            self.key.cmp(&other.key)
        } else {
            other.key.cmp(&self.key)
        };
        key_order.then_with(|| other.source.cmp(&self.source))
    }
}

/// K-way merge of sorted sources, stable on source index: when several
/// sources hold the same key, the source added first wins and the duplicates
/// are skipped.
pub struct MergeIterator {
    sources: Vec<Box<dyn KvIterator>>,
    heap: BinaryHeap<HeapEntry>,
    reversed: bool,
}

impl MergeIterator {
    pub fn new(sources: Vec<Box<dyn KvIterator>>, reversed: bool) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
            reversed,
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap.clear();
        for (idx, source) in self.sources.iter().enumerate() {
            if source.valid() {
                self.heap.push(HeapEntry {
                    key: source.key().clone(),
                    source: idx,
                    reversed: self.reversed,
                });
            }
        }
    }

    fn advance_source(&mut self, idx: usize) -> Result<()> {
        self.sources[idx].next()?;
        if self.sources[idx].valid() {
            self.heap.push(HeapEntry {
                key: self.sources[idx].key().clone(),
                source: idx,
                reversed: self.reversed,
            });
        }
        Ok(())
    }
}

impl KvIterator for MergeIterator {
    fn rewind(&mut self) -> Result<()> {
        for source in &mut self.sources {
            source.rewind()?;
        }
        self.rebuild_heap();
        Ok(())
    }

    fn seek(&mut self, key: &Key) -> Result<()> {
        for source in &mut self.sources {
            source.seek(key)?;
        }
        self.rebuild_heap();
        Ok(())
    }

    fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    fn key(&self) -> &Key {
        &self.heap.peek().unwrap().key
    }

    fn value(&self) -> ValueStruct {
        let top = self.heap.peek().unwrap();
        self.sources[top.source].value()
    }

    fn next(&mut self) -> Result<()> {
        let Some(top) = self.heap.pop() else {
            return Ok(());
        };
        self.advance_source(top.source)?;
        // Skip exact duplicates of the key we just yielded; the top source
        // already won.
        while let Some(peek) = self.heap.peek() {
            if peek.key != top.key {
                break;
            }
            let dup = self.heap.pop().unwrap();
            self.advance_source(dup.source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{build_table, kv};
    use super::*;
    use crate::config::Options;
    use crate::error::Result;
    use tempfile::TempDir;

    fn collect(it: &mut dyn KvIterator) -> Result<Vec<(String, u64, String)>> {
        let mut out = Vec::new();
        it.rewind()?;
        while it.valid() {
            out.push((
                String::from_utf8_lossy(&it.key().user_key).into_owned(),
                it.key().version,
                String::from_utf8_lossy(&it.value().value).into_owned(),
            ));
            it.next()?;
        }
        Ok(out)
    }

    #[test]
    fn test_table_iterator_order_and_seek() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path()).table_block_size(64);
        let mut entries = vec![];
        for i in 0..50 {
            entries.push(kv(&format!("key_{i:03}"), 2, "new"));
            entries.push(kv(&format!("key_{i:03}"), 1, "old"));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let table = build_table(dir.path(), 1, &opts, 1, &entries)?;
        assert!(table.num_blocks() > 1);

        let mut it = table.iter(false);
        let all = collect(&mut it)?;
        assert_eq!(all.len(), 100);
        // Within one user key the higher version comes first.
        assert_eq!(all[0], ("key_000".into(), 2, "new".into()));
        assert_eq!(all[1], ("key_000".into(), 1, "old".into()));

        it.seek(&Key::new(&b"key_025"[..], u64::MAX))?;
        assert!(it.valid());
        assert_eq!(it.key().user_key.as_ref(), b"key_025");
        assert_eq!(it.key().version, 2);

        // Seek past the end.
        it.seek(&Key::new(&b"zzz"[..], u64::MAX))?;
        assert!(!it.valid());
        Ok(())
    }

    #[test]
    fn test_table_iterator_reversed() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path()).table_block_size(32);
        let mut entries: Vec<_> = (0..20).map(|i| kv(&format!("k{i:02}"), 1, "v")).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let table = build_table(dir.path(), 1, &opts, 1, &entries)?;

        let mut it = table.iter(true);
        let all = collect(&mut it)?;
        assert_eq!(all.len(), 20);
        assert_eq!(all[0].0, "k19");
        assert_eq!(all[19].0, "k00");

        // Reversed seek: last entry <= target.
        it.seek(&Key::new(&b"k10"[..], 1))?;
        assert!(it.valid());
        assert_eq!(it.key().user_key.as_ref(), b"k10");

        it.seek(&Key::new(&b"k105"[..], 1))?;
        assert!(it.valid());
        assert_eq!(it.key().user_key.as_ref(), b"k10");

        it.seek(&Key::new(&b"a"[..], 1))?;
        assert!(!it.valid());
        Ok(())
    }

    #[test]
    fn test_concat_iterator() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let t1 = build_table(
            dir.path(),
            1,
            &opts,
            1,
            &[kv("a", 1, "1"), kv("b", 1, "2")],
        )?;
        let t2 = build_table(
            dir.path(),
            2,
            &opts,
            1,
            &[kv("c", 1, "3"), kv("d", 1, "4")],
        )?;

        let mut it = ConcatIterator::new(vec![t1.clone(), t2.clone()], false);
        let all = collect(&mut it)?;
        assert_eq!(
            all.iter().map(|e| e.0.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );

        it.seek(&Key::new(&b"c"[..], u64::MAX))?;
        assert!(it.valid());
        assert_eq!(it.key().user_key.as_ref(), b"c");

        // Crossing the table boundary.
        it.seek(&Key::new(&b"b"[..], 0))?;
        assert_eq!(it.key().user_key.as_ref(), b"b");
        it.next()?;
        assert_eq!(it.key().user_key.as_ref(), b"c");

        let mut rev = ConcatIterator::new(vec![t1, t2], true);
        let all = collect(&mut rev)?;
        assert_eq!(
            all.iter().map(|e| e.0.as_str()).collect::<Vec<_>>(),
            vec!["d", "c", "b", "a"]
        );
        Ok(())
    }

    #[test]
    fn test_merge_iterator_version_order_and_stability() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        // Source 0 (newer) and source 1 (older) share user key "b".
        let t1 = build_table(
            dir.path(),
            1,
            &opts,
            1,
            &[kv("a", 5, "a5"), kv("b", 7, "b7")],
        )?;
        let t2 = build_table(
            dir.path(),
            2,
            &opts,
            1,
            &[kv("b", 3, "b3"), kv("c", 2, "c2")],
        )?;

        let mut it = MergeIterator::new(
            vec![
                Box::new(t1.iter(false)) as Box<dyn KvIterator>,
                Box::new(t2.iter(false)),
            ],
            false,
        );
        let all = collect(&mut it)?;
        assert_eq!(
            all,
            vec![
                ("a".into(), 5, "a5".into()),
                ("b".into(), 7, "b7".into()),
                ("b".into(), 3, "b3".into()),
                ("c".into(), 2, "c2".into()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_merge_iterator_skips_exact_duplicates() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let t1 = build_table(dir.path(), 1, &opts, 1, &[kv("k", 4, "from_new")])?;
        let t2 = build_table(dir.path(), 2, &opts, 1, &[kv("k", 4, "from_old")])?;

        let mut it = MergeIterator::new(
            vec![
                Box::new(t1.iter(false)) as Box<dyn KvIterator>,
                Box::new(t2.iter(false)),
            ],
            false,
        );
        let all = collect(&mut it)?;
        assert_eq!(all, vec![("k".into(), 4, "from_new".into())]);
        Ok(())
    }

    #[test]
    fn test_merge_iterator_reversed() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let t1 = build_table(dir.path(), 1, &opts, 1, &[kv("a", 1, "1"), kv("c", 1, "3")])?;
        let t2 = build_table(dir.path(), 2, &opts, 1, &[kv("b", 1, "2"), kv("d", 1, "4")])?;

        let mut it = MergeIterator::new(
            vec![
                Box::new(t1.iter(true)) as Box<dyn KvIterator>,
                Box::new(t2.iter(true)),
            ],
            true,
        );
        let all = collect(&mut it)?;
        assert_eq!(
            all.iter().map(|e| e.0.as_str()).collect::<Vec<_>>(),
            vec!["d", "c", "b", "a"]
        );
        Ok(())
    }
}
