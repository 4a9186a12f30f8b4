//! Compaction execution: merge the planned inputs and emit new tables.
//!
//! The merge iterator yields `(user_key asc, version desc)` order, so for
//! each user key the newest version arrives first. The first version at or
//! below the safe timestamp is the newest one any live reader can see; it is
//! kept (or filtered) and every older version of that user key is discarded.
//! File boundaries are forced by size, by prefix guards, by caller split
//! hints, and by skipped bottom tables whose ranges output files must not
//! cross.

use std::fmt;
use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::filter::{CompactionFilter, Decision, Guard};
use crate::format::{BlobPointer, Key, ValueStruct};
use crate::table::builder::TableBuilder;
use crate::table::iterator::{ConcatIterator, KvIterator, MergeIterator};
use crate::table::{new_filename, Table};

use super::controller::Core;
use super::plan::CompactDef;
use super::status::KeyRange;
use super::handler::LevelHandler;

/// Blob-pointer entries dropped by a compaction, forwarded to the value-log
/// manager so it can pick garbage-collection victims.
#[derive(Default)]
pub struct DiscardStats {
    pub num_skips: i64,
    pub skipped_bytes: i64,
    pub ptrs: Vec<BlobPointer>,
}

impl DiscardStats {
    fn collect(&mut self, vs: &ValueStruct) {
        if vs.is_value_pointer() {
            if let Some(bp) = BlobPointer::decode(&vs.value) {
                self.skipped_bytes += bp.len as i64;
                self.ptrs.push(bp);
            }
        }
        self.num_skips += 1;
    }
}

impl fmt::Display for DiscardStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_skips:{}, skipped_bytes:{}",
            self.num_skips, self.skipped_bytes
        )
    }
}

/// Per-compaction I/O accounting, folded into the controller totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub keys_read: u64,
    pub bytes_read: u64,
    pub keys_written: u64,
    pub bytes_written: u64,
    pub keys_discarded: u64,
    pub bytes_discarded: u64,
}

/// Whether the current output file must close before taking `key`.
///
/// True once `key` leaves the guard prefix entirely, or once the file
/// outgrows its cap; when `key` and `last_key` diverge within the guard's
/// `match_len` the cap shrinks to the guard minimum so the file can close on
/// the prefix boundary.
fn should_finish_file(
    key: &Key,
    last_key: &Key,
    guard: Option<&Guard>,
    current_size: i64,
    mut max_size: i64,
) -> bool {
    if last_key.is_empty() {
        return false;
    }
    if let Some(guard) = guard {
        if !key.user_key.starts_with(&guard.prefix) {
            return true;
        }
        if !match_guard(&key.user_key, &last_key.user_key, guard) && max_size > guard.min_size {
            max_size = guard.min_size;
        }
    }
    current_size > max_size
}

fn match_guard(key: &[u8], last_key: &[u8], guard: &Guard) -> bool {
    if last_key.len() < guard.match_len {
        return false;
    }
    key.starts_with(&last_key[..guard.match_len])
}

/// Longest-prefix-matching guard for `key`, if any.
fn search_guard<'a>(key: &[u8], guards: &'a [Guard]) -> Option<&'a Guard> {
    let mut best: Option<&Guard> = None;
    for guard in guards {
        if key.starts_with(&guard.prefix) {
            if best.map_or(true, |b| guard.prefix.len() > b.prefix.len()) {
                best = Some(guard);
            }
        }
    }
    best
}

/// Drop skipped tables whose whole range is now behind `key`. Returns whether
/// any boundary was crossed, in which case the current file must close.
fn over_skip_tables(key: &Key, skipped: &mut Vec<Table>) -> bool {
    let crossed = skipped
        .iter()
        .take_while(|t| *key > *t.biggest())
        .count();
    skipped.drain(..crossed);
    crossed > 0
}

impl Core {
    /// Whether any level strictly deeper than the destination holds keys in
    /// the compaction's top range. Decides if tombstones and old versions at
    /// or below the safe timestamp must survive to keep shadowing them.
    pub(crate) fn has_overlap_below(&self, cd: &CompactDef) -> bool {
        let Some(kr) = KeyRange::from_tables(&cd.top) else {
            return false;
        };
        for level in (cd.next_level + 1)..self.opts.max_levels {
            let state = self.levels[level].read();
            let (left, right) = LevelHandler::overlapping_tables(&state, &kr);
            if right > left {
                return true;
            }
        }
        false
    }

    pub(crate) fn reserve_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Merge `cd`'s inputs and emit the replacement tables for the next
    /// level. On error every file created here is removed again; nothing is
    /// referenced by the manifest yet.
    pub(crate) fn compact_build_tables(
        &self,
        level: usize,
        cd: &CompactDef,
        split_hints: &[Key],
    ) -> Result<Vec<Table>> {
        let mut new_tables = Vec::new();
        let mut discard = DiscardStats::default();
        let mut stats = CompactionStats::default();

        if let Err(err) = self.build_tables(level, cd, split_hints, &mut new_tables, &mut discard, &mut stats)
        {
            for t in new_tables.drain(..) {
                t.delete();
            }
            return Err(err);
        }

        // Make the new directory entries durable before the manifest can
        // reference them.
        File::open(&self.opts.dir)?.sync_all()?;
        new_tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));

        stats.keys_discarded = discard.num_skips as u64;
        stats.bytes_discarded = discard.skipped_bytes as u64;
        self.stats.add(&stats);
        tracing::info!(discard = %discard, "compaction discard stats");

        if !discard.ptrs.is_empty() {
            if let Some(tx) = &self.discard_tx {
                // Bounded send: a slow blob manager backpressures compaction,
                // never loses stats.
                if tx.send(discard).is_err() {
                    tracing::warn!("discard stats receiver dropped");
                }
            }
        }
        Ok(new_tables)
    }

    fn build_tables(
        &self,
        level: usize,
        cd: &CompactDef,
        split_hints: &[Key],
        new_tables: &mut Vec<Table>,
        discard: &mut DiscardStats,
        stats: &mut CompactionStats,
    ) -> Result<()> {
        let has_overlap = self.has_overlap_below(cd);
        tracing::info!(has_overlap, "key range overlap with deeper levels");

        // L0 tables overlap, so each gets its own iterator, newest first.
        // Deeper sources are disjoint and concatenate.
        let mut iters: Vec<Box<dyn KvIterator>> = Vec::new();
        if level == 0 {
            for t in cd.top.iter().rev() {
                iters.push(Box::new(t.iter(false)));
            }
        } else {
            iters.push(Box::new(ConcatIterator::new(cd.top.clone(), false)));
        }
        iters.push(Box::new(ConcatIterator::new(cd.bot.clone(), false)));
        let mut it = MergeIterator::new(iters, false);
        it.rewind()?;

        // Versions above this watermark may still be read by live snapshots
        // and are never collapsed.
        let safe_ts = self.compact_safe_ts.load(Ordering::SeqCst);

        let mut filter: Option<Box<dyn CompactionFilter>> = None;
        let mut guards: Vec<Guard> = Vec::new();
        if let Some(factory) = &self.opts.compaction_filter_factory {
            let f = factory.create(
                cd.next_level,
                &cd.smallest().user_key,
                &cd.biggest().user_key,
            );
            guards = f.guards();
            filter = Some(f);
        }

        let mut skipped = cd.skipped.clone();
        let mut hint_idx = 0usize;
        let mut builder: Option<TableBuilder> = None;
        let mut skip_key = Key::default();

        while it.valid() {
            let file_id = self.reserve_file_id();
            let path = new_filename(file_id, &self.opts.dir);
            let file = File::create(&path)?;
            match builder.as_mut() {
                Some(b) => b.reset(file),
                None => {
                    builder = Some(TableBuilder::new(
                        file,
                        Arc::clone(&self.limiter),
                        cd.next_level,
                        &self.opts,
                    ))
                }
            }
            let b = builder.as_mut().unwrap();
            let mut last_key = Key::default();
            let first_user_key = it.key().user_key.clone();
            let guard = search_guard(&first_user_key, &guards);

            let file_result: Result<()> = loop {
                if !it.valid() {
                    break Ok(());
                }
                let key = it.key().clone();
                let vs = it.value();
                let kv_size = (key.user_key.len() + vs.encoded_size()) as u64;
                stats.keys_read += 1;
                stats.bytes_read += kv_size;

                // Older versions of a collapsed user key are dropped wholesale.
                if !skip_key.is_empty() {
                    if key.same_user_key(&skip_key) {
                        discard.collect(&vs);
                        if let Err(e) = it.next() {
                            break Err(e);
                        }
                        continue;
                    }
                    skip_key = Key::default();
                }

                if !key.same_user_key(&last_key) {
                    // All versions of one user key stay within one file, so
                    // boundaries are only considered on a fresh user key.
                    if !skipped.is_empty() {
                        let over = over_skip_tables(&key, &mut skipped);
                        if over && !b.empty() {
                            // Continuing would write across a skipped table's
                            // range.
                            break Ok(());
                        }
                    }
                    if should_finish_file(
                        &key,
                        &last_key,
                        guard,
                        b.estimate_size(),
                        self.opts.max_table_size,
                    ) {
                        break Ok(());
                    }
                    if hint_idx < split_hints.len() && key >= split_hints[hint_idx] {
                        while hint_idx < split_hints.len() && key >= split_hints[hint_idx] {
                            hint_idx += 1;
                        }
                        break Ok(());
                    }
                    last_key = key.clone();
                }

                if key.version <= safe_ts {
                    // Newest readable version of this user key; everything
                    // older is invisible to every snapshot.
                    skip_key = key.clone();

                    if vs.is_deleted() {
                        // A tombstone only has work left if deeper levels
                        // still hold versions it must shadow.
                        if !has_overlap {
                            if let Err(e) = it.next() {
                                break Err(e);
                            }
                            continue;
                        }
                    } else if let Some(f) = filter.as_ref() {
                        match f.filter(&key.user_key, &vs.value, &vs.user_meta) {
                            Decision::MarkTombstone => {
                                discard.collect(&vs);
                                if has_overlap {
                                    if let Err(e) = b.add(&key, &ValueStruct::tombstone()) {
                                        break Err(e);
                                    }
                                }
                                if let Err(e) = it.next() {
                                    break Err(e);
                                }
                                continue;
                            }
                            Decision::Drop => {
                                discard.collect(&vs);
                                if let Err(e) = it.next() {
                                    break Err(e);
                                }
                                continue;
                            }
                            Decision::Keep => {}
                        }
                    }
                }

                if let Err(e) = b.add(&key, &vs) {
                    break Err(e);
                }
                stats.keys_written += 1;
                stats.bytes_written += kv_size;
                if let Err(e) = it.next() {
                    break Err(e);
                }
            };

            let finished = file_result.and_then(|()| b.finish());
            if let Err(err) = finished {
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }

            match Table::open(&path, self.opts.compression_at(cd.next_level)) {
                Ok(t) => {
                    if t.smallest().is_empty() {
                        // Nothing survived into this file.
                        t.delete();
                    } else {
                        new_tables.push(t);
                    }
                }
                Err(err) => {
                    let _ = std::fs::remove_file(&path);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
