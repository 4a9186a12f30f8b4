//! Level orchestration: recovery, background workers, foreground installs.
//!
//! ## Data and control flow
//!
//! ```text
//! foreground writer                  background workers (num_compactors)
//!   add_level_0_table(t)               loop: pick -> fill -> build -> install
//!        |                                     |
//!        v                                     v
//!   manifest Create ----------------- manifest ChangeSet (before any delete)
//!        |                                     |
//!   L0 try-add (stall when full)       replace_tables / delete_tables
//!                                              |
//!                                      epoch-deferred file reclamation
//! ```
//!
//! Reads walk levels in ascending order, which is what makes a key moving
//! from L_i to L_{i+1} mid-compaction observable exactly once: either still
//! at L_i before the install or at L_{i+1} after it.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{select, Sender};
use itertools::Itertools;
use rand::Rng;

use crate::closer::Closer;
use crate::config::Options;
use crate::epoch::{self, ResourceManager};
use crate::error::{Error, Result};
use crate::format::{hash_user_key, Key, ValueStruct};
use crate::manifest::{HeadInfo, Manifest, ManifestChange};
use crate::rate::RateLimiter;
use crate::table::iterator::KvIterator;
use crate::table::{new_filename, parse_file_id, Table};

use super::build::{CompactionStats, DiscardStats};
use super::handler::LevelHandler;
use super::plan::{CompactDef, CompactionPriority};
use super::status::CompactStatus;

const STALL_POLL: Duration = Duration::from_millis(10);

/// One table's identity and key span, for introspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub id: u64,
    pub level: usize,
    pub left: Bytes,
    pub right: Bytes,
}

#[derive(Default)]
pub(crate) struct AggregateStats {
    keys_read: AtomicU64,
    bytes_read: AtomicU64,
    keys_written: AtomicU64,
    bytes_written: AtomicU64,
    keys_discarded: AtomicU64,
    bytes_discarded: AtomicU64,
}

impl AggregateStats {
    pub(crate) fn add(&self, s: &CompactionStats) {
        self.keys_read.fetch_add(s.keys_read, Ordering::Relaxed);
        self.bytes_read.fetch_add(s.bytes_read, Ordering::Relaxed);
        self.keys_written.fetch_add(s.keys_written, Ordering::Relaxed);
        self.bytes_written.fetch_add(s.bytes_written, Ordering::Relaxed);
        self.keys_discarded.fetch_add(s.keys_discarded, Ordering::Relaxed);
        self.bytes_discarded.fetch_add(s.bytes_discarded, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CompactionStats {
        CompactionStats {
            keys_read: self.keys_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            keys_written: self.keys_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            keys_discarded: self.keys_discarded.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Core {
    pub(crate) opts: Options,
    pub(crate) levels: Vec<LevelHandler>,
    pub(crate) cstatus: CompactStatus,
    pub(crate) next_file_id: AtomicU64,
    pub(crate) manifest: Manifest,
    pub(crate) resource_mgr: ResourceManager,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) discard_tx: Option<Sender<DiscardStats>>,
    pub(crate) compact_safe_ts: AtomicU64,
    pub(crate) stats: AggregateStats,
    failed_compactions: AtomicU64,
    last_unstalled: Mutex<Instant>,
    stalled: Mutex<Duration>,
}

/// The leveled-compaction core. One instance owns the level structure, the
/// manifest, and the compaction worker pool of a store.
pub struct LevelController {
    pub(crate) core: Arc<Core>,
    closer: Closer,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LevelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelController").finish_non_exhaustive()
    }
}

impl LevelController {
    /// Open the directory: reconcile files with the manifest, load every
    /// referenced table at its recorded level, and verify level invariants.
    pub fn open(
        opts: Options,
        resource_mgr: ResourceManager,
        discard_tx: Option<Sender<DiscardStats>>,
    ) -> Result<LevelController> {
        assert!(opts.max_levels >= 2, "need at least two levels");
        assert!(
            opts.num_level_zero_tables_stall > opts.num_level_zero_tables,
            "stall limit must exceed the compaction trigger"
        );

        if !opts.read_only {
            std::fs::create_dir_all(&opts.dir)?;
        }
        let manifest = Manifest::open(&opts.dir)?;
        let manifest_state = manifest.state();

        let id_map = read_id_map(&opts.dir)?;
        revert_to_manifest(&opts, &manifest_state.tables, &id_map)?;

        let mut levels = Vec::with_capacity(opts.max_levels);
        for i in 0..opts.max_levels {
            let max_total_size = match i {
                0 => 0,
                1 => opts.level_one_size,
                _ => 0, // filled below from the previous level
            };
            levels.push(LevelHandler::new(
                i,
                max_total_size,
                opts.num_level_zero_tables_stall,
            ));
        }
        for i in 2..opts.max_levels {
            let prev = levels[i - 1].max_total_size;
            levels[i].max_total_size = prev * opts.level_size_multiplier;
        }

        // Some orphan files may just have been deleted; load only what the
        // manifest lists.
        let mut tables_by_level: Vec<Vec<Table>> = vec![Vec::new(); opts.max_levels];
        let mut max_file_id = 0u64;
        for (&id, tm) in &manifest_state.tables {
            if tm.level as usize >= opts.max_levels {
                return Err(Error::Validation(format!(
                    "table {id} at level {} beyond max_levels {}",
                    tm.level, opts.max_levels
                )));
            }
            let path = new_filename(id, &opts.dir);
            let table = Table::open(&path, tm.compression)?;
            tables_by_level[tm.level as usize].push(table);
            max_file_id = max_file_id.max(id);
        }
        for (handler, tables) in levels.iter().zip(tables_by_level) {
            handler.init_tables(tables);
        }

        let core = Core {
            cstatus: CompactStatus::new(opts.max_levels),
            next_file_id: AtomicU64::new(max_file_id + 1),
            manifest,
            resource_mgr,
            limiter: Arc::new(RateLimiter::new(opts.rate_bytes_per_sec)),
            discard_tx,
            compact_safe_ts: AtomicU64::new(0),
            stats: AggregateStats::default(),
            failed_compactions: AtomicU64::new(0),
            last_unstalled: Mutex::new(Instant::now()),
            stalled: Mutex::new(Duration::ZERO),
            levels,
            opts,
        };
        core.validate()?;

        // The open may have removed orphans; make the directory state
        // durable before serving.
        File::open(&core.opts.dir)?.sync_all()?;

        Ok(LevelController {
            core: Arc::new(core),
            closer: Closer::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Launch the compaction worker pool. The first half of the workers try
    /// priorities in level order (upper levels first, which is what unblocks
    /// stalled writers); the rest sort by score.
    pub fn start_compact(&self) {
        let n = self.core.opts.num_compactors;
        let mut handles = self.handles.lock().unwrap();
        for i in 0..n {
            let core = Arc::clone(&self.core);
            let closer = self.closer.clone();
            let score_priority = i * 2 >= n;
            let handle = std::thread::Builder::new()
                .name(format!("emberdb-compact-{i}"))
                .spawn(move || run_worker(core, closer, score_priority))
                .expect("failed to spawn compaction worker");
            handles.push(handle);
        }
    }

    /// Signal the workers and wait for them to exit. A compaction already
    /// past its manifest commit finishes its in-memory install first.
    pub fn close(&self) {
        self.closer.signal();
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    /// Watermark below which older key versions may be collapsed. Supplied
    /// by the transaction subsystem's minimum read timestamp.
    pub fn set_compact_safe_ts(&self, ts: u64) {
        self.core.compact_safe_ts.store(ts, Ordering::SeqCst);
    }

    /// Point read: levels in ascending order, first hit wins. A tombstone is
    /// returned as a deleted [`ValueStruct`]; interpreting it is up to the
    /// caller.
    pub fn get(&self, key: &Key) -> Result<Option<ValueStruct>> {
        let hash = hash_user_key(&key.user_key);
        for handler in &self.core.levels {
            if let Some(vs) = handler.get(key, hash)? {
                return Ok(Some(vs));
            }
        }
        Ok(None)
    }

    /// Iterators over every level, L0 tables first (newest to oldest), then
    /// one concat iterator per deeper level.
    pub fn append_iterators(&self, out: &mut Vec<Box<dyn KvIterator>>, reversed: bool) {
        for handler in &self.core.levels {
            handler.append_iterators(out, reversed);
        }
    }

    /// Install a freshly flushed table into L0. The manifest entry is
    /// persisted first, so a compaction can never delete a table the
    /// manifest does not know. Blocks while L0 is at the stall limit; that
    /// stall is the only backpressure writers observe.
    pub fn add_level_0_table(&self, table: Table, head: Option<HeadInfo>) -> Result<()> {
        if self.core.opts.read_only {
            return Err(Error::ReadOnly);
        }
        self.core.manifest.add_changes(
            vec![ManifestChange::Create {
                id: table.id(),
                level: 0,
                compression: table.compression_type(),
            }],
            head,
        )?;

        while !self.core.levels[0].try_add_l0_table(table.clone()) {
            let since_unstalled = self.core.last_unstalled.lock().unwrap().elapsed();
            tracing::warn!(?since_unstalled, "L0 full, stalling foreground writes");
            for i in 0..self.core.opts.max_levels {
                tracing::warn!(
                    level = i,
                    claimed = %self.core.cstatus.debug_level(i),
                    size = self.core.levels[i].total_size(),
                    "level status during stall"
                );
            }

            // Wait for L0 to become healthy, or it would fill right up
            // again. The release condition mirrors the picker's L0 criteria,
            // which is what guarantees progress.
            let start = Instant::now();
            let mut polls = 0u32;
            while self.core.is_l0_compactable() {
                std::thread::sleep(STALL_POLL);
                polls += 1;
                if polls % 100 == 0 {
                    let prios = self.core.pick_compact_levels();
                    tracing::warn!(?prios, "still waiting to add L0 table");
                }
            }
            let stalled = start.elapsed();
            *self.core.stalled.lock().unwrap() += stalled;
            *self.core.last_unstalled.lock().unwrap() = Instant::now();
            tracing::info!(?stalled, "L0 writes unstalled");
        }
        Ok(())
    }

    /// Allocate the next table file id.
    pub fn reserve_file_id(&self) -> u64 {
        self.core.reserve_file_id()
    }

    /// Snapshot of every table's identity and span, sorted by (level, id).
    pub fn get_table_info(&self) -> Vec<TableInfo> {
        let mut infos = Vec::new();
        for handler in &self.core.levels {
            let state = handler.read();
            for t in &state.tables {
                infos.push(TableInfo {
                    id: t.id(),
                    level: handler.level,
                    left: t.smallest().user_key.clone(),
                    right: t.biggest().user_key.clone(),
                });
            }
        }
        infos.sort_by(|a, b| (a.level, a.id).cmp(&(b.level, b.id)));
        infos
    }

    /// Cumulative compaction I/O counters.
    pub fn compaction_stats(&self) -> CompactionStats {
        self.core.stats.snapshot()
    }

    /// Total time foreground writers spent stalled on L0.
    pub fn stall_time(&self) -> Duration {
        *self.core.stalled.lock().unwrap()
    }

    /// Compaction attempts that failed with an error since open.
    pub fn failed_compactions(&self) -> u64 {
        self.core.failed_compactions.load(Ordering::Relaxed)
    }
}

impl Drop for LevelController {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_id_map(dir: &Path) -> Result<HashSet<u64>> {
    let mut ids = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_file_id(&path) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Check that every manifest table exists on disk and sweep table files the
/// manifest does not reference.
fn revert_to_manifest(
    opts: &Options,
    tables: &HashMap<u64, crate::manifest::TableManifest>,
    id_map: &HashSet<u64>,
) -> Result<()> {
    for &id in tables.keys() {
        if !id_map.contains(&id) {
            return Err(Error::FileMissing(id));
        }
    }
    for &id in id_map {
        if !tables.contains_key(&id) {
            tracing::info!(table_id = id, "table file not referenced in manifest");
            if !opts.read_only {
                std::fs::remove_file(new_filename(id, &opts.dir))?;
            }
        }
    }
    Ok(())
}

fn run_worker(core: Arc<Core>, closer: Closer, score_priority: bool) {
    if core.opts.do_not_compact {
        return;
    }

    // De-synchronize the pool so workers do not pick the same priority at
    // the same instant.
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
    select! {
        recv(closer.has_been_signaled()) -> _ => return,
        default(jitter) => {}
    }

    loop {
        let guard = core.resource_mgr.acquire();
        let mut prios = core.pick_compact_levels();
        if score_priority {
            prios.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let mut did_compact = false;
        for p in prios {
            match core.do_compact(p, &guard) {
                Ok(true) => {
                    did_compact = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    core.failed_compactions.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "compaction attempt failed");
                }
            }
        }
        guard.done();

        let wait = if did_compact {
            Duration::from_millis(300)
        } else {
            Duration::from_secs(3)
        };
        select! {
            recv(closer.has_been_signaled()) -> _ => return,
            default(wait) => {}
        }
    }
}

impl Core {
    /// Level invariants: per level >= 1, tables sorted by smallest key with
    /// pairwise-disjoint ranges; no table id appears twice.
    pub(crate) fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for handler in &self.levels {
            let state = handler.read();
            for t in &state.tables {
                if !seen.insert(t.id()) {
                    return Err(Error::Validation(format!(
                        "table {} appears in more than one level",
                        t.id()
                    )));
                }
                if t.smallest() > t.biggest() {
                    return Err(Error::Validation(format!(
                        "table {} has smallest > biggest",
                        t.id()
                    )));
                }
            }
            if handler.level == 0 {
                continue;
            }
            for (a, b) in state.tables.iter().tuple_windows() {
                if a.biggest().user_key >= b.smallest().user_key {
                    return Err(Error::Validation(format!(
                        "level {}: tables {} and {} overlap",
                        handler.level,
                        a.id(),
                        b.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Try to compact `p.level` into the next level. `Ok(false)` means there
    /// was nothing claimable (not an error); `Err` means a planned compaction
    /// failed and its claims were released.
    pub(crate) fn do_compact(
        &self,
        p: CompactionPriority,
        guard: &epoch::Guard,
    ) -> Result<bool> {
        assert!(p.level + 1 < self.opts.max_levels);
        tracing::info!(level = p.level, score = p.score, "got compaction priority");

        let mut cd = CompactDef::new(p.level, p.level + 1);
        let filled = if p.level == 0 {
            self.fill_tables_l0(&mut cd)?
        } else {
            self.fill_tables(&mut cd)?
        };
        if !filled {
            tracing::debug!(level = p.level, "no compactable table set");
            return Ok(false);
        }
        cd.mark_tables_compacting(true);
        tracing::info!(plan = %cd, "running compaction");

        let result = self.run_compact_def(p.level, &cd, guard);
        self.cstatus.delete(&cd);
        cd.mark_tables_compacting(false);

        match result {
            Ok(()) => {
                tracing::info!(level = p.level, "compaction done");
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(plan = %cd, error = %err, "compaction failed");
                Err(err)
            }
        }
    }

    /// Execute one planned compaction: build (or move) the output, persist
    /// the manifest change set, then mutate the levels. Files are only
    /// deleted after the manifest commit; level mutation is pure in-memory
    /// and cannot fail past that point.
    pub(crate) fn run_compact_def(
        &self,
        level: usize,
        cd: &CompactDef,
        guard: &epoch::Guard,
    ) -> Result<()> {
        let start = Instant::now();

        let mut top_move = false;
        let mut changes = Vec::new();
        let new_tables;
        if level > 0 && cd.bot.is_empty() && cd.skipped.is_empty() {
            // Nothing to merge with: promote the files as they are. L0 never
            // qualifies because its tables overlap each other.
            new_tables = cd.top.clone();
            for t in &new_tables {
                changes.push(ManifestChange::MoveDown {
                    id: t.id(),
                    new_level: cd.next_level as u32,
                });
            }
            top_move = true;
        } else {
            new_tables = self.compact_build_tables(level, cd, &[])?;
            for t in &new_tables {
                changes.push(ManifestChange::Create {
                    id: t.id(),
                    level: cd.next_level as u32,
                    compression: t.compression_type(),
                });
            }
            for t in cd.top.iter().chain(&cd.bot) {
                changes.push(ManifestChange::Delete { id: t.id() });
            }
        }

        // Manifest before any level mutation or file deletion. If this
        // fails, the new files are unreferenced orphans and the next open
        // sweeps them.
        if let Err(err) = self.manifest.add_changes(changes, None) {
            if !top_move {
                for t in &new_tables {
                    t.delete();
                }
            }
            return Err(err);
        }

        // Install downward first; `get` walks levels top-down, so a key is
        // visible at the old level until the moment it is visible at the new
        // one.
        self.levels[cd.next_level].replace_tables(&new_tables, cd, guard);
        self.levels[cd.this_level].delete_tables(&cd.top, guard, top_move);

        tracing::info!(
            plan = %cd,
            deleted = cd.top.len() + cd.bot.len(),
            added = new_tables.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "compaction installed"
        );
        Ok(())
    }
}
