use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::filter::CompactionFilterFactory;

/// Block compression applied to table data blocks, selectable per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Snappy,
}

impl CompressionType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Snappy => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Configuration for the compaction core.
///
/// `num_level_zero_tables_stall` must be strictly greater than
/// `num_level_zero_tables`; `LevelController::open` asserts this.
#[derive(Clone)]
pub struct Options {
    /// Directory holding table files and the manifest.
    pub dir: PathBuf,

    /// Number of levels, L0 included (>= 2).
    pub max_levels: usize,

    /// L0 table count that makes L0 eligible for compaction.
    pub num_level_zero_tables: usize,

    /// L0 table count at which foreground installs stall.
    pub num_level_zero_tables_stall: usize,

    /// Target size of L1 in bytes. Each deeper level is the previous level's
    /// target multiplied by `level_size_multiplier`.
    pub level_one_size: i64,

    /// Growth factor between adjacent level targets (typically 10).
    pub level_size_multiplier: i64,

    /// File size cap for tables produced by compaction.
    pub max_table_size: i64,

    /// Target size of one table data block.
    pub table_block_size: usize,

    /// Number of background compaction workers.
    pub num_compactors: usize,

    /// Test/debug knob: workers return immediately without compacting.
    pub do_not_compact: bool,

    /// Block compression per level; levels past the end of the vector use
    /// `CompressionType::None`.
    pub compression_per_level: Vec<CompressionType>,

    /// Open table files without write capability.
    pub read_only: bool,

    /// Overlapping next-level tables at or above this size that no top table
    /// actually intersects are left in place instead of being rewritten.
    pub min_skipped_table_size: i64,

    /// Cap on `top + bot` bytes when expanding a compaction seed.
    pub max_compaction_expand_size: i64,

    /// Compaction write throughput cap in bytes per second; 0 is unlimited.
    pub rate_bytes_per_sec: u64,

    /// Optional compaction filter plug-in, created once per compaction for
    /// the destination level and key span.
    pub compaction_filter_factory: Option<Arc<dyn CompactionFilterFactory>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            max_levels: 7,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 10,
            level_one_size: 256 * 1024 * 1024,
            level_size_multiplier: 10,
            max_table_size: 64 * 1024 * 1024,
            table_block_size: 4 * 1024,
            num_compactors: 3,
            do_not_compact: false,
            compression_per_level: Vec::new(),
            read_only: false,
            min_skipped_table_size: 1024 * 1024,
            max_compaction_expand_size: 1 << 30,
            rate_bytes_per_sec: 0,
            compaction_filter_factory: None,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn max_levels(mut self, n: usize) -> Self {
        self.max_levels = n;
        self
    }

    pub fn num_level_zero_tables(mut self, n: usize) -> Self {
        self.num_level_zero_tables = n;
        self
    }

    pub fn num_level_zero_tables_stall(mut self, n: usize) -> Self {
        self.num_level_zero_tables_stall = n;
        self
    }

    pub fn level_one_size(mut self, bytes: i64) -> Self {
        self.level_one_size = bytes;
        self
    }

    pub fn level_size_multiplier(mut self, factor: i64) -> Self {
        self.level_size_multiplier = factor;
        self
    }

    pub fn max_table_size(mut self, bytes: i64) -> Self {
        self.max_table_size = bytes;
        self
    }

    pub fn table_block_size(mut self, bytes: usize) -> Self {
        self.table_block_size = bytes;
        self
    }

    pub fn num_compactors(mut self, n: usize) -> Self {
        self.num_compactors = n;
        self
    }

    pub fn do_not_compact(mut self, v: bool) -> Self {
        self.do_not_compact = v;
        self
    }

    pub fn compression_per_level(mut self, kinds: Vec<CompressionType>) -> Self {
        self.compression_per_level = kinds;
        self
    }

    pub fn read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    pub fn min_skipped_table_size(mut self, bytes: i64) -> Self {
        self.min_skipped_table_size = bytes;
        self
    }

    pub fn max_compaction_expand_size(mut self, bytes: i64) -> Self {
        self.max_compaction_expand_size = bytes;
        self
    }

    pub fn rate_bytes_per_sec(mut self, bytes: u64) -> Self {
        self.rate_bytes_per_sec = bytes;
        self
    }

    pub fn compaction_filter_factory(
        mut self,
        factory: Arc<dyn CompactionFilterFactory>,
    ) -> Self {
        self.compaction_filter_factory = Some(factory);
        self
    }

    /// Compression for tables written to `level`.
    pub fn compression_at(&self, level: usize) -> CompressionType {
        self.compression_per_level
            .get(level)
            .copied()
            .unwrap_or(CompressionType::None)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("dir", &self.dir)
            .field("max_levels", &self.max_levels)
            .field("num_level_zero_tables", &self.num_level_zero_tables)
            .field(
                "num_level_zero_tables_stall",
                &self.num_level_zero_tables_stall,
            )
            .field("level_one_size", &self.level_one_size)
            .field("level_size_multiplier", &self.level_size_multiplier)
            .field("max_table_size", &self.max_table_size)
            .field("num_compactors", &self.num_compactors)
            .field("do_not_compact", &self.do_not_compact)
            .field("read_only", &self.read_only)
            .field(
                "has_compaction_filter",
                &self.compaction_filter_factory.is_some(),
            )
            .finish()
    }
}
