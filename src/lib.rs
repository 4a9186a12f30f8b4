//! # emberdb: leveled-compaction core
//!
//! The level structure, compaction policy and compaction execution of an
//! LSM-tree storage engine. Flushed tables enter L0 through
//! [`LevelController::add_level_0_table`]; background workers started by
//! [`LevelController::start_compact`] merge tables down the levels, applying
//! MVCC visibility rules, compaction filters and prefix guards, while a
//! durable manifest keeps table ownership crash-consistent.
//!
//! The write-ahead log, memtables and transactions sit above this crate;
//! they hand over immutable tables and a read-timestamp watermark
//! ([`LevelController::set_compact_safe_ts`]) and otherwise stay out of the
//! way.

pub mod closer;
pub mod config;
pub mod epoch;
pub mod error;
pub mod filter;
pub mod format;
pub mod levels;
pub mod manifest;
pub mod rate;
pub mod table;

pub use config::{CompressionType, Options};
pub use epoch::ResourceManager;
pub use error::{Error, Result};
pub use format::{Key, ValueStruct};
pub use levels::{CompactionStats, DiscardStats, LevelController, TableInfo};
pub use manifest::{HeadInfo, Manifest, ManifestChange};
