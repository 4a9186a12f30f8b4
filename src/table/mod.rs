//! Immutable sorted table files (SSTs).
//!
//! ## File Layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |   entries, sorted by (user_key asc, version desc),
//! +-------------------+   optionally Snappy-compressed per block
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Index Block       |   first key + offset + length per data block
//! +-------------------+
//! | Bloom Block       |   user-key hash filter
//! +-------------------+
//! | Properties        |   smallest/biggest key
//! +-------------------+
//! | Footer (fixed)    |   section handles, entry count, magic
//! +-------------------+
//! ```
//!
//! A [`Table`] is a cheap-clone handle over the open file. Blocks are fetched
//! with positional reads, so any number of readers share the handle without
//! seek races. `delete()` marks the file for removal; the unlink happens when
//! the last handle drops, which the epoch manager defers past every reader
//! that could still hold the table in a level snapshot.

pub mod bloom;
pub mod builder;
pub mod iterator;

use std::fs::File;
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;

use crate::config::CompressionType;
use crate::error::{Error, Result};
use crate::format::{Key, ValueStruct};
use bloom::BloomFilter;
use iterator::{KvIterator, TableIterator};

pub(crate) const FOOTER_SIZE: usize = 48;
pub(crate) const MAGIC: u32 = 0x454d_4252;

/// Path of the table file with the given id.
pub fn new_filename(id: u64, dir: &Path) -> PathBuf {
    dir.join(format!("{id:08}.sst"))
}

/// Table id encoded in a file name, if the name is a table file's.
pub fn parse_file_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".sst")?;
    stem.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub first_key: Key,
    pub offset: u64,
    pub len: u32,
}

/// A shared handle to one open table.
#[derive(Clone)]
pub struct Table {
    core: Arc<TableCore>,
}

pub(crate) struct TableCore {
    id: u64,
    path: PathBuf,
    file: File,
    size: i64,
    smallest: Key,
    biggest: Key,
    entry_count: u64,
    index: Vec<BlockHandle>,
    bloom: BloomFilter,
    compression: CompressionType,
    compacting: AtomicBool,
    delete_on_drop: AtomicBool,
}

impl Drop for TableCore {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::SeqCst) {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(table_id = self.id, error = %err, "failed to remove table file");
            }
        }
    }
}

impl Table {
    /// Open a table file. The compression kind comes from the manifest entry
    /// that created the table.
    pub fn open(path: &Path, compression: CompressionType) -> Result<Table> {
        let id = parse_file_id(path)
            .ok_or_else(|| crate::errdata!("not a table file name: {}", path.display()))?;
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if (size as usize) < FOOTER_SIZE {
            return Err(crate::errdata!(
                "table {id} too short: {size} bytes"
            ));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE as u64)?;
        let mut cursor = Cursor::new(&footer[..]);
        let index_offset = cursor.read_u64::<BigEndian>()?;
        let index_len = cursor.read_u32::<BigEndian>()? as usize;
        let bloom_offset = cursor.read_u64::<BigEndian>()?;
        let bloom_len = cursor.read_u32::<BigEndian>()? as usize;
        let props_offset = cursor.read_u64::<BigEndian>()?;
        let props_len = cursor.read_u32::<BigEndian>()? as usize;
        let entry_count = cursor.read_u64::<BigEndian>()?;
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(crate::errdata!("table {id} bad magic {magic:#x}"));
        }

        let mut index_buf = vec![0u8; index_len];
        file.read_exact_at(&mut index_buf, index_offset)?;
        let index = decode_index(&index_buf)?;

        let mut bloom_buf = vec![0u8; bloom_len];
        file.read_exact_at(&mut bloom_buf, bloom_offset)?;
        let bloom = BloomFilter::read_from(&mut bloom_buf.as_slice())?;

        let mut props_buf = vec![0u8; props_len];
        file.read_exact_at(&mut props_buf, props_offset)?;
        let (smallest, biggest) = decode_props(&props_buf)?;

        Ok(Table {
            core: Arc::new(TableCore {
                id,
                path: path.to_path_buf(),
                file,
                size: size as i64,
                smallest,
                biggest,
                entry_count,
                index,
                bloom,
                compression,
                compacting: AtomicBool::new(false),
                delete_on_drop: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn size(&self) -> i64 {
        self.core.size
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn entry_count(&self) -> u64 {
        self.core.entry_count
    }

    pub fn compression_type(&self) -> CompressionType {
        self.core.compression
    }

    /// Smallest key in the table; empty for a table with no entries.
    pub fn smallest(&self) -> &Key {
        &self.core.smallest
    }

    pub fn biggest(&self) -> &Key {
        &self.core.biggest
    }

    pub fn mark_compacting(&self, v: bool) {
        self.core.compacting.store(v, Ordering::SeqCst);
    }

    pub fn is_compacting(&self) -> bool {
        self.core.compacting.load(Ordering::SeqCst)
    }

    /// Mark the file for removal once the last handle drops.
    pub fn delete(&self) {
        self.core.delete_on_drop.store(true, Ordering::SeqCst);
    }

    /// Bloom pre-check with a caller-computed user-key hash.
    pub fn may_contain_hash(&self, hash: u64) -> bool {
        self.core.bloom.may_contain_hash(hash)
    }

    /// Newest entry for `key.user_key` with version <= `key.version`.
    pub fn get(&self, key: &Key) -> Result<Option<ValueStruct>> {
        if key.user_key < self.core.smallest.user_key
            || key.user_key > self.core.biggest.user_key
        {
            return Ok(None);
        }
        let mut it = self.iter(false);
        it.seek(key)?;
        if it.valid() && it.key().same_user_key(key) {
            let mut vs = it.value();
            vs.version = it.key().version;
            Ok(Some(vs))
        } else {
            Ok(None)
        }
    }

    /// Whether the table holds user keys within `[lo, hi]` (`[lo, hi)` when
    /// `inclusive` is false).
    pub fn has_overlap(&self, lo: &Key, hi: &Key, inclusive: bool) -> Result<bool> {
        if hi.user_key < self.core.smallest.user_key
            || lo.user_key > self.core.biggest.user_key
        {
            return Ok(false);
        }
        let mut it = self.iter(false);
        it.seek(&lo.min_version())?;
        if !it.valid() {
            return Ok(false);
        }
        let uk = &it.key().user_key;
        if *uk < hi.user_key {
            Ok(true)
        } else {
            Ok(*uk == hi.user_key && inclusive)
        }
    }

    pub fn iter(&self, reversed: bool) -> TableIterator {
        TableIterator::new(self.clone(), reversed)
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.core.index.len()
    }

    pub(crate) fn block_handle(&self, idx: usize) -> &BlockHandle {
        &self.core.index[idx]
    }

    /// Read and decode data block `idx`.
    pub(crate) fn read_block(&self, idx: usize) -> Result<Vec<(Key, ValueStruct)>> {
        let handle = &self.core.index[idx];
        let mut buf = vec![0u8; handle.len as usize];
        self.core.file.read_exact_at(&mut buf, handle.offset)?;
        let raw = match self.core.compression {
            CompressionType::None => buf,
            CompressionType::Snappy => snap::raw::Decoder::new()
                .decompress_vec(&buf)
                .map_err(|e| crate::errdata!("table {}: snappy block: {e}", self.core.id))?,
        };
        decode_entries(&raw)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.core.id)
            .field("size", &self.core.size)
            .field("smallest", &self.core.smallest)
            .field("biggest", &self.core.biggest)
            .finish()
    }
}

/// Entry wire format inside a raw data block.
pub(crate) fn encode_entry(buf: &mut Vec<u8>, key: &Key, vs: &ValueStruct) {
    buf.extend_from_slice(&(key.user_key.len() as u16).to_be_bytes());
    buf.extend_from_slice(&key.user_key);
    buf.extend_from_slice(&key.version.to_be_bytes());
    buf.push(vs.meta);
    buf.push(vs.user_meta.len() as u8);
    buf.extend_from_slice(&vs.user_meta);
    buf.extend_from_slice(&vs.expires_at.to_be_bytes());
    buf.extend_from_slice(&(vs.value.len() as u32).to_be_bytes());
    buf.extend_from_slice(&vs.value);
}

pub(crate) fn encoded_entry_size(key: &Key, vs: &ValueStruct) -> usize {
    2 + key.user_key.len() + 8 + vs.encoded_size()
}

pub(crate) fn decode_entries(raw: &[u8]) -> Result<Vec<(Key, ValueStruct)>> {
    let mut entries = Vec::new();
    let mut cursor = Cursor::new(raw);
    while (cursor.position() as usize) < raw.len() {
        let key_len = cursor.read_u16::<BigEndian>()? as usize;
        let pos = cursor.position() as usize;
        check_len(raw, pos, key_len)?;
        let user_key = Bytes::copy_from_slice(&raw[pos..pos + key_len]);
        cursor.set_position((pos + key_len) as u64);
        let version = cursor.read_u64::<BigEndian>()?;

        let meta = cursor.read_u8()?;
        let user_meta_len = cursor.read_u8()? as usize;
        let pos = cursor.position() as usize;
        check_len(raw, pos, user_meta_len)?;
        let user_meta = Bytes::copy_from_slice(&raw[pos..pos + user_meta_len]);
        cursor.set_position((pos + user_meta_len) as u64);
        let expires_at = cursor.read_u64::<BigEndian>()?;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        let pos = cursor.position() as usize;
        check_len(raw, pos, value_len)?;
        let value = Bytes::copy_from_slice(&raw[pos..pos + value_len]);
        cursor.set_position((pos + value_len) as u64);

        entries.push((
            Key { user_key, version },
            ValueStruct {
                meta,
                user_meta,
                expires_at,
                value,
                version,
            },
        ));
    }
    Ok(entries)
}

fn check_len(raw: &[u8], pos: usize, len: usize) -> Result<()> {
    if pos + len > raw.len() {
        return Err(crate::errdata!("block entry out of bounds"));
    }
    Ok(())
}

pub(crate) fn encode_index(index: &[BlockHandle]) -> Vec<u8> {
    let mut buf = Vec::new();
    for handle in index {
        buf.extend_from_slice(&(handle.first_key.user_key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&handle.first_key.user_key);
        buf.extend_from_slice(&handle.first_key.version.to_be_bytes());
        buf.extend_from_slice(&handle.offset.to_be_bytes());
        buf.extend_from_slice(&handle.len.to_be_bytes());
    }
    buf
}

fn decode_index(buf: &[u8]) -> Result<Vec<BlockHandle>> {
    let mut index = Vec::new();
    let mut cursor = Cursor::new(buf);
    while (cursor.position() as usize) < buf.len() {
        let key_len = cursor.read_u16::<BigEndian>()? as usize;
        let pos = cursor.position() as usize;
        check_len(buf, pos, key_len)?;
        let user_key = Bytes::copy_from_slice(&buf[pos..pos + key_len]);
        cursor.set_position((pos + key_len) as u64);
        let version = cursor.read_u64::<BigEndian>()?;
        let offset = cursor.read_u64::<BigEndian>()?;
        let len = cursor.read_u32::<BigEndian>()?;
        index.push(BlockHandle {
            first_key: Key { user_key, version },
            offset,
            len,
        });
    }
    Ok(index)
}

pub(crate) fn encode_props(smallest: &Key, biggest: &Key) -> Vec<u8> {
    let mut buf = Vec::new();
    for key in [smallest, biggest] {
        buf.extend_from_slice(&(key.user_key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&key.user_key);
        buf.extend_from_slice(&key.version.to_be_bytes());
    }
    buf
}

fn decode_props(buf: &[u8]) -> Result<(Key, Key)> {
    let mut cursor = Cursor::new(buf);
    let mut keys = Vec::with_capacity(2);
    for _ in 0..2 {
        let key_len = cursor.read_u16::<BigEndian>()? as usize;
        let pos = cursor.position() as usize;
        check_len(buf, pos, key_len)?;
        let user_key = Bytes::copy_from_slice(&buf[pos..pos + key_len]);
        cursor.set_position((pos + key_len) as u64);
        let version = cursor.read_u64::<BigEndian>()?;
        keys.push(Key { user_key, version });
    }
    let biggest = keys.pop().expect("two keys");
    let smallest = keys.pop().expect("two keys");
    Ok((smallest, biggest))
}

impl From<snap::Error> for Error {
    fn from(err: snap::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::builder::TableBuilder;
    use super::*;
    use crate::config::Options;
    use crate::rate::RateLimiter;
    use std::sync::Arc;

    /// Build a table file from sorted `(key, value)` pairs and open it.
    pub(crate) fn build_table(
        dir: &Path,
        id: u64,
        opts: &Options,
        level: usize,
        entries: &[(Key, ValueStruct)],
    ) -> Result<Table> {
        let path = new_filename(id, dir);
        let file = File::create(&path)?;
        let limiter = Arc::new(RateLimiter::unlimited());
        let mut builder = TableBuilder::new(file, limiter, level, opts);
        for (key, vs) in entries {
            builder.add(key, vs)?;
        }
        builder.finish()?;
        Table::open(&path, opts.compression_at(level))
    }

    pub(crate) fn kv(user_key: &str, version: u64, value: &str) -> (Key, ValueStruct) {
        (
            Key::new(user_key.as_bytes().to_vec(), version),
            ValueStruct::new(value.as_bytes().to_vec()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::{build_table, kv};
    use super::*;
    use crate::config::Options;
    use crate::format::hash_user_key;
    use tempfile::TempDir;

    fn sorted(mut entries: Vec<(Key, ValueStruct)>) -> Vec<(Key, ValueStruct)> {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    #[test]
    fn test_build_open_get() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let entries = sorted(vec![
            kv("alpha", 3, "a3"),
            kv("alpha", 1, "a1"),
            kv("beta", 2, "b2"),
            kv("gamma", 7, "g7"),
        ]);
        let table = build_table(dir.path(), 1, &opts, 1, &entries)?;

        assert_eq!(table.id(), 1);
        assert_eq!(table.entry_count(), 4);
        assert_eq!(table.smallest().user_key.as_ref(), b"alpha");
        assert_eq!(table.biggest().user_key.as_ref(), b"gamma");

        // Newest visible version wins.
        let vs = table.get(&Key::new(&b"alpha"[..], u64::MAX))?.unwrap();
        assert_eq!(vs.value.as_ref(), b"a3");
        assert_eq!(vs.version, 3);

        // Snapshot read below the newest version.
        let vs = table.get(&Key::new(&b"alpha"[..], 2))?.unwrap();
        assert_eq!(vs.value.as_ref(), b"a1");

        assert!(table.get(&Key::new(&b"delta"[..], u64::MAX))?.is_none());
        Ok(())
    }

    #[test]
    fn test_bloom_rejects_absent_key() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let entries = sorted((0..100).map(|i| kv(&format!("key_{i:03}"), 1, "v")).collect());
        let table = build_table(dir.path(), 2, &opts, 1, &entries)?;

        assert!(table.may_contain_hash(hash_user_key(b"key_042")));
        let misses = (0..100)
            .filter(|i| !table.may_contain_hash(hash_user_key(format!("no_{i}").as_bytes())))
            .count();
        assert!(misses > 90);
        Ok(())
    }

    #[test]
    fn test_snappy_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path())
            .compression_per_level(vec![CompressionType::None, CompressionType::Snappy]);
        let entries = sorted(
            (0..500)
                .map(|i| kv(&format!("key_{i:05}"), 1, &"x".repeat(100)))
                .collect(),
        );
        let table = build_table(dir.path(), 3, &opts, 1, &entries)?;
        assert_eq!(table.compression_type(), CompressionType::Snappy);
        assert!(table.num_blocks() > 1);

        let vs = table.get(&Key::new(&b"key_00250"[..], u64::MAX))?.unwrap();
        assert_eq!(vs.value.len(), 100);
        Ok(())
    }

    #[test]
    fn test_has_overlap() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let entries = sorted(vec![kv("d", 1, "v"), kv("f", 1, "v"), kv("h", 1, "v")]);
        let table = build_table(dir.path(), 4, &opts, 1, &entries)?;

        let key = |s: &str| Key::new(s.as_bytes().to_vec(), 1);
        assert!(table.has_overlap(&key("a"), &key("e"), true)?);
        assert!(table.has_overlap(&key("h"), &key("z"), true)?);
        // Range [a, d) excludes the boundary key.
        assert!(!table.has_overlap(&key("a"), &key("d"), false)?);
        assert!(table.has_overlap(&key("a"), &key("d"), true)?);
        // Gap between stored keys still counts: "e" is absent but "f" is in
        // range.
        assert!(table.has_overlap(&key("e"), &key("g"), true)?);
        // Disjoint on either side.
        assert!(!table.has_overlap(&key("a"), &key("c"), true)?);
        assert!(!table.has_overlap(&key("i"), &key("z"), true)?);
        Ok(())
    }

    #[test]
    fn test_delete_on_last_drop() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let table = build_table(dir.path(), 5, &opts, 1, &sorted(vec![kv("k", 1, "v")]))?;
        let path = table.path().to_path_buf();

        let clone = table.clone();
        table.delete();
        drop(table);
        assert!(path.exists(), "file must outlive remaining handles");
        drop(clone);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_filename_roundtrip() {
        let dir = Path::new("/data");
        let path = new_filename(42, dir);
        assert_eq!(path, Path::new("/data/00000042.sst"));
        assert_eq!(parse_file_id(&path), Some(42));
        assert_eq!(parse_file_id(Path::new("/data/MANIFEST")), None);
    }
}
