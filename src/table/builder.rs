//! Table construction during compaction and flush.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use crate::config::{CompressionType, Options};
use crate::error::Result;
use crate::format::{hash_user_key, Key, ValueStruct};
use crate::rate::RateLimiter;

use super::bloom::BloomFilter;
use super::{encode_entry, encode_index, encode_props, encoded_entry_size, BlockHandle, MAGIC};

/// Streams sorted entries into one table file: data blocks as they fill,
/// then index, bloom, properties and footer on `finish`.
///
/// The rate limiter meters every block write, so a shared limiter caps the
/// aggregate compaction write throughput.
pub struct TableBuilder {
    file: File,
    compression: CompressionType,
    block_size: usize,
    limiter: Arc<RateLimiter>,

    block_buf: Vec<u8>,
    block_first_key: Option<Key>,
    index: Vec<BlockHandle>,
    bloom_hashes: Vec<u64>,
    offset: u64,

    smallest: Option<Key>,
    biggest: Option<Key>,
    entry_count: u64,
}

impl TableBuilder {
    pub fn new(file: File, limiter: Arc<RateLimiter>, level: usize, opts: &Options) -> Self {
        Self {
            file,
            compression: opts.compression_at(level),
            block_size: opts.table_block_size,
            limiter,
            block_buf: Vec::new(),
            block_first_key: None,
            index: Vec::new(),
            bloom_hashes: Vec::new(),
            offset: 0,
            smallest: None,
            biggest: None,
            entry_count: 0,
        }
    }

    /// Reuse the builder for the next output file of the same compaction.
    pub fn reset(&mut self, file: File) {
        self.file = file;
        self.block_buf.clear();
        self.block_first_key = None;
        self.index.clear();
        self.bloom_hashes.clear();
        self.offset = 0;
        self.smallest = None;
        self.biggest = None;
        self.entry_count = 0;
    }

    pub fn empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Bytes this table would occupy if finished now; the compaction loop
    /// compares it against the file cap and guard minimums.
    pub fn estimate_size(&self) -> i64 {
        (self.offset as usize + self.block_buf.len()) as i64
    }

    /// Append the next entry. Keys must arrive in table order.
    pub fn add(&mut self, key: &Key, vs: &ValueStruct) -> Result<()> {
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.biggest = Some(key.clone());

        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.clone());
        }
        encode_entry(&mut self.block_buf, key, vs);
        self.bloom_hashes.push(hash_user_key(&key.user_key));
        self.entry_count += 1;

        if self.block_buf.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// An upper bound on the size `add(key, vs)` would contribute.
    pub fn entry_size(key: &Key, vs: &ValueStruct) -> usize {
        encoded_entry_size(key, vs)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let payload = match self.compression {
            CompressionType::None => std::mem::take(&mut self.block_buf),
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new().compress_vec(&self.block_buf)?;
                self.block_buf.clear();
                compressed
            }
        };
        self.limiter.acquire(payload.len());
        self.file.write_all(&payload)?;
        self.index.push(BlockHandle {
            first_key: self.block_first_key.take().expect("non-empty block"),
            offset: self.offset,
            len: payload.len() as u32,
        });
        self.offset += payload.len() as u64;
        Ok(())
    }

    /// Write the trailing sections and fsync the file. The builder may be
    /// `reset` and reused afterwards.
    pub fn finish(&mut self) -> Result<()> {
        self.flush_block()?;

        let index_buf = encode_index(&self.index);
        let index_offset = self.offset;
        self.file.write_all(&index_buf)?;
        self.offset += index_buf.len() as u64;

        let bloom = BloomFilter::from_hashes(&self.bloom_hashes);
        let mut bloom_buf = Vec::with_capacity(bloom.serialized_size());
        bloom.write_to(&mut bloom_buf)?;
        let bloom_offset = self.offset;
        self.file.write_all(&bloom_buf)?;
        self.offset += bloom_buf.len() as u64;

        let empty = Key::default();
        let props_buf = encode_props(
            self.smallest.as_ref().unwrap_or(&empty),
            self.biggest.as_ref().unwrap_or(&empty),
        );
        let props_offset = self.offset;
        self.file.write_all(&props_buf)?;
        self.offset += props_buf.len() as u64;

        let mut footer = Vec::with_capacity(super::FOOTER_SIZE);
        footer.extend_from_slice(&index_offset.to_be_bytes());
        footer.extend_from_slice(&(index_buf.len() as u32).to_be_bytes());
        footer.extend_from_slice(&bloom_offset.to_be_bytes());
        footer.extend_from_slice(&(bloom_buf.len() as u32).to_be_bytes());
        footer.extend_from_slice(&props_offset.to_be_bytes());
        footer.extend_from_slice(&(props_buf.len() as u32).to_be_bytes());
        footer.extend_from_slice(&self.entry_count.to_be_bytes());
        footer.extend_from_slice(&MAGIC.to_be_bytes());
        self.file.write_all(&footer)?;

        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{new_filename, Table};
    use super::*;
    use tempfile::TempDir;

    fn make_builder(dir: &std::path::Path, id: u64, opts: &Options) -> Result<TableBuilder> {
        let file = File::create(new_filename(id, dir))?;
        Ok(TableBuilder::new(
            file,
            Arc::new(RateLimiter::unlimited()),
            1,
            opts,
        ))
    }

    #[test]
    fn test_estimate_tracks_growth() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let mut builder = make_builder(dir.path(), 1, &opts)?;

        assert!(builder.empty());
        assert_eq!(builder.estimate_size(), 0);

        let key = Key::new(&b"key"[..], 1);
        let vs = ValueStruct::new(&b"value"[..]);
        builder.add(&key, &vs)?;
        assert!(!builder.empty());
        assert_eq!(
            builder.estimate_size(),
            TableBuilder::entry_size(&key, &vs) as i64
        );
        Ok(())
    }

    #[test]
    fn test_reset_reuses_builder() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let mut builder = make_builder(dir.path(), 1, &opts)?;
        builder.add(&Key::new(&b"a"[..], 1), &ValueStruct::new(&b"v"[..]))?;
        builder.finish()?;

        builder.reset(File::create(new_filename(2, dir.path()))?);
        assert!(builder.empty());
        builder.add(&Key::new(&b"b"[..], 1), &ValueStruct::new(&b"w"[..]))?;
        builder.finish()?;

        let t1 = Table::open(&new_filename(1, dir.path()), CompressionType::None)?;
        let t2 = Table::open(&new_filename(2, dir.path()), CompressionType::None)?;
        assert_eq!(t1.smallest().user_key.as_ref(), b"a");
        assert_eq!(t2.smallest().user_key.as_ref(), b"b");
        Ok(())
    }

    #[test]
    fn test_empty_table_has_empty_smallest() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = Options::new(dir.path());
        let mut builder = make_builder(dir.path(), 1, &opts)?;
        builder.finish()?;

        let table = Table::open(&new_filename(1, dir.path()), CompressionType::None)?;
        assert!(table.smallest().is_empty());
        assert_eq!(table.entry_count(), 0);
        Ok(())
    }
}
