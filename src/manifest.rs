//! Durable manifest of table files and their levels.
//!
//! The manifest is a WAL for database structure rather than user data: an
//! append-only log of change sets describing which table files exist, at
//! which level, and with which compression. Compactions persist their whole
//! change set in one record **before** any level mutation or file deletion,
//! so the manifest is always the authority on crash recovery.
//!
//! # File Format
//!
//! ```text
//! +--------------------+
//! | Header (16 bytes)  |  magic, format version
//! +--------------------+
//! | ChangeSet 1        |  len: u32 | payload | crc32: u32
//! +--------------------+
//! | ChangeSet 2        |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! Every record carries a CRC32 checksum; a mismatch or a truncated tail
//! fails the open, because a manifest that cannot be trusted means table
//! ownership cannot be established.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::config::CompressionType;
use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MANIFEST_FILE: &str = "MANIFEST";
const HEADER_SIZE: usize = 16;
const MANIFEST_MAGIC: u32 = 0x454d_424d;
const FORMAT_VERSION: u32 = 1;

const TAG_CREATE: u8 = 0x01;
const TAG_DELETE: u8 = 0x02;
const TAG_MOVE_DOWN: u8 = 0x03;

/// Watermark of the write-ahead subsystem, persisted alongside foreground L0
/// installs so recovery knows where the log has been made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadInfo {
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestChange {
    Create {
        id: u64,
        level: u32,
        compression: CompressionType,
    },
    Delete {
        id: u64,
    },
    MoveDown {
        id: u64,
        new_level: u32,
    },
}

/// Per-table manifest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableManifest {
    pub level: u32,
    pub compression: CompressionType,
}

/// In-memory view of the manifest, rebuilt by replay at open.
#[derive(Debug, Clone, Default)]
pub struct ManifestState {
    pub tables: HashMap<u64, TableManifest>,
    pub head: Option<HeadInfo>,
}

impl ManifestState {
    fn apply(&mut self, change: &ManifestChange) -> Result<()> {
        match *change {
            ManifestChange::Create {
                id,
                level,
                compression,
            } => {
                if self.tables.contains_key(&id) {
                    return Err(crate::errdata!("manifest already contains table {id}"));
                }
                self.tables.insert(id, TableManifest { level, compression });
            }
            ManifestChange::Delete { id } => {
                if self.tables.remove(&id).is_none() {
                    return Err(crate::errdata!("manifest delete of unknown table {id}"));
                }
            }
            ManifestChange::MoveDown { id, new_level } => match self.tables.get_mut(&id) {
                Some(tm) => tm.level = new_level,
                None => {
                    return Err(crate::errdata!("manifest move of unknown table {id}"));
                }
            },
        }
        Ok(())
    }
}

pub struct Manifest {
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    path: PathBuf,
    state: ManifestState,
}

impl Manifest {
    /// Open or create the manifest in `dir` and replay it.
    pub fn open(dir: &Path) -> Result<Manifest> {
        let path = dir.join(MANIFEST_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut state = ManifestState::default();
        if len == 0 {
            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.write_u32::<BigEndian>(MANIFEST_MAGIC)?;
            header.write_u32::<BigEndian>(FORMAT_VERSION)?;
            header.write_u64::<BigEndian>(0)?;
            file.write_all(&header)?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; HEADER_SIZE];
            file.read_exact(&mut header)?;
            let mut cursor = Cursor::new(&header[..]);
            if cursor.read_u32::<BigEndian>()? != MANIFEST_MAGIC {
                return Err(crate::errdata!("bad manifest magic"));
            }
            let version = cursor.read_u32::<BigEndian>()?;
            if version != FORMAT_VERSION {
                return Err(crate::errdata!("unsupported manifest version {version}"));
            }
            state = replay(&mut file)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Manifest {
            inner: Mutex::new(Inner { file, path, state }),
        })
    }

    /// Persist one change set atomically: applied to the in-memory state,
    /// appended as a single CRC-framed record, then fsynced.
    pub fn add_changes(
        &self,
        changes: Vec<ManifestChange>,
        head: Option<HeadInfo>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        // Validate against a scratch copy first so a rejected change set
        // leaves both memory and disk untouched.
        let mut next = inner.state.clone();
        for change in &changes {
            next.apply(change)?;
        }
        if head.is_some() {
            next.head = head;
        }

        let payload = encode_change_set(&changes, head);
        let mut record = Vec::with_capacity(payload.len() + 8);
        record.write_u32::<BigEndian>(payload.len() as u32)?;
        record.extend_from_slice(&payload);
        record.write_u32::<BigEndian>(CRC32.checksum(&payload))?;

        inner.file.write_all(&record)?;
        inner.file.sync_all()?;
        inner.state = next;
        Ok(())
    }

    /// Snapshot of the replayed state.
    pub fn state(&self) -> ManifestState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }
}

fn encode_change_set(changes: &[ManifestChange], head: Option<HeadInfo>) -> Vec<u8> {
    let mut buf = Vec::new();
    match head {
        Some(h) => {
            buf.push(1);
            buf.extend_from_slice(&h.version.to_be_bytes());
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&(changes.len() as u32).to_be_bytes());
    for change in changes {
        match *change {
            ManifestChange::Create {
                id,
                level,
                compression,
            } => {
                buf.push(TAG_CREATE);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&level.to_be_bytes());
                buf.push(compression.to_byte());
            }
            ManifestChange::Delete { id } => {
                buf.push(TAG_DELETE);
                buf.extend_from_slice(&id.to_be_bytes());
            }
            ManifestChange::MoveDown { id, new_level } => {
                buf.push(TAG_MOVE_DOWN);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&new_level.to_be_bytes());
            }
        }
    }
    buf
}

fn decode_change_set(payload: &[u8]) -> Result<(Vec<ManifestChange>, Option<HeadInfo>)> {
    let mut cursor = Cursor::new(payload);
    let head = match cursor.read_u8()? {
        0 => None,
        1 => Some(HeadInfo {
            version: cursor.read_u64::<BigEndian>()?,
        }),
        other => return Err(crate::errdata!("bad head flag {other}")),
    };
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut changes = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let id = cursor.read_u64::<BigEndian>()?;
        let change = match tag {
            TAG_CREATE => {
                let level = cursor.read_u32::<BigEndian>()?;
                let compression = CompressionType::from_byte(cursor.read_u8()?)
                    .ok_or_else(|| crate::errdata!("bad compression byte for table {id}"))?;
                ManifestChange::Create {
                    id,
                    level,
                    compression,
                }
            }
            TAG_DELETE => ManifestChange::Delete { id },
            TAG_MOVE_DOWN => ManifestChange::MoveDown {
                id,
                new_level: cursor.read_u32::<BigEndian>()?,
            },
            other => return Err(crate::errdata!("invalid manifest change tag {other}")),
        };
        changes.push(change);
    }
    Ok((changes, head))
}

fn replay(file: &mut File) -> Result<ManifestState> {
    let mut state = ManifestState::default();
    loop {
        let len = match file.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(e)),
        };
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)
            .map_err(|_| crate::errdata!("truncated manifest record"))?;
        let stored = file
            .read_u32::<BigEndian>()
            .map_err(|_| crate::errdata!("truncated manifest checksum"))?;
        if CRC32.checksum(&payload) != stored {
            return Err(crate::errdata!("manifest checksum mismatch"));
        }
        let (changes, head) = decode_change_set(&payload)?;
        for change in &changes {
            state.apply(change)?;
        }
        if head.is_some() {
            state.head = head;
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create(id: u64, level: u32) -> ManifestChange {
        ManifestChange::Create {
            id,
            level,
            compression: CompressionType::None,
        }
    }

    #[test]
    fn test_open_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path())?;
        assert!(manifest.state().tables.is_empty());
        assert!(manifest.state().head.is_none());
        Ok(())
    }

    #[test]
    fn test_create_delete_movedown_replay() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let manifest = Manifest::open(dir.path())?;
            manifest.add_changes(vec![create(1, 0), create(2, 0)], None)?;
            manifest.add_changes(
                vec![
                    ManifestChange::Delete { id: 1 },
                    create(3, 1),
                ],
                None,
            )?;
            manifest.add_changes(vec![ManifestChange::MoveDown { id: 3, new_level: 2 }], None)?;
        }

        let manifest = Manifest::open(dir.path())?;
        let state = manifest.state();
        assert_eq!(state.tables.len(), 2);
        assert_eq!(state.tables[&2].level, 0);
        assert_eq!(state.tables[&3].level, 2);
        assert!(!state.tables.contains_key(&1));
        Ok(())
    }

    #[test]
    fn test_head_info_persists() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let manifest = Manifest::open(dir.path())?;
            manifest.add_changes(vec![create(1, 0)], Some(HeadInfo { version: 42 }))?;
            manifest.add_changes(vec![create(2, 0)], None)?;
        }
        let manifest = Manifest::open(dir.path())?;
        assert_eq!(manifest.state().head, Some(HeadInfo { version: 42 }));
        Ok(())
    }

    #[test]
    fn test_rejected_change_set_leaves_state_untouched() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = Manifest::open(dir.path())?;
        manifest.add_changes(vec![create(1, 0)], None)?;

        // Second create of the same id is invalid; the valid first change in
        // the same set must not leak either.
        let err = manifest.add_changes(vec![create(2, 0), create(1, 1)], None);
        assert!(err.is_err());
        let state = manifest.state();
        assert_eq!(state.tables.len(), 1);
        assert!(!state.tables.contains_key(&2));
        Ok(())
    }

    #[test]
    fn test_checksum_corruption_fails_open() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let manifest = Manifest::open(dir.path())?;
            manifest.add_changes(vec![create(1, 0)], None)?;
        }
        // Flip the last checksum byte.
        let path = dir.path().join(MANIFEST_FILE);
        let mut data = std::fs::read(&path)?;
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data)?;

        assert!(matches!(
            Manifest::open(dir.path()),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_tail_fails_open() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let manifest = Manifest::open(dir.path())?;
            manifest.add_changes(vec![create(1, 0), create(2, 0)], None)?;
        }
        let path = dir.path().join(MANIFEST_FILE);
        let len = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 3)?;

        assert!(matches!(
            Manifest::open(dir.path()),
            Err(Error::InvalidData(_))
        ));
        Ok(())
    }

    #[test]
    fn test_compression_recorded() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let manifest = Manifest::open(dir.path())?;
            manifest.add_changes(
                vec![ManifestChange::Create {
                    id: 7,
                    level: 1,
                    compression: CompressionType::Snappy,
                }],
                None,
            )?;
        }
        let manifest = Manifest::open(dir.path())?;
        assert_eq!(
            manifest.state().tables[&7].compression,
            CompressionType::Snappy
        );
        Ok(())
    }
}
