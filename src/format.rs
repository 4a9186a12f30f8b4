//! Key and value representations shared across levels, tables and iterators.
//!
//! A key is `(user_key, version)`. Ordering is lexicographic on the user key
//! ascending, then on the version **descending**, so that within one user key
//! the newest version sorts first. Iterators, level invariants and the merge
//! heap all rely on this ordering.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, Bytes};

/// Entry is a tombstone; it shadows older versions of the same user key.
pub const BIT_DELETE: u8 = 1 << 0;
/// Entry's value is a blob pointer into the value log, not an inline value.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;

/// A versioned key.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    pub user_key: Bytes,
    pub version: u64,
}

impl Key {
    pub fn new(user_key: impl Into<Bytes>, version: u64) -> Self {
        Self {
            user_key: user_key.into(),
            version,
        }
    }

    /// The empty key; sorts before every real key and doubles as "unset".
    pub fn is_empty(&self) -> bool {
        self.user_key.is_empty()
    }

    pub fn same_user_key(&self, other: &Key) -> bool {
        self.user_key == other.user_key
    }

    /// Widen to the smallest key of this user key (all versions included).
    pub fn min_version(&self) -> Key {
        Key::new(self.user_key.clone(), u64::MAX)
    }

    /// Widen to the largest key of this user key (all versions included).
    pub fn max_version(&self) -> Key {
        Key::new(self.user_key.clone(), 0)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            String::from_utf8_lossy(&self.user_key),
            self.version
        )
    }
}

/// A stored value with its metadata.
///
/// `version` mirrors the key's version; readers get it filled in so callers
/// can reason about visibility without carrying the key alongside.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ValueStruct {
    pub meta: u8,
    pub user_meta: Bytes,
    pub expires_at: u64,
    pub value: Bytes,
    pub version: u64,
}

impl ValueStruct {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn tombstone() -> Self {
        Self {
            meta: BIT_DELETE,
            ..Default::default()
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    pub fn is_value_pointer(&self) -> bool {
        self.meta & BIT_VALUE_POINTER != 0
    }

    /// Size of the encoded form inside a table block.
    pub fn encoded_size(&self) -> usize {
        // meta + user_meta len + user_meta + expires_at + value len + value
        1 + 1 + self.user_meta.len() + 8 + 4 + self.value.len()
    }
}

impl fmt::Debug for ValueStruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueStruct")
            .field("meta", &self.meta)
            .field("version", &self.version)
            .field("value_len", &self.value.len())
            .finish()
    }
}

/// A pointer into the value log, stored in place of large values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobPointer {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl BlobPointer {
    pub const ENCODED_LEN: usize = 16;

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            file_id: buf.get_u32(),
            offset: buf.get_u64(),
            len: buf.get_u32(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.file_id.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
        Bytes::from(out)
    }
}

/// FNV-1a hash of a user key, shared by bloom insertion and probes so the
/// read path can hash once per lookup.
pub fn hash_user_key(key: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
