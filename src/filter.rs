//! Compaction filter plug-in surface.
//!
//! A factory is invoked once per compaction with the destination level and
//! the key span being rewritten; the filter it returns judges each entry that
//! has fallen below the safe timestamp, and may supply prefix guards that
//! shape output file boundaries for locality.

use bytes::Bytes;

/// Verdict for one `(user_key, value, user_meta)` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep the entry as is.
    Keep,
    /// Drop the entry entirely.
    Drop,
    /// Drop the entry; if deeper levels still hold older versions, write a
    /// tombstone in its place so they stay shadowed.
    MarkTombstone,
}

/// A key-prefix hint directing compaction to produce tables aligned to the
/// prefix.
///
/// Keys sharing `prefix` are kept within guard-shaped files; once two
/// consecutive keys diverge within the first `match_len` bytes, the effective
/// file-size cap drops to `min_size` so the file can close on the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub prefix: Bytes,
    pub match_len: usize,
    pub min_size: i64,
}

pub trait CompactionFilter: Send {
    fn filter(&self, user_key: &[u8], value: &[u8], user_meta: &[u8]) -> Decision;

    /// Guards shaping the output of this compaction. Empty means no shaping.
    fn guards(&self) -> Vec<Guard> {
        Vec::new()
    }
}

pub trait CompactionFilterFactory: Send + Sync {
    fn create(
        &self,
        next_level: usize,
        smallest_user_key: &[u8],
        biggest_user_key: &[u8],
    ) -> Box<dyn CompactionFilter>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropOdd;

    impl CompactionFilter for DropOdd {
        fn filter(&self, user_key: &[u8], _value: &[u8], _user_meta: &[u8]) -> Decision {
            if user_key.last().map_or(false, |b| b % 2 == 1) {
                Decision::Drop
            } else {
                Decision::Keep
            }
        }
    }

    #[test]
    fn test_filter_object_safety() {
        let filter: Box<dyn CompactionFilter> = Box::new(DropOdd);
        assert_eq!(filter.filter(&[2], b"", b""), Decision::Keep);
        assert_eq!(filter.filter(&[3], b"", b""), Decision::Drop);
        assert!(filter.guards().is_empty());
    }
}
