use std::fmt::Display;
use std::io;

/// Errors surfaced by the compaction core.
///
/// Range-claim races are deliberately not represented here: a failed claim is
/// an ordinary outcome of planning, reported as `false` by the fill functions
/// and retried on the next worker tick.
#[derive(Debug)]
pub enum Error {
    /// The manifest references a table file that does not exist on disk.
    /// Fatal at open.
    FileMissing(u64),
    /// An I/O error during reads, writes or fsync. A compaction hitting this
    /// is aborted and its claimed ranges released; the worker backs off.
    Io(io::Error),
    /// Invalid on-disk data: decoding failures, checksum mismatches,
    /// truncated records.
    InvalidData(String),
    /// Post-open invariant checks failed (level ordering, duplicate table
    /// ids). Fatal at open.
    Validation(String),
    /// A write was attempted on a read-only store.
    ReadOnly,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::FileMissing(id) => write!(f, "file does not exist for table {id}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Validation(msg) => write!(f, "validation failed: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only store"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Constructs an Error::InvalidData from a format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
