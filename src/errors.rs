//! Error types for the recovery engine.
//!
//! Only structural failures surface as [`Error`] values: an unreadable image,
//! an invalid superblock, a malformed ddrescue map or tree-cache file. Damage
//! inside the filesystem is never an error; it travels as `ok` flags on
//! views, extents and file nodes, and the scan keeps going.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying read or mmap failure on the image or a cache path.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock is unreadable or its magic number is invalid.
    ///
    /// Fatal at open time; nothing can be recovered without filesystem
    /// geometry.
    #[error("bad superblock: {0}")]
    BadSuperblock(&'static str),

    /// A malformed line in a ddrescue map or tree-cache file.
    #[error("parse error in {path} line {line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    /// A byte position outside the damage map's covered range.
    #[error("position {0:#x} is outside the mapped image range")]
    OutOfRange(u64),

    /// An inode number outside `[1, inode_count]`.
    #[error("invalid inode number {0}")]
    InvalidInode(u64),

    /// A tree-cache file written by an incompatible version of the format.
    #[error("unsupported tree cache version {0}")]
    CacheVersion(u32),

    /// A tree-cache file keyed for a different image or rescue log.
    #[error("tree cache was built for a different {0}")]
    CacheMismatch(&'static str),
}
