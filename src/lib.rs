//! Recovery engine for damaged ext2/3/4 filesystem images.
//!
//! The input is a raw disk image, usually produced by GNU ddrescue from a
//! failing device, plus ddrescue's map file describing which byte ranges
//! were actually rescued. The engine rebuilds the file tree that survives in
//! the image, annotates every file with a damage status, and can extract the
//! surviving data into a directory.
//!
//! Pipeline: a [`damage::DamageMap`] indexes the rescued ranges; a
//! [`cache::BlockCache`] maps image pages on demand and hands out typed,
//! damage-aware views; [`ext4::Ext4Image`] decodes the on-disk structures
//! through those views; [`scan::scan`] sweeps every inode into a
//! [`tree::FileTree`]; [`treecache`] persists the result keyed by the input
//! identities; [`naming`], [`report`] and [`extract`] present and
//! materialize it.

pub mod cache;
pub mod damage;
pub mod errors;
pub mod ext4;
pub mod extract;
pub mod naming;
pub mod report;
pub mod scan;
pub mod tree;
pub mod treecache;

pub use errors::{Error, Result};
