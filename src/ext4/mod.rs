//! On-disk ext2/3/4 structures and damage-tolerant access to them.
//!
//! Layouts and field semantics follow the Linux kernel's on-disk format
//! documentation. Everything here is read-only: structures are decoded out
//! of mapped pages through [`crate::cache::CachedView`] overlays, and every
//! decode carries an `ok` flag derived from the damage map.

pub mod dir;
pub mod extent;
pub mod image;
pub mod inode;
pub mod sb;

pub use image::{Ext4Image, InodeView, DEFAULT_CACHE_PAGES};
