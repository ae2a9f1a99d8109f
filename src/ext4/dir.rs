//! ext4 directory entry structures.
//!
//! Directory data blocks hold a chain of variable-length
//! `ext4_dir_entry_2` records, each advancing by its `rec_len`. The walk is
//! per-block: damage or a nonsensical record length abandons the current
//! block only, and the caller moves on to the directory's next block.

use std::cell::RefCell;

use bytemuck::{Pod, Zeroable};

use crate::cache::{BlockCache, CachedView};

/// File type codes carried in directory entries when the `filetype`
/// incompatible feature is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirEntryKind {
    Unknown,
    Regular,
    Directory,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
    SymbolicLink,
}

impl From<u8> for DirEntryKind {
    fn from(code: u8) -> Self {
        match code {
            0x1 => Self::Regular,
            0x2 => Self::Directory,
            0x3 => Self::CharacterDevice,
            0x4 => Self::BlockDevice,
            0x5 => Self::Fifo,
            0x6 => Self::Socket,
            0x7 => Self::SymbolicLink,
            _ => Self::Unknown,
        }
    }
}

/// Fixed head of an `ext4_dir_entry_2` record; the name follows it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4DirEntryHead {
    /// Inode the entry points at; 0 marks an unused slot
    pub inode: u32,

    /// Distance to the next record
    pub rec_len: u16,

    /// Length of the name that follows
    pub name_len: u8,

    /// File type code
    pub file_type: u8,
}

/// Smallest possible record: the head plus a zero-length name, rounded up
/// to the 4-byte record alignment.
pub const MIN_REC_LEN: u16 = 12;

const HEAD_SIZE: u64 = std::mem::size_of::<Ext4DirEntryHead>() as u64;

impl Ext4DirEntryHead {
    pub fn inode(&self) -> u64 {
        u64::from(u32::from_le(self.inode))
    }

    pub fn rec_len(&self) -> u16 {
        u16::from_le(self.rec_len)
    }

    pub fn kind(&self) -> DirEntryKind {
        DirEntryKind::from(self.file_type)
    }
}

/// A decoded directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    pub kind: DirEntryKind,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// The name as a string, with non-UTF-8 bytes replaced.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Walks the entries of one directory data block in on-disk order.
///
/// Stops early (without error) as soon as a record is damaged or its
/// `rec_len` would step outside the block; entries with inode 0 are skipped
/// but walked over.
pub struct DirBlockEntries<'c> {
    cache: &'c RefCell<BlockCache>,
    block: u64,
    offset: u64,
    block_size: u64,
}

impl<'c> DirBlockEntries<'c> {
    pub fn new(cache: &'c RefCell<BlockCache>, block: u64) -> Self {
        let block_size = cache.borrow().block_size();
        Self {
            cache,
            block,
            offset: 0,
            block_size,
        }
    }
}

impl Iterator for DirBlockEntries<'_> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            if self.offset + HEAD_SIZE > self.block_size {
                return None;
            }

            let view: CachedView<Ext4DirEntryHead> = self
                .cache
                .borrow_mut()
                .request_struct(self.block, self.offset);
            if !view.is_ok() {
                return None;
            }

            let head = view.read();
            let rec_len = u64::from(head.rec_len());
            if rec_len < u64::from(MIN_REC_LEN) || self.offset + rec_len > self.block_size {
                return None;
            }

            let name_len = u64::from(head.name_len);
            if HEAD_SIZE + name_len > rec_len {
                return None;
            }

            let entry_offset = self.offset;
            self.offset += rec_len;

            if head.inode() == 0 {
                // Unused slot; keep stepping.
                continue;
            }

            let name_view = self
                .cache
                .borrow_mut()
                .request(self.block, entry_offset + HEAD_SIZE);
            if !name_view.is_ok() {
                return None;
            }
            let name = name_view.bytes()[..name_len as usize].to_vec();

            return Some(DirEntry {
                inode: head.inode(),
                kind: head.kind(),
                name,
            });
        }
    }
}
