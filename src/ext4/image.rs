//! Damaged ext4 image access.
//!
//! [`Ext4Image`] ties the page cache, the damage map and the on-disk
//! structure overlays together: it validates the superblock, locates group
//! descriptors and inodes, and hands out extent and directory walks. It
//! deliberately trusts as little as possible: every lookup that crosses an
//! unreadable structure degrades to a sentinel view instead of failing the
//! whole session.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

use crate::cache::{BlockCache, CachedView, MappedExtent};
use crate::damage::DamageMap;
use crate::errors::{Error, Result};
use crate::ext4::dir::DirBlockEntries;
use crate::ext4::extent::{Extent, ExtentRange};
use crate::ext4::inode::{Ext4Inode, Ext4InodeTail, INODE_BLOCK_AREA_OFFSET};
use crate::ext4::sb::{Ext4Superblock, IncompatibleFeatureSet, SUPERBLOCK_OFFSET};

/// Default cache capacity: 4 MiB of mapped pages.
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Legacy (and low half of the 64-bit) group descriptor.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4GroupDesc {
    /// Block bitmap block, low 32 bits
    pub bg_block_bitmap_lo: u32,

    /// Inode bitmap block, low 32 bits
    pub bg_inode_bitmap_lo: u32,

    /// Inode table start block, low 32 bits
    pub bg_inode_table_lo: u32,

    /// Free block count, low 16 bits
    pub bg_free_blocks_count_lo: u16,

    /// Free inode count, low 16 bits
    pub bg_free_inodes_count_lo: u16,

    /// Used directory count, low 16 bits
    pub bg_used_dirs_count_lo: u16,

    /// Block group flags
    pub bg_flags: u16,

    /// Exclude bitmap block, low 32 bits
    pub bg_exclude_bitmap_lo: u32,

    /// Block bitmap checksum, low 16 bits
    pub bg_block_bitmap_csum_lo: u16,

    /// Inode bitmap checksum, low 16 bits
    pub bg_inode_bitmap_csum_lo: u16,

    /// Unused inode count, low 16 bits
    pub bg_itable_unused_lo: u16,

    /// Group descriptor checksum
    pub bg_checksum: u16,
}

/// High half of a 64-byte group descriptor (64-bit feature).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4GroupDescHi {
    /// Block bitmap block, high 32 bits
    pub bg_block_bitmap_hi: u32,

    /// Inode bitmap block, high 32 bits
    pub bg_inode_bitmap_hi: u32,

    /// Inode table start block, high 32 bits
    pub bg_inode_table_hi: u32,

    /// Free block count, high 16 bits
    pub bg_free_blocks_count_hi: u16,

    /// Free inode count, high 16 bits
    pub bg_free_inodes_count_hi: u16,

    /// Used directory count, high 16 bits
    pub bg_used_dirs_count_hi: u16,

    /// Unused inode count, high 16 bits
    pub bg_itable_unused_hi: u16,

    /// Exclude bitmap block, high 32 bits
    pub bg_exclude_bitmap_hi: u32,

    /// Block bitmap checksum, high 16 bits
    pub bg_block_bitmap_csum_hi: u16,

    /// Inode bitmap checksum, high 16 bits
    pub bg_inode_bitmap_csum_hi: u16,

    /// Unused
    pub bg_reserved: u32,
}

/// View of one on-disk inode plus where it was found.
///
/// An inode whose group descriptor (or table block) is unreachable carries
/// the unmapped sentinel view and no location.
pub struct InodeView {
    /// The inode number the view was requested for.
    pub number: u64,
    view: CachedView<Ext4Inode>,
    location: Option<(u64, u64)>,
}

impl InodeView {
    /// Whether the on-disk inode bytes were rescued.
    pub fn is_ok(&self) -> bool {
        self.view.is_ok()
    }

    /// Decodes the 128-byte base inode (zeroed for sentinels).
    pub fn read(&self) -> Ext4Inode {
        self.view.read()
    }

    /// (block, byte offset) of the inode within the image, when reachable.
    pub fn location(&self) -> Option<(u64, u64)> {
        self.location
    }
}

/// A damaged ext2/3/4 filesystem image opened for recovery.
#[derive(Debug)]
pub struct Ext4Image {
    cache: RefCell<BlockCache>,
    sb: Ext4Superblock,
    block_size: u64,
    inodes_per_block: u64,
    group_desc_start: u64,
}

impl Ext4Image {
    /// Opens and validates `path`.
    ///
    /// The superblock is read through a provisional 4 KiB-block cache; once
    /// the real block size is known the cache is rebuilt around it.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the image cannot be opened, [`Error::BadSuperblock`]
    /// if the superblock is unreadable, carries the wrong magic, or declares
    /// geometry this tool cannot work with.
    pub fn open(path: &Path, damage: Rc<DamageMap>, cache_pages: usize) -> Result<Self> {
        let mut cache = BlockCache::new(path, damage, 4096, cache_pages)?;

        let view: CachedView<Ext4Superblock> =
            cache.request_struct(SUPERBLOCK_OFFSET / 4096, SUPERBLOCK_OFFSET % 4096);
        if !view.is_ok() {
            return Err(Error::BadSuperblock("superblock bytes are unreadable"));
        }

        let sb = view.read();
        drop(view);
        if !sb.magic_valid() {
            return Err(Error::BadSuperblock("magic is not 0xEF53"));
        }

        let block_size = sb.block_size();
        if block_size != 4096 {
            cache = cache.with_block_size(block_size)?;
        }

        let inode_size = sb.inode_size();
        if inode_size == 0 || block_size % inode_size != 0 {
            return Err(Error::BadSuperblock("inode size does not divide block size"));
        }
        if sb.inodes_per_group() == 0 {
            return Err(Error::BadSuperblock("zero inodes per group"));
        }

        tracing::info!(
            label = %sb.volume_label(),
            block_size,
            inodes = sb.inode_count(),
            blocks = sb.block_count(),
            "opened ext4 image"
        );

        Ok(Self {
            cache: RefCell::new(cache),
            block_size,
            inodes_per_block: block_size / inode_size,
            // The block after the one holding the superblock.
            group_desc_start: SUPERBLOCK_OFFSET / block_size + 1,
            sb,
        })
    }

    /// The validated superblock.
    pub fn superblock(&self) -> &Ext4Superblock {
        &self.sb
    }

    /// Filesystem block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Total inode count.
    pub fn inode_count(&self) -> u64 {
        self.sb.inode_count()
    }

    /// The page cache; exposed for the walk helpers that borrow it.
    pub fn cache(&self) -> &RefCell<BlockCache> {
        &self.cache
    }

    /// The damage map the image was opened with.
    pub fn damage(&self) -> Rc<DamageMap> {
        Rc::clone(self.cache.borrow().damage())
    }

    /// (block, offset) of group `g`'s descriptor.
    fn group_desc_location(&self, group: u64) -> (u64, u64) {
        let desc_size = self.sb.group_desc_size();
        let per_block = self.block_size / desc_size;
        (
            self.group_desc_start + group / per_block,
            (group % per_block) * desc_size,
        )
    }

    /// First block of group `g`'s inode table, or `None` when the
    /// descriptor is unreadable.
    pub fn inode_table_block(&self, group: u64) -> Option<u64> {
        let (block, offset) = self.group_desc_location(group);

        let view: CachedView<Ext4GroupDesc> =
            self.cache.borrow_mut().request_struct(block, offset);
        if !view.is_ok() {
            return None;
        }
        let lo = u64::from(u32::from_le(view.read().bg_inode_table_lo));

        if self.sb.has_incompat(IncompatibleFeatureSet::SIXTY_FOUR_BIT)
            && self.sb.group_desc_size() >= 64
        {
            let hi_view: CachedView<Ext4GroupDescHi> =
                self.cache.borrow_mut().request_struct(block, offset + 32);
            if hi_view.is_ok() {
                let hi = u64::from(u32::from_le(hi_view.read().bg_inode_table_hi));
                return Some(lo | (hi << 32));
            }
        }

        Some(lo)
    }

    /// (block, byte offset) of inode `n` within the image.
    ///
    /// Returns `None` when the group descriptor on the way is unreadable.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInode`] for numbers outside `[1, inode_count]`.
    pub fn locate_inode(&self, n: u64) -> Result<Option<(u64, u64)>> {
        if n == 0 || n > self.inode_count() {
            return Err(Error::InvalidInode(n));
        }

        let group = (n - 1) / self.sb.inodes_per_group();
        let index_in_group = (n - 1) % self.sb.inodes_per_group();

        let Some(table) = self.inode_table_block(group) else {
            return Ok(None);
        };

        Ok(Some((
            table + index_in_group / self.inodes_per_block,
            (index_in_group % self.inodes_per_block) * self.sb.inode_size(),
        )))
    }

    /// Reads inode `n`, degrading to the unreadable sentinel when its group
    /// descriptor is gone.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInode`] for numbers outside `[1, inode_count]`.
    pub fn inode(&self, n: u64) -> Result<InodeView> {
        match self.locate_inode(n)? {
            Some((block, offset)) => Ok(InodeView {
                number: n,
                view: self.cache.borrow_mut().request_struct(block, offset),
                location: Some((block, offset)),
            }),
            None => Ok(InodeView {
                number: n,
                view: self.cache.borrow().request_struct_unmapped(),
                location: None,
            }),
        }
    }

    /// Reads the optional inode tail behind `inode`, when the filesystem's
    /// inode size leaves room for one.
    pub fn inode_tail(&self, inode: &InodeView) -> Option<Ext4InodeTail> {
        let (block, offset) = inode.location()?;
        if self.sb.inode_size() < 160 {
            return None;
        }

        let view: CachedView<Ext4InodeTail> =
            self.cache.borrow_mut().request_struct(block, offset + 128);
        view.is_ok().then(|| view.read())
    }

    /// Starts a lazy extent walk over `inode`'s block map.
    pub fn extents(&self, inode: &InodeView) -> Option<ExtentRange<'_>> {
        let (block, offset) = inode.location()?;
        Some(ExtentRange::new(
            &self.cache,
            block,
            offset + INODE_BLOCK_AREA_OFFSET,
        ))
    }

    /// Walks the entries of one directory data block.
    pub fn dir_block_entries(&self, block: u64) -> DirBlockEntries<'_> {
        DirBlockEntries::new(&self.cache, block)
    }

    /// Maps the data blocks of one extent, outside the LRU cache.
    pub fn map_extent(&self, extent: &Extent) -> MappedExtent {
        self.cache
            .borrow()
            .map_extent(extent.physical_block, u64::from(extent.block_count))
    }

    /// Resolves a symlink target.
    ///
    /// Fast symlinks read straight out of `i_block`; everything else takes
    /// the first data extent. Returns `None` when the target's bytes are
    /// damaged.
    pub fn symlink_target(&self, inode: &InodeView) -> Option<Vec<u8>> {
        if !inode.is_ok() {
            return None;
        }

        let raw = inode.read();
        if raw.is_fast_symlink(&self.sb) {
            return Some(raw.fast_symlink_target().to_vec());
        }

        let mut range = self.extents(inode)?;
        let extent = range.find(|e| e.ok)?;
        let mapped = self.map_extent(&extent);
        if !mapped.is_ok() {
            return None;
        }

        let len = (raw.size() as usize).min(mapped.bytes().len());
        Some(mapped.bytes()[..len].to_vec())
    }
}
