//! ext4 inode structures.
//!
//! The on-disk inode comes in two parts: the 128-byte base every ext2/3/4
//! filesystem has, and an optional tail (`i_extra_isize` and the high
//! timestamp bits) present when `s_inode_size` exceeds 128. Everything the
//! scan needs lives in the base; the tail is only consulted when restoring
//! timestamps during extraction. Reading just the base also keeps a view's
//! damage range from bleeding into the next inode in the table.

use bytemuck::{Pod, Zeroable};

use crate::ext4::sb::{Ext4Superblock, ReadOnlyCompatibleFeatureSet};

/// Inode number of the filesystem root directory.
pub const ROOT_INODE: u64 = 2;

/// First inode number available for regular allocation; 1..=10 are reserved.
pub const FIRST_NON_RESERVED_INODE: u64 = 11;

/// Byte offset of `i_block` within the inode, where extent trees root.
pub const INODE_BLOCK_AREA_OFFSET: u64 = 40;

/// Size of the `i_block` area in bytes.
pub const INODE_BLOCK_AREA_SIZE: usize = 60;

/// File mode field of an inode: type in the high nibble, permissions below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFileMode(pub u16);

impl InodeFileMode {
    /// FIFO
    pub const S_IFIFO: Self = Self(0x1000);

    /// Character device
    pub const S_IFCHR: Self = Self(0x2000);

    /// Directory
    pub const S_IFDIR: Self = Self(0x4000);

    /// Block device
    pub const S_IFBLK: Self = Self(0x6000);

    /// Regular file
    pub const S_IFREG: Self = Self(0x8000);

    /// Symbolic link
    pub const S_IFLNK: Self = Self(0xA000);

    /// Socket
    pub const S_IFSOCK: Self = Self(0xC000);

    const TYPE_MASK: u16 = 0xF000;

    /// The permission bits, without the file type.
    pub fn permissions(self) -> u32 {
        u32::from(self.0 & !Self::TYPE_MASK)
    }
}

/// Classified inode type.
///
/// Only the first three matter to the recovery pass; the rest exist so the
/// scan can name what it skips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeType {
    Regular,
    Directory,
    SymbolicLink,
    Fifo,
    CharacterDevice,
    BlockDevice,
    Socket,
    Unknown,
}

impl From<InodeFileMode> for InodeType {
    fn from(mode: InodeFileMode) -> Self {
        match InodeFileMode(mode.0 & InodeFileMode::TYPE_MASK) {
            InodeFileMode::S_IFREG => Self::Regular,
            InodeFileMode::S_IFDIR => Self::Directory,
            InodeFileMode::S_IFLNK => Self::SymbolicLink,
            InodeFileMode::S_IFIFO => Self::Fifo,
            InodeFileMode::S_IFCHR => Self::CharacterDevice,
            InodeFileMode::S_IFBLK => Self::BlockDevice,
            InodeFileMode::S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// Inode flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFlags(pub u32);

impl InodeFlags {
    /// `i_blocks` counts filesystem blocks, not 512-byte sectors
    /// (meaningful only with the `HUGE_FILE` read-only compat feature).
    pub const HUGE_FILE: Self = Self(0x40000);

    /// The inode maps its data through an extent tree.
    pub const EXTENTS: Self = Self(0x80000);

    /// The inode stores its data inline in `i_block`.
    pub const INLINE_DATA: Self = Self(0x1000_0000);

    /// Checks if every flag of `flags` is set.
    pub fn includes(self, flags: Self) -> bool {
        self.0 & flags.0 == flags.0
    }
}

/// On-disk layout of the 128-byte base inode.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4Inode {
    /// File mode and type
    pub i_mode: InodeFileMode,

    /// Owner UID, low 16 bits
    pub i_uid: u16,

    /// Size in bytes, low 32 bits
    pub i_size_lo: u32,

    /// Last access time, seconds since the epoch
    pub i_atime: u32,

    /// Last inode change time, seconds since the epoch
    pub i_ctime: u32,

    /// Last data modification time, seconds since the epoch
    pub i_mtime: u32,

    /// Deletion time; nonzero means the inode was freed
    pub i_dtime: u32,

    /// Group ID, low 16 bits
    pub i_gid: u16,

    /// Hard link count
    pub i_links_count: u16,

    /// Block count, low 32 bits (512-byte sectors unless `HUGE_FILE`)
    pub i_blocks_lo: u32,

    /// Inode flags
    pub i_flags: InodeFlags,

    /// OS-dependent word (version on Linux)
    pub l_i_version: u32,

    /// Block map, extent tree root, or inline symlink target
    pub i_block: [u8; INODE_BLOCK_AREA_SIZE],

    /// File version
    pub i_generation: u32,

    /// Extended attribute block, low 32 bits
    pub i_file_acl_lo: u32,

    /// Size in bytes, high 32 bits (regular files only)
    pub i_size_high: u32,

    /// Obsolete fragment address
    pub i_obso_faddr: u32,

    /// Block count, high 16 bits
    pub l_i_blocks_high: u16,

    /// Extended attribute block, high 16 bits
    pub l_i_file_acl_high: u16,

    /// Owner UID, high 16 bits
    pub l_i_uid_high: u16,

    /// Group ID, high 16 bits
    pub l_i_gid_high: u16,

    /// Inode checksum, low 16 bits
    pub l_i_checksum_lo: u16,

    /// Unused
    pub l_i_reserved: u16,
}

/// Optional inode tail present when `s_inode_size > 128`.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4InodeTail {
    /// Bytes of the tail that are in use
    pub i_extra_isize: u16,

    /// Inode checksum, high 16 bits
    pub i_checksum_hi: u16,

    /// Extra change time bits (epoch extension + nanoseconds)
    pub i_ctime_extra: u32,

    /// Extra modification time bits
    pub i_mtime_extra: u32,

    /// Extra access time bits
    pub i_atime_extra: u32,

    /// File creation time, seconds since the epoch
    pub i_crtime: u32,

    /// Extra creation time bits
    pub i_crtime_extra: u32,
}

impl Ext4Inode {
    /// The classified type of this inode.
    pub fn inode_type(&self) -> InodeType {
        InodeType::from(InodeFileMode(u16::from_le(self.i_mode.0)))
    }

    /// Hard link count.
    pub fn link_count(&self) -> u16 {
        u16::from_le(self.i_links_count)
    }

    /// Deletion time; nonzero means the inode was freed and its data blocks
    /// may be reused, so the scan skips it.
    pub fn deletion_time(&self) -> u32 {
        u32::from_le(self.i_dtime)
    }

    /// Last data modification time, seconds since the epoch.
    pub fn modification_time(&self) -> u32 {
        u32::from_le(self.i_mtime)
    }

    /// Size in bytes. 64-bit for regular files; everything else uses only
    /// the low word.
    pub fn size(&self) -> u64 {
        let lo = u64::from(u32::from_le(self.i_size_lo));
        match self.inode_type() {
            InodeType::Regular => lo | (u64::from(u32::from_le(self.i_size_high)) << 32),
            _ => lo,
        }
    }

    /// Checks if one or more inode flags are set.
    pub fn has_flag(&self, flags: InodeFlags) -> bool {
        InodeFlags(u32::from_le(self.i_flags.0)).includes(flags)
    }

    /// Checks if this inode maps its data through an extent tree.
    pub fn uses_extent_tree(&self) -> bool {
        self.has_flag(InodeFlags::EXTENTS)
    }

    /// Block count normalized to 512-byte sectors.
    ///
    /// Without the `huge_file` read-only compat feature the count is the raw
    /// low word. With it, the high 16 bits join in, and if the inode itself
    /// carries the `HUGE_FILE` flag the value counts filesystem blocks and
    /// is scaled back to sectors.
    pub fn sector_count(&self, sb: &Ext4Superblock) -> u64 {
        let lo = u64::from(u32::from_le(self.i_blocks_lo));

        if !sb.has_ro_compat(ReadOnlyCompatibleFeatureSet::HUGE_FILE) {
            return lo;
        }

        let wide = lo | (u64::from(u16::from_le(self.l_i_blocks_high)) << 32);
        if !self.has_flag(InodeFlags::HUGE_FILE) {
            return wide;
        }

        // Filesystem blocks; one block is 2^(1 + log_block_size) sectors.
        wide << (1 + u32::from_le(sb.log_block_size))
    }

    /// Extended attribute block number, or 0 if none.
    pub fn xattr_block(&self) -> u64 {
        u64::from(u32::from_le(self.i_file_acl_lo))
            | (u64::from(u16::from_le(self.l_i_file_acl_high)) << 32)
    }

    /// Checks whether a symlink inode stores its target inline in
    /// `i_block`: every data sector is accounted to the xattr block, leaving
    /// none for the target.
    pub fn is_fast_symlink(&self, sb: &Ext4Superblock) -> bool {
        if self.inode_type() != InodeType::SymbolicLink {
            return false;
        }

        let xattr_sectors = if self.xattr_block() != 0 {
            sb.block_size() / 512
        } else {
            0
        };

        self.sector_count(sb).saturating_sub(xattr_sectors) == 0
    }

    /// The inline symlink target bytes, truncated to the declared size.
    pub fn fast_symlink_target(&self) -> &[u8] {
        let len = (self.size() as usize).min(INODE_BLOCK_AREA_SIZE);
        &self.i_block[..len]
    }
}

impl Ext4InodeTail {
    /// Modification time nanoseconds, when the tail records them.
    pub fn mtime_nanos(&self) -> u32 {
        u32::from_le(self.i_mtime_extra) >> 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext4::sb::ReadOnlyCompatibleFeatureSet;

    #[test]
    fn overlay_field_offsets() {
        assert_eq!(std::mem::offset_of!(Ext4Inode, i_mode), 0x0);
        assert_eq!(std::mem::offset_of!(Ext4Inode, i_dtime), 0x14);
        assert_eq!(std::mem::offset_of!(Ext4Inode, i_blocks_lo), 0x1C);
        assert_eq!(
            std::mem::offset_of!(Ext4Inode, i_block),
            INODE_BLOCK_AREA_OFFSET as usize
        );
        assert_eq!(std::mem::offset_of!(Ext4Inode, i_size_high), 0x6C);
        assert_eq!(std::mem::offset_of!(Ext4Inode, l_i_blocks_high), 0x74);
        assert_eq!(std::mem::size_of::<Ext4Inode>(), 128);
    }

    fn superblock(huge_file: bool, log_block_size: u32) -> Ext4Superblock {
        let mut sb = Ext4Superblock::zeroed();
        sb.log_block_size = log_block_size.to_le();
        if huge_file {
            sb.feature_ro_compat =
                ReadOnlyCompatibleFeatureSet(ReadOnlyCompatibleFeatureSet::HUGE_FILE.0.to_le());
        }
        sb
    }

    #[test]
    fn sector_count_without_huge_file_feature() {
        let mut inode = Ext4Inode::zeroed();
        inode.i_blocks_lo = 100u32.to_le();
        inode.l_i_blocks_high = 5u16.to_le();
        // High bits are ignored without the feature.
        assert_eq!(inode.sector_count(&superblock(false, 2)), 100);
    }

    #[test]
    fn sector_count_with_feature_without_inode_flag() {
        let mut inode = Ext4Inode::zeroed();
        inode.i_blocks_lo = 100u32.to_le();
        inode.l_i_blocks_high = 1u16.to_le();
        assert_eq!(inode.sector_count(&superblock(true, 2)), 0x1_0000_0064);
    }

    #[test]
    fn sector_count_with_huge_file_flag_scales_blocks() {
        let mut inode = Ext4Inode::zeroed();
        inode.i_blocks_lo = 3u32.to_le();
        inode.i_flags = InodeFlags(InodeFlags::HUGE_FILE.0.to_le());
        // 4 KiB blocks: 3 blocks == 24 sectors.
        assert_eq!(inode.sector_count(&superblock(true, 2)), 24);
    }

    #[test]
    fn fast_symlink_detection() {
        let sb = superblock(false, 2);

        let mut link = Ext4Inode::zeroed();
        link.i_mode = InodeFileMode(InodeFileMode::S_IFLNK.0.to_le());
        link.i_size_lo = 6u32.to_le();
        link.i_block[..6].copy_from_slice(b"/hello");
        assert!(link.is_fast_symlink(&sb));
        assert_eq!(link.fast_symlink_target(), b"/hello");

        // A symlink whose only sectors belong to its xattr block is still
        // fast.
        link.i_file_acl_lo = 99u32.to_le();
        link.i_blocks_lo = 8u32.to_le();
        assert!(link.is_fast_symlink(&sb));

        // One with real data sectors is not.
        link.i_blocks_lo = 16u32.to_le();
        assert!(!link.is_fast_symlink(&sb));

        let mut file = Ext4Inode::zeroed();
        file.i_mode = InodeFileMode(InodeFileMode::S_IFREG.0.to_le());
        assert!(!file.is_fast_symlink(&sb));
    }

    #[test]
    fn regular_file_size_is_64_bit() {
        let mut inode = Ext4Inode::zeroed();
        inode.i_mode = InodeFileMode(InodeFileMode::S_IFREG.0.to_le());
        inode.i_size_lo = 0x10u32.to_le();
        inode.i_size_high = 0x3u32.to_le();
        assert_eq!(inode.size(), 0x3_0000_0010);

        inode.i_mode = InodeFileMode(InodeFileMode::S_IFDIR.0.to_le());
        assert_eq!(inode.size(), 0x10);
    }
}
