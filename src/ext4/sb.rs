//! ext4 superblock structures.
//!
//! The superblock stores the filesystem geometry everything else hangs off:
//! block size, inode size and placement, group layout, and the feature sets
//! that change how other structures are decoded.
//!
//! All multi-byte fields are little-endian on disk; the overlay keeps them
//! raw and every accessor decodes through `from_le`, so the structures are
//! correct on any host.

use bytemuck::{Pod, Zeroable};

/// Magic number identifying an ext2/3/4 superblock.
pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;

/// Byte offset of the primary superblock within the image.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Incompatible feature set flags.
///
/// A reader that does not understand one of these must not interpret the
/// filesystem at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct IncompatibleFeatureSet(pub(crate) u32);

impl IncompatibleFeatureSet {
    /// Directory entries carry a file type byte.
    pub const FILETYPE: Self = Self(0x0002);

    /// Inodes map their data through extent trees.
    pub const EXTENTS: Self = Self(0x0040);

    /// The filesystem may exceed 2^32 blocks; group descriptors grow to
    /// `s_desc_size` bytes.
    pub const SIXTY_FOUR_BIT: Self = Self(0x0080);

    /// Checks if this set includes every flag of `features`.
    pub fn includes(self, features: Self) -> bool {
        self.0 & features.0 == features.0
    }
}

/// Read-only compatible feature set flags.
///
/// A reader that does not understand one of these may still mount the
/// filesystem read-only, which is the only thing this tool ever does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct ReadOnlyCompatibleFeatureSet(pub(crate) u32);

impl ReadOnlyCompatibleFeatureSet {
    /// Files may be larger than 2 GiB (`i_size_high` is meaningful).
    pub const LARGE_FILE: Self = Self(0x0002);

    /// `i_blocks` may count filesystem blocks instead of 512-byte sectors,
    /// gated per-inode by the `HUGE_FILE` inode flag.
    pub const HUGE_FILE: Self = Self(0x0008);

    /// Checks if this set includes every flag of `features`.
    pub fn includes(self, features: Self) -> bool {
        self.0 & features.0 == features.0
    }
}

/// On-disk layout of the ext4 superblock, through the 64-bit feature block.
///
/// The on-disk structure runs on for another ~600 reserved or
/// journal-related bytes; nothing past `s_flags` matters to a read-only
/// recovery pass, so the overlay stops there.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Ext4Superblock {
    /// Total inode count
    pub inodes_count: u32,

    /// Total block count, low 32 bits
    pub blocks_count_lo: u32,

    /// Reserved block count, low 32 bits
    pub r_blocks_count_lo: u32,

    /// Free block count, low 32 bits
    pub free_blocks_count_lo: u32,

    /// Free inode count
    pub free_inodes_count: u32,

    /// First data block (1 for 1 KiB blocks, 0 otherwise)
    pub first_data_block: u32,

    /// Block size is `1024 << log_block_size`
    pub log_block_size: u32,

    /// Cluster size is `1024 << log_cluster_size`
    pub log_cluster_size: u32,

    /// Blocks per group
    pub blocks_per_group: u32,

    /// Clusters per group
    pub clusters_per_group: u32,

    /// Inodes per group
    pub inodes_per_group: u32,

    /// Last mount time
    pub mtime: u32,

    /// Last write time
    pub wtime: u32,

    /// Mount count since the last consistency check
    pub mnt_count: u16,

    /// Mounts allowed before a consistency check is required
    pub max_mnt_count: u16,

    /// Magic signature, `0xEF53`
    pub magic: u16,

    /// Filesystem state flags
    pub state: u16,

    /// Behaviour on error detection
    pub errors: u16,

    /// Minor revision level
    pub minor_rev_level: u16,

    /// Time of last consistency check
    pub lastcheck: u32,

    /// Maximum time between consistency checks
    pub checkinterval: u32,

    /// Creator OS
    pub creator_os: u32,

    /// Major revision level
    pub rev_level: u32,

    /// Default uid for reserved blocks
    pub def_resuid: u16,

    /// Default gid for reserved blocks
    pub def_resgid: u16,

    /// First non-reserved inode
    pub first_ino: u32,

    /// Size of each on-disk inode structure, in bytes
    pub inode_size: u16,

    /// Block group number of this superblock copy
    pub block_group_nr: u16,

    /// Compatible feature set
    pub feature_compat: u32,

    /// Incompatible feature set
    pub feature_incompat: IncompatibleFeatureSet,

    /// Read-only compatible feature set
    pub feature_ro_compat: ReadOnlyCompatibleFeatureSet,

    /// Volume UUID
    pub uuid: [u8; 16],

    /// Volume label
    pub volume_name: [u8; 16],

    /// Directory the volume was last mounted on
    pub last_mounted: [u8; 64],

    /// Compression algorithm usage bitmap
    pub algorithm_usage_bitmap: u32,

    /// Blocks to preallocate for files
    pub prealloc_blocks: u8,

    /// Blocks to preallocate for directories
    pub prealloc_dir_blocks: u8,

    /// Blocks reserved for future group descriptor growth
    pub reserved_gdt_blocks: u16,

    /// Journal superblock UUID
    pub journal_uuid: [u8; 16],

    /// Journal file inode
    pub journal_inum: u32,

    /// Journal device number
    pub journal_dev: u32,

    /// Head of the orphan inode list
    pub last_orphan: u32,

    /// HTREE hash seed
    pub hash_seed: [u32; 4],

    /// Default hash algorithm for directory hashes
    pub def_hash_version: u8,

    /// Journal backup type
    pub jnl_backup_type: u8,

    /// Group descriptor size when the 64-bit feature is set
    pub desc_size: u16,

    /// Default mount options
    pub default_mount_opts: u32,

    /// First metablock block group
    pub first_meta_bg: u32,

    /// Filesystem creation time
    pub mkfs_time: u32,

    /// Journal inode backup
    pub jnl_blocks: [u32; 17],

    /// Total block count, high 32 bits (64-bit feature)
    pub blocks_count_hi: u32,

    /// Reserved block count, high 32 bits (64-bit feature)
    pub r_blocks_count_hi: u32,

    /// Free block count, high 32 bits (64-bit feature)
    pub free_blocks_count_hi: u32,

    /// Minimum inode tail size all inodes have
    pub min_extra_isize: u16,

    /// Inode tail size new inodes should reserve
    pub want_extra_isize: u16,

    /// Miscellaneous flags
    pub flags: u32,
}

/// Legacy 32-byte group descriptor size, used without the 64-bit feature.
pub const LEGACY_DESC_SIZE: u16 = 32;

impl Ext4Superblock {
    /// Checks the magic signature.
    pub fn magic_valid(&self) -> bool {
        u16::from_le(self.magic) == EXT4_SUPER_MAGIC
    }

    /// Block size in bytes, `1024 << log_block_size`.
    pub fn block_size(&self) -> u64 {
        1024u64 << u32::from_le(self.log_block_size)
    }

    /// Total inode count.
    pub fn inode_count(&self) -> u64 {
        u64::from(u32::from_le(self.inodes_count))
    }

    /// Inodes in each block group.
    pub fn inodes_per_group(&self) -> u64 {
        u64::from(u32::from_le(self.inodes_per_group))
    }

    /// Blocks in each block group.
    pub fn blocks_per_group(&self) -> u64 {
        u64::from(u32::from_le(self.blocks_per_group))
    }

    /// Size of one on-disk inode structure in bytes.
    pub fn inode_size(&self) -> u64 {
        u64::from(u16::from_le(self.inode_size))
    }

    /// Total block count, honoring the 64-bit feature.
    pub fn block_count(&self) -> u64 {
        let lo = u64::from(u32::from_le(self.blocks_count_lo));
        if self.has_incompat(IncompatibleFeatureSet::SIXTY_FOUR_BIT) {
            lo | (u64::from(u32::from_le(self.blocks_count_hi)) << 32)
        } else {
            lo
        }
    }

    /// Size of one group descriptor: `s_desc_size` with the 64-bit feature,
    /// 32 bytes otherwise.
    pub fn group_desc_size(&self) -> u64 {
        if self.has_incompat(IncompatibleFeatureSet::SIXTY_FOUR_BIT) {
            let size = u16::from_le(self.desc_size);
            if size >= LEGACY_DESC_SIZE {
                return u64::from(size);
            }
        }
        u64::from(LEGACY_DESC_SIZE)
    }

    /// Checks whether an incompatible feature is enabled.
    pub fn has_incompat(&self, features: IncompatibleFeatureSet) -> bool {
        IncompatibleFeatureSet(u32::from_le(self.feature_incompat.0)).includes(features)
    }

    /// Checks whether a read-only compatible feature is enabled.
    pub fn has_ro_compat(&self, features: ReadOnlyCompatibleFeatureSet) -> bool {
        ReadOnlyCompatibleFeatureSet(u32::from_le(self.feature_ro_compat.0)).includes(features)
    }

    /// Volume label with trailing NULs stripped.
    pub fn volume_label(&self) -> String {
        self.volume_name
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect()
    }
}
