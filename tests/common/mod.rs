//! Synthetic ext4 image builder for the end-to-end scenarios.
//!
//! Builds just enough of a 1 KiB-block filesystem for the recovery engine:
//! superblock, one block group, an inode table at block 8, and hand-placed
//! data blocks. Extent trees are written depth-0 into the inodes' `i_block`
//! area.

use std::io::Write;
use std::rc::Rc;

use ext4rescue::damage::{DamageMap, Region};
use ext4rescue::ext4::inode::InodeFileMode;
use ext4rescue::ext4::Ext4Image;

pub const BLOCK_SIZE: u64 = 1024;
pub const INODE_SIZE: usize = 128;
pub const INODE_TABLE_BLOCK: u64 = 8;

pub const KIND_REG: u8 = 0x1;
pub const KIND_DIR: u8 = 0x2;
pub const KIND_SYMLINK: u8 = 0x7;

pub struct ImageBuilder {
    data: Vec<u8>,
}

impl ImageBuilder {
    /// An empty filesystem of `total_blocks` blocks and `inode_count`
    /// inodes in a single group spanning the whole image.
    pub fn new(total_blocks: u64, inode_count: u32) -> Self {
        let mut data = vec![0u8; (total_blocks * BLOCK_SIZE) as usize];

        // Superblock at byte 1024.
        let sb = 1024;
        le32(&mut data, sb, inode_count);
        le32(&mut data, sb + 0x4, total_blocks as u32);
        le32(&mut data, sb + 0x14, 1); // first_data_block
        le32(&mut data, sb + 0x18, 0); // log_block_size -> 1024
        le32(&mut data, sb + 0x20, total_blocks as u32); // blocks_per_group
        le32(&mut data, sb + 0x28, inode_count); // inodes_per_group
        le16(&mut data, sb + 0x38, 0xEF53);
        le16(&mut data, sb + 0x58, INODE_SIZE as u16);
        le32(&mut data, sb + 0x60, 0x2 | 0x40); // filetype + extents

        // Group 0 descriptor in block 2.
        le32(&mut data, 2 * BLOCK_SIZE as usize + 0x8, INODE_TABLE_BLOCK as u32);

        Self { data }
    }

    fn inode_offset(&self, n: u64) -> usize {
        INODE_TABLE_BLOCK as usize * BLOCK_SIZE as usize + (n as usize - 1) * INODE_SIZE
    }

    /// Writes an inode with a depth-0 extent tree rooted in `i_block`.
    pub fn set_inode(
        &mut self,
        n: u64,
        mode: u16,
        links: u16,
        size: u64,
        extents: &[(u32, u16, u64)],
    ) {
        let at = self.inode_offset(n);
        le16(&mut self.data, at, mode);
        le32(&mut self.data, at + 0x4, size as u32);
        le16(&mut self.data, at + 0x1A, links);
        let sectors: u64 = extents
            .iter()
            .map(|&(_, len, _)| u64::from(len) * BLOCK_SIZE / 512)
            .sum();
        le32(&mut self.data, at + 0x1C, sectors as u32);
        le32(&mut self.data, at + 0x20, 0x80000); // extents flag

        // Extent root: header + leaves at i_block (offset 40).
        let root = at + 40;
        le16(&mut self.data, root, 0xF30A);
        le16(&mut self.data, root + 2, extents.len() as u16);
        le16(&mut self.data, root + 4, 4);
        le16(&mut self.data, root + 6, 0); // depth
        for (i, &(logical, len, physical)) in extents.iter().enumerate() {
            let leaf = root + 12 + i * 12;
            le32(&mut self.data, leaf, logical);
            le16(&mut self.data, leaf + 4, len);
            le16(&mut self.data, leaf + 6, (physical >> 32) as u16);
            le32(&mut self.data, leaf + 8, physical as u32);
        }
    }

    /// Writes a fast symlink: the target lives in `i_block`, no extents.
    pub fn set_fast_symlink(&mut self, n: u64, links: u16, target: &[u8]) {
        assert!(target.len() <= 60);
        let at = self.inode_offset(n);
        le16(&mut self.data, at, InodeFileMode::S_IFLNK.0 | 0o777);
        le32(&mut self.data, at + 0x4, target.len() as u32);
        le16(&mut self.data, at + 0x1A, links);
        self.data[at + 40..at + 40 + target.len()].copy_from_slice(target);
    }

    /// Marks an inode as deleted (`i_dtime` set).
    pub fn set_deleted(&mut self, n: u64) {
        let at = self.inode_offset(n);
        le32(&mut self.data, at + 0x14, 1_600_000_000);
    }

    /// Fills a data block with directory entries; the final entry's record
    /// is stretched to the end of the block.
    pub fn put_dir_block(&mut self, block: u64, entries: &[(u64, u8, &[u8])]) {
        let mut bytes = Vec::new();
        for (i, &(inode, kind, name)) in entries.iter().enumerate() {
            let body = 8 + name.len();
            let padded = body.div_ceil(4) * 4;
            let rec_len = if i + 1 == entries.len() {
                BLOCK_SIZE as usize - bytes.len()
            } else {
                padded
            };
            le32_vec(&mut bytes, inode as u32);
            bytes.extend_from_slice(&(rec_len as u16).to_le_bytes());
            bytes.push(name.len() as u8);
            bytes.push(kind);
            bytes.extend_from_slice(name);
            bytes.resize(bytes.len() + rec_len - body, 0);
        }
        self.put_block(block, &bytes);
    }

    /// Copies raw bytes to the start of a block.
    pub fn put_block(&mut self, block: u64, bytes: &[u8]) {
        let at = (block * BLOCK_SIZE) as usize;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn image_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Writes the image to a temp file.
    pub fn write(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&self.data).unwrap();
        file
    }
}

/// A damage map over `size` bytes with the given bad `[begin, end)` ranges
/// (ascending, non-overlapping).
pub fn damage_with_bad(size: u64, bad: &[(u64, u64)]) -> DamageMap {
    if bad.is_empty() {
        return DamageMap::all_good_map(size);
    }

    let mut regions = Vec::new();
    let mut pos = 0;
    for &(begin, end) in bad {
        if begin > pos {
            regions.push(Region { position: pos, size: begin - pos, good: true });
        }
        regions.push(Region { position: begin, size: end - begin, good: false });
        pos = end;
    }
    if pos < size {
        regions.push(Region { position: pos, size: size - pos, good: true });
    }
    DamageMap::from_regions(regions).unwrap()
}

/// Opens a built image with the given bad ranges.
pub fn open_built(
    builder: &ImageBuilder,
    bad: &[(u64, u64)],
) -> (tempfile::NamedTempFile, Ext4Image) {
    let file = builder.write();
    let damage = Rc::new(damage_with_bad(builder.image_size(), bad));
    let image = Ext4Image::open(file.path(), damage, 64).unwrap();
    (file, image)
}

/// The standard small filesystem used by several scenarios:
///
/// ```text
/// /               inode 2, data in block 16
/// /lost+found     inode 11, data in block 17
/// /foobar         inode 12, data in block 18
/// /foobar/hello.txt   inode 13, content "hello world" in block 20
/// /link           inode 14, fast symlink -> foobar/hello.txt
/// ```
pub fn standard_fs() -> ImageBuilder {
    let mut fs = ImageBuilder::new(64, 64);

    let dir = InodeFileMode::S_IFDIR.0 | 0o755;
    let reg = InodeFileMode::S_IFREG.0 | 0o644;

    fs.set_inode(2, dir, 4, BLOCK_SIZE, &[(0, 1, 16)]);
    fs.put_dir_block(
        16,
        &[
            (2, KIND_DIR, b"."),
            (2, KIND_DIR, b".."),
            (11, KIND_DIR, b"lost+found"),
            (12, KIND_DIR, b"foobar"),
            (14, KIND_SYMLINK, b"link"),
        ],
    );

    fs.set_inode(11, dir, 2, BLOCK_SIZE, &[(0, 1, 17)]);
    fs.put_dir_block(17, &[(11, KIND_DIR, b"."), (2, KIND_DIR, b"..")]);

    fs.set_inode(12, dir, 2, BLOCK_SIZE, &[(0, 1, 18)]);
    fs.put_dir_block(
        18,
        &[
            (12, KIND_DIR, b"."),
            (2, KIND_DIR, b".."),
            (13, KIND_REG, b"hello.txt"),
        ],
    );

    fs.set_inode(13, reg, 1, 11, &[(0, 1, 20)]);
    fs.put_block(20, b"hello world");

    fs.set_fast_symlink(14, 1, b"foobar/hello.txt");

    fs
}

fn le16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn le32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn le32_vec(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}
