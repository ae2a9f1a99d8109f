//! Scanning passes that populate a [`FileTree`] from an [`Ext4Image`].
//!
//! The scan sweeps every allocatable inode in ascending order, classifying
//! directories, regular files and symlinks, wiring parents and names from
//! directory entries, and measuring how much of each file's data survived.
//! Damage never stops the sweep; it is recorded on the nodes it touches.
//!
//! When the root directory's own inode is destroyed, a raw-block sweep looks
//! for a surviving copy of its first directory block and re-attaches
//! whatever it names.

use std::ops::ControlFlow;

use crate::errors::Result;
use crate::ext4::dir::{DirEntry, DirEntryKind, Ext4DirEntryHead, MIN_REC_LEN};
use crate::ext4::extent::Extent;
use crate::ext4::image::{Ext4Image, InodeView};
use crate::ext4::inode::{Ext4Inode, InodeType, FIRST_NON_RESERVED_INODE, ROOT_INODE};
use crate::tree::{FileNode, FileTree};

/// Counters accumulated over one scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanStats {
    /// Inodes whose on-disk bytes were not rescued.
    pub unreadable_inodes: u64,

    /// Inodes visited before the scan finished or was stopped.
    pub scanned_inodes: u64,
}

/// A finished (or deliberately stopped) scan.
#[derive(Debug)]
pub struct ScanReport {
    pub tree: FileTree,
    pub stats: ScanStats,

    /// True when the progress callback stopped the scan early; the tree is
    /// whatever had been discovered up to that point.
    pub stopped_early: bool,
}

/// Scans the whole image, reporting progress through `progress`.
///
/// The callback receives `(current, total)` every `ceil(total / 1024)`
/// inodes and may stop the scan by returning [`ControlFlow::Break`]; the
/// partially populated tree is returned in that case with no torn state.
///
/// # Errors
///
/// Only structural failures ([`crate::errors::Error::InvalidInode`] cannot
/// occur for in-range sweeps) propagate; per-inode damage is recorded in the
/// tree instead.
pub fn scan<F>(image: &Ext4Image, mut progress: F) -> Result<ScanReport>
where
    F: FnMut(u64, u64) -> ControlFlow<()>,
{
    let mut scanner = Scanner {
        image,
        tree: FileTree::new(),
        stats: ScanStats::default(),
    };

    let inode_count = image.inode_count();
    let numbers = std::iter::once(ROOT_INODE)
        .chain(FIRST_NON_RESERVED_INODE..=inode_count.max(FIRST_NON_RESERVED_INODE - 1));
    let total = 1 + inode_count.saturating_sub(FIRST_NON_RESERVED_INODE - 1);
    let step = total.div_ceil(1024).max(1);

    let mut stopped_early = false;
    for (visited, n) in numbers.enumerate() {
        let current = visited as u64 + 1;
        scanner.visit(n)?;
        scanner.stats.scanned_inodes = current;

        if current % step == 0 && progress(current, total).is_break() {
            stopped_early = true;
            break;
        }
    }

    if !stopped_early {
        scanner.recover_root_if_needed();
    }

    Ok(ScanReport {
        tree: scanner.tree,
        stats: scanner.stats,
        stopped_early,
    })
}

struct Scanner<'img> {
    image: &'img Ext4Image,
    tree: FileTree,
    stats: ScanStats,
}

impl Scanner<'_> {
    fn visit(&mut self, n: u64) -> Result<()> {
        let view = self.image.inode(n)?;

        if !view.is_ok() {
            self.stats.unreadable_inodes += 1;
            if n == ROOT_INODE {
                // Materialize the root so recovery has a node to repair.
                let _ = self.tree.directory_mut(ROOT_INODE);
            }
            return Ok(());
        }

        let raw = view.read();
        if raw.deletion_time() != 0 {
            return Ok(());
        }

        match raw.inode_type() {
            InodeType::Directory => self.visit_directory(n, &view, &raw),
            InodeType::Regular => self.visit_file(n, &view, &raw, false),
            InodeType::SymbolicLink => self.visit_file(n, &view, &raw, true),
            _ => {}
        }

        Ok(())
    }

    fn record_common(&mut self, n: u64, raw: &Ext4Inode) {
        let sectors = raw.sector_count(self.image.superblock());
        if let Some(node) = self.tree.get_mut(n) {
            let common = node.common_mut();
            common.link_count = raw.link_count();
            common.size = raw.size();
            common.byte_count = sectors * 512;
            common.inode_ok = true;
        }
    }

    fn visit_directory(&mut self, n: u64, view: &InodeView, raw: &Ext4Inode) {
        if self.tree.directory_mut(n).is_none() {
            return;
        }
        self.record_common(n, raw);

        let Some(mut range) = self.image.extents(view) else {
            return;
        };
        let extents: Vec<Extent> = range.by_ref().filter(|e| e.ok).collect();
        if !range.root_ok() {
            if let Some(node) = self.tree.get_mut(n) {
                node.common_mut().block_map_ok = false;
            }
        }

        for extent in extents {
            for i in 0..u64::from(extent.block_count) {
                let block = extent.physical_block + i;
                let entries: Vec<DirEntry> = self.image.dir_block_entries(block).collect();
                for entry in entries {
                    self.apply_dir_entry(n, &entry);
                }
            }
        }
    }

    fn apply_dir_entry(&mut self, current: u64, entry: &DirEntry) {
        if entry.inode == 0 || entry.inode > self.image.inode_count() {
            return;
        }

        match entry.kind {
            DirEntryKind::Directory => {
                if entry.name == b"." {
                    return;
                }
                if entry.name == b".." {
                    self.tree.associate_parent(current, entry.inode);
                    return;
                }
                self.tree.set_directory_name(entry.inode, &entry.name_lossy());
                self.tree.associate_parent(entry.inode, current);
            }
            DirEntryKind::Regular => {
                self.tree
                    .add_link(entry.inode, false, current, &entry.name_lossy());
            }
            DirEntryKind::SymbolicLink => {
                self.tree
                    .add_link(entry.inode, true, current, &entry.name_lossy());
            }
            _ => {}
        }
    }

    fn visit_file(&mut self, n: u64, view: &InodeView, raw: &Ext4Inode, symlink: bool) {
        if self.tree.file_mut(n, symlink).is_none() {
            return;
        }
        self.record_common(n, raw);

        // Fast symlinks keep their target inside the inode; there is no
        // block map to check.
        if symlink && raw.is_fast_symlink(self.image.superblock()) {
            return;
        }

        let Some(mut range) = self.image.extents(view) else {
            return;
        };

        let block_size = self.image.block_size();
        let damage = self.image.damage();
        let mut mapped = 0u64;
        let mut reachable = 0u64;
        let mut readable = 0u64;

        for extent in range.by_ref() {
            if !extent.ok {
                continue;
            }
            let bytes = block_size * u64::from(extent.block_count);
            let begin = extent.physical_block * block_size;
            mapped += bytes;
            reachable += bytes;
            readable += damage.count_readable_bytes(begin, begin + bytes);
        }

        let root_ok = range.root_ok();
        if let Some(node) = self.tree.get_mut(n) {
            let common = node.common_mut();
            common.mapped_byte_count = mapped;
            common.reachable_byte_count = reachable;
            common.readable_byte_count = readable;
            if !root_ok {
                common.block_map_ok = false;
            }
        }
    }

    /// Raw-block root recovery, run only when the root inode itself was
    /// destroyed but its directory data may have survived.
    fn recover_root_if_needed(&mut self) {
        let needs_recovery = matches!(
            self.tree.get(ROOT_INODE),
            Some(FileNode::Directory(d)) if !d.common.inode_ok
        );
        if !needs_recovery {
            return;
        }

        tracing::info!("root inode is unreadable, sweeping raw blocks for its directory data");

        let candidates = self.image.superblock().blocks_per_group();
        for block in 0..candidates {
            if !self.root_block_head_matches(block) {
                continue;
            }

            let entries: Vec<DirEntry> = self
                .image
                .dir_block_entries(block)
                .skip(2) // "." and ".." already vetted
                .collect();

            if !self.root_block_plausible(&entries) {
                continue;
            }

            tracing::info!(block, "recovered root directory data");
            for entry in &entries {
                self.attach_recovered_root_entry(entry);
            }
            return;
        }

        tracing::warn!("no surviving root directory block found");
    }

    /// Checks the exact `"."`/`".."` head pair a root directory block must
    /// begin with: both pointing at inode 2, both directories, both with
    /// the minimal record length.
    fn root_block_head_matches(&self, block: u64) -> bool {
        let head_matches = |offset: u64, name: &[u8]| {
            let view = self
                .image
                .cache()
                .borrow_mut()
                .request_struct::<Ext4DirEntryHead>(block, offset);
            if !view.is_ok() {
                return false;
            }
            let head = view.read();
            if head.inode() != ROOT_INODE
                || head.rec_len() != MIN_REC_LEN
                || head.kind() != DirEntryKind::Directory
                || usize::from(head.name_len) != name.len()
            {
                return false;
            }

            let name_view = self.image.cache().borrow_mut().request(block, offset + 8);
            name_view.is_ok() && &name_view.bytes()[..name.len()] == name
        };

        head_matches(0, b".") && head_matches(u64::from(MIN_REC_LEN), b"..")
    }

    /// Validates the remaining entries of a candidate block against what
    /// the scan already knows. Any contradiction disqualifies the block.
    fn root_block_plausible(&self, entries: &[DirEntry]) -> bool {
        for entry in entries {
            if entry.inode == 0 || entry.inode > self.image.inode_count() {
                return false;
            }

            let node = self.tree.get(entry.inode);
            match entry.kind {
                DirEntryKind::Directory => {
                    if let Some(node) = node {
                        let Some(dir) = node.as_directory() else {
                            return false;
                        };
                        if !matches!(dir.parent, None | Some(ROOT_INODE)) {
                            return false;
                        }
                    }
                }
                DirEntryKind::Regular | DirEntryKind::SymbolicLink => {
                    if let Some(node) = node {
                        let matches_kind = matches!(
                            (entry.kind, node),
                            (DirEntryKind::Regular, FileNode::RegularFile(_))
                                | (DirEntryKind::SymbolicLink, FileNode::SymbolicLink(_))
                        );
                        if !matches_kind {
                            return false;
                        }
                        if node.found_link_count() >= u64::from(node.common().link_count) {
                            return false;
                        }
                    }
                }
                _ => return false,
            }
        }

        true
    }

    /// Wires one recovered root entry into the tree. Only nodes the scan
    /// already discovered are touched; the entry is otherwise ignored.
    fn attach_recovered_root_entry(&mut self, entry: &DirEntry) {
        if self.tree.get(entry.inode).is_none() {
            return;
        }

        match entry.kind {
            DirEntryKind::Directory => {
                self.tree.set_directory_name(entry.inode, &entry.name_lossy());
                self.tree.associate_parent(entry.inode, ROOT_INODE);
            }
            DirEntryKind::Regular => {
                self.tree
                    .add_link(entry.inode, false, ROOT_INODE, &entry.name_lossy());
            }
            DirEntryKind::SymbolicLink => {
                self.tree
                    .add_link(entry.inode, true, ROOT_INODE, &entry.name_lossy());
            }
            _ => {}
        }
    }
}
