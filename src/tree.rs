//! Reconstructed file tree.
//!
//! Nodes are keyed by inode number and refer to each other by number, never
//! by pointer: under corruption the parent/child graph is not guaranteed to
//! be a tree, and number-keyed lookups tolerate forward references while the
//! scan is still discovering nodes.
//!
//! Every node carries the raw ingredients of its health verdict (link
//! counts, byte accounting, `ok` flags); [`FileStatus`] is derived on
//! demand, never stored.

use bitflags::bitflags;
use hashbrown::HashMap;
use std::collections::BTreeSet;

use crate::ext4::inode::ROOT_INODE;

bitflags! {
    /// What is wrong with a file, one bit per independent finding.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FileStatus: u8 {
        /// The inode itself was unreadable; nothing else is known.
        const BAD_INODE = 1 << 0;

        /// No (or no unambiguous) parent directory was found.
        const PARENT_UNKNOWN = 1 << 1;

        /// No name was found for the file.
        const NAME_UNKNOWN = 1 << 2;

        /// Fewer links were found than the inode declares.
        const MISSING_LINKS = 1 << 3;

        /// The extent tree was damaged; the data accounting is incomplete.
        const BAD_MAP = 1 << 4;

        /// Some reachable data bytes are unreadable.
        const BAD_DATA = 1 << 5;
    }
}

impl FileStatus {
    /// A file is ok exactly when no finding is set.
    pub fn is_ok(self) -> bool {
        self.is_empty()
    }
}

/// Fields shared by every node variant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileCommon {
    /// Inode number.
    pub inode: u64,

    /// Hard link count declared by the inode.
    pub link_count: u16,

    /// Bytes occupied on disk as declared by the inode (512-byte sectors).
    pub byte_count: u64,

    /// File size in bytes as declared by the inode.
    pub size: u64,

    /// Bytes covered by readable extents.
    pub mapped_byte_count: u64,

    /// Bytes covered by extents whose start was resolved.
    pub reachable_byte_count: u64,

    /// Readable subset of the reachable bytes, per the damage map.
    pub readable_byte_count: u64,

    /// Whether the inode bytes themselves were rescued.
    pub inode_ok: bool,

    /// Whether the extent tree root was intact.
    pub block_map_ok: bool,
}

impl FileCommon {
    fn new(inode: u64) -> Self {
        Self {
            inode,
            block_map_ok: true,
            ..Self::default()
        }
    }
}

/// A directory node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directory {
    pub common: FileCommon,

    /// Parent directory, when exactly one candidate was seen.
    pub parent: Option<u64>,

    /// A second, different parent candidate was seen; the first one is
    /// kept but can no longer be trusted.
    pub parent_mismatch: bool,

    /// Name of this directory within its parent.
    pub name: Option<String>,

    /// Every node whose parent (or link parent) is this directory.
    pub children: BTreeSet<u64>,

    /// Number of subdirectories that named this directory as parent.
    pub subdirectory_count: u64,
}

/// A regular file or symlink: anything reached purely through hard links.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiplyLinkedFile {
    pub common: FileCommon,

    /// `(parent inode, name)` for every directory entry seen pointing here,
    /// in discovery order.
    pub links: Vec<(u64, String)>,
}

/// One reconstructed file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileNode {
    Directory(Directory),
    RegularFile(MultiplyLinkedFile),
    SymbolicLink(MultiplyLinkedFile),
}

impl FileNode {
    pub fn common(&self) -> &FileCommon {
        match self {
            Self::Directory(d) => &d.common,
            Self::RegularFile(f) | Self::SymbolicLink(f) => &f.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut FileCommon {
        match self {
            Self::Directory(d) => &mut d.common,
            Self::RegularFile(f) | Self::SymbolicLink(f) => &mut f.common,
        }
    }

    pub fn as_directory(&self) -> Option<&Directory> {
        match self {
            Self::Directory(d) => Some(d),
            _ => None,
        }
    }

    /// Number of links actually discovered, the counterpart of the inode's
    /// declared link count. For a directory that is its subdirectories'
    /// `..` entries, its own `.`, and its name in the parent.
    pub fn found_link_count(&self) -> u64 {
        match self {
            Self::Directory(d) => {
                d.subdirectory_count + 1 + u64::from(d.name.is_some())
            }
            Self::RegularFile(f) | Self::SymbolicLink(f) => f.links.len() as u64,
        }
    }

    /// Derives the status bitmask from the node's recorded facts.
    pub fn status(&self) -> FileStatus {
        let common = self.common();

        if !common.inode_ok {
            return FileStatus::BAD_INODE;
        }

        let mut status = FileStatus::empty();
        if !common.block_map_ok {
            status |= FileStatus::BAD_MAP;
        }
        if common.readable_byte_count < common.reachable_byte_count {
            status |= FileStatus::BAD_DATA;
        }

        match self {
            Self::Directory(d) => {
                if i128::from(d.subdirectory_count) != i128::from(common.link_count) - 2 {
                    status |= FileStatus::MISSING_LINKS;
                }
                if common.inode == ROOT_INODE {
                    return status;
                }
                if d.parent.is_none() || d.parent_mismatch {
                    status |= FileStatus::PARENT_UNKNOWN;
                }
                if d.name.is_none() {
                    status |= FileStatus::NAME_UNKNOWN | FileStatus::MISSING_LINKS;
                }
            }
            Self::RegularFile(f) | Self::SymbolicLink(f) => {
                if f.links.len() as u64 != u64::from(common.link_count) {
                    status |= FileStatus::MISSING_LINKS;
                }
                if f.links.is_empty() {
                    status |= FileStatus::PARENT_UNKNOWN | FileStatus::NAME_UNKNOWN;
                }
            }
        }

        status
    }
}

/// The reconstructed tree: inode number → node.
#[derive(Clone, Debug, Default)]
pub struct FileTree {
    nodes: HashMap<u64, FileNode>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, inode: u64) -> Option<&FileNode> {
        self.nodes.get(&inode)
    }

    pub fn get_mut(&mut self, inode: u64) -> Option<&mut FileNode> {
        self.nodes.get_mut(&inode)
    }

    /// Inode numbers in ascending order.
    pub fn inodes_sorted(&self) -> Vec<u64> {
        let mut inodes: Vec<u64> = self.nodes.keys().copied().collect();
        inodes.sort_unstable();
        inodes
    }

    /// Nodes with no known parent: unparented directories plus files and
    /// symlinks without a single link. Sorted by inode number.
    pub fn roots(&self) -> Vec<u64> {
        let mut roots: Vec<u64> = self
            .nodes
            .iter()
            .filter(|(_, node)| match node {
                FileNode::Directory(d) => d.parent.is_none(),
                FileNode::RegularFile(f) | FileNode::SymbolicLink(f) => f.links.is_empty(),
            })
            .map(|(&inode, _)| inode)
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Inserts a fully-formed node, replacing any previous one. Used by the
    /// tree-cache loader.
    pub fn insert(&mut self, node: FileNode) {
        self.nodes.insert(node.common().inode, node);
    }

    /// Looks up `inode` as a directory, creating it if absent. Returns
    /// `None` when the inode already exists as a different node type (a
    /// corrupt image can claim both).
    pub fn directory_mut(&mut self, inode: u64) -> Option<&mut Directory> {
        let node = self.nodes.entry(inode).or_insert_with(|| {
            let mut dir = Directory {
                common: FileCommon::new(inode),
                ..Directory::default()
            };
            if inode == ROOT_INODE {
                dir.name = Some("/".into());
            }
            FileNode::Directory(dir)
        });

        match node {
            FileNode::Directory(d) => Some(d),
            _ => {
                tracing::warn!(inode, "inode referenced both as directory and as file");
                None
            }
        }
    }

    /// Looks up `inode` as a regular file or symlink, creating it if
    /// absent. `symlink` only matters at creation time.
    pub fn file_mut(&mut self, inode: u64, symlink: bool) -> Option<&mut MultiplyLinkedFile> {
        let node = self.nodes.entry(inode).or_insert_with(|| {
            let file = MultiplyLinkedFile {
                common: FileCommon::new(inode),
                links: Vec::new(),
            };
            if symlink {
                FileNode::SymbolicLink(file)
            } else {
                FileNode::RegularFile(file)
            }
        });

        match node {
            FileNode::RegularFile(f) | FileNode::SymbolicLink(f) => Some(f),
            FileNode::Directory(_) => {
                tracing::warn!(inode, "inode referenced both as file and as directory");
                None
            }
        }
    }

    /// Records `parent` as the parent of directory `child`.
    ///
    /// The first association wins; a later, different candidate only sets
    /// the child's `parent_mismatch` flag.
    pub fn associate_parent(&mut self, child: u64, parent: u64) {
        // The root's `..` points at itself; a self-parent is never an edge.
        if child == parent {
            return;
        }

        let Some(child_dir) = self.directory_mut(child) else {
            return;
        };

        match child_dir.parent {
            None => {
                child_dir.parent = Some(parent);
                if let Some(parent_dir) = self.directory_mut(parent) {
                    parent_dir.children.insert(child);
                    parent_dir.subdirectory_count += 1;
                }
            }
            Some(existing) if existing == parent => {}
            Some(_) => {
                if let Some(child_dir) = self.directory_mut(child) {
                    child_dir.parent_mismatch = true;
                }
            }
        }
    }

    /// Names directory `inode`; the first name seen is kept.
    pub fn set_directory_name(&mut self, inode: u64, name: &str) {
        if inode == ROOT_INODE {
            return;
        }
        if let Some(dir) = self.directory_mut(inode) {
            if dir.name.is_none() {
                dir.name = Some(name.to_owned());
            }
        }
    }

    /// Appends a `(parent, name)` link to file or symlink `inode` and
    /// registers it among the parent's children.
    pub fn add_link(&mut self, inode: u64, symlink: bool, parent: u64, name: &str) {
        let Some(file) = self.file_mut(inode, symlink) else {
            return;
        };
        file.links.push((parent, name.to_owned()));

        if let Some(parent_dir) = self.directory_mut(parent) {
            parent_dir.children.insert(inode);
        }
    }
}
