//! Human-readable paths and status rendering for tree nodes.
//!
//! A damaged tree cannot always produce a real path: directories may have
//! lost their name, their parent, or their whole ancestry. Rather than
//! refusing, the path builder substitutes stable placeholders
//! (`~~DIR@<inode>`, `~~FILE@<inode>`, `~~@UNKNOWN_PARENT`) so every node
//! can be listed and extracted somewhere deterministic.

use hashbrown::HashSet;

use crate::ext4::inode::ROOT_INODE;
use crate::tree::{FileNode, FileStatus, FileTree};

/// Pseudo-root prepended when a parent chain dead-ends before inode 2.
pub const UNKNOWN_PARENT: &str = "~~@UNKNOWN_PARENT";

/// Status letters in render order; one per [`FileStatus`] bit.
const STATUS_LETTERS: [(FileStatus, char); 6] = [
    (FileStatus::BAD_INODE, 'i'),
    (FileStatus::PARENT_UNKNOWN, 'p'),
    (FileStatus::NAME_UNKNOWN, 'n'),
    (FileStatus::MISSING_LINKS, 'l'),
    (FileStatus::BAD_MAP, 'm'),
    (FileStatus::BAD_DATA, 'd'),
];

/// Renders a status as the fixed-width `ipnlmd` letter string, `-` for
/// clear bits.
pub fn status_letters(status: FileStatus) -> String {
    STATUS_LETTERS
        .iter()
        .map(|&(bit, letter)| if status.contains(bit) { letter } else { '-' })
        .collect()
}

/// Every path a node is reachable under.
///
/// Directories have exactly one path. Files and symlinks get one path per
/// discovered link, or a single placeholder path when no link survived.
pub fn node_paths(tree: &FileTree, inode: u64) -> Vec<String> {
    match tree.get(inode) {
        Some(FileNode::Directory(_)) | None => {
            vec![directory_path(tree, inode, &mut HashSet::new())]
        }
        Some(FileNode::RegularFile(f)) => linked_paths(tree, inode, &f.links, "~~FILE@"),
        Some(FileNode::SymbolicLink(f)) => linked_paths(tree, inode, &f.links, "~~SYMLINK@"),
    }
}

fn linked_paths(
    tree: &FileTree,
    inode: u64,
    links: &[(u64, String)],
    placeholder: &str,
) -> Vec<String> {
    if links.is_empty() {
        return vec![format!("{UNKNOWN_PARENT}/{placeholder}{inode}")];
    }

    links
        .iter()
        .map(|(parent, name)| {
            let dir = directory_path(tree, *parent, &mut HashSet::new());
            join(&dir, name)
        })
        .collect()
}

/// Path of a directory by walking its parent chain.
///
/// The chain ends at the root (`"/"`), at a node with no parent (rendered
/// under [`UNKNOWN_PARENT`]), or at a cycle, which corruption can produce
/// and which is treated like a missing parent.
fn directory_path(tree: &FileTree, inode: u64, visited: &mut HashSet<u64>) -> String {
    if inode == ROOT_INODE {
        return "/".into();
    }

    let name = match tree.get(inode).and_then(FileNode::as_directory) {
        Some(dir) => dir
            .name
            .clone()
            .unwrap_or_else(|| format!("~~DIR@{inode}")),
        None => format!("~~DIR@{inode}"),
    };

    let parent = tree
        .get(inode)
        .and_then(FileNode::as_directory)
        .and_then(|dir| dir.parent);

    match parent {
        Some(parent) if visited.insert(inode) => {
            let base = directory_path(tree, parent, visited);
            join(&base, &name)
        }
        _ => format!("{UNKNOWN_PARENT}/{name}"),
    }
}

fn join(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FileTree;

    fn sample_tree() -> FileTree {
        let mut tree = FileTree::new();
        tree.associate_parent(15, 2);
        tree.set_directory_name(15, "docs");
        tree.associate_parent(16, 15);
        tree.set_directory_name(16, "old");
        tree.add_link(20, false, 16, "notes.txt");
        tree.add_link(20, false, 2, "hardlink.txt");
        tree
    }

    #[test]
    fn plain_paths() {
        let tree = sample_tree();
        assert_eq!(node_paths(&tree, 2), vec!["/"]);
        assert_eq!(node_paths(&tree, 15), vec!["/docs"]);
        assert_eq!(node_paths(&tree, 16), vec!["/docs/old"]);
        assert_eq!(
            node_paths(&tree, 20),
            vec!["/docs/old/notes.txt", "/hardlink.txt"]
        );
    }

    #[test]
    fn paths_are_stable_across_revisits() {
        let tree = sample_tree();
        for _ in 0..3 {
            assert_eq!(node_paths(&tree, 20), node_paths(&tree, 20));
            assert_eq!(node_paths(&tree, 16), vec!["/docs/old"]);
        }
    }

    #[test]
    fn nameless_directory_gets_placeholder() {
        let mut tree = sample_tree();
        tree.associate_parent(17, 15);
        assert_eq!(node_paths(&tree, 17), vec!["/docs/~~DIR@17"]);
    }

    #[test]
    fn parentless_chain_is_rooted_at_unknown_parent() {
        let mut tree = FileTree::new();
        // 30 has a name but its parent was never found.
        tree.set_directory_name(30, "stray");
        tree.associate_parent(31, 30);
        tree.set_directory_name(31, "inner");
        tree.add_link(40, false, 31, "file");

        assert_eq!(node_paths(&tree, 30), vec!["~~@UNKNOWN_PARENT/stray"]);
        assert_eq!(node_paths(&tree, 31), vec!["~~@UNKNOWN_PARENT/stray/inner"]);
        assert_eq!(
            node_paths(&tree, 40),
            vec!["~~@UNKNOWN_PARENT/stray/inner/file"]
        );
    }

    #[test]
    fn unlinked_files_get_placeholder_paths() {
        let mut tree = FileTree::new();
        tree.file_mut(50, false).unwrap();
        tree.file_mut(51, true).unwrap();
        assert_eq!(node_paths(&tree, 50), vec!["~~@UNKNOWN_PARENT/~~FILE@50"]);
        assert_eq!(
            node_paths(&tree, 51),
            vec!["~~@UNKNOWN_PARENT/~~SYMLINK@51"]
        );
    }

    #[test]
    fn parent_cycles_terminate() {
        let mut tree = FileTree::new();
        tree.set_directory_name(60, "a");
        tree.set_directory_name(61, "b");
        tree.associate_parent(60, 61);
        tree.associate_parent(61, 60);

        let paths = node_paths(&tree, 60);
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with(UNKNOWN_PARENT));
        assert!(paths[0].ends_with("/a"));
    }

    #[test]
    fn letters_render_in_fixed_order() {
        assert_eq!(status_letters(FileStatus::empty()), "------");
        assert_eq!(status_letters(FileStatus::BAD_INODE), "i-----");
        assert_eq!(status_letters(FileStatus::BAD_DATA), "-----d");
        assert_eq!(
            status_letters(
                FileStatus::PARENT_UNKNOWN | FileStatus::NAME_UNKNOWN | FileStatus::MISSING_LINKS
            ),
            "-pnl--"
        );
        assert_eq!(status_letters(FileStatus::all()), "ipnlmd");
    }
}
