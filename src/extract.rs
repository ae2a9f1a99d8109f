//! Extraction of surviving data into a target directory.
//!
//! Walks the tree's nodes that are reachable by a real path (rooted at
//! `/`), recreates directories, files, hard links and symlinks under the
//! target, and restores what metadata the inodes still provide. Each
//! extracted entry is tagged with its status letters in a
//! `user.ext4rescue.status` extended attribute so damaged files remain
//! identifiable after the fact.
//!
//! Data is written extent by extent at its logical offset; holes and
//! unrescued extents stay unwritten, leaving sparse zero ranges.

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::errors::Result;
use crate::ext4::image::{Ext4Image, InodeView};
use crate::ext4::inode::{Ext4Inode, ROOT_INODE};
use crate::naming::{node_paths, status_letters, UNKNOWN_PARENT};
use crate::tree::{FileNode, FileTree};

/// Counters for one extraction run.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractStats {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,

    /// Nodes or links skipped: unknown path, unsafe name, or unreadable
    /// symlink target.
    pub skipped: u64,
}

/// Extracts every path-reachable node of `tree` below `target`.
///
/// # Errors
///
/// [`crate::errors::Error::Io`] on any write failure under the target;
/// damage in the source image is not an error (it shows in the extracted
/// file's status attribute instead).
pub fn extract_tree(image: &Ext4Image, tree: &FileTree, target: &Path) -> Result<ExtractStats> {
    let mut stats = ExtractStats::default();
    fs::create_dir_all(target)?;

    // Directories first, in path order, so parents exist before children.
    // The root maps onto the target directory itself.
    let mut dir_paths: Vec<(u64, PathBuf)> = Vec::new();
    for inode in tree.inodes_sorted() {
        if let Some(FileNode::Directory(_)) = tree.get(inode) {
            let rel = if inode == ROOT_INODE {
                Some(PathBuf::new())
            } else {
                extraction_path(tree, inode).pop()
            };
            match rel {
                Some(rel) => dir_paths.push((inode, rel)),
                None => stats.skipped += 1,
            }
        }
    }
    dir_paths.sort_by(|a, b| a.1.cmp(&b.1));

    for (inode, rel) in &dir_paths {
        let dest = target.join(rel);
        fs::create_dir_all(&dest)?;
        stats.directories += 1;
        apply_metadata(image, tree, *inode, &dest, false);
    }

    for inode in tree.inodes_sorted() {
        match tree.get(inode) {
            Some(FileNode::RegularFile(_)) => extract_file(image, tree, inode, target, &mut stats)?,
            Some(FileNode::SymbolicLink(_)) => {
                extract_symlink(image, tree, inode, target, &mut stats)?
            }
            _ => {}
        }
    }

    tracing::info!(
        directories = stats.directories,
        files = stats.files,
        symlinks = stats.symlinks,
        skipped = stats.skipped,
        "extraction finished"
    );
    Ok(stats)
}

/// Relative extraction paths of a node: its known paths, made safe, with
/// unknown-parent subtrees dropped.
fn extraction_path(tree: &FileTree, inode: u64) -> Vec<PathBuf> {
    node_paths(tree, inode)
        .into_iter()
        .filter(|path| !path.starts_with(UNKNOWN_PARENT))
        .filter_map(|path| safe_relative(&path))
        .collect()
}

/// Converts an absolute tree path into a relative one, refusing anything a
/// corrupt name could use to escape the target directory.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let rel = Path::new(path.strip_prefix('/')?);
    if rel.as_os_str().is_empty() {
        return None;
    }

    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }

    Some(rel.to_owned())
}

fn extract_file(
    image: &Ext4Image,
    tree: &FileTree,
    inode: u64,
    target: &Path,
    stats: &mut ExtractStats,
) -> Result<()> {
    let paths = extraction_path(tree, inode);
    if paths.is_empty() {
        stats.skipped += 1;
        return Ok(());
    }

    let first = target.join(&paths[0]);
    write_file_data(image, tree, inode, &first)?;
    stats.files += 1;
    apply_metadata(image, tree, inode, &first, false);

    // Remaining paths are the file's other hard links.
    for rel in &paths[1..] {
        let dest = target.join(rel);
        if let Err(err) = fs::hard_link(&first, &dest) {
            tracing::warn!(dest = %dest.display(), %err, "hard link failed");
            stats.skipped += 1;
        } else {
            stats.files += 1;
        }
    }

    Ok(())
}

/// Writes the readable extents of `inode` into `dest`, sized to the
/// declared file length.
fn write_file_data(image: &Ext4Image, tree: &FileTree, inode: u64, dest: &Path) -> Result<()> {
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)?;

    let size = tree.get(inode).map_or(0, |node| node.common().size);
    out.set_len(size)?;

    let Ok(view) = image.inode(inode) else {
        return Ok(());
    };
    if !view.is_ok() {
        return Ok(());
    }
    let Some(range) = image.extents(&view) else {
        return Ok(());
    };

    let block_size = image.block_size();
    for extent in range {
        if !extent.ok || extent.block_count == 0 {
            continue;
        }

        let mapped = image.map_extent(&extent);
        let bytes = mapped.bytes();
        if bytes.is_empty() {
            continue;
        }

        let logical_begin = u64::from(extent.logical_block) * block_size;
        if logical_begin >= size {
            continue;
        }
        let len = bytes.len().min((size - logical_begin) as usize);

        out.seek(SeekFrom::Start(logical_begin))?;
        out.write_all(&bytes[..len])?;
    }

    out.flush()?;
    Ok(())
}

fn extract_symlink(
    image: &Ext4Image,
    tree: &FileTree,
    inode: u64,
    target: &Path,
    stats: &mut ExtractStats,
) -> Result<()> {
    let paths = extraction_path(tree, inode);
    if paths.is_empty() {
        stats.skipped += 1;
        return Ok(());
    }

    let link_target = image
        .inode(inode)
        .ok()
        .and_then(|view| image.symlink_target(&view));
    let Some(link_target) = link_target else {
        tracing::warn!(inode, "symlink target is unreadable, skipping");
        stats.skipped += paths.len() as u64;
        return Ok(());
    };

    let link_target = {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(link_target))
    };

    for rel in &paths {
        let dest = target.join(rel);
        match std::os::unix::fs::symlink(&link_target, &dest) {
            Ok(()) => {
                stats.symlinks += 1;
                apply_metadata(image, tree, inode, &dest, true);
            }
            Err(err) => {
                tracing::warn!(dest = %dest.display(), %err, "symlink failed");
                stats.skipped += 1;
            }
        }
    }

    Ok(())
}

/// Restores permissions and modification time from the inode when it was
/// readable, and records the status letters as an extended attribute.
fn apply_metadata(image: &Ext4Image, tree: &FileTree, inode: u64, dest: &Path, symlink: bool) {
    if let Some(node) = tree.get(inode) {
        set_status_attr(dest, &status_letters(node.status()), symlink);
    }

    let Ok(view) = image.inode(inode) else {
        return;
    };
    if !view.is_ok() {
        return;
    }
    let raw = view.read();

    if !symlink {
        if let Err(err) = fs::set_permissions(dest, inode_permissions(&raw)) {
            tracing::debug!(dest = %dest.display(), %err, "chmod failed");
        }
    }

    set_mtime(image, &view, &raw, dest, symlink);
}

fn inode_permissions(inode: &Ext4Inode) -> fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    let mode = crate::ext4::inode::InodeFileMode(u16::from_le(inode.i_mode.0));
    fs::Permissions::from_mode(mode.permissions())
}

fn set_mtime(image: &Ext4Image, view: &InodeView, raw: &Ext4Inode, dest: &Path, symlink: bool) {
    let secs = i64::from(raw.modification_time());
    let nanos = image
        .inode_tail(view)
        .map_or(0, |tail| i64::from(tail.mtime_nanos()));

    let Ok(cpath) = CString::new(dest.as_os_str().as_bytes()) else {
        return;
    };

    let time = libc::timespec {
        tv_sec: secs as _,
        tv_nsec: nanos as _,
    };
    let times = [time, time];
    let flags = if symlink {
        libc::AT_SYMLINK_NOFOLLOW
    } else {
        0
    };

    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), flags) };
    if rc != 0 {
        tracing::debug!(dest = %dest.display(), "utimensat failed");
    }
}

#[cfg(target_os = "linux")]
fn set_status_attr(dest: &Path, letters: &str, symlink: bool) {
    let Ok(cpath) = CString::new(dest.as_os_str().as_bytes()) else {
        return;
    };
    let name = c"user.ext4rescue.status";

    let rc = unsafe {
        if symlink {
            libc::lsetxattr(
                cpath.as_ptr(),
                name.as_ptr(),
                letters.as_ptr().cast(),
                letters.len(),
                0,
            )
        } else {
            libc::setxattr(
                cpath.as_ptr(),
                name.as_ptr(),
                letters.as_ptr().cast(),
                letters.len(),
                0,
            )
        }
    };
    if rc != 0 {
        tracing::debug!(dest = %dest.display(), "setxattr failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_status_attr(_dest: &Path, _letters: &str, _symlink: bool) {}
