//! Listing and damage-summary presentation.

use std::io::{self, Write};

use crate::damage::DamageMap;
use crate::naming::{node_paths, status_letters};
use crate::scan::ScanStats;
use crate::tree::{FileNode, FileStatus, FileTree};

/// Per-category damage counters over a whole tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DamageSummary {
    pub total_files: u64,
    pub ok_files: u64,
    pub bad_inode: u64,
    pub parent_unknown: u64,
    pub name_unknown: u64,
    pub missing_links: u64,
    pub bad_map: u64,
    pub bad_data: u64,
}

impl DamageSummary {
    /// Tallies the status of every node in `tree`.
    pub fn collect(tree: &FileTree) -> Self {
        let mut summary = Self::default();

        for inode in tree.inodes_sorted() {
            let status = tree.get(inode).map(FileNode::status).unwrap_or_default();
            summary.total_files += 1;
            if status.is_ok() {
                summary.ok_files += 1;
            }
            for (bit, counter) in [
                (FileStatus::BAD_INODE, &mut summary.bad_inode),
                (FileStatus::PARENT_UNKNOWN, &mut summary.parent_unknown),
                (FileStatus::NAME_UNKNOWN, &mut summary.name_unknown),
                (FileStatus::MISSING_LINKS, &mut summary.missing_links),
                (FileStatus::BAD_MAP, &mut summary.bad_map),
                (FileStatus::BAD_DATA, &mut summary.bad_data),
            ] {
                if status.contains(bit) {
                    *counter += 1;
                }
            }
        }

        summary
    }
}

/// Prints the damage summary: per-category file counts, scanner counters,
/// and the raw byte loss from the rescue map.
pub fn print_summary(
    out: &mut impl Write,
    tree: &FileTree,
    stats: &ScanStats,
    damage: &DamageMap,
) -> io::Result<()> {
    let summary = DamageSummary::collect(tree);

    writeln!(out, "files:              {}", summary.total_files)?;
    writeln!(out, "intact:             {}", summary.ok_files)?;
    writeln!(out, "damaged:            {}", summary.total_files - summary.ok_files)?;
    writeln!(out, "  bad inode (i):    {}", summary.bad_inode)?;
    writeln!(out, "  no parent (p):    {}", summary.parent_unknown)?;
    writeln!(out, "  no name (n):      {}", summary.name_unknown)?;
    writeln!(out, "  missing links (l): {}", summary.missing_links)?;
    writeln!(out, "  bad block map (m): {}", summary.bad_map)?;
    writeln!(out, "  bad data (d):     {}", summary.bad_data)?;
    writeln!(out, "unreadable inodes:  {}", stats.unreadable_inodes)?;
    writeln!(
        out,
        "unreadable bytes:   {} of {}",
        damage.total_bad_byte_count(),
        damage.mapped_size()
    )?;

    let roots = tree.roots();
    if roots.len() > 1 {
        writeln!(out, "detached subtrees:  {}", roots.len() - 1)?;
    }

    Ok(())
}

/// Prints one line per file path: status letters, size, path. Files with
/// several links appear once per link, in inode order.
pub fn print_listing(out: &mut impl Write, tree: &FileTree) -> io::Result<()> {
    for inode in tree.inodes_sorted() {
        let Some(node) = tree.get(inode) else {
            continue;
        };
        let letters = status_letters(node.status());
        let size = node.common().size;

        for path in node_paths(tree, inode) {
            writeln!(out, "{letters} {size:>12} {path}")?;
        }
    }

    Ok(())
}
