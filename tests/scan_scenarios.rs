//! End-to-end scanner scenarios on synthetic images.

mod common;

use std::ops::ControlFlow;

use common::*;
use ext4rescue::ext4::inode::InodeFileMode;
use ext4rescue::naming::{node_paths, status_letters};
use ext4rescue::scan::scan;
use ext4rescue::tree::{FileNode, FileStatus};

fn run_scan(image: &ext4rescue::ext4::Ext4Image) -> ext4rescue::scan::ScanReport {
    scan(image, |_, _| ControlFlow::Continue(())).unwrap()
}

#[test]
fn all_good_image_reconstructs_the_tree() {
    let fs = standard_fs();
    let (_file, image) = open_built(&fs, &[]);
    let report = run_scan(&image);
    let tree = &report.tree;

    assert!(!report.stopped_early);
    assert_eq!(report.stats.unreadable_inodes, 0);
    assert_eq!(tree.inodes_sorted(), vec![2, 11, 12, 13, 14]);
    assert_eq!(tree.roots(), vec![2]);

    let root = tree.get(2).unwrap().as_directory().unwrap();
    assert_eq!(root.name.as_deref(), Some("/"));
    assert_eq!(root.parent, None);
    assert_eq!(root.subdirectory_count, 2);
    assert_eq!(
        root.children.iter().copied().collect::<Vec<_>>(),
        vec![11, 12, 14]
    );

    for inode in [2, 11, 12, 13, 14] {
        let node = tree.get(inode).unwrap();
        assert!(
            node.status().is_ok(),
            "inode {inode} status {}",
            status_letters(node.status())
        );
    }

    assert_eq!(node_paths(tree, 13), vec!["/foobar/hello.txt"]);
    assert_eq!(node_paths(tree, 14), vec!["/link"]);

    let file = tree.get(13).unwrap();
    assert_eq!(file.common().size, 11);
    assert_eq!(file.common().byte_count, 1024);
    assert_eq!(file.common().reachable_byte_count, 1024);
    assert_eq!(file.common().readable_byte_count, 1024);
}

#[test]
fn bad_region_over_file_data_marks_bad_data_only() {
    let fs = standard_fs();
    // Block 20 holds hello.txt's data; its whole page is bad.
    let (_file, image) = open_built(&fs, &[(20 * BLOCK_SIZE, 24 * BLOCK_SIZE)]);
    let report = run_scan(&image);

    let file = report.tree.get(13).unwrap();
    let common = file.common();
    assert!(common.inode_ok);
    assert!(common.block_map_ok);
    assert_eq!(common.reachable_byte_count, 1024);
    assert_eq!(common.readable_byte_count, 0);

    assert_eq!(file.status(), FileStatus::BAD_DATA);
    assert_eq!(status_letters(file.status()), "-----d");

    // Everything else is untouched.
    assert!(report.tree.get(12).unwrap().status().is_ok());
    assert_eq!(report.stats.unreadable_inodes, 0);
}

#[test]
fn corrupt_root_data_with_good_inode_does_not_trigger_recovery() {
    let fs = standard_fs();
    // The page holding the root's directory data (blocks 16..20). The
    // children's directory blocks happen to share it; their entries are
    // lost the same way.
    let (_file, image) = open_built(&fs, &[(16 * BLOCK_SIZE, 20 * BLOCK_SIZE)]);
    let report = run_scan(&image);
    let tree = &report.tree;

    let root = tree.get(2).unwrap().as_directory().unwrap();
    assert!(root.common.inode_ok, "root inode must still be readable");
    assert_eq!(root.name.as_deref(), Some("/"));
    assert!(!root.parent_mismatch);
    assert!(root.children.is_empty());
    assert_eq!(root.subdirectory_count, 0);

    // The subdirectories were still discovered through the inode sweep,
    // just not named; raw-block recovery must not have run (it would have
    // attached names to them from the surviving root block copy).
    let lost_found = tree.get(11).unwrap().as_directory().unwrap();
    assert_eq!(lost_found.name, None);
    assert_eq!(lost_found.parent, None);
}

#[test]
fn damaged_root_inode_recovers_from_raw_directory_block() {
    let mut fs = ImageBuilder::new(64, 64);
    let dir = InodeFileMode::S_IFDIR.0 | 0o755;
    let reg = InodeFileMode::S_IFREG.0 | 0o644;

    // Root inode lives in the damaged page; its directory data survives in
    // block 16 even though nothing points at it any more.
    fs.set_inode(2, dir, 4, BLOCK_SIZE, &[(0, 1, 16)]);
    fs.put_dir_block(
        16,
        &[
            (2, KIND_DIR, b"."),
            (2, KIND_DIR, b".."),
            (33, KIND_DIR, b"photos"),
            (34, KIND_REG, b"readme"),
        ],
    );

    // Inodes 33/34 sit in inode-table block 12, outside the damaged page.
    fs.set_inode(33, dir, 2, BLOCK_SIZE, &[(0, 1, 17)]);
    fs.set_inode(34, reg, 1, 5, &[(0, 1, 20)]);
    fs.put_block(20, b"hello");

    // Page 2 (blocks 8..12) holds inodes 1..32, the root among them.
    let (_file, image) = open_built(&fs, &[(8 * BLOCK_SIZE, 12 * BLOCK_SIZE)]);
    let report = run_scan(&image);
    let tree = &report.tree;

    // Root inode was unreadable together with the other reserved inodes.
    let root = tree.get(2).unwrap().as_directory().unwrap();
    assert!(!root.common.inode_ok);
    assert_eq!(report.stats.unreadable_inodes, 23);
    assert_eq!(tree.get(2).unwrap().status(), FileStatus::BAD_INODE);

    // Recovery found block 16 and re-attached both children.
    let photos = tree.get(33).unwrap().as_directory().unwrap();
    assert_eq!(photos.name.as_deref(), Some("photos"));
    assert_eq!(photos.parent, Some(2));

    let readme = tree.get(34).unwrap();
    match readme {
        FileNode::RegularFile(f) => {
            assert_eq!(f.links, vec![(2, "readme".to_owned())]);
        }
        other => panic!("inode 34 should be a regular file, got {other:?}"),
    }
    assert!(readme.status().is_ok());

    assert_eq!(node_paths(tree, 34), vec!["/readme"]);
    assert_eq!(
        root.children.iter().copied().collect::<Vec<_>>(),
        vec![33, 34]
    );
}

#[test]
fn deleted_inodes_are_skipped() {
    let mut fs = standard_fs();
    fs.set_deleted(13);

    let (_file, image) = open_built(&fs, &[]);
    let report = run_scan(&image);

    // The inode exists only as the phantom its directory entry created;
    // its fields were never recorded.
    let node = report.tree.get(13).unwrap();
    assert!(!node.common().inode_ok);
    assert_eq!(node.status(), FileStatus::BAD_INODE);
}

#[test]
fn progress_callback_can_stop_the_scan() {
    let fs = standard_fs();
    let (_file, image) = open_built(&fs, &[]);

    let mut calls = 0u64;
    let report = scan(&image, |current, total| {
        calls += 1;
        assert!(current <= total);
        // 64 inodes -> total 55, step 1: stop immediately.
        ControlFlow::Break(())
    })
    .unwrap();

    assert!(report.stopped_early);
    assert_eq!(calls, 1);
    // Only the root was visited; hello.txt hides behind /foobar, which the
    // stopped scan never reached.
    assert!(report.tree.get(13).is_none());

    let full = run_scan(&image);
    assert_eq!(full.tree.len(), 5);
}

#[test]
fn progress_callback_cadence() {
    let fs = standard_fs();
    let (_file, image) = open_built(&fs, &[]);

    let mut calls = 0u64;
    let mut last = (0, 0);
    scan(&image, |current, total| {
        calls += 1;
        last = (current, total);
        ControlFlow::Continue(())
    })
    .unwrap();

    // total = 1 + (64 - 10) = 55; step = ceil(55/1024) = 1.
    assert_eq!(calls, 55);
    assert_eq!(last, (55, 55));
}

#[test]
fn symlink_targets_resolve() {
    let fs = standard_fs();
    let (_file, image) = open_built(&fs, &[]);

    let view = image.inode(14).unwrap();
    assert_eq!(
        image.symlink_target(&view).as_deref(),
        Some(b"foobar/hello.txt".as_slice())
    );
}
