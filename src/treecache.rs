//! Persistent cache of a reconstructed [`FileTree`].
//!
//! Scanning a large image is expensive; the resulting tree is written to a
//! small line-oriented file keyed by the identity of its inputs. The key is
//! a SHA-1 over the absolute image path and modification time, plus the
//! rescue log's when one was used, so touching either input switches to a
//! different cache file and forces a rescan.
//!
//! Cache-load failures are never fatal: the caller logs them and falls back
//! to a full scan.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use sha1::{Digest, Sha1};

use crate::errors::{Error, Result};
use crate::tree::{Directory, FileCommon, FileNode, FileTree, MultiplyLinkedFile};

/// Format version written to the first line. Readers accept exactly this.
pub const CACHE_VERSION: u32 = 10004;

/// Directory under `$HOME` holding all cache files.
const CACHE_DIR: &str = ".ext4rescue";

/// Computes the cache file path for the given image and optional rescue
/// log: `$HOME/.ext4rescue/<sha1 of identities>.cache`.
///
/// # Errors
///
/// [`Error::Io`] when a path cannot be canonicalized or its metadata read,
/// or when `$HOME` is unset.
pub fn cache_file_path(image: &Path, rescue_log: Option<&Path>) -> Result<PathBuf> {
    let mut hasher = Sha1::new();
    hasher.update(identity(image)?.as_bytes());
    if let Some(log) = rescue_log {
        hasher.update(identity(log)?.as_bytes());
    }

    let digest = hasher.finalize();
    let mut name = String::with_capacity(digest.len() * 2 + 6);
    for byte in digest {
        name.push_str(&format!("{byte:02x}"));
    }
    name.push_str(".cache");

    Ok(home_dir()?.join(CACHE_DIR).join(name))
}

/// `<abspath>!<mtime as RFC 3339 with nanoseconds>` for one input file.
fn identity(path: &Path) -> Result<String> {
    let abs = fs::canonicalize(path)?;
    let mtime = fs::metadata(&abs)?.modified()?;
    Ok(format!("{}!{}", abs.display(), mtime_iso(mtime)))
}

fn mtime_iso(mtime: SystemTime) -> String {
    DateTime::<Utc>::from(mtime).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| Error::Io(std::io::Error::other("HOME is not set")))
}

/// Writes `tree` to the cache file derived from the inputs, creating the
/// cache directory on first use. Returns the path written.
pub fn cache_file_tree(
    tree: &FileTree,
    image: &Path,
    rescue_log: Option<&Path>,
) -> Result<PathBuf> {
    let path = cache_file_path(image, rescue_log)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut out = BufWriter::new(File::create(&path)?);
    writeln!(out, "{CACHE_VERSION}")?;
    writeln!(out, "{}", image.display())?;
    match rescue_log {
        Some(log) => writeln!(out, "{}", log.display())?,
        None => writeln!(out)?,
    }

    for inode in tree.inodes_sorted() {
        let node = tree.get(inode).expect("sorted inode vanished");
        writeln!(out, "{}", node_line(node))?;
    }

    out.flush()?;
    tracing::debug!(path = %path.display(), nodes = tree.len(), "tree cache written");
    Ok(path)
}

/// Removes the cache file for the inputs, if one exists. Used after a
/// failed or aborted scan so a stale tree is never reloaded.
pub fn remove_cached_file_tree(image: &Path, rescue_log: Option<&Path>) -> Result<()> {
    let path = cache_file_path(image, rescue_log)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Loads the cached tree for the inputs.
///
/// Returns `Ok(None)` when no cache file exists for this (image, log,
/// mtimes) identity.
///
/// # Errors
///
/// [`Error::CacheVersion`] for a version outside the accepted range,
/// [`Error::CacheMismatch`] when the stored paths differ from the inputs,
/// [`Error::Parse`] for a malformed node line. All of these are recoverable
/// by rescanning.
pub fn read_cached_file_tree(image: &Path, rescue_log: Option<&Path>) -> Result<Option<FileTree>> {
    let path = cache_file_path(image, rescue_log)?;
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()?;
    let parse_err = |line: usize, msg: String| Error::Parse {
        path: path.clone(),
        line,
        msg,
    };

    let version_line = lines
        .first()
        .ok_or_else(|| parse_err(1, "empty cache file".into()))?;
    let version: u32 = version_line
        .trim()
        .parse()
        .map_err(|_| parse_err(1, format!("bad version {version_line:?}")))?;
    if version != CACHE_VERSION {
        return Err(Error::CacheVersion(version));
    }

    let stored_image = lines
        .get(1)
        .ok_or_else(|| parse_err(2, "missing image path".into()))?;
    if *stored_image != image.display().to_string() {
        return Err(Error::CacheMismatch("image"));
    }

    let stored_log = lines
        .get(2)
        .ok_or_else(|| parse_err(3, "missing rescue log path".into()))?;
    let expected_log = rescue_log.map_or(String::new(), |p| p.display().to_string());
    if *stored_log != expected_log {
        return Err(Error::CacheMismatch("rescue log"));
    }

    let mut tree = FileTree::new();
    let mut dir_parents: Vec<(u64, u64)> = Vec::new();
    let mut file_links: Vec<(u64, u64)> = Vec::new();

    for (idx, line) in lines.iter().enumerate().skip(3) {
        if line.is_empty() {
            continue;
        }
        let node = parse_node_line(line).map_err(|msg| parse_err(idx + 1, msg))?;

        match &node {
            FileNode::Directory(d) => {
                if let Some(parent) = d.parent {
                    dir_parents.push((d.common.inode, parent));
                }
            }
            FileNode::RegularFile(f) | FileNode::SymbolicLink(f) => {
                for (parent, _) in &f.links {
                    file_links.push((f.common.inode, *parent));
                }
            }
        }
        tree.insert(node);
    }

    // Children sets and subdirectory counters are derived state; rebuild
    // them from the loaded parent edges.
    for (child, parent) in dir_parents {
        if let Some(dir) = tree.directory_mut(parent) {
            dir.children.insert(child);
            dir.subdirectory_count += 1;
        }
    }
    for (child, parent) in file_links {
        if let Some(dir) = tree.directory_mut(parent) {
            dir.children.insert(child);
        }
    }

    tracing::debug!(path = %path.display(), nodes = tree.len(), "tree cache loaded");
    Ok(Some(tree))
}

fn bool_field(value: bool) -> char {
    if value {
        '1'
    } else {
        '0'
    }
}

fn common_fields(tag: char, common: &FileCommon) -> String {
    format!(
        "{tag}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
        common.inode,
        common.link_count,
        common.byte_count,
        common.size,
        bool_field(common.inode_ok),
        bool_field(common.block_map_ok),
        common.mapped_byte_count,
        common.reachable_byte_count,
        common.readable_byte_count,
    )
}

fn node_line(node: &FileNode) -> String {
    match node {
        FileNode::Directory(d) => {
            format!(
                "{}/{}/{}/{}",
                common_fields('d', &d.common),
                d.parent.unwrap_or(0),
                bool_field(d.parent_mismatch),
                d.name.as_deref().unwrap_or(""),
            )
        }
        FileNode::RegularFile(f) => file_line('r', f),
        FileNode::SymbolicLink(f) => file_line('l', f),
    }
}

fn file_line(tag: char, file: &MultiplyLinkedFile) -> String {
    let mut line = common_fields(tag, &file.common);
    for (parent, name) in &file.links {
        line.push('/');
        line.push_str(&parent.to_string());
        line.push('/');
        line.push_str(name);
    }
    line
}

fn parse_node_line(line: &str) -> std::result::Result<FileNode, String> {
    let tag = line
        .chars()
        .next()
        .ok_or_else(|| "empty node line".to_string())?;

    match tag {
        'd' => {
            // The name is the final field and may itself contain `/` (the
            // root's name does), so split with a bounded field count.
            let fields: Vec<&str> = line.splitn(13, '/').collect();
            if fields.len() != 13 {
                return Err(format!("expected 13 fields, found {}", fields.len()));
            }
            let common = parse_common(&fields[1..10])?;

            let parent = parse_u64(fields[10])?;
            let name = fields[12];
            Ok(FileNode::Directory(Directory {
                common,
                parent: (parent != 0).then_some(parent),
                parent_mismatch: parse_bool(fields[11])?,
                name: (!name.is_empty()).then(|| name.to_owned()),
                children: Default::default(),
                subdirectory_count: 0,
            }))
        }
        'r' | 'l' => {
            let fields: Vec<&str> = line.split('/').collect();
            if fields.len() < 10 || (fields.len() - 10) % 2 != 0 {
                return Err(format!("bad field count {}", fields.len()));
            }
            let common = parse_common(&fields[1..10])?;

            let mut links = Vec::new();
            let mut rest = &fields[10..];
            while let [parent, name, tail @ ..] = rest {
                links.push((parse_u64(parent)?, (*name).to_owned()));
                rest = tail;
            }

            let file = MultiplyLinkedFile { common, links };
            Ok(match tag {
                'r' => FileNode::RegularFile(file),
                _ => FileNode::SymbolicLink(file),
            })
        }
        other => Err(format!("unknown node type tag {other:?}")),
    }
}

fn parse_common(fields: &[&str]) -> std::result::Result<FileCommon, String> {
    Ok(FileCommon {
        inode: parse_u64(fields[0])?,
        link_count: fields[1]
            .parse()
            .map_err(|_| format!("bad link count {:?}", fields[1]))?,
        byte_count: parse_u64(fields[2])?,
        size: parse_u64(fields[3])?,
        inode_ok: parse_bool(fields[4])?,
        block_map_ok: parse_bool(fields[5])?,
        mapped_byte_count: parse_u64(fields[6])?,
        reachable_byte_count: parse_u64(fields[7])?,
        readable_byte_count: parse_u64(fields[8])?,
    })
}

fn parse_u64(field: &str) -> std::result::Result<u64, String> {
    field.parse().map_err(|_| format!("bad number {field:?}"))
}

fn parse_bool(field: &str) -> std::result::Result<bool, String> {
    match field {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(format!("bad flag {other:?}")),
    }
}
