//! Command-line front-end: scan a rescued image, list or summarize the
//! surviving tree, extract data.

use std::io::Write;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ext4rescue::damage::DamageMap;
use ext4rescue::ext4::{Ext4Image, DEFAULT_CACHE_PAGES};
use ext4rescue::scan::{self, ScanStats};
use ext4rescue::tree::FileTree;
use ext4rescue::{extract, report, treecache};

/// Examine and recover files from a damaged ext2/3/4 filesystem image.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the raw filesystem image.
    image: PathBuf,

    /// GNU ddrescue map file describing the rescued byte ranges.
    #[arg(long, value_name = "FILE")]
    ddrescue_log: Option<PathBuf>,

    /// Ignore any cached file tree and rescan the image.
    #[arg(long)]
    force_scan: bool,

    /// List every file with its status letters and path.
    #[arg(long)]
    list: bool,

    /// Print the damage summary (the default action).
    #[arg(long)]
    summary: bool,

    /// Extract surviving files into this directory.
    #[arg(long, value_name = "DIR")]
    extract_to: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let damage = Rc::new(load_damage_map(&cli)?);
    let image = Ext4Image::open(&cli.image, Rc::clone(&damage), DEFAULT_CACHE_PAGES)
        .with_context(|| format!("cannot open image {}", cli.image.display()))?;

    let (tree, stats) = obtain_tree(&cli, &image)?;

    if cli.list {
        report::print_listing(&mut std::io::stdout().lock(), &tree)?;
    }

    if let Some(target) = &cli.extract_to {
        let stats = extract::extract_tree(&image, &tree, target)
            .with_context(|| format!("extraction into {} failed", target.display()))?;
        println!(
            "extracted {} directories, {} files, {} symlinks ({} skipped)",
            stats.directories, stats.files, stats.symlinks, stats.skipped
        );
    }

    if cli.summary || (!cli.list && cli.extract_to.is_none()) {
        report::print_summary(&mut std::io::stdout().lock(), &tree, &stats, &damage)?;
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_damage_map(cli: &Cli) -> anyhow::Result<DamageMap> {
    match &cli.ddrescue_log {
        Some(log) => DamageMap::from_ddrescue_map(log)
            .with_context(|| format!("cannot parse rescue map {}", log.display())),
        None => {
            let len = std::fs::metadata(&cli.image)
                .with_context(|| format!("cannot stat image {}", cli.image.display()))?
                .len();
            Ok(DamageMap::all_good_map(len))
        }
    }
}

/// Loads the cached tree when possible, otherwise scans and refreshes the
/// cache. A failed or interrupted scan removes the cache file so a stale
/// tree can never be reloaded.
fn obtain_tree(cli: &Cli, image: &Ext4Image) -> anyhow::Result<(FileTree, ScanStats)> {
    let log = cli.ddrescue_log.as_deref();

    if !cli.force_scan {
        match treecache::read_cached_file_tree(&cli.image, log) {
            Ok(Some(tree)) => {
                tracing::info!("using cached file tree");
                let stats = stats_from_tree(&tree);
                return Ok((tree, stats));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%err, "tree cache unusable, rescanning");
            }
        }
    }

    let report = match run_scan(image) {
        Ok(report) => report,
        Err(err) => {
            let _ = treecache::remove_cached_file_tree(&cli.image, log);
            return Err(err).context("scan failed");
        }
    };

    if let Err(err) = treecache::cache_file_tree(&report.tree, &cli.image, log) {
        tracing::warn!(%err, "could not write tree cache");
    }

    Ok((report.tree, report.stats))
}

fn run_scan(image: &Ext4Image) -> ext4rescue::Result<scan::ScanReport> {
    let stderr_is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } == 1;

    let report = scan::scan(image, |current, total| {
        if stderr_is_tty {
            let percent = current * 100 / total.max(1);
            eprint!("\rscanning inodes: {percent:3}%");
            let _ = std::io::stderr().flush();
        }
        ControlFlow::Continue(())
    })?;

    if stderr_is_tty {
        eprintln!();
    }
    Ok(report)
}

/// Rebuilds the scan counters for a tree that came from the cache.
fn stats_from_tree(tree: &FileTree) -> ScanStats {
    let unreadable = tree
        .inodes_sorted()
        .into_iter()
        .filter_map(|inode| tree.get(inode))
        .filter(|node| !node.common().inode_ok)
        .count() as u64;

    ScanStats {
        unreadable_inodes: unreadable,
        scanned_inodes: tree.len() as u64,
    }
}
