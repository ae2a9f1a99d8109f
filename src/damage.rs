//! Damage map built from a GNU ddrescue map file.
//!
//! ddrescue records which byte ranges of a rescued image were read
//! successfully. The [`DamageMap`] indexes those ranges as a contiguous,
//! sorted partition of `[0, image_size)` and answers range queries: is this
//! byte range fully readable, and how many of its bytes are readable at all.
//!
//! Without a map file the whole image is presumed good; reads may still fail
//! at the mmap level, but the filesystem layer has no better information.

use std::fs;
use std::path::Path;

use crate::errors::{Error, Result};

/// One contiguous byte range of the image, either fully readable or not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// Byte offset of the region start within the image.
    pub position: u64,

    /// Length of the region in bytes.
    pub size: u64,

    /// Whether every byte of the region was rescued.
    pub good: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.position + self.size
    }
}

/// Partition of the image byte range into good and bad regions.
///
/// Regions are contiguous and sorted by position; the map is immutable once
/// built.
#[derive(Clone, Debug)]
pub struct DamageMap {
    regions: Vec<Region>,
}

impl DamageMap {
    /// Builds a map with a single all-good region spanning `image_size`
    /// bytes. Used when no rescue log is available.
    pub fn all_good_map(image_size: u64) -> Self {
        Self {
            regions: vec![Region {
                position: 0,
                size: image_size,
                good: true,
            }],
        }
    }

    /// Builds a map from an already-parsed region list.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when the list is empty, does not start at 0, or
    /// has a gap or overlap between consecutive regions.
    pub fn from_regions(regions: Vec<Region>) -> Result<Self> {
        let mut expected = 0;
        for region in &regions {
            if region.position != expected {
                return Err(Error::OutOfRange(region.position));
            }
            expected = region.end();
        }
        if regions.is_empty() {
            return Err(Error::OutOfRange(0));
        }

        Ok(Self { regions })
    }

    /// Parses a ddrescue map file.
    ///
    /// `#`-prefixed lines and blank lines are ignored, as is the two-token
    /// current-position line ddrescue writes before the data lines. Data
    /// lines carry `0xPOS 0xSIZE STATUS` where a `+` status marks the range
    /// as rescued; every other status character marks it bad. Ranges must be
    /// contiguous.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, [`Error::Parse`] for a
    /// malformed data line or a gap between consecutive ranges.
    pub fn from_ddrescue_map(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut regions: Vec<Region> = Vec::new();

        let parse_err = |line: usize, msg: String| Error::Parse {
            path: path.to_path_buf(),
            line,
            msg,
        };

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() == 2 {
                // ddrescue status line (current position + state character)
                continue;
            }
            if tokens.len() != 3 {
                return Err(parse_err(
                    line_no,
                    format!("expected 3 tokens, found {}", tokens.len()),
                ));
            }

            let position = parse_hex(tokens[0])
                .ok_or_else(|| parse_err(line_no, format!("bad position {:?}", tokens[0])))?;
            let size = parse_hex(tokens[1])
                .ok_or_else(|| parse_err(line_no, format!("bad size {:?}", tokens[1])))?;
            if tokens[2].len() != 1 {
                return Err(parse_err(line_no, format!("bad status {:?}", tokens[2])));
            }
            let good = tokens[2] == "+";

            let expected = regions.last().map_or(0, Region::end);
            if position != expected {
                return Err(parse_err(
                    line_no,
                    format!("range starts at {position:#x}, expected {expected:#x}"),
                ));
            }

            regions.push(Region {
                position,
                size,
                good,
            });
        }

        if regions.is_empty() {
            return Err(parse_err(0, "no data lines".into()));
        }

        tracing::debug!(
            regions = regions.len(),
            bad_bytes = regions.iter().filter(|r| !r.good).map(|r| r.size).sum::<u64>(),
            "loaded ddrescue map"
        );

        Self::from_regions(regions)
    }

    /// Total byte range covered by the map.
    pub fn mapped_size(&self) -> u64 {
        self.regions.last().map_or(0, Region::end)
    }

    /// The regions of the partition, sorted by position.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Index of the region containing byte `pos`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `pos` lies at or past the final region's
    /// end.
    pub fn locate(&self, pos: u64) -> Result<usize> {
        if pos >= self.mapped_size() {
            return Err(Error::OutOfRange(pos));
        }

        let idx = self
            .regions
            .binary_search_by(|r| {
                use std::cmp::Ordering;
                if pos < r.position {
                    Ordering::Greater
                } else if pos >= r.end() {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .map_err(|_| Error::OutOfRange(pos))?;

        Ok(idx)
    }

    /// Checks whether every byte of `[begin, end)` lies in good regions.
    ///
    /// An empty or inverted range is trivially good. A range reaching past
    /// the mapped size is not.
    pub fn all_good(&self, begin: u64, end: u64) -> bool {
        if end <= begin {
            return true;
        }
        if end > self.mapped_size() {
            return false;
        }

        let Ok(first) = self.locate(begin) else {
            return false;
        };

        for region in &self.regions[first..] {
            if region.position >= end {
                break;
            }
            if !region.good {
                return false;
            }
        }

        true
    }

    /// Number of readable bytes within `[begin, end)`.
    ///
    /// Always `<= end - begin`; bytes past the mapped size count as
    /// unreadable.
    pub fn count_readable_bytes(&self, begin: u64, end: u64) -> u64 {
        if end <= begin {
            return 0;
        }

        let Ok(first) = self.locate(begin) else {
            return 0;
        };

        let mut readable = 0;
        for region in &self.regions[first..] {
            if region.position >= end {
                break;
            }
            if region.good {
                let lo = region.position.max(begin);
                let hi = region.end().min(end);
                readable += hi - lo;
            }
        }

        readable
    }

    /// Total number of bytes in bad regions.
    pub fn total_bad_byte_count(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| !r.good)
            .map(|r| r.size)
            .sum()
    }
}

fn parse_hex(token: &str) -> Option<u64> {
    let digits = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}
