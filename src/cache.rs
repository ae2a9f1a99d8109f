//! Page cache over the memory-mapped image.
//!
//! The image is mapped read-only in host-page (4 KiB) units on demand. Each
//! mapped page is handed out through refcounted views; the cache keeps one
//! reference of its own and evicts, least-recently-used first, only pages
//! nobody else still holds. Views therefore never dangle: a page stays
//! mapped until its last view drops, even if the cache evicted or dropped it
//! long before.
//!
//! Every view carries an `ok` flag combining the page's position in the
//! [`DamageMap`] with the exact byte range the view covers. Callers check
//! the flag; they never get an error for reading rescued-but-damaged bytes.

use std::cell::Cell;
use std::fs::File;
use std::marker::PhantomData;
use std::path::Path;
use std::rc::Rc;

use bytemuck::Pod;
use hashbrown::HashMap;
use memmap2::{Mmap, MmapOptions};

use crate::damage::DamageMap;
use crate::errors::{Error, Result};

/// Host page size; the mmap granularity of the cache.
pub const PAGE_SIZE: u64 = 4096;

/// One mapped 4 KiB page of the image.
///
/// Pages fully past the end of the image carry no mapping at all and read as
/// zeroes; their views are never `ok`.
#[derive(Debug)]
pub struct CachedPage {
    map: Option<Mmap>,
    ok: bool,
    stamp: Cell<u64>,
}

impl CachedPage {
    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

/// Refcounted view of the tail of one filesystem block.
pub struct CachedBlock {
    page: Rc<CachedPage>,
    offset: usize,
    len: usize,
    ok: bool,
}

impl CachedBlock {
    /// Whether the whole page is rescued and the viewed range is rescued.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// The viewed bytes. Empty when the page lies past the end of the image.
    pub fn bytes(&self) -> &[u8] {
        let data = self.page.bytes();
        if data.is_empty() {
            return data;
        }
        &data[self.offset..self.offset + self.len]
    }
}

/// Refcounted view of one on-disk structure inside a cached page.
///
/// `read` decodes the structure out of the mapped bytes; the on-disk format
/// is little-endian, so accessors on the decoded structs go through
/// `from_le` conversions rather than trusting host endianness.
pub struct CachedView<S: Pod> {
    page: Option<Rc<CachedPage>>,
    offset: usize,
    ok: bool,
    _marker: PhantomData<S>,
}

impl<S: Pod> CachedView<S> {
    /// The "unmapped, not ok" sentinel, used when the caller already knows
    /// the structure is unreachable (e.g. its group descriptor is gone).
    pub fn unmapped() -> Self {
        Self {
            page: None,
            offset: 0,
            ok: false,
            _marker: PhantomData,
        }
    }

    /// Whether the containing page and this exact byte range are rescued.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Decodes the structure. Sentinels and past-end pages decode as all
    /// zeroes; callers gate on [`Self::is_ok`] before trusting the content.
    pub fn read(&self) -> S {
        let Some(page) = &self.page else {
            return S::zeroed();
        };
        let data = page.bytes();
        let end = self.offset + std::mem::size_of::<S>();
        if data.len() < end {
            return S::zeroed();
        }
        bytemuck::pod_read_unaligned(&data[self.offset..end])
    }
}

/// A private mapping of one physical extent, outside the LRU cache.
///
/// Holds exactly the pages containing `block_count` blocks; unmapped when
/// dropped.
pub struct MappedExtent {
    map: Option<Mmap>,
    lead: usize,
    len: usize,
    ok: bool,
}

impl MappedExtent {
    /// Whether the page-aligned range of the extent is fully rescued.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// The extent's bytes. Empty when the extent lies outside the image.
    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[self.lead..self.lead + self.len],
            None => &[],
        }
    }
}

/// LRU page cache over a read-only image file.
#[derive(Debug)]
pub struct BlockCache {
    file: File,
    file_len: u64,
    damage: Rc<DamageMap>,
    block_size: u64,
    capacity: usize,
    pages: HashMap<u64, Rc<CachedPage>>,
    tick: u64,
    leaks: Rc<Cell<u64>>,
}

impl BlockCache {
    /// Opens `path` read-only and prepares an empty cache.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the image cannot be opened, or
    /// [`Error::BadSuperblock`] for a block size that does not divide the
    /// host page size.
    pub fn new(
        path: &Path,
        damage: Rc<DamageMap>,
        block_size: u64,
        capacity: usize,
    ) -> Result<Self> {
        if block_size == 0 || PAGE_SIZE % block_size != 0 {
            return Err(Error::BadSuperblock("unsupported block size"));
        }

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        Ok(Self {
            file,
            file_len,
            damage,
            block_size,
            capacity,
            pages: HashMap::new(),
            tick: 0,
            leaks: Rc::new(Cell::new(0)),
        })
    }

    /// Rebuilds the cache on the same file with a different block size,
    /// dropping every cached page. Used once at open time when the real
    /// filesystem block size turns out to differ from the provisional one.
    pub fn with_block_size(self, block_size: u64) -> Result<Self> {
        if block_size == 0 || PAGE_SIZE % block_size != 0 {
            return Err(Error::BadSuperblock("unsupported block size"));
        }

        Ok(Self {
            file: self.file.try_clone()?,
            file_len: self.file_len,
            damage: Rc::clone(&self.damage),
            block_size,
            capacity: self.capacity,
            pages: HashMap::new(),
            tick: 0,
            leaks: Rc::new(Cell::new(0)),
        })
    }

    /// Filesystem block size this cache was built for.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Length of the underlying image file in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// The damage map the cache consults for view validity.
    pub fn damage(&self) -> &Rc<DamageMap> {
        &self.damage
    }

    /// Counter incremented at teardown for every page still referenced
    /// outside the cache. Clone before dropping the cache to observe it.
    pub fn leak_counter(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.leaks)
    }

    /// Maps `block_count` blocks starting at `physical_block` privately,
    /// aligned down to containing pages, bypassing the LRU cache.
    pub fn map_extent(&self, physical_block: u64, block_count: u64) -> MappedExtent {
        let begin = physical_block * self.block_size;
        let len = block_count * self.block_size;
        let aligned_begin = begin - begin % PAGE_SIZE;
        let aligned_end = next_page_boundary(begin + len);

        // Pages fully past EOF cannot be touched without faulting.
        if len == 0 || begin + len > next_page_boundary(self.file_len) {
            return MappedExtent {
                map: None,
                lead: 0,
                len: 0,
                ok: false,
            };
        }

        let map = unsafe {
            MmapOptions::new()
                .offset(aligned_begin)
                .len((aligned_end - aligned_begin) as usize)
                .map(&self.file)
        };

        match map {
            Ok(map) => {
                let ok = self.damage.all_good(aligned_begin, aligned_end);
                MappedExtent {
                    map: Some(map),
                    lead: (begin - aligned_begin) as usize,
                    len: len as usize,
                    ok,
                }
            }
            Err(err) => {
                tracing::warn!(physical_block, block_count, %err, "extent mmap failed");
                MappedExtent {
                    map: None,
                    lead: 0,
                    len: 0,
                    ok: false,
                }
            }
        }
    }

    /// View of block `block` from `byte_offset` to the block's end.
    ///
    /// Obtains (inserting or promoting) the containing page.
    pub fn request(&mut self, block: u64, byte_offset: u64) -> CachedBlock {
        debug_assert!(byte_offset < self.block_size);

        let begin = block * self.block_size + byte_offset;
        let end = (block + 1) * self.block_size;
        let page = self.page(begin / PAGE_SIZE);
        let ok = page.ok && self.damage.all_good(begin, end);

        CachedBlock {
            offset: (begin % PAGE_SIZE) as usize,
            len: (end - begin) as usize,
            ok,
            page,
        }
    }

    /// Typed view of the structure `S` at `offset` bytes into `block`.
    pub fn request_struct<S: Pod>(&mut self, block: u64, offset: u64) -> CachedView<S> {
        let begin = block * self.block_size + offset;
        let size = std::mem::size_of::<S>() as u64;
        let page_no = begin / PAGE_SIZE;

        // Structures never straddle pages with the supported block sizes;
        // a range that would is unreachable by construction.
        if begin % PAGE_SIZE + size > PAGE_SIZE {
            return CachedView::unmapped();
        }

        let page = self.page(page_no);
        let ok = page.ok && self.damage.all_good(begin, begin + size);

        CachedView {
            offset: (begin % PAGE_SIZE) as usize,
            ok,
            page: Some(page),
            _marker: PhantomData,
        }
    }

    /// The unmapped sentinel view; see [`CachedView::unmapped`].
    pub fn request_struct_unmapped<S: Pod>(&self) -> CachedView<S> {
        CachedView::unmapped()
    }

    fn page(&mut self, page_no: u64) -> Rc<CachedPage> {
        self.tick += 1;
        let tick = self.tick;

        if let Some(page) = self.pages.get(&page_no) {
            page.stamp.set(tick);
            return Rc::clone(page);
        }

        if self.pages.len() >= self.capacity {
            self.evict_one();
        }

        let page = Rc::new(self.map_page(page_no, tick));
        self.pages.insert(page_no, Rc::clone(&page));
        page
    }

    /// Evicts the least-recently-used page whose only reference is the
    /// cache's own. When every page is pinned by an outstanding view the
    /// cache grows past capacity instead of refusing service.
    fn evict_one(&mut self) {
        let victim = self
            .pages
            .iter()
            .filter(|(_, page)| Rc::strong_count(page) == 1)
            .min_by_key(|(_, page)| page.stamp.get())
            .map(|(&no, _)| no);

        match victim {
            Some(no) => {
                self.pages.remove(&no);
            }
            None => {
                tracing::trace!(pages = self.pages.len(), "all cached pages pinned");
            }
        }
    }

    fn map_page(&self, page_no: u64, tick: u64) -> CachedPage {
        let begin = page_no * PAGE_SIZE;

        if begin >= self.file_len {
            return CachedPage {
                map: None,
                ok: false,
                stamp: Cell::new(tick),
            };
        }

        let map = unsafe {
            MmapOptions::new()
                .offset(begin)
                .len(PAGE_SIZE as usize)
                .map(&self.file)
        };

        match map {
            Ok(map) => CachedPage {
                ok: self.damage.all_good(begin, begin + PAGE_SIZE),
                map: Some(map),
                stamp: Cell::new(tick),
            },
            Err(err) => {
                tracing::warn!(page_no, %err, "page mmap failed");
                CachedPage {
                    map: None,
                    ok: false,
                    stamp: Cell::new(tick),
                }
            }
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let leaked = self
            .pages
            .values()
            .filter(|page| Rc::strong_count(page) > 1)
            .count() as u64;

        if leaked > 0 {
            self.leaks.set(self.leaks.get() + leaked);
            tracing::warn!(leaked, "pages still referenced at cache teardown");
        }
    }
}

fn next_page_boundary(pos: u64) -> u64 {
    pos.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn image(len: usize, fill: impl Fn(usize) -> u8) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..len).map(fill).collect();
        file.write_all(&bytes).unwrap();
        file
    }

    fn cache(file: &tempfile::NamedTempFile, capacity: usize) -> BlockCache {
        let len = file.as_file().metadata().unwrap().len();
        BlockCache::new(
            file.path(),
            Rc::new(DamageMap::all_good_map(len)),
            1024,
            capacity,
        )
        .unwrap()
    }

    #[test]
    fn rejects_block_size_not_dividing_page() {
        let file = image(8192, |_| 0);
        let damage = Rc::new(DamageMap::all_good_map(8192));
        assert!(BlockCache::new(file.path(), Rc::clone(&damage), 3000, 4).is_err());
        assert!(BlockCache::new(file.path(), damage, 8192, 4).is_err());
    }

    #[test]
    fn successive_requests_read_identical_bytes() {
        let file = image(64 * 1024, |i| (i % 251) as u8);
        let mut cache = cache(&file, 4);

        let first: Vec<u8> = cache.request(5, 0).bytes().to_vec();
        let second: Vec<u8> = cache.request(5, 0).bytes().to_vec();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1024);
        assert_eq!(first[0], ((5 * 1024) % 251) as u8);
    }

    #[test]
    fn eviction_does_not_change_observed_bytes() {
        let file = image(64 * 1024, |i| (i % 251) as u8);
        let mut cache = cache(&file, 2);

        let before: Vec<u8> = cache.request(0, 0).bytes().to_vec();
        // Cycle far more pages than the capacity.
        for block in 0..60 {
            let _ = cache.request(block, 0);
        }
        let after: Vec<u8> = cache.request(0, 0).bytes().to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn outstanding_views_survive_eviction_and_teardown() {
        let file = image(64 * 1024, |i| (i % 251) as u8);
        let mut cache = cache(&file, 2);

        let held = cache.request(1, 0);
        let snapshot: Vec<u8> = held.bytes().to_vec();
        let leaks = cache.leak_counter();

        for block in 8..40 {
            let _ = cache.request(block, 0);
        }
        // The held page was never evictable; the bytes must still be intact.
        assert_eq!(held.bytes(), &snapshot[..]);

        drop(cache);
        assert_eq!(held.bytes(), &snapshot[..]);
        assert_eq!(leaks.get(), 1);
    }

    #[test]
    fn clean_teardown_reports_no_leaks() {
        let file = image(16 * 1024, |_| 7);
        let mut cache = cache(&file, 4);
        let leaks = cache.leak_counter();
        let _ = cache.request(0, 0);
        drop(cache);
        assert_eq!(leaks.get(), 0);
    }

    #[test]
    fn view_ok_follows_damage_map() {
        let file = image(64 * 1024, |_| 0);
        // One bad page: bytes [4096, 8192).
        let text = "0x0 0x1000 +\n0x1000 0x1000 -\n0x2000 0xE000 +\n";
        let mut log = tempfile::NamedTempFile::new().unwrap();
        log.write_all(text.as_bytes()).unwrap();
        let damage = Rc::new(DamageMap::from_ddrescue_map(log.path()).unwrap());

        let mut cache = BlockCache::new(file.path(), damage, 1024, 4).unwrap();

        assert!(cache.request(0, 0).is_ok());
        // Blocks 4..8 live in the bad page.
        assert!(!cache.request(4, 0).is_ok());
        assert!(!cache.request(7, 0).is_ok());
        assert!(cache.request(8, 0).is_ok());

        let extent = cache.map_extent(0, 4);
        assert!(extent.is_ok());
        assert_eq!(extent.bytes().len(), 4096);
        let extent = cache.map_extent(2, 4);
        assert!(!extent.is_ok());
    }

    #[test]
    fn struct_views_decode_little_endian() {
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(C)]
        struct Triple {
            a: u32,
            b: u16,
            c: u16,
        }

        let file = image(8192, |i| i as u8);
        let mut cache = cache(&file, 4);

        let view = cache.request_struct::<Triple>(1, 4);
        assert!(view.is_ok());
        let triple = view.read();
        // Bytes 1028..1036 of the pattern i % 256.
        assert_eq!(u32::from_le(triple.a), u32::from_le_bytes([4, 5, 6, 7]));
        assert_eq!(u16::from_le(triple.b), u16::from_le_bytes([8, 9]));
        assert_eq!(u16::from_le(triple.c), u16::from_le_bytes([10, 11]));
    }

    #[test]
    fn sentinel_view_reads_zeroes() {
        let file = image(4096, |_| 0xFF);
        let cache = cache(&file, 4);
        let view = cache.request_struct_unmapped::<u64>();
        assert!(!view.is_ok());
        assert_eq!(view.read(), 0);
    }

    #[test]
    fn pages_past_image_end_are_not_ok() {
        let file = image(4096, |_| 1);
        let mut cache = cache(&file, 4);
        let view = cache.request(8, 0);
        assert!(!view.is_ok());
        assert!(view.bytes().is_empty());
    }
}
