//! Dirty-log tracker: per-page dirty bits for the migration client.
//!
//! Granularity is always `PAGE_SIZE`; offsets passed in are expected to be
//! page-aligned. Backed by a hand-rolled word-packed bitset per block rather
//! than a `HashSet<(String, u64)>` so `test`/`mark`/`clear` stay O(1) and
//! `count` stays O(words) instead of O(set size).

use std::collections::HashMap;

use crate::PAGE_SIZE;

/// One bit per page, packed into `u64` words.
struct PageBitmap {
    words: Vec<u64>,
    page_count: u64,
}

impl PageBitmap {
    fn new(page_count: u64) -> Self {
        let words = vec![0u64; ((page_count + 63) / 64) as usize];
        Self { words, page_count }
    }

    fn set(&mut self, page_idx: u64) {
        self.words[(page_idx / 64) as usize] |= 1 << (page_idx % 64);
    }

    fn clear(&mut self, page_idx: u64) {
        self.words[(page_idx / 64) as usize] &= !(1 << (page_idx % 64));
    }

    fn test(&self, page_idx: u64) -> bool {
        self.words[(page_idx / 64) as usize] & (1 << (page_idx % 64)) != 0
    }

    fn set_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = u64::MAX;
        }
        self.mask_trailing_bits();
    }

    fn clear_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
    }

    fn mask_trailing_bits(&mut self) {
        let used_bits = self.page_count % 64;
        if used_bits != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << used_bits) - 1;
            }
        }
    }

    fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

/// A range of pages newly reported dirty by a host-side source external to
/// this crate (e.g. hypervisor-tracked dirty logging). Folded in by
/// [`DirtyLog::sync`].
pub trait DirtySyncSource {
    fn collect_dirty(&mut self) -> Vec<(String, u64, u64)>;
}

/// A source that reports nothing; the default when no external tracker is
/// wired up.
pub struct NoExternalDirtySource;

impl DirtySyncSource for NoExternalDirtySource {
    fn collect_dirty(&mut self) -> Vec<(String, u64, u64)> {
        Vec::new()
    }
}

pub struct DirtyLog {
    bitmaps: HashMap<String, PageBitmap>,
    logging_enabled: bool,
}

impl DirtyLog {
    pub fn new() -> Self {
        Self {
            bitmaps: HashMap::new(),
            logging_enabled: false,
        }
    }

    pub fn register_block(&mut self, block_id: &str, length: u64) {
        let page_count = length / PAGE_SIZE as u64;
        self.bitmaps
            .insert(block_id.to_string(), PageBitmap::new(page_count));
    }

    fn pages_in_range(offset: u64, len: u64) -> impl Iterator<Item = u64> {
        let first = offset / PAGE_SIZE as u64;
        let last = (offset + len - 1) / PAGE_SIZE as u64;
        first..=last
    }

    pub fn mark(&mut self, block_id: &str, offset: u64, len: u64) {
        if let Some(bitmap) = self.bitmaps.get_mut(block_id) {
            for page in Self::pages_in_range(offset, len) {
                bitmap.set(page);
            }
        }
    }

    pub fn mark_all(&mut self, block_id: &str) {
        if let Some(bitmap) = self.bitmaps.get_mut(block_id) {
            bitmap.set_all();
        }
    }

    pub fn test(&self, block_id: &str, offset: u64, len: u64) -> bool {
        self.bitmaps
            .get(block_id)
            .map(|bitmap| Self::pages_in_range(offset, len).any(|p| bitmap.test(p)))
            .unwrap_or(false)
    }

    pub fn clear(&mut self, block_id: &str, offset: u64, len: u64) {
        if let Some(bitmap) = self.bitmaps.get_mut(block_id) {
            for page in Self::pages_in_range(offset, len) {
                bitmap.clear(page);
            }
        }
    }

    pub fn enable_logging(&mut self) {
        self.logging_enabled = true;
    }

    pub fn disable_logging(&mut self) {
        self.logging_enabled = false;
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.logging_enabled
    }

    /// Folds any externally-tracked dirty ranges into the bitmap. Idempotent
    /// within a single iteration: marking an already-dirty page is a no-op.
    pub fn sync(&mut self, source: &mut dyn DirtySyncSource) {
        for (block_id, offset, len) in source.collect_dirty() {
            self.mark(&block_id, offset, len);
        }
    }

    pub fn count(&self) -> u64 {
        self.bitmaps.values().map(|b| b.count()).sum()
    }
}

impl Default for DirtyLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_test_is_true() {
        let mut log = DirtyLog::new();
        log.register_block("pc.ram", 4 * PAGE_SIZE as u64);
        log.mark("pc.ram", 0, PAGE_SIZE as u64);
        assert!(log.test("pc.ram", 0, PAGE_SIZE as u64));
        assert!(!log.test("pc.ram", PAGE_SIZE as u64, PAGE_SIZE as u64));
    }

    #[test]
    fn clear_is_idempotent() {
        let mut log = DirtyLog::new();
        log.register_block("pc.ram", PAGE_SIZE as u64);
        log.mark("pc.ram", 0, PAGE_SIZE as u64);
        log.clear("pc.ram", 0, PAGE_SIZE as u64);
        assert!(!log.test("pc.ram", 0, PAGE_SIZE as u64));
        log.clear("pc.ram", 0, PAGE_SIZE as u64);
        assert!(!log.test("pc.ram", 0, PAGE_SIZE as u64));
    }

    #[test]
    fn mark_all_sets_every_page_including_tail_bits() {
        let mut log = DirtyLog::new();
        let pages = 70u64; // spans two u64 words, exercises trailing-bit mask
        log.register_block("pc.ram", pages * PAGE_SIZE as u64);
        log.mark_all("pc.ram");
        assert_eq!(log.count(), pages);
    }

    #[test]
    fn count_sums_across_blocks() {
        let mut log = DirtyLog::new();
        log.register_block("a", 2 * PAGE_SIZE as u64);
        log.register_block("b", 3 * PAGE_SIZE as u64);
        log.mark("a", 0, PAGE_SIZE as u64);
        log.mark("b", 0, PAGE_SIZE as u64);
        log.mark("b", PAGE_SIZE as u64, PAGE_SIZE as u64);
        assert_eq!(log.count(), 3);
    }

    struct FakeSource(Vec<(String, u64, u64)>);
    impl DirtySyncSource for FakeSource {
        fn collect_dirty(&mut self) -> Vec<(String, u64, u64)> {
            std::mem::take(&mut self.0)
        }
    }

    #[test]
    fn sync_folds_external_dirty_ranges() {
        let mut log = DirtyLog::new();
        log.register_block("pc.ram", 2 * PAGE_SIZE as u64);
        let mut source = FakeSource(vec![("pc.ram".to_string(), PAGE_SIZE as u64, PAGE_SIZE as u64)]);
        log.sync(&mut source);
        assert!(log.test("pc.ram", PAGE_SIZE as u64, PAGE_SIZE as u64));
    }

    #[test]
    fn unregistered_block_reads_as_clean() {
        let log = DirtyLog::new();
        assert!(!log.test("ghost", 0, PAGE_SIZE as u64));
    }
}
