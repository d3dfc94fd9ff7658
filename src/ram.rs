//! RAM-block registry: an ordered set of named, fixed-size guest memory
//! regions, registered once and looked up by id for the lifetime of a
//! migration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::PAGE_SIZE;

/// A named, contiguous region of guest physical memory.
///
/// `host_base` is a raw pointer into host memory owned by the caller (the
/// emulator); the registry never allocates or frees it. Upholding the
/// validity of `host_base` for the lifetime of the `RamBlock` is the
/// caller's responsibility — this mirrors how the source keeps a bare
/// pointer into guest RAM alongside the block record.
#[derive(Debug)]
pub struct RamBlock {
    id: String,
    host_base: *mut u8,
    length: u64,
    guest_offset: u64,
}

// SAFETY: `host_base` is only ever dereferenced through `page`/`page_mut`,
// which require the caller to uphold the same aliasing discipline documented
// on those methods regardless of which thread calls them.
unsafe impl Send for RamBlock {}
unsafe impl Sync for RamBlock {}

impl RamBlock {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn guest_offset(&self) -> u64 {
        self.guest_offset
    }

    pub fn page_count(&self) -> u64 {
        self.length / PAGE_SIZE as u64
    }

    /// Borrow one page of this block's backing memory.
    ///
    /// # Safety
    /// `offset` must be page-aligned and `offset + PAGE_SIZE <= length`, and
    /// the memory at `host_base` must still be valid for reads for the
    /// lifetime of the returned slice (no concurrent free/unmap).
    pub unsafe fn page(&self, offset: u64) -> &[u8] {
        debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
        debug_assert!(offset + PAGE_SIZE as u64 <= self.length);
        std::slice::from_raw_parts(self.host_base.add(offset as usize), PAGE_SIZE)
    }

    /// Mutable dual of [`RamBlock::page`]; same safety obligations apply,
    /// plus exclusive access for the duration of the borrow.
    pub unsafe fn page_mut(&self, offset: u64) -> &mut [u8] {
        debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
        debug_assert!(offset + PAGE_SIZE as u64 <= self.length);
        std::slice::from_raw_parts_mut(self.host_base.add(offset as usize), PAGE_SIZE)
    }
}

/// A cheaply-cloneable reference to a registered block.
pub type BlockHandle = Arc<RamBlock>;

/// Ordered set of [`RamBlock`]s, thread-safe for registration from multiple
/// device-model threads and read-only once migration starts.
pub struct RamBlockRegistry {
    blocks: RwLock<HashMap<String, BlockHandle>>,
    next_guest_offset: RwLock<u64>,
    sorted: RwLock<Option<Vec<BlockHandle>>>,
}

impl RamBlockRegistry {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            next_guest_offset: RwLock::new(0),
            sorted: RwLock::new(None),
        }
    }

    /// Registers a new block. `length` must be a multiple of `PAGE_SIZE`.
    ///
    /// # Safety
    /// `host_base` must point to at least `length` bytes of memory valid for
    /// reads and writes for as long as the returned handle (or any clone of
    /// it) is alive.
    pub unsafe fn register(
        &self,
        id: impl Into<String>,
        host_base: *mut u8,
        length: u64,
    ) -> Result<BlockHandle, RegistryError> {
        let id = id.into();
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let mut next = self.next_guest_offset.write();
        let guest_offset = *next;
        *next += length;

        let block = Arc::new(RamBlock {
            id: id.clone(),
            host_base,
            length,
            guest_offset,
        });
        blocks.insert(id, block.clone());
        *self.sorted.write() = None;
        Ok(block)
    }

    pub fn lookup_by_id(&self, id: &str) -> Result<BlockHandle, RegistryError> {
        self.blocks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBlock(id.to_string()))
    }

    pub fn total_bytes(&self) -> u64 {
        self.blocks.read().values().map(|b| b.length).sum()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Freezes migration order as a stable lexicographic sort by `id`.
    /// One-shot: called exactly once per migration, from `Setup`. A later
    /// call just re-derives the same order (registration is closed by then
    /// in practice, but nothing here enforces that).
    pub fn sort(&self) -> Vec<BlockHandle> {
        let mut order: Vec<BlockHandle> = self.blocks.read().values().cloned().collect();
        order.sort_by(|a, b| a.id.cmp(&b.id));
        *self.sorted.write() = Some(order.clone());
        order
    }

    /// Returns the order established by the last [`RamBlockRegistry::sort`]
    /// call, or computes and freezes one if `sort` was never called.
    pub fn iterate_sorted(&self) -> Vec<BlockHandle> {
        if let Some(order) = self.sorted.read().as_ref() {
            return order.clone();
        }
        self.sort()
    }
}

impl Default for RamBlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_buf(len: usize) -> *mut u8 {
        Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8
    }

    #[test]
    fn register_and_lookup() {
        let reg = RamBlockRegistry::new();
        let base = leak_buf(PAGE_SIZE);
        unsafe {
            reg.register("pc.ram", base, PAGE_SIZE as u64).unwrap();
        }
        assert_eq!(reg.lookup_by_id("pc.ram").unwrap().length(), PAGE_SIZE as u64);
        assert!(reg.lookup_by_id("missing").is_err());
    }

    #[test]
    fn duplicate_id_rejected() {
        let reg = RamBlockRegistry::new();
        let base = leak_buf(PAGE_SIZE);
        unsafe {
            reg.register("pc.ram", base, PAGE_SIZE as u64).unwrap();
            let err = reg.register("pc.ram", base, PAGE_SIZE as u64).unwrap_err();
            assert!(matches!(err, RegistryError::DuplicateId(_)));
        }
    }

    #[test]
    fn sort_is_lexicographic_by_id() {
        let reg = RamBlockRegistry::new();
        unsafe {
            reg.register("vga.vram", leak_buf(PAGE_SIZE), PAGE_SIZE as u64)
                .unwrap();
            reg.register("pc.ram", leak_buf(PAGE_SIZE), PAGE_SIZE as u64)
                .unwrap();
            reg.register("pc.bios", leak_buf(PAGE_SIZE), PAGE_SIZE as u64)
                .unwrap();
        }
        let order = reg.sort();
        let ids: Vec<&str> = order.iter().map(|b| b.id()).collect();
        assert_eq!(ids, vec!["pc.bios", "pc.ram", "vga.vram"]);
    }

    #[test]
    fn guest_offsets_are_monotonic_and_contiguous() {
        let reg = RamBlockRegistry::new();
        let a = unsafe { reg.register("a", leak_buf(2 * PAGE_SIZE), 2 * PAGE_SIZE as u64) }.unwrap();
        let b = unsafe { reg.register("b", leak_buf(PAGE_SIZE), PAGE_SIZE as u64) }.unwrap();
        assert_eq!(a.guest_offset(), 0);
        assert_eq!(b.guest_offset(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn total_bytes_sums_all_blocks() {
        let reg = RamBlockRegistry::new();
        unsafe {
            reg.register("a", leak_buf(PAGE_SIZE), PAGE_SIZE as u64)
                .unwrap();
            reg.register("b", leak_buf(2 * PAGE_SIZE), 2 * PAGE_SIZE as u64)
                .unwrap();
        }
        assert_eq!(reg.total_bytes(), 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn page_read_write_round_trips() {
        let reg = RamBlockRegistry::new();
        let base = leak_buf(PAGE_SIZE);
        let block = unsafe { reg.register("pc.ram", base, PAGE_SIZE as u64) }.unwrap();
        unsafe {
            block.page_mut(0)[0] = 0xAB;
            assert_eq!(block.page(0)[0], 0xAB);
        }
    }

    #[test]
    fn registry_is_usable_across_threads() {
        use std::thread;

        let reg = Arc::new(RamBlockRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || unsafe {
                reg.register(format!("block-{i}"), leak_buf(PAGE_SIZE), PAGE_SIZE as u64)
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 8);
    }
}
