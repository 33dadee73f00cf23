//! Fixed-size slab allocator: the heap's fast tier.
//!
//! Each [`SlabAllocator`] serves one object size from block-size-aligned
//! blocks. A block starts with a header followed by object slots; free
//! slots form a freelist threaded by slot *index* (a `u32` written into
//! the slot itself), and blocks with free slots form a singly-linked list
//! threaded through the headers. A block that fills up simply leaves the
//! list; freeing into a full block links it back in, with the block base
//! recovered from the pointer via block-size alignment.

use bekos_core::addr::VirtAddr;

/// Freelist terminator for slot indices.
const NO_SLOT: u32 = u32::MAX;

/// Header embedded at the start of every slab block.
#[repr(C)]
struct BlockHeader {
    /// Base address of the next block with free slots (0 = end of list).
    next_block: u64,
    /// Index of the first free slot ([`NO_SLOT`] = block full).
    free_head: u32,
    /// Currently allocated objects in this block.
    allocated: u32,
    /// Total object slots in this block.
    total: u32,
    _pad: u32,
}

/// A slab allocator for one object size.
pub(crate) struct SlabAllocator {
    obj_size: usize,
    blk_size: usize,
    /// Base address of the first block with free slots (0 = none).
    partial_head: u64,
    total_objects: usize,
    allocated_objects: usize,
}

const fn default_block_size(obj_size: usize) -> usize {
    if obj_size <= 256 { 4096 } else { (obj_size / 256) * 4096 }
}

impl SlabAllocator {
    pub(crate) fn new(obj_size: usize) -> Self {
        assert!(obj_size >= 32, "slab objects start at 32 bytes");
        assert!(obj_size.is_power_of_two());
        Self {
            obj_size,
            blk_size: default_block_size(obj_size),
            partial_head: 0,
            total_objects: 0,
            allocated_objects: 0,
        }
    }

    pub(crate) fn object_size(&self) -> usize {
        self.obj_size
    }

    pub(crate) fn block_size(&self) -> usize {
        self.blk_size
    }

    fn header(base: u64) -> *mut BlockHeader {
        base as *mut BlockHeader
    }

    /// Offset of the first object slot: the header rounded up to a whole
    /// number of slots.
    fn data_offset(&self) -> usize {
        size_of::<BlockHeader>().div_ceil(self.obj_size) * self.obj_size
    }

    fn slot_ptr(&self, base: u64, index: u32) -> *mut u32 {
        (base as usize + self.data_offset() + index as usize * self.obj_size) as *mut u32
    }

    /// Adopts a fresh `blk_size`-aligned block and links it into the
    /// partial list.
    ///
    /// # Safety
    ///
    /// `base` must point to an exclusive, writable region of `blk_size`
    /// bytes aligned to `blk_size`.
    pub(crate) unsafe fn add_block(&mut self, base: VirtAddr) {
        let base = base.as_u64();
        debug_assert!(base % self.blk_size as u64 == 0);
        let total = ((self.blk_size - self.data_offset()) / self.obj_size) as u32;

        // Thread every slot onto the freelist, last slot first.
        for index in 0..total {
            let next = if index + 1 < total { index + 1 } else { NO_SLOT };
            // SAFETY: slot lies inside the exclusive block.
            unsafe { self.slot_ptr(base, index).write(next) };
        }

        // SAFETY: header area lies inside the exclusive block.
        unsafe {
            Self::header(base).write(BlockHeader {
                next_block: self.partial_head,
                free_head: 0,
                allocated: 0,
                total,
                _pad: 0,
            });
        }
        self.partial_head = base;
        self.total_objects += total as usize;
    }

    /// Pops an object from the first partial block, or returns `None` if a
    /// new block is needed.
    pub(crate) fn allocate(&mut self) -> Option<VirtAddr> {
        let base = self.partial_head;
        if base == 0 {
            return None;
        }
        // SAFETY: partial_head always points at a live block header.
        let header = unsafe { &mut *Self::header(base) };
        let slot = header.free_head;
        debug_assert_ne!(slot, NO_SLOT, "partial block with no free slots");

        // SAFETY: `slot` is a valid free slot of this block.
        header.free_head = unsafe { self.slot_ptr(base, slot).read() };
        header.allocated += 1;
        self.allocated_objects += 1;

        if header.free_head == NO_SLOT {
            // Block is now full; it leaves the partial list until a free.
            self.partial_head = header.next_block;
            header.next_block = 0;
        }

        Some(VirtAddr::new(
            base + self.data_offset() as u64 + u64::from(slot) * self.obj_size as u64,
        ))
    }

    /// Returns an object to its block.
    pub(crate) fn free(&mut self, ptr: VirtAddr) {
        let raw = ptr.as_u64();
        let base = raw / self.blk_size as u64 * self.blk_size as u64;
        // SAFETY: `ptr` was produced by `allocate`, so `base` is a live
        // block of this slab.
        let header = unsafe { &mut *Self::header(base) };
        debug_assert!(raw >= base + self.data_offset() as u64);
        let slot_offset = (raw - base) as usize - self.data_offset();
        debug_assert!(slot_offset % self.obj_size == 0, "misaligned slab free");
        let slot = (slot_offset / self.obj_size) as u32;
        debug_assert!(slot < header.total);

        if header.free_head == NO_SLOT {
            // Was full: re-link into the partial list.
            header.next_block = self.partial_head;
            self.partial_head = base;
        }

        // SAFETY: the slot is being returned; writing the freelist link
        // into it is the slab invariant.
        unsafe { self.slot_ptr(base, slot).write(header.free_head) };
        header.free_head = slot;
        header.allocated -= 1;
        self.allocated_objects -= 1;
    }

    pub(crate) fn free_bytes(&self) -> usize {
        (self.total_objects - self.allocated_objects) * self.obj_size
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total_objects * self.obj_size
    }
}
