//! A chunk is eight contiguous blocks, aligned on a block boundary in
//! memory; it is the unit of OS-level allocation.

use crate::block::{Block, BlockFlags};
use crate::globals::*;
use crate::memory;
use crate::utils::align_up;
use std::ptr::null_mut;

/// Chunk bookkeeping, stored in the reserved header area of the chunk's
/// first block.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChunkHeader {
    /// Offset between the chunk base and the raw OS allocation, kept so the
    /// original pointer can be handed back on free.
    pub(crate) allocation_offset: i32,
    pub(crate) block_unavailable_count: u8,
    pub(crate) block_recyclable_count: u8,
}

/// Typed view over a chunk base address.
#[repr(C)]
pub struct Chunk {
    first: Block,
}

impl Chunk {
    /// Allocate and initialize a chunk. The OS request carries one block of
    /// slack so the chunk base can be rounded up to block alignment; the
    /// memory comes back zeroed so untouched bump space reads as size-0
    /// objects. Null on exhaustion.
    pub fn allocate() -> *mut Chunk {
        unsafe {
            let raw = memory::allocate_zeroed(TOTAL_CHUNK_SIZE);
            if raw.is_null() {
                return null_mut();
            }
            let base = align_up(raw as usize, BLOCK_SIZE) as *mut u8;
            let chunk = base as *mut Chunk;
            for i in 0..BLOCK_COUNT_PER_CHUNK {
                (*(*chunk).block(i)).initialize(i as u8);
            }
            let header = (*chunk).header_mut();
            header.allocation_offset = (base as usize - raw as usize) as i32;
            header.block_unavailable_count = 0;
            header.block_recyclable_count = 0;
            chunk
        }
    }

    /// Hand the chunk's memory back to the OS.
    ///
    /// # Safety
    /// The chunk must have come from [`Chunk::allocate`] and must not be
    /// reachable from any directory afterwards.
    pub unsafe fn destroy(chunk: *mut Chunk) {
        let offset = (*chunk).header().allocation_offset;
        memory::free((chunk as *mut u8).offset(-(offset as isize)));
    }

    #[inline(always)]
    pub fn block_count(&self) -> usize {
        BLOCK_COUNT_PER_CHUNK
    }

    #[inline(always)]
    pub fn start(&self) -> *mut u8 {
        self as *const Self as *mut u8
    }

    /// One word shy of the true end, so a one-past-the-end pointer of the
    /// last object is not taken for a pointer into the next chunk.
    #[inline(always)]
    pub fn end_of_chunk(&self) -> *mut u8 {
        (self.start() as usize + CHUNK_SIZE - std::mem::size_of::<*mut u8>()) as *mut u8
    }

    /// Block at `index`; index must be below [`Self::block_count`].
    #[inline(always)]
    pub fn block(&self, index: usize) -> *mut Block {
        debug_assert!(index < self.block_count());
        (self.start() as usize + index * BLOCK_SIZE) as *mut Block
    }

    #[inline(always)]
    fn header(&self) -> &ChunkHeader {
        &self.first.meta.chunk
    }

    #[inline(always)]
    fn header_mut(&mut self) -> &mut ChunkHeader {
        &mut self.first.meta.chunk
    }

    /// Determines whether this chunk is completely free.
    #[inline(always)]
    pub fn is_free(&self) -> bool {
        let header = self.header();
        header.block_unavailable_count == 0 && header.block_recyclable_count == 0
    }

    /// Determines whether this chunk still has untouched blocks.
    #[inline(always)]
    pub fn has_free_blocks(&self) -> bool {
        let header = self.header();
        ((header.block_unavailable_count + header.block_recyclable_count) as usize)
            < self.block_count()
    }

    /// Determines whether this chunk has blocks with reusable holes.
    #[inline(always)]
    pub fn has_recyclable_blocks(&self) -> bool {
        self.header().block_recyclable_count > 0
    }

    /// If `block` is recyclable, account it as handed out and return true.
    /// The block keeps its `Recyclable` flag so the owning mutator knows to
    /// search it for holes.
    pub fn try_get_recyclable_block(&mut self, block: *mut Block) -> bool {
        debug_assert!(!block.is_null());
        if unsafe { (*block).is_recyclable() } {
            let header = self.header_mut();
            header.block_recyclable_count -= 1;
            header.block_unavailable_count += 1;
            return true;
        }
        false
    }

    /// If `block` is free, account it as handed out, flip it to
    /// `Unavailable` and return true.
    pub fn try_get_free_block(&mut self, block: *mut Block) -> bool {
        debug_assert!(!block.is_null());
        if unsafe { (*block).is_free() } {
            self.header_mut().block_unavailable_count += 1;
            unsafe { (*block).set_flags(BlockFlags::Unavailable) };
            return true;
        }
        false
    }

    /// Clear marks on every block before a new collection.
    pub fn clear_marked(&mut self) {
        for i in 0..self.block_count() {
            unsafe { (*self.block(i)).clear_marked() };
        }
    }

    /// Recycle every block and rebuild the chunk counters from the
    /// per-block outcomes.
    pub fn recycle(&mut self) {
        self.header_mut().block_unavailable_count = 0;
        self.header_mut().block_recyclable_count = 0;

        for i in 0..self.block_count() {
            let block = self.block(i);
            unsafe {
                (*block).recycle();
                if (*block).is_unavailable() {
                    self.header_mut().block_unavailable_count += 1;
                } else if (*block).is_recyclable() {
                    self.header_mut().block_recyclable_count += 1;
                }
            }
        }
    }
}
