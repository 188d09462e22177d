//! Line-divided allocation block.
//!
//! A block is a 64 KiB, block-aligned region. Its first two lines hold the
//! metadata below (bump window, flags, counters, and the chunk header slot
//! used by the first block of a chunk) followed by one flag byte per line;
//! the remaining 254 lines hold objects.

use crate::chunk::ChunkHeader;
use crate::globals::*;
use crate::header::StandardObjectAddress;
use crate::utils::align_down;
use modular_bitfield::prelude::*;
use std::ptr::write_bytes;

/// Per-line metadata byte. The offset field records where the first object
/// *starting* in this line begins, in 4-byte units.
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct LineFlags {
    pub marked: bool,
    pub contains_object: bool,
    pub first_object_offset: B6,
}

/// The block allocation state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum BlockFlags {
    /// No live lines.
    Free = 0,
    /// Some live lines, some holes.
    Recyclable = 1,
    /// No usable holes.
    Unavailable = 2,
}

#[repr(C)]
pub struct BlockMeta {
    pub(crate) bump_cursor: u32,
    pub(crate) bump_cursor_limit: u32,
    pub(crate) flags: BlockFlags,
    pub(crate) used_line_count: u8,
    pub(crate) consecutive_used_line_count: u8,
    pub(crate) pinned: u8,
    pub(crate) block_index: u8,
    _reserved: [u8; 3],
    /// Chunk description, only valid in the first block of a chunk.
    pub(crate) chunk: ChunkHeader,
}

/// Typed view over a block-aligned 64 KiB region.
#[repr(C)]
pub struct Block {
    pub(crate) meta: BlockMeta,
    _meta_pad: [u8; LINE_SIZE - std::mem::size_of::<BlockMeta>()],
    pub(crate) line_flags: [LineFlags; LINE_COUNT],
}

impl Block {
    /// Zero the metadata lines and open the bump window over the whole
    /// payload.
    pub fn initialize(&mut self, block_index: u8) {
        unsafe {
            write_bytes(self.start(), 0, BLOCK_HEADER_SIZE);
        }
        self.meta.bump_cursor = BLOCK_HEADER_SIZE as u32;
        self.meta.bump_cursor_limit = BLOCK_SIZE as u32;
        self.meta.block_index = block_index;
    }

    #[inline(always)]
    pub fn start(&self) -> *mut u8 {
        self as *const Self as *mut u8
    }

    #[inline(always)]
    pub fn line(&self, index: usize) -> *mut u8 {
        debug_assert!(index < LINE_COUNT);
        (self.start() as usize + (index << LINE_BITS)) as *mut u8
    }

    /// Get the block owning this object by masking its address.
    #[inline(always)]
    pub fn from_object(object: *const StandardObjectAddress) -> *mut Block {
        align_down(object as usize, BLOCK_SIZE) as *mut Block
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.meta.flags == BlockFlags::Free
    }

    #[inline(always)]
    pub fn is_recyclable(&self) -> bool {
        self.meta.flags == BlockFlags::Recyclable
    }

    #[inline(always)]
    pub fn is_unavailable(&self) -> bool {
        self.meta.flags == BlockFlags::Unavailable
    }

    #[inline(always)]
    pub(crate) fn set_flags(&mut self, flags: BlockFlags) {
        self.meta.flags = flags;
    }

    /// Index of this block within its chunk.
    #[inline(always)]
    pub fn block_index(&self) -> u8 {
        self.meta.block_index
    }

    /// Reserved non-moving hint; nothing in the allocator consumes it yet.
    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.meta.pinned != 0
    }

    /// Determines whether an object starts within the given line.
    #[inline(always)]
    pub fn contains_object(&self, line_index: usize) -> bool {
        debug_assert!(line_index >= HEADER_LINE_COUNT);
        self.line_flags[line_index].contains_object()
    }

    /// First object starting in the given line. [`Self::contains_object`]
    /// must hold.
    #[inline(always)]
    pub fn first_object(&self, line_index: usize) -> *mut StandardObjectAddress {
        debug_assert!(self.contains_object(line_index));
        let offset = (self.line_flags[line_index].first_object_offset() as usize) << 2;
        (self.line(line_index) as usize + offset) as *mut StandardObjectAddress
    }

    /// Mark every line the object extent touches and pull the block out of
    /// the allocatable states. An object ending on a line boundary also
    /// keeps the following line alive; that over-retention is the price of
    /// line-granularity marking.
    pub fn mark_lines(&mut self, object: *mut StandardObjectAddress) {
        let offset = object as usize - self.start() as usize;
        let line_from = offset >> LINE_BITS;
        let line_to =
            ((offset + unsafe { (*object).size() } as usize) >> LINE_BITS).min(LINE_COUNT - 1);
        for i in line_from..=line_to {
            self.line_flags[i].set_marked(true);
        }
        self.meta.flags = BlockFlags::Unavailable;
    }

    /// Clear line marks before a new collection. Every block reads as free
    /// until marking proves otherwise.
    pub fn clear_marked(&mut self) {
        self.meta.flags = BlockFlags::Free;
        for i in HEADER_LINE_COUNT..LINE_COUNT {
            self.line_flags[i].set_marked(false);
        }
    }

    /// Rebuild the block from its line marks: zero reclaimed lines, recount
    /// used lines, and aim the bump window at the first hole.
    pub fn recycle(&mut self) {
        let mut bump_cursor: u32 = 0;
        let mut bump_cursor_limit: u32 = 0;
        let mut used_line_count: u8 = 0;
        let mut consecutive_used_line_count: u8 = 0;

        // Marking flipped the block to Unavailable; anything else never had
        // a surviving object and is free as a whole.
        if self.is_unavailable() {
            let mut previous_line_was_used = false;
            for i in HEADER_LINE_COUNT..LINE_COUNT {
                if self.line_flags[i].marked() {
                    used_line_count += 1;
                    if previous_line_was_used {
                        consecutive_used_line_count += 1;
                    }
                    previous_line_was_used = true;
                    if bump_cursor_limit == 0 && bump_cursor != 0 {
                        bump_cursor_limit = (i << LINE_BITS) as u32;
                    }
                } else {
                    previous_line_was_used = false;
                    self.line_flags[i] = LineFlags::new();
                    if bump_cursor == 0 {
                        bump_cursor = (i << LINE_BITS) as u32;
                    }

                    // Reclaimed lines read as size-0 objects afterwards.
                    unsafe {
                        write_bytes(self.line(i), 0, LINE_SIZE);
                    }
                }
            }

            if bump_cursor != 0 && bump_cursor_limit == 0 {
                bump_cursor_limit = BLOCK_SIZE as u32;
            }

            self.meta.flags = if used_line_count as usize == EFFECTIVE_LINE_COUNT {
                BlockFlags::Unavailable
            } else {
                BlockFlags::Recyclable
            };
        } else {
            self.meta.flags = BlockFlags::Free;
        }

        if bump_cursor == 0 {
            if self.is_unavailable() {
                // Entirely used: leave an empty window so the next
                // allocation attempt falls through to a block request.
                bump_cursor = BLOCK_SIZE as u32;
                bump_cursor_limit = BLOCK_SIZE as u32;
            } else {
                bump_cursor = BLOCK_HEADER_SIZE as u32;
                bump_cursor_limit = BLOCK_SIZE as u32;
            }
        }

        self.meta.bump_cursor = bump_cursor;
        self.meta.bump_cursor_limit = bump_cursor_limit;
        self.meta.used_line_count = used_line_count;
        self.meta.consecutive_used_line_count = consecutive_used_line_count;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory;

    /// Carve one block-aligned block out of an oversized OS allocation.
    pub(crate) struct RawBlock {
        raw: *mut u8,
        pub block: *mut Block,
    }

    impl RawBlock {
        pub fn new() -> Self {
            unsafe {
                let raw = memory::allocate_zeroed(BLOCK_SIZE * 2);
                assert!(!raw.is_null());
                let block =
                    crate::utils::align_up(raw as usize, BLOCK_SIZE) as *mut Block;
                (*block).initialize(0);
                Self { raw, block }
            }
        }
    }

    impl Drop for RawBlock {
        fn drop(&mut self) {
            unsafe { memory::free(self.raw) }
        }
    }

    #[test]
    fn meta_fits_one_line() {
        assert!(std::mem::size_of::<BlockMeta>() <= LINE_SIZE);
        assert_eq!(
            std::mem::size_of::<BlockMeta>()
                + std::mem::size_of::<[u8; LINE_SIZE - std::mem::size_of::<BlockMeta>()]>()
                + std::mem::size_of::<[LineFlags; LINE_COUNT]>(),
            BLOCK_HEADER_SIZE
        );
    }

    #[test]
    fn line_flag_encoding() {
        let mut flags = LineFlags::new();
        flags.set_contains_object(true);
        flags.set_first_object_offset((36 >> 2) as u8);
        let byte = flags.into_bytes()[0];
        assert_eq!(byte, 36 | 0b10);
        assert!(!flags.marked());
        flags.set_marked(true);
        assert_eq!(flags.into_bytes()[0], 36 | 0b11);
    }

    #[test]
    fn initialize_opens_full_window() {
        let raw = RawBlock::new();
        let block = unsafe { &mut *raw.block };
        assert_eq!(block.meta.bump_cursor, BLOCK_HEADER_SIZE as u32);
        assert_eq!(block.meta.bump_cursor_limit, BLOCK_SIZE as u32);
        assert!(block.is_free());
    }

    #[test]
    fn mark_lines_spans_conservatively() {
        let raw = RawBlock::new();
        let block = unsafe { &mut *raw.block };

        unsafe {
            // One object near the end of line 4, spilling into line 5.
            let object =
                (block.start() as usize + 4 * LINE_SIZE + LINE_SIZE - 16) as *mut StandardObjectAddress;
            (*object).initialize(60);
            block.mark_lines(object);

            assert!(block.is_unavailable());
            assert!(block.line_flags[4].marked());
            assert!(block.line_flags[5].marked());
            assert!(!block.line_flags[3].marked());
            assert!(!block.line_flags[6].marked());
        }
    }

    #[test]
    fn recycle_unmarked_block_is_free() {
        let raw = RawBlock::new();
        let block = unsafe { &mut *raw.block };
        block.recycle();
        assert!(block.is_free());
        assert_eq!(block.meta.bump_cursor, BLOCK_HEADER_SIZE as u32);
        assert_eq!(block.meta.used_line_count, 0);
    }

    #[test]
    fn recycle_rebuilds_hole_window() {
        let raw = RawBlock::new();
        let block = unsafe { &mut *raw.block };

        // Lines 2 and 5 hold survivors; 3 and 4 form the first hole.
        block.set_flags(BlockFlags::Unavailable);
        block.line_flags[2].set_marked(true);
        block.line_flags[5].set_marked(true);
        unsafe {
            // Garbage in a reclaimed line must be zeroed.
            *block.line(3) = 0xAB;
        }

        block.recycle();

        assert!(block.is_recyclable());
        assert_eq!(block.meta.used_line_count, 2);
        assert_eq!(block.meta.bump_cursor, (3 << LINE_BITS) as u32);
        assert_eq!(block.meta.bump_cursor_limit, (5 << LINE_BITS) as u32);
        unsafe {
            assert_eq!(*block.line(3), 0);
        }
    }

    #[test]
    fn recycle_full_block_forces_rerequest() {
        let raw = RawBlock::new();
        let block = unsafe { &mut *raw.block };

        block.set_flags(BlockFlags::Unavailable);
        for i in HEADER_LINE_COUNT..LINE_COUNT {
            block.line_flags[i].set_marked(true);
        }

        block.recycle();

        assert!(block.is_unavailable());
        assert_eq!(block.meta.used_line_count as usize, EFFECTIVE_LINE_COUNT);
        assert_eq!(block.meta.bump_cursor, block.meta.bump_cursor_limit);
        assert_eq!(block.meta.bump_cursor, BLOCK_SIZE as u32);
    }

    #[test]
    fn recycle_tail_hole_runs_to_block_end() {
        let raw = RawBlock::new();
        let block = unsafe { &mut *raw.block };

        block.set_flags(BlockFlags::Unavailable);
        for i in HEADER_LINE_COUNT..32 {
            block.line_flags[i].set_marked(true);
        }

        block.recycle();

        assert!(block.is_recyclable());
        assert_eq!(block.meta.bump_cursor, (32 << LINE_BITS) as u32);
        assert_eq!(block.meta.bump_cursor_limit, BLOCK_SIZE as u32);
        assert_eq!(block.meta.consecutive_used_line_count, 29);
    }
}
