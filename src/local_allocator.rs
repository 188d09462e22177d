//! Thread-local side of the allocator: a bump allocator over a *current*
//! and an *overflow* block, plus the entry point that turns a pending
//! collection request into an actual cycle.

use crate::block::{Block, LineFlags};
use crate::global_allocator::GlobalAllocator;
use crate::globals::*;
use crate::header::{LargeObjectAddress, StandardObjectAddress};
use crate::stack::{StackCallback, StackFrame};
use std::ptr::null_mut;

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockHandle {
    Current,
    Overflow,
}

pub struct LocalAllocator {
    global: *const GlobalAllocator,
    /// Block ordinary allocations bump into.
    current: *mut Block,
    /// Block medium objects fall back to, so they do not chew through the
    /// small holes of recyclable blocks.
    overflow: *mut Block,
    stack_frame: StackFrame,
}

impl LocalAllocator {
    /// Bind a mutator to its collector. The caller's frame becomes the
    /// bottom of the conservative stack scan, so this must run at the top
    /// of the mutator thread, above any frame that stores managed pointers.
    pub fn new(global: &GlobalAllocator) -> LocalAllocator {
        let mut this = LocalAllocator {
            global,
            current: null_mut(),
            overflow: null_mut(),
            stack_frame: StackFrame::new(),
        };
        this.stack_frame.initialize();
        this
    }

    #[inline(always)]
    fn global(&self) -> &GlobalAllocator {
        unsafe { &*self.global }
    }

    #[inline(always)]
    fn block_slot(&mut self, handle: BlockHandle) -> &mut *mut Block {
        match handle {
            BlockHandle::Current => &mut self.current,
            BlockHandle::Overflow => &mut self.overflow,
        }
    }

    /// Run a collection from this mutator's stack.
    pub fn collect(&mut self) {
        unsafe {
            let frame: *mut StackFrame = &mut self.stack_frame;
            (*frame).capture(self);
        }
    }

    /// Allocate a standard object, bump-first with hole search on
    /// recyclable blocks. Returns null on out of memory.
    pub fn allocate(
        &mut self,
        size_in_bytes: u32,
        class_descriptor: *mut u8,
    ) -> *mut StandardObjectAddress {
        debug_assert!(size_in_bytes > 0 && size_in_bytes as usize <= STANDARD_OBJECT_MAX_SIZE);
        debug_assert!(!class_descriptor.is_null());

        if self.global().collect_requested() {
            self.collect();

            // Drop both blocks so the next step pulls from the freshly
            // recycled pool.
            self.current = null_mut();
            self.overflow = null_mut();
        }

        // Align to 4 bytes.
        let size_in_bytes = (size_in_bytes + 3) & !3;
        let total_size_in_bytes = size_in_bytes + HEADER_TOTAL_SIZE as u32;
        let is_medium_sized_object = total_size_in_bytes as usize > LINE_SIZE;

        // Start with the current block handle.
        let mut handle = BlockHandle::Current;

        loop {
            let block_ptr = *self.block_slot(handle);

            // No block allocated yet for this handle.
            if block_ptr.is_null() {
                let block = self
                    .global()
                    .request_block(handle == BlockHandle::Overflow);
                if block.is_null() {
                    return null_mut();
                }
                *self.block_slot(handle) = block;
                continue;
            }

            let block = unsafe { &mut *block_ptr };
            let bump_cursor_end = block.meta.bump_cursor + total_size_in_bytes;

            // The object does not fit before the block boundary; replace
            // the block.
            if bump_cursor_end > BLOCK_SIZE as u32 {
                *self.block_slot(handle) = null_mut();
                continue;
            }

            // Recyclable block whose current hole is too small.
            if block.is_recyclable() && bump_cursor_end > block.meta.bump_cursor_limit {
                // A hole exists but cannot take a medium object; switch to
                // the overflow handle rather than fragment more holes.
                if is_medium_sized_object && block.meta.bump_cursor_limit != 0 {
                    handle = BlockHandle::Overflow;
                    continue;
                }

                // Number of free lines the object needs.
                let expected_line_count =
                    (total_size_in_bytes as usize + LINE_SIZE - 1) >> LINE_BITS;

                let search_from = if block.meta.bump_cursor_limit != 0 {
                    block.meta.bump_cursor_limit + 1
                } else {
                    block.meta.bump_cursor
                };
                let first_line = (search_from >> LINE_BITS) as usize;

                let mut new_cursor_line_index = 0usize;
                let mut new_cursor_limit_line_index = 0usize;

                for i in first_line..LINE_COUNT {
                    if block.line_flags[i].marked() {
                        if new_cursor_line_index > 0
                            && expected_line_count <= i - new_cursor_line_index
                        {
                            new_cursor_limit_line_index = i;
                            break;
                        }
                        new_cursor_line_index = 0;
                    } else {
                        if new_cursor_line_index == 0 {
                            new_cursor_line_index = i;
                        }
                        // Unmarked lines are reset on the way through.
                        block.line_flags[i] = LineFlags::new();
                    }
                }

                if new_cursor_limit_line_index == 0 {
                    // The tail of the block may still be an adequate run.
                    if new_cursor_line_index > 0
                        && expected_line_count <= LINE_COUNT - new_cursor_line_index
                    {
                        new_cursor_limit_line_index = LINE_COUNT;
                    } else if is_medium_sized_object {
                        handle = BlockHandle::Overflow;
                        continue;
                    } else {
                        // No hole in this block; request a new one.
                        *self.block_slot(handle) = null_mut();
                        continue;
                    }
                }

                block.meta.bump_cursor = (new_cursor_line_index << LINE_BITS) as u32;
                block.meta.bump_cursor_limit = (new_cursor_limit_line_index << LINE_BITS) as u32;
            }

            // Bump allocation.
            let bump_cursor = block.meta.bump_cursor;
            let object =
                (block.start() as usize + bump_cursor as usize) as *mut StandardObjectAddress;
            let offset_in_line = bump_cursor as usize & LINE_SIZE_MASK;
            let line_index = (bump_cursor as usize) >> LINE_BITS;

            unsafe {
                (*object).initialize(size_in_bytes);
                (*object).base.set_class_descriptor(class_descriptor);
            }

            // The first object to start in a line owns the offset record.
            if !block.line_flags[line_index].contains_object() {
                let mut flags = LineFlags::new();
                flags.set_contains_object(true);
                flags.set_first_object_offset((offset_in_line >> 2) as u8);
                block.line_flags[line_index] = flags;
            }

            block.meta.bump_cursor += total_size_in_bytes;

            return object;
        }
    }

    /// Allocate a large object through the global allocator.
    pub fn allocate_large_object(
        &mut self,
        size_in_bytes: usize,
        class_descriptor: *mut u8,
    ) -> *mut LargeObjectAddress {
        if self.global().collect_requested() {
            self.collect();
            self.current = null_mut();
            self.overflow = null_mut();
        }
        self.global()
            .allocate_large_object(size_in_bytes, class_descriptor)
    }
}

impl StackCallback for LocalAllocator {
    /// Runs with the captured stack range in place and drives one full
    /// collection cycle against this mutator's stack.
    fn stack_callback(&mut self) {
        let top = self.stack_frame.top_of_stack();
        let bottom = self.stack_frame.bottom_of_stack();
        self.global().collection_cycle(top, bottom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ObjectAddress;

    fn descriptor() -> *mut u8 {
        static DESCRIPTOR: [usize; 2] = [0; 2];
        DESCRIPTOR.as_ptr() as *mut u8
    }

    #[test]
    fn sequential_allocations_bump_contiguously() {
        let global = GlobalAllocator::new(false);
        let mut local = LocalAllocator::new(&global);

        let first = local.allocate(60, descriptor());
        let second = local.allocate(60, descriptor());
        assert_eq!(
            second as usize,
            first as usize + 60 + HEADER_TOTAL_SIZE
        );
        unsafe {
            assert_eq!((*first).size(), 64);
            assert_eq!((*first).next_object(), second);
            assert_eq!((*first).base.class_descriptor(), descriptor());
        }
    }

    #[test]
    fn size_is_rounded_to_four_bytes() {
        let global = GlobalAllocator::new(false);
        let mut local = LocalAllocator::new(&global);

        let object = local.allocate(13, descriptor());
        unsafe {
            assert_eq!((*object).size(), 16 + HEADER_TOTAL_SIZE as u32);
            assert_eq!(object as usize & 3, 0);
        }
    }

    #[test]
    fn first_object_offset_is_recorded_once() {
        let global = GlobalAllocator::new(false);
        let mut local = LocalAllocator::new(&global);

        let first = local.allocate(60, descriptor());
        let _second = local.allocate(60, descriptor());

        let block = unsafe { &*Block::from_object(first) };
        let line = (first as usize - block.start() as usize) >> LINE_BITS;
        assert!(block.contains_object(line));
        // Both objects start in the same line; the record points at the
        // first.
        assert_eq!(block.first_object(line), first);
    }

    #[test]
    fn medium_objects_span_lines() {
        let global = GlobalAllocator::new(false);
        let mut local = LocalAllocator::new(&global);

        let object = local.allocate(LINE_SIZE as u32 * 3, descriptor());
        assert!(!object.is_null());
        unsafe {
            assert_eq!((*object).size() as usize, LINE_SIZE * 3 + HEADER_TOTAL_SIZE);
        }
    }

    #[test]
    fn exhausted_block_is_replaced() {
        let global = GlobalAllocator::new(false);
        let mut local = LocalAllocator::new(&global);

        let payload = 1020u32;
        let per_block = EFFECTIVE_BLOCK_SIZE / (payload as usize + HEADER_TOTAL_SIZE);

        let first = local.allocate(payload, descriptor());
        let first_block = Block::from_object(first);
        let mut last = first;
        for _ in 1..per_block + 1 {
            last = local.allocate(payload, descriptor());
            assert!(!last.is_null());
        }
        assert_ne!(Block::from_object(last), first_block);
    }

    #[test]
    fn roots_survive_collection() {
        let global = GlobalAllocator::new(false);
        let mut local = LocalAllocator::new(&global);

        let object = local.allocate(64, descriptor());
        let mut root = unsafe { (*object).base.to_user_object() };
        global.add_gc_root(&mut root);

        global.clear_marked();
        global.mark_roots();
        global.recycle();

        unsafe {
            let block = &*Block::from_object(object);
            assert!(block.is_recyclable());
            assert_eq!(block.meta.used_line_count, 1);
            assert_eq!(
                global.find_object_conservative(object as *const u8),
                object as *mut ObjectAddress
            );
        }
        global.remove_gc_root(&mut root);
    }
}
