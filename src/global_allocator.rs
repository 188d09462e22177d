//! Process-wide side of the allocator: owns every chunk and large object,
//! hands blocks to thread-local allocators, resolves conservative pointers
//! and drives the clear/mark/recycle cycle.

use crate::block::Block;
use crate::chunk::Chunk;
use crate::collections::ordered_range::{OrderedRange, RangeItem};
use crate::globals::*;
use crate::header::{LargeObjectAddress, ObjectAddress, StandardObjectAddress};
use crate::large_space::LargeObjectSpace;
use crate::marking::Marker;
use crate::utils::{align_down, formatted_size};
use parking_lot::Mutex;
use std::ptr::{null_mut, read_unaligned};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

impl RangeItem for Chunk {
    fn end_of_item(item: *mut Self) -> *mut u8 {
        (item as usize + CHUNK_SIZE) as *mut u8
    }
}

/// Chunk directory plus the block-handout cursor, all behind the chunks
/// mutex.
struct ChunkSpace {
    chunks: OrderedRange<Chunk>,
    next_recyclable_chunk_index: i32,
    next_free_chunk_index: i32,
    next_block_index_in_chunk: usize,
    use_recyclable_blocks: bool,
}

pub struct GlobalAllocator {
    chunks: Mutex<ChunkSpace>,
    large_objects: Mutex<LargeObjectSpace>,
    roots: Mutex<Vec<*mut *mut u8>>,
    total_allocated: AtomicUsize,
    allocated_since_last_collect: AtomicUsize,
    collect_requested: AtomicBool,
    verbose: bool,
}

unsafe impl Send for GlobalAllocator {}
unsafe impl Sync for GlobalAllocator {}

impl GlobalAllocator {
    pub fn new(verbose: bool) -> Self {
        Self {
            chunks: Mutex::new(ChunkSpace {
                chunks: OrderedRange::new(),
                next_recyclable_chunk_index: -1,
                next_free_chunk_index: -1,
                next_block_index_in_chunk: 0,
                use_recyclable_blocks: false,
            }),
            large_objects: Mutex::new(LargeObjectSpace::new()),
            roots: Mutex::new(Vec::with_capacity(512)),
            total_allocated: AtomicUsize::new(0),
            allocated_since_last_collect: AtomicUsize::new(0),
            collect_requested: AtomicBool::new(false),
            verbose,
        }
    }

    /// Total bytes this allocator holds from the OS.
    pub fn total_bytes_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    /// Bytes accrued since the last collection finished.
    pub fn allocated_bytes_since_last_collect(&self) -> usize {
        self.allocated_since_last_collect.load(Ordering::Relaxed)
    }

    /// True once enough allocation accrued that the next allocating mutator
    /// should run a collection.
    #[inline(always)]
    pub fn collect_requested(&self) -> bool {
        self.collect_requested.load(Ordering::Relaxed)
    }

    fn add_allocated_size(&self, size: usize) {
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        let since = self
            .allocated_since_last_collect
            .fetch_add(size, Ordering::Relaxed)
            + size;
        if since >= COLLECT_TRIGGER_LIMIT {
            self.collect_requested.store(true, Ordering::Relaxed);
        }
    }

    /// Hand out a block for a thread-local allocator: first a recyclable
    /// block unless the caller wants an empty one, then an untouched free
    /// block, finally a block of a freshly created chunk. Null on OOM.
    pub fn request_block(&self, request_for_empty_block: bool) -> *mut Block {
        let mut space = self.chunks.lock();
        let space = &mut *space;

        self.add_allocated_size(TOTAL_CHUNK_SIZE);

        // Allocate from recyclable blocks.
        if space.use_recyclable_blocks && !request_for_empty_block {
            let mut chunk_index = space.next_recyclable_chunk_index.max(0) as usize;
            while chunk_index < space.chunks.len() {
                let chunk = space.chunks.get(chunk_index);
                unsafe {
                    if (*chunk).has_recyclable_blocks() {
                        let mut block_index = space.next_block_index_in_chunk;
                        while block_index < (*chunk).block_count() {
                            let block = (*chunk).block(block_index);
                            if (*chunk).try_get_recyclable_block(block) {
                                space.next_recyclable_chunk_index = chunk_index as i32;
                                space.next_block_index_in_chunk = block_index + 1;
                                return block;
                            }
                            block_index += 1;
                        }
                    }
                }
                space.next_block_index_in_chunk = 0;
                chunk_index += 1;
            }

            // Every chunk with recyclable blocks is exhausted.
            space.next_recyclable_chunk_index = -1;
            space.use_recyclable_blocks = false;
        }

        // Allocate from free blocks.
        if space.next_free_chunk_index >= 0 {
            let mut chunk_index = space.next_free_chunk_index as usize;
            while chunk_index < space.chunks.len() {
                let chunk = space.chunks.get(chunk_index);
                unsafe {
                    if (*chunk).has_free_blocks() {
                        let mut block_index = space.next_block_index_in_chunk;
                        while block_index < (*chunk).block_count() {
                            let block = (*chunk).block(block_index);
                            if (*chunk).try_get_free_block(block) {
                                space.next_free_chunk_index = chunk_index as i32;
                                space.next_block_index_in_chunk = block_index + 1;
                                return block;
                            }
                            block_index += 1;
                        }
                    }
                }
                space.next_block_index_in_chunk = 0;
                chunk_index += 1;
            }
            space.next_free_chunk_index = chunk_index as i32;
        }

        // Create a new chunk and hand out its first block.
        let chunk = Chunk::allocate();
        if chunk.is_null() {
            return null_mut();
        }

        space.next_free_chunk_index = space.chunks.len() as i32;
        space.chunks.add(chunk);

        if self.verbose {
            eprintln!(
                "[quasar] new chunk {:p}, {} chunks, heap {}",
                chunk,
                space.chunks.len(),
                formatted_size(self.total_bytes_allocated())
            );
        }

        unsafe {
            let block = (*chunk).block(0);
            (*chunk).try_get_free_block(block);
            space.next_block_index_in_chunk = 1;
            block
        }
    }

    /// Allocate a large object. Accounting is coarse: one chunk-size per
    /// object keeps the collect trigger conservative.
    pub fn allocate_large_object(
        &self,
        size: usize,
        class_descriptor: *mut u8,
    ) -> *mut LargeObjectAddress {
        let object = self.large_objects.lock().allocate(size, class_descriptor);
        if object.is_null() {
            return null_mut();
        }
        self.add_allocated_size(CHUNK_SIZE);
        object
    }

    /// Register the address of a pointer variable as a GC root slot.
    pub fn add_gc_root(&self, gc_root: *mut *mut u8) {
        debug_assert!(!gc_root.is_null());
        self.roots.lock().push(gc_root);
    }

    /// Unregister a root slot; no-op when it was never added.
    pub fn remove_gc_root(&self, gc_root: *mut *mut u8) {
        debug_assert!(!gc_root.is_null());
        let mut roots = self.roots.lock();
        if let Some(index) = roots.iter().position(|&slot| slot == gc_root) {
            roots.remove(index);
        }
    }

    /// Mark every object reachable from a registered root slot.
    pub fn mark_roots(&self) {
        let roots = self.roots.lock();
        for &slot in roots.iter() {
            let user_object = unsafe { *slot };
            if !user_object.is_null() {
                Marker::mark(ObjectAddress::from_user_object(user_object));
            }
        }
    }

    /// Clear mark bits on every block and large object.
    pub fn clear_marked(&self) {
        let space = self.chunks.lock();
        let mut large = self.large_objects.lock();
        Self::clear_marked_locked(&space, &mut large);
    }

    fn clear_marked_locked(space: &ChunkSpace, large: &mut LargeObjectSpace) {
        for i in 0..space.chunks.len() {
            unsafe { (*space.chunks.get(i)).clear_marked() };
        }
        large.clear_marked();
    }

    /// Rebuild every block from its marks and free unmarked large objects.
    pub fn recycle(&self) {
        let mut space = self.chunks.lock();
        let mut large = self.large_objects.lock();
        self.recycle_locked(&mut space, &mut large);
    }

    fn recycle_locked(&self, space: &mut ChunkSpace, large: &mut LargeObjectSpace) {
        self.allocated_since_last_collect.store(0, Ordering::Relaxed);
        self.collect_requested.store(false, Ordering::Relaxed);
        space.next_recyclable_chunk_index = -1;
        space.next_free_chunk_index = -1;
        space.next_block_index_in_chunk = 0;

        for i in 0..space.chunks.len() {
            let chunk = space.chunks.get(i);
            unsafe {
                (*chunk).recycle();

                if (*chunk).has_recyclable_blocks() && space.next_recyclable_chunk_index < 0 {
                    space.next_recyclable_chunk_index = i as i32;
                } else if (*chunk).has_free_blocks() && space.next_free_chunk_index < 0 {
                    space.next_free_chunk_index = i as i32;
                }
            }
        }
        space.use_recyclable_blocks = space.next_recyclable_chunk_index >= 0;

        let freed = large.recycle();
        self.total_allocated.fetch_sub(freed, Ordering::Relaxed);

        if self.verbose {
            eprintln!(
                "[quasar] recycle: {} large-object bytes freed, heap {}",
                formatted_size(freed),
                formatted_size(self.total_bytes_allocated())
            );
        }
    }

    /// Resolve an arbitrary machine word to the object it points into, or
    /// null when it is not a managed pointer.
    pub fn find_object_conservative(&self, ptr: *const u8) -> *mut ObjectAddress {
        let space = self.chunks.lock();
        let large = self.large_objects.lock();
        Self::find_object_conservative_locked(&space, &large, ptr)
    }

    fn find_object_conservative_locked(
        space: &ChunkSpace,
        large: &LargeObjectSpace,
        ptr: *const u8,
    ) -> *mut ObjectAddress {
        // Discard pointers outside the chunk address range without touching
        // any chunk memory.
        if space.chunks.contains(ptr) {
            let object = Self::find_object_in_chunks(space, ptr);
            if !object.is_null() {
                return object;
            }
        }

        let object = large.find_conservative(ptr);
        if !object.is_null() {
            return object as *mut ObjectAddress;
        }
        null_mut()
    }

    fn find_object_in_chunks(space: &ChunkSpace, ptr: *const u8) -> *mut ObjectAddress {
        unsafe {
            for &chunk in space.chunks.bucket(ptr) {
                // Sorted bucket, sentinel terminated: the first chunk past
                // the probe ends the scan.
                if (ptr as usize) < chunk as usize {
                    break;
                }
                if ptr >= (*chunk).end_of_chunk() {
                    continue;
                }

                let block = align_down(ptr as usize, BLOCK_SIZE) as *mut Block;
                let line_in_block = (ptr as usize - block as usize) >> LINE_BITS;

                // Walk lines backwards: the object containing `ptr` starts
                // in this line or an earlier one.
                let mut line_index = line_in_block;
                while line_index >= HEADER_LINE_COUNT {
                    if (*block).contains_object(line_index) {
                        let mut object = (*block).first_object(line_index);
                        if (ptr as usize) < object as usize {
                            line_index -= 1;
                            continue;
                        }

                        loop {
                            if StandardObjectAddress::is_interior_pointer_or_next(
                                &mut object, ptr,
                            ) {
                                return object as *mut ObjectAddress;
                            }
                            if object.is_null() {
                                // The pointer lies in a gap between
                                // objects; it may still hit a large object.
                                return null_mut();
                            }
                        }
                    }
                    line_index -= 1;
                }
                break;
            }
        }
        null_mut()
    }

    /// One full collection on behalf of an allocating mutator: clear marks,
    /// mark roots, conservatively scan the captured stack range, recycle.
    /// The chunks and large-object locks are held throughout, so no other
    /// mutator can obtain blocks or large objects mid-cycle.
    pub(crate) fn collection_cycle(&self, stack_top: *mut u8, stack_bottom: *mut u8) {
        let mut space = self.chunks.lock();
        let mut large = self.large_objects.lock();

        Self::clear_marked_locked(&space, &mut large);
        self.mark_roots();

        let mut marked = 0usize;
        // Step four bytes at a time so pointers at any object-aligned
        // offset are seen.
        let mut cursor = stack_top as usize;
        while cursor < stack_bottom as usize {
            let candidate = unsafe { read_unaligned(cursor as *const *mut u8) };
            let object = Self::find_object_conservative_locked(&space, &large, candidate);
            if !object.is_null() {
                Marker::mark(object);
                marked += 1;
            }
            cursor += 4;
        }

        if self.verbose {
            eprintln!(
                "[quasar] collection: {} stack bytes scanned, {} conservative hits",
                stack_bottom as usize - stack_top as usize,
                marked
            );
        }

        self.recycle_locked(&mut space, &mut large);
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.lock().chunks.len()
    }

    pub(crate) fn large_object_count(&self) -> usize {
        self.large_objects.lock().len()
    }

    /// Block at a heap-wide index; for inspection from tests.
    pub(crate) fn get_block(&self, index: usize) -> *mut Block {
        let space = self.chunks.lock();
        let chunk_index = index >> BLOCK_COUNT_BITS_PER_CHUNK;
        let block_index = index & BLOCK_COUNT_PER_CHUNK_MASK;
        debug_assert!(chunk_index < space.chunks.len());
        unsafe { (*space.chunks.get(chunk_index)).block(block_index) }
    }
}

impl Drop for GlobalAllocator {
    fn drop(&mut self) {
        let space = self.chunks.get_mut();
        for i in 0..space.chunks.len() {
            unsafe { Chunk::destroy(space.chunks.get(i)) };
        }
        // Large objects are freed by a last recycle with nothing marked.
        self.large_objects.get_mut().clear_marked();
        self.large_objects.get_mut().recycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_block_fills_chunk_then_grows() {
        let global = GlobalAllocator::new(false);

        let first = global.request_block(false);
        assert!(!first.is_null());
        assert_eq!(global.chunk_count(), 1);
        assert_eq!(global.get_block(0), first);
        assert!(unsafe { (*first).is_unavailable() });

        let mut previous = first;
        for _ in 1..BLOCK_COUNT_PER_CHUNK {
            let block = global.request_block(false);
            assert_eq!(block as usize, previous as usize + BLOCK_SIZE);
            previous = block;
        }
        assert_eq!(global.chunk_count(), 1);

        let overflowing = global.request_block(false);
        assert!(!overflowing.is_null());
        assert_eq!(global.chunk_count(), 2);
    }

    #[test]
    fn allocation_counters_trigger_collect_request() {
        let global = GlobalAllocator::new(false);
        assert!(!global.collect_requested());

        let mut requested = 0;
        while !global.collect_requested() {
            assert!(!global.request_block(false).is_null());
            requested += 1;
            assert!(requested < 64);
        }
        assert!(global.total_bytes_allocated() >= COLLECT_TRIGGER_LIMIT);

        global.recycle();
        assert!(!global.collect_requested());
        assert_eq!(global.allocated_bytes_since_last_collect(), 0);
    }

    #[test]
    fn recycle_elects_first_recyclable_and_free_chunks() {
        let global = GlobalAllocator::new(false);
        let block = global.request_block(false);

        unsafe {
            // Fake one survivor line so the block recycles instead of
            // going back to free.
            (*block).line_flags[10].set_marked(true);
        }
        global.recycle();

        let space = global.chunks.lock();
        assert!(space.use_recyclable_blocks);
        assert_eq!(space.next_recyclable_chunk_index, 0);
        assert_eq!(space.next_block_index_in_chunk, 0);
        drop(space);

        // The recyclable block is preferred for the next ordinary request.
        let handed = global.request_block(false);
        assert_eq!(handed, block);
        assert!(unsafe { (*handed).is_recyclable() });

        // An empty-block request must skip it.
        let empty = global.request_block(true);
        assert_ne!(empty, block);
        assert!(unsafe { (*empty).is_unavailable() });
    }

    #[test]
    fn find_object_rejects_foreign_pointers() {
        let global = GlobalAllocator::new(false);
        let _ = global.request_block(false);

        let local = 0usize;
        assert!(global
            .find_object_conservative(&local as *const usize as *const u8)
            .is_null());
        assert!(global.find_object_conservative(null_mut()).is_null());
    }
}
