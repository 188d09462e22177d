//! Sequential store buffer: LIFO pointer records in 4 KiB aligned buffers.
//!
//! A handle pushes pointers into its current buffer; filling it chains a
//! fresh buffer in front, and draining one pops back to the previous. The
//! alignment makes the full test a single mask of the write cursor.

use crate::memory;
use crate::utils::align_up;
use parking_lot::Mutex;
use std::ptr::null_mut;

/// Size of one buffer. Power of two; the buffer struct is laid out to span
/// exactly this many bytes.
pub const STORE_BUFFER_SIZE: usize = 4096;

/// Buffers carved out of a single OS allocation.
pub const STORE_BUFFERS_PER_CHUNK: usize = 8;

const POINTER_SIZE: usize = std::mem::size_of::<*mut u8>();
const POINTER_CAPACITY: usize = STORE_BUFFER_SIZE / POINTER_SIZE - 3;

#[repr(C)]
pub struct StoreBuffer {
    previous: *mut StoreBuffer,
    next: *mut *mut u8,
    /// Stays null. Popping an empty buffer walks the cursor onto this slot
    /// and reads the null back out.
    empty: *mut u8,
    pointers: [*mut u8; POINTER_CAPACITY],
}

impl StoreBuffer {
    fn initialize(&mut self) {
        self.previous = null_mut();
        self.empty = null_mut();
        self.next = self.pointers.as_mut_ptr();
    }

    #[inline(always)]
    fn is_full(&self) -> bool {
        self.next as usize & (STORE_BUFFER_SIZE - 1) == 0
    }

    #[inline(always)]
    fn push(&mut self, pointer: *mut u8) {
        unsafe {
            *self.next = pointer;
            self.next = self.next.add(1);
        }
    }

    #[inline(always)]
    fn pop(&mut self) -> *mut u8 {
        unsafe {
            self.next = self.next.sub(1);
            let ptr = *self.next;
            if ptr.is_null() {
                self.next = self.next.add(1);
            }
            ptr
        }
    }

    fn seek_to_end(&mut self) {
        self.next = (self as *mut Self as usize + STORE_BUFFER_SIZE) as *mut *mut u8;
    }
}

struct StoreBufferChunks {
    chunks: Vec<*mut u8>,
    free_buffers: Vec<*mut StoreBuffer>,
    next_index_in_chunk: usize,
}

/// Hands out aligned [`StoreBuffer`]s, eight per OS chunk, recycling
/// returned buffers through a free list.
pub struct StoreBufferAllocator {
    chunks: Mutex<StoreBufferChunks>,
}

unsafe impl Send for StoreBufferAllocator {}
unsafe impl Sync for StoreBufferAllocator {}

impl StoreBufferAllocator {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(StoreBufferChunks {
                chunks: Vec::new(),
                free_buffers: Vec::new(),
                next_index_in_chunk: 0,
            }),
        }
    }

    fn next_buffer(&self) -> *mut StoreBuffer {
        let mut inner = self.chunks.lock();

        if let Some(buffer) = inner.free_buffers.pop() {
            unsafe { (*buffer).initialize() };
            return buffer;
        }

        let mut chunk = inner.chunks.last().copied().unwrap_or(null_mut());
        if chunk.is_null() || inner.next_index_in_chunk == STORE_BUFFERS_PER_CHUNK {
            chunk =
                unsafe { memory::allocate(STORE_BUFFER_SIZE * (STORE_BUFFERS_PER_CHUNK + 1)) };
            inner.chunks.push(chunk);
            inner.next_index_in_chunk = 0;
        }

        let buffers = align_up(chunk as usize, STORE_BUFFER_SIZE) as *mut StoreBuffer;
        unsafe {
            if inner.next_index_in_chunk == 0 {
                for i in 0..STORE_BUFFERS_PER_CHUNK {
                    (*buffers.add(i)).initialize();
                }
            }
            let buffer = buffers.add(inner.next_index_in_chunk);
            inner.next_index_in_chunk += 1;
            buffer
        }
    }

    fn recycle(&self, buffer: *mut StoreBuffer) {
        self.chunks.lock().free_buffers.push(buffer);
    }
}

impl Drop for StoreBufferAllocator {
    fn drop(&mut self) {
        let inner = self.chunks.get_mut();
        for &chunk in &inner.chunks {
            unsafe { memory::free(chunk) };
        }
    }
}

/// A mutator-side handle over a chain of store buffers.
pub struct StoreBufferHandle<'a> {
    allocator: &'a StoreBufferAllocator,
    buffer: *mut StoreBuffer,
}

impl<'a> StoreBufferHandle<'a> {
    pub fn new(allocator: &'a StoreBufferAllocator) -> Self {
        Self {
            allocator,
            buffer: allocator.next_buffer(),
        }
    }

    #[inline]
    pub fn push(&mut self, pointer: *mut u8) {
        debug_assert!(!pointer.is_null());
        unsafe {
            (*self.buffer).push(pointer);
            if (*self.buffer).is_full() {
                self.overflow();
            }
        }
    }

    /// Pop the most recently pushed pointer; null once the chain is empty.
    #[inline]
    pub fn pop(&mut self) -> *mut u8 {
        unsafe {
            let ptr = (*self.buffer).pop();
            if ptr.is_null() {
                return self.recycle();
            }
            ptr
        }
    }

    #[inline(never)]
    fn overflow(&mut self) {
        unsafe {
            let previous = self.buffer;
            let next = self.allocator.next_buffer();
            (*previous).next = next as *mut *mut u8;
            self.buffer = next;
            (*self.buffer).previous = previous;
        }
    }

    #[inline(never)]
    fn recycle(&mut self) -> *mut u8 {
        unsafe {
            let previous = (*self.buffer).previous;
            (*self.buffer).previous = null_mut();
            if previous.is_null() {
                return null_mut();
            }
            self.allocator.recycle(self.buffer);
            self.buffer = previous;
            (*self.buffer).seek_to_end();
            (*self.buffer).pop()
        }
    }
}

impl<'a> Drop for StoreBufferHandle<'a> {
    fn drop(&mut self) {
        self.allocator.recycle(self.buffer);
    }
}
