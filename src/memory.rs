//! Thin shim over the process heap. Chunks, large objects and store buffers
//! all come from here; nothing in the crate calls the OS allocator directly.

#[cfg(unix)]
pub mod _unix {
    /// Allocate `size` uninitialized bytes. Null on exhaustion.
    pub unsafe fn allocate(size: usize) -> *mut u8 {
        libc::malloc(size as _) as *mut u8
    }

    /// Allocate `size` zeroed bytes. Null on exhaustion.
    pub unsafe fn allocate_zeroed(size: usize) -> *mut u8 {
        libc::calloc(1, size as _) as *mut u8
    }

    pub unsafe fn free(ptr: *mut u8) {
        libc::free(ptr as *mut _);
    }
}

#[cfg(windows)]
pub mod _win {
    use winapi::um::heapapi::{GetProcessHeap, HeapAlloc, HeapFree};
    use winapi::um::winnt::HEAP_ZERO_MEMORY;

    pub unsafe fn allocate(size: usize) -> *mut u8 {
        HeapAlloc(GetProcessHeap(), 0, size as _) as *mut u8
    }

    pub unsafe fn allocate_zeroed(size: usize) -> *mut u8 {
        HeapAlloc(GetProcessHeap(), HEAP_ZERO_MEMORY, size as _) as *mut u8
    }

    pub unsafe fn free(ptr: *mut u8) {
        HeapFree(GetProcessHeap(), 0, ptr as *mut _);
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
