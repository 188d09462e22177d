//! Embedding surface: the process-wide collector instance and the calling
//! thread's mutator binding.

use crate::global_allocator::GlobalAllocator;
use crate::local_allocator::LocalAllocator;
use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

static INSTANCE: AtomicPtr<GlobalAllocator> = AtomicPtr::new(null_mut());

thread_local! {
    static LOCAL: Cell<*mut LocalAllocator> = Cell::new(null_mut());
}

/// Set up the process-wide collector. Idempotent; the first caller wins.
pub fn initialize() {
    if INSTANCE.load(Ordering::Acquire).is_null() {
        let global = Box::into_raw(Box::new(GlobalAllocator::new(false)));
        if INSTANCE
            .compare_exchange(null_mut(), global, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            unsafe { drop(Box::from_raw(global)) };
        }
    }
}

/// The process-wide collector. [`initialize`] must have run.
pub fn global() -> &'static GlobalAllocator {
    let instance = INSTANCE.load(Ordering::Acquire);
    debug_assert!(!instance.is_null(), "initialize() must run first");
    unsafe { &*instance }
}

/// Bind the calling thread to the collector. Must precede any allocation on
/// this thread, and should run at the top of the thread so the conservative
/// scan covers every later frame.
pub fn initialize_mutator_thread() {
    let global = global();
    LOCAL.with(|cell| {
        if cell.get().is_null() {
            cell.set(Box::into_raw(Box::new(LocalAllocator::new(global))));
        }
    });
}

/// Unbind the calling thread from the collector and release its local
/// allocator. Call when a mutator thread is done allocating; idempotent.
/// Any blocks the thread still borrowed return to the global allocator at
/// the next collection.
pub fn shutdown_mutator_thread() {
    LOCAL.with(|cell| {
        let local = cell.replace(null_mut());
        if !local.is_null() {
            unsafe { drop(Box::from_raw(local)) };
        }
    });
}

fn local() -> *mut LocalAllocator {
    let local = LOCAL.with(|cell| cell.get());
    debug_assert!(
        !local.is_null(),
        "initialize_mutator_thread() must precede allocation"
    );
    local
}

/// Allocate a standard-size managed object; returns the user-object
/// pointer, or null on out of memory.
///
/// `size` must be in `1..=STANDARD_OBJECT_MAX_SIZE` and `class_descriptor`
/// non-null.
pub fn allocate_standard_object(size: u32, class_descriptor: *mut u8) -> *mut u8 {
    let object = unsafe { (*local()).allocate(size, class_descriptor) };
    if object.is_null() {
        return null_mut();
    }
    unsafe { (*object).base.to_user_object() }
}

/// Allocate a large managed object (`size > STANDARD_OBJECT_MAX_SIZE`);
/// returns the user-object pointer, or null on out of memory.
pub fn allocate_large_object(size: usize, class_descriptor: *mut u8) -> *mut u8 {
    let object = unsafe { (*local()).allocate_large_object(size, class_descriptor) };
    if object.is_null() {
        return null_mut();
    }
    unsafe { (*object).base.to_user_object() }
}

/// Register the address of a pointer variable whose referent must survive
/// collections.
pub fn add_gc_root(gc_root: *mut *mut u8) {
    global().add_gc_root(gc_root);
}

/// Unregister a root slot; no-op when it was never added.
pub fn remove_gc_root(gc_root: *mut *mut u8) {
    global().remove_gc_root(gc_root);
}

/// Run a collection from the calling mutator, regardless of the trigger.
pub fn collect() {
    unsafe { (*local()).collect() }
}
