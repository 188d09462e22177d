//! Large-object space: objects too big for a block payload get their own
//! heap allocation and are tracked in a sorted directory for conservative
//! lookup.

use crate::collections::ordered_range::{OrderedRange, RangeItem};
use crate::globals::*;
use crate::header::LargeObjectAddress;
use crate::memory;
use crate::utils::{align_up, is_aligned};
use std::ptr::null_mut;

impl RangeItem for LargeObjectAddress {
    fn end_of_item(item: *mut Self) -> *mut u8 {
        unsafe { (item as usize + (*item).size()) as *mut u8 }
    }
}

pub struct LargeObjectSpace {
    objects: OrderedRange<LargeObjectAddress>,
}

impl LargeObjectSpace {
    pub fn new() -> Self {
        Self {
            objects: OrderedRange::new(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Allocate and register a large object. The allocation is zeroed,
    /// sized to `align(size + header, 16)` and 16-byte aligned. Null on
    /// exhaustion.
    pub fn allocate(&mut self, size: usize, class_descriptor: *mut u8) -> *mut LargeObjectAddress {
        debug_assert!(size > STANDARD_OBJECT_MAX_SIZE);
        debug_assert!(!class_descriptor.is_null());

        let total_size = align_up(size + HEADER_TOTAL_SIZE, 16);
        let object = unsafe { memory::allocate_zeroed(total_size) } as *mut LargeObjectAddress;

        if object.is_null() {
            return null_mut();
        }
        debug_assert!(is_aligned(object as usize, 16));

        unsafe {
            (*object).initialize(total_size);
            (*object).base.set_class_descriptor(class_descriptor);
        }
        self.objects.add(object);

        object
    }

    /// Resolve a conservative pointer against the directory.
    pub fn find_conservative(&self, ptr: *const u8) -> *mut LargeObjectAddress {
        if !self.objects.contains(ptr) {
            return null_mut();
        }

        for &object in self.objects.bucket(ptr) {
            // The bucket is sorted and sentinel terminated; the first entry
            // past the probe ends the scan.
            if (ptr as usize) < object as usize {
                break;
            }
            unsafe {
                if (*object).contains(ptr) {
                    return object;
                }
            }
        }
        null_mut()
    }

    /// Strip mark bits from every registered object.
    pub fn clear_marked(&mut self) {
        for i in 0..self.objects.len() {
            unsafe { (*self.objects.get(i)).base.unmark() };
        }
    }

    /// Free every unmarked object, walking in reverse so removals do not
    /// shift unvisited entries. Returns the number of bytes released.
    pub fn recycle(&mut self) -> usize {
        let mut freed = 0;
        let mut removed = false;

        for i in (0..self.objects.len()).rev() {
            let object = self.objects.get(i);
            unsafe {
                if !(*object).base.is_marked() {
                    freed += (*object).size();
                    self.objects.remove(i);
                    memory::free(object as *mut u8);
                    removed = true;
                }
            }
        }
        if removed {
            self.objects.reset_min_max();
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> *mut u8 {
        static DESCRIPTOR: [usize; 2] = [0; 2];
        DESCRIPTOR.as_ptr() as *mut u8
    }

    #[test]
    fn allocate_initializes_header() {
        let mut space = LargeObjectSpace::new();
        let size = EFFECTIVE_BLOCK_SIZE * 2;
        let object = space.allocate(size, descriptor());
        assert!(!object.is_null());

        unsafe {
            assert!((*object).base.is_large_object());
            assert!(!(*object).base.is_marked());
            assert_eq!((*object).size(), align_up(size + HEADER_TOTAL_SIZE, 16));
            assert_eq!((*object).base.class_descriptor(), descriptor());
            assert!(is_aligned(object as usize, 16));
        }
        assert_eq!(space.len(), 1);
        space.recycle();
    }

    #[test]
    fn find_conservative_resolves_interior_pointers() {
        let mut space = LargeObjectSpace::new();
        let object = space.allocate(STANDARD_OBJECT_MAX_SIZE + 100, descriptor());
        let size = unsafe { (*object).size() };

        let base = object as *const u8;
        unsafe {
            assert_eq!(space.find_conservative(base), object);
            assert_eq!(space.find_conservative(base.add(size / 2)), object);
            assert_eq!(space.find_conservative(base.add(size - 1)), object);
            assert!(space.find_conservative(base.add(size)).is_null());
        }
        space.recycle();
    }

    #[test]
    fn recycle_frees_unmarked_only() {
        let mut space = LargeObjectSpace::new();
        let keep = space.allocate(STANDARD_OBJECT_MAX_SIZE + 1000, descriptor());
        let dead = space.allocate(STANDARD_OBJECT_MAX_SIZE + 2000, descriptor());
        let dead_size = unsafe { (*dead).size() };

        unsafe { (*keep).base.mark() };
        let freed = space.recycle();

        assert_eq!(freed, dead_size);
        assert_eq!(space.len(), 1);
        assert_eq!(space.find_conservative(keep as *const u8), keep);

        unsafe { (*keep).base.unmark() };
        space.recycle();
        assert_eq!(space.len(), 0);
    }
}
