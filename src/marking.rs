//! Recursive marking over the object graph.

use crate::block::Block;
use crate::header::{
    InnerObjectAddress, ObjectAddress, ObjectVisitor, StandardObjectAddress, VisitorContext,
};
use std::ptr::read_unaligned;

/// Visits and marks the object graph reachable from single objects.
pub struct Marker;

impl Marker {
    /// Mark `object` and everything reachable from it.
    pub fn mark(object: *mut ObjectAddress) {
        let mut context = VisitorContext {
            visitor: mark_object,
        };
        unsafe { mark_object(object, &mut context) };
    }
}

/// The marking visitor itself; user-class visitors call back through the
/// context so recursion flows through this function for every reference.
unsafe extern "C" fn mark_object(object: *mut ObjectAddress, context: *mut VisitorContext) {
    // Marking is optimistic: no lock around the test-and-set, two racing
    // markers at worst trace the same subgraph twice.
    if object.is_null() || (*object).is_marked() {
        return;
    }
    (*object).mark();

    let mut object = object;
    if (*object).is_inner_object() {
        object = (*(object as *mut InnerObjectAddress)).parent();
        if (*object).is_marked() {
            return;
        }
        (*object).mark();
    }

    if (*object).is_standard_object() {
        let standard = object as *mut StandardObjectAddress;
        (*Block::from_object(standard)).mark_lines(standard);
    }

    let visitor = (*object).visitor_word();

    // No visitor: the object is pointer free.
    if visitor == 0 {
        return;
    }

    if visitor & 1 != 0 {
        // Odd visitor word: the class stores an inline count of reference
        // slots following the class descriptor instead of a function.
        let count = visitor >> 1;
        let mut slot = (*object).to_user_object() as *mut *mut u8;
        for _ in 0..count {
            slot = slot.add(1);
            mark_object(
                ObjectAddress::from_user_object(read_unaligned(slot)),
                context,
            );
        }
    } else {
        let visitor: ObjectVisitor = std::mem::transmute(visitor);
        visitor(object, context);
    }
}
