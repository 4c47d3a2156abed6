//! Stop-the-world semispace copying collector.
//!
//! Roots come from three places: the native stack between enter-frame
//! sentinels, the persistent handle list, and the root context. Each
//! discovered root is a `(value, slot)` pair on a grey queue; the
//! slot address is retained so it can be rewritten after evacuation.
//!
//! Every cycle evacuates all live objects. The destination space is
//! chosen per object: survivors of `MIN_OLD_SPACE_GENERATION`
//! evacuations are promoted into old space, everything else lands in
//! the new to-space. At the end of the cycle both to-spaces are
//! swapped in and the size limits recomputed.

use std::collections::VecDeque;

use crate::heap::{GcType, Heap, HeapTag, Space, ENTER_FRAME_TAG, MIN_OLD_SPACE_GENERATION,
                  POINTER_SIZE};
use crate::value;
use crate::value::{context, function, map, object, string};

/// A grey root: the value and the slot it was found in. A null slot
/// means the value is rooted but nothing needs rewriting (the copy's
/// own slots are enqueued with real addresses).
struct GcValue {
    value: *mut u8,
    slot: *mut *mut u8,
}

impl GcValue {
    unsafe fn relocate(&self, address: *mut u8) {
        if !self.slot.is_null() {
            *self.slot = address;
        }
    }
}

/// Collect garbage. `stack_top` is the top of the native stack of the
/// mutator; pass null to skip the stack walk (embedder-only roots).
///
/// # Safety
/// The stack between `stack_top` and the end of the sentinel chain
/// must follow the enter-frame layout planted by generated code; a
/// chain pointer that does not move towards older frames is treated
/// as corruption and aborts.
pub unsafe fn collect_garbage(heap: &mut Heap, stack_top: *mut u8) {
    let mut to_new = Space::new(heap.new_space.page_size());
    let mut to_old = Space::new(heap.old_space.page_size());

    // Reset GC flag
    heap.clear_needs_gc();

    let mut grey: VecDeque<GcValue> = VecDeque::new();

    if !stack_top.is_null() {
        scan_stack(heap, stack_top, &mut grey);
    }

    // Persistent handles root their referents unconditionally.
    for r in &heap.references {
        if r.kind == crate::heap::RefKind::Persistent {
            let value = *r.slot;
            grey.push_back(GcValue { value, slot: r.slot });
        }
    }

    // The root context itself.
    if !heap.root_context.is_null() {
        let slot = &mut heap.root_context as *mut *mut u8;
        grey.push_back(GcValue {
            value: *slot,
            slot,
        });
    }

    while let Some(item) = grey.pop_front() {
        let value = item.value;

        // Skip unboxed values and nil
        if value.is_null() || value::is_unboxed(value) || value::is_nil(value) {
            continue;
        }

        if value::is_gc_marked(value) {
            item.relocate(value::get_gc_forward(value));
            continue;
        }

        // Promote long-lived objects into old space.
        let generation = value::generation(value);
        let space = if generation + 1 >= MIN_OLD_SPACE_GENERATION {
            &mut to_old
        } else {
            &mut to_new
        };

        let size = value::size_of_value(value);
        let copy = space.allocate(size);
        std::ptr::copy_nonoverlapping(value.sub(1), copy.sub(1), size as usize);
        value::increment_generation(copy);

        // Forwarding clobbers the first field of the from-copy, so it
        // happens only after the bytes have been moved.
        value::set_gc_mark(value, copy);
        item.relocate(copy);

        visit_value(copy, &mut grey);
    }

    // Probe weak handles: survivors are rewritten, the rest fire
    // their callback exactly once and are unlinked.
    let mut fired: Vec<(crate::heap::WeakCallback, *mut u8)> = Vec::new();
    heap.weak_refs.retain_mut(|w| {
        if value::is_unboxed(w.value) || value::is_nil(w.value) {
            return true;
        }
        if value::is_gc_marked(w.value) {
            w.value = value::get_gc_forward(w.value);
            true
        } else {
            fired.push((w.callback, w.value));
            false
        }
    });

    // Weak embedder handles observe collection through their slot.
    for r in &heap.references {
        if r.kind == crate::heap::RefKind::Weak {
            let value = *r.slot;
            if value.is_null() || value::is_unboxed(value) || value::is_nil(value) {
                continue;
            }
            if value::is_gc_marked(value) {
                *r.slot = value::get_gc_forward(value);
            } else {
                *r.slot = value::nil_value();
            }
        }
    }

    heap.new_space.swap(&mut to_new);
    heap.old_space.swap(&mut to_old);
    heap.new_space.compute_size_limit();
    heap.old_space.compute_size_limit();

    // Callbacks run after the heap is consistent again; they may
    // allocate or re-enter the collector.
    for (callback, value) in fired {
        callback(value);
    }
}

/// Precise stack walk: word by word from `stack_top` towards older
/// frames, hopping over enter-frame sentinels and skipping return
/// addresses.
unsafe fn scan_stack(heap: &Heap, stack_top: *mut u8, grey: &mut VecDeque<GcValue>) {
    let mut top = stack_top;

    loop {
        // Once an enter-frame signature is found, skip stack entities
        // until the last exit frame position (or null).
        while *(top as *const usize) == ENTER_FRAME_TAG {
            let next = *(top.add(POINTER_SIZE) as *const *mut u8);
            if next.is_null() {
                return;
            }
            if (next as usize) <= (top as usize) {
                // Frames must get older as we walk; anything else
                // means the chain is corrupted.
                std::process::abort();
            }
            top = next;
        }

        let slot = top as *mut *mut u8;

        // A return address in the next slot means this word is the
        // saved frame pointer; skip both.
        if heap.is_code_addr(*slot.add(1) as *const u8) {
            top = top.add(2 * POINTER_SIZE);
            continue;
        }

        let value = *slot;

        // Skip null pointers, non-pointer values and code addresses
        if !value.is_null()
            && !value::is_unboxed(value)
            && !value::is_nil(value)
            && !heap.is_code_addr(value as *const u8)
        {
            grey.push_back(GcValue { value, slot });
        }

        top = top.add(POINTER_SIZE);
    }
}

/// Enqueue the outgoing slots of a freshly-evacuated copy. Booleans,
/// numbers and CData reference nothing; flat strings neither, but
/// cons strings carry their two children.
unsafe fn visit_value(copy: *mut u8, grey: &mut VecDeque<GcValue>) {
    match value::get_tag(copy) {
        Some(HeapTag::Context) => visit_context(copy, grey),
        Some(HeapTag::Function) => visit_function(copy, grey),
        Some(HeapTag::Object) | Some(HeapTag::Array) => visit_object(copy, grey),
        Some(HeapTag::Map) => visit_map(copy, grey),
        Some(HeapTag::String) => {
            if value::representation(copy) == string::CONS {
                grey.push_back(GcValue {
                    value: string::left_cons(copy),
                    slot: string::left_cons_slot(copy),
                });
                grey.push_back(GcValue {
                    value: string::right_cons(copy),
                    slot: string::right_cons_slot(copy),
                });
            }
        }
        Some(HeapTag::Boolean) | Some(HeapTag::Number) | Some(HeapTag::CData) => {}
        _ => unreachable!("unexpected tag during GC visit"),
    }
}

unsafe fn visit_context(ctx: *mut u8, grey: &mut VecDeque<GcValue>) {
    if !context::parent(ctx).is_null() {
        grey.push_back(GcValue {
            value: context::parent(ctx),
            slot: context::parent_slot(ctx),
        });
    }

    for i in 0..context::slots(ctx) {
        if !context::has_slot(ctx, i) {
            continue;
        }
        grey.push_back(GcValue {
            value: context::get_slot(ctx, i),
            slot: context::slot_addr(ctx, i),
        });
    }
}

unsafe fn visit_function(func: *mut u8, grey: &mut VecDeque<GcValue>) {
    // Host bindings have no parent context to scan.
    if !function::is_binding(func) && !function::parent(func).is_null() {
        grey.push_back(GcValue {
            value: function::parent(func),
            slot: function::parent_slot(func),
        });
    }
    if !function::root(func).is_null() {
        grey.push_back(GcValue {
            value: function::root(func),
            slot: function::root_slot(func),
        });
    }
}

unsafe fn visit_object(obj: *mut u8, grey: &mut VecDeque<GcValue>) {
    grey.push_back(GcValue {
        value: object::map(obj),
        slot: object::map_slot(obj),
    });
}

unsafe fn visit_map(m: *mut u8, grey: &mut VecDeque<GcValue>) {
    for i in 0..map::size(m) {
        if map::is_empty_slot(m, i) {
            continue;
        }
        grey.push_back(GcValue {
            value: *map::key_addr(m, i),
            slot: map::key_addr(m, i),
        });
        grey.push_back(GcValue {
            value: *map::value_addr(m, i),
            slot: map::value_addr(m, i),
        });
    }
}

/// True when `needs_gc` requests any collection; emitted code reads
/// the raw word instead.
pub fn gc_requested(heap: &Heap) -> bool {
    heap.needs_gc() != GcType::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{RefKind, Tenure};
    use crate::value::number;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn heap() -> Box<Heap> {
        Heap::new(4096)
    }

    #[test]
    fn unrooted_objects_are_dropped() {
        let mut heap = heap();
        for _ in 0..100 {
            object::new_empty(&mut heap, Tenure::New);
        }
        let before = heap.new_space().size();
        unsafe { collect_garbage(&mut heap, std::ptr::null_mut()) };
        let after = heap.new_space().size();
        assert!(after <= before);
        // Everything was garbage: one fresh page remains.
        assert_eq!(after, heap.new_space().page_size());
    }

    #[test]
    fn persistent_handle_keeps_value_alive_and_rewrites_slot() {
        let mut heap = heap();
        let mut cell = string::new(&mut heap, Tenure::New, b"persist me please ok");
        let slot = &mut cell as *mut *mut u8;
        heap.reference(RefKind::Persistent, slot);

        unsafe {
            collect_garbage(&mut heap, std::ptr::null_mut());
            // The object moved and the slot was rewritten.
            assert!(heap.new_space().contains(cell));
            assert_eq!(string::to_vec(cell), b"persist me please ok");
        }
        heap.dereference(slot);
    }

    #[test]
    fn gc_is_idempotent_without_mutation() {
        let mut heap = heap();
        let mut cell = object::new_empty(&mut heap, Tenure::New);
        let slot = &mut cell as *mut *mut u8;
        heap.reference(RefKind::Persistent, slot);

        unsafe {
            collect_garbage(&mut heap, std::ptr::null_mut());
            let new_size = heap.new_space().size();
            let old_size = heap.old_space().size();
            collect_garbage(&mut heap, std::ptr::null_mut());
            assert_eq!(heap.new_space().size(), new_size);
            assert_eq!(heap.old_space().size(), old_size);
        }
        heap.dereference(slot);
    }

    #[test]
    fn no_reachable_slot_points_into_dead_semispace() {
        let mut heap = heap();
        let mut obj = object::new_empty(&mut heap, Tenure::New);
        let slot = &mut obj as *mut *mut u8;
        heap.reference(RefKind::Persistent, slot);

        unsafe {
            collect_garbage(&mut heap, std::ptr::null_mut());
            let map = object::map(obj);
            assert!(heap.new_space().contains(obj));
            assert!(heap.new_space().contains(map));
        }
        heap.dereference(slot);
    }

    #[test]
    fn promotion_after_five_generations() {
        let mut heap = heap();
        let mut cell = object::new_empty(&mut heap, Tenure::New);
        let slot = &mut cell as *mut *mut u8;
        heap.reference(RefKind::Persistent, slot);

        unsafe {
            for _ in 0..MIN_OLD_SPACE_GENERATION {
                collect_garbage(&mut heap, std::ptr::null_mut());
            }
            assert!(heap.old_space().contains(cell), "object should be tenured");
        }
        heap.dereference(slot);
    }

    static WEAK_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn weak_callback(_value: *mut u8) {
        WEAK_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn weak_callback_fires_exactly_once() {
        let mut heap = heap();
        let doomed = object::new_empty(&mut heap, Tenure::New);
        heap.add_weak(doomed, weak_callback);

        unsafe {
            collect_garbage(&mut heap, std::ptr::null_mut());
            collect_garbage(&mut heap, std::ptr::null_mut());
        }
        assert_eq!(WEAK_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn context_chain_survives_collection() {
        let mut heap = heap();
        let parent = context::new(&mut heap, Tenure::New, 2);
        let child = context::new(&mut heap, Tenure::New, 1);
        unsafe {
            context::set_parent(child, parent);
            context::set_slot(parent, 0, number::tag(11));
            context::set_slot(child, 0, string::new(&mut heap, Tenure::New, b"x"));
        }

        let mut cell = child;
        let slot = &mut cell as *mut *mut u8;
        heap.reference(RefKind::Persistent, slot);

        unsafe {
            collect_garbage(&mut heap, std::ptr::null_mut());
            let moved_parent = context::parent(cell);
            assert!(heap.new_space().contains(moved_parent));
            assert_eq!(number::untag(context::get_slot(moved_parent, 0)), 11);
            assert_eq!(string::to_vec(context::get_slot(cell, 0)), b"x");
        }
        heap.dereference(slot);
    }

    #[test]
    fn stack_roots_found_through_sentinel_chain() {
        let mut heap = heap();
        let obj = object::new_empty(&mut heap, Tenure::New);
        let num = number::tag(21);

        // Fake native stack, addresses growing towards older frames:
        // [value][value][sentinel][link -> terminator][...]
        let mut stack: Vec<usize> = vec![0; 8];
        stack[0] = obj as usize;
        stack[1] = num as usize;
        stack[2] = ENTER_FRAME_TAG;
        // terminator frame: sentinel with null link
        stack[4] = ENTER_FRAME_TAG;
        stack[5] = 0;
        stack[3] = &stack[4] as *const usize as usize;

        unsafe {
            collect_garbage(&mut heap, stack.as_mut_ptr() as *mut u8);
            let moved = stack[0] as *mut u8;
            assert_ne!(moved, obj, "rooted object should have been evacuated");
            assert!(heap.new_space().contains(moved));
            // Unboxed values are untouched.
            assert_eq!(stack[1], num as usize);
        }
    }

    #[test]
    fn return_addresses_are_skipped() {
        let mut heap = heap();
        // Register a fake code range and plant a "return address" in
        // the second slot, with a garbage odd word before it.
        let code = vec![0u8; 64];
        heap.register_code_range(code.as_ptr() as usize, 64);

        let mut stack: Vec<usize> = vec![0; 6];
        stack[0] = 0xdead_beef | 1; // would crash if treated as boxed
        stack[1] = code.as_ptr() as usize + 8; // return address
        stack[2] = ENTER_FRAME_TAG;
        stack[3] = 0;

        unsafe {
            collect_garbage(&mut heap, stack.as_mut_ptr() as *mut u8);
        }
        // Reaching here without dereferencing the fake pointer is the
        // assertion.
    }
}
