//! Tagged value layout and typed accessors.
//!
//! Every runtime value is a machine word. Bit 0 clear means an
//! unboxed integer stored as `n << 1`; bit 0 set means a boxed
//! pointer one byte past a heap header. All interior offsets are of
//! the form `k * W - 1`, so the literal field offsets below look
//! "off by one" on purpose.
//!
//! Header bytes, relative to the boxed pointer `p`:
//!
//! | field          | offset      |
//! |----------------|-------------|
//! | tag            | `0*W - 1`   |
//! | representation | `0*W - 1+1` |
//! | generation     | `0*W - 1+2` |
//! | GC mark        | `1*W - 2`   |
//! | GC forward     | `1*W - 1`   |
//!
//! The forwarding word overlaps the first entity field; it is only
//! written on the from-space copy once the object has been evacuated.

use crate::heap::{Heap, HeapTag, Tenure, BINDING_CONTEXT_TAG, POINTER_SIZE};

const W: usize = POINTER_SIZE;

/// Interior offset helper: `k * W - 1`.
pub const fn interior_offset(k: isize) -> isize {
    k * W as isize - 1
}

pub const TAG_OFFSET: isize = interior_offset(0);
pub const REPRESENTATION_OFFSET: isize = interior_offset(0) + 1;
pub const GENERATION_OFFSET: isize = interior_offset(0) + 2;
pub const GC_MARK_OFFSET: isize = interior_offset(1) - 1;
pub const GC_FORWARD_OFFSET: isize = interior_offset(1);

/// The canonical nil value: tag value 1 with the boxed bit set but no
/// header behind it.
pub fn nil_value() -> *mut u8 {
    HeapTag::Nil as usize as *mut u8
}

pub fn is_unboxed(p: *const u8) -> bool {
    (p as usize) & 1 == 0
}

pub fn is_nil(p: *const u8) -> bool {
    p as usize == HeapTag::Nil as usize
}

/// Tag byte of a boxed value. Callers must have excluded nil and
/// unboxed values.
pub unsafe fn get_tag(p: *const u8) -> Option<HeapTag> {
    HeapTag::from_u8(*p.offset(TAG_OFFSET))
}

pub unsafe fn is_heap_object(tag: HeapTag, p: *const u8) -> bool {
    !is_unboxed(p) && !is_nil(p) && get_tag(p) == Some(tag)
}

pub unsafe fn representation(p: *const u8) -> u8 {
    *p.offset(REPRESENTATION_OFFSET)
}

pub unsafe fn set_representation(p: *mut u8, r: u8) {
    *p.offset(REPRESENTATION_OFFSET) = r;
}

pub unsafe fn generation(p: *const u8) -> u8 {
    *p.offset(GENERATION_OFFSET)
}

pub unsafe fn increment_generation(p: *mut u8) {
    let g = *p.offset(GENERATION_OFFSET);
    *p.offset(GENERATION_OFFSET) = g.saturating_add(1);
}

pub unsafe fn is_gc_marked(p: *const u8) -> bool {
    *p.offset(GC_MARK_OFFSET) != 0
}

/// Mark `p` as evacuated to `new_addr`. The forwarding word clobbers
/// the first entity field, so this must happen after the copy.
pub unsafe fn set_gc_mark(p: *mut u8, new_addr: *mut u8) {
    *p.offset(GC_MARK_OFFSET) = 1;
    *(p.offset(GC_FORWARD_OFFSET) as *mut *mut u8) = new_addr;
}

pub unsafe fn get_gc_forward(p: *const u8) -> *mut u8 {
    *(p.offset(GC_FORWARD_OFFSET) as *const *mut u8)
}

unsafe fn word_at(p: *const u8, off: isize) -> usize {
    *(p.offset(off) as *const usize)
}

unsafe fn set_word_at(p: *mut u8, off: isize, value: usize) {
    *(p.offset(off) as *mut usize) = value;
}

// --- Numbers ---

pub mod number {
    use super::*;

    pub const VALUE_OFFSET: isize = interior_offset(1);

    /// Largest magnitude representable as an unboxed integer
    /// (`W - 1` usable bits).
    pub fn fits_unboxed(value: i64) -> bool {
        value <= (isize::MAX >> 1) as i64 && value >= (isize::MIN >> 1) as i64
    }

    pub fn tag(value: i64) -> *mut u8 {
        ((value as isize) << 1) as *mut u8
    }

    pub fn untag(p: *const u8) -> i64 {
        ((p as isize) >> 1) as i64
    }

    /// Allocates a number; integral values representable as small
    /// integers stay unboxed.
    pub fn new(heap: &mut Heap, tenure: Tenure, value: f64) -> *mut u8 {
        if value.fract() == 0.0 && !value.is_infinite() && fits_unboxed(value as i64) {
            return tag(value as i64);
        }
        let addr = heap.allocate_tagged(HeapTag::Number, tenure, (W + 8) as u32);
        unsafe {
            *(addr.offset(VALUE_OFFSET) as *mut f64) = value;
        }
        addr
    }

    pub unsafe fn double_value(p: *const u8) -> f64 {
        *(p.offset(VALUE_OFFSET) as *const f64)
    }

    /// Numeric value of any number, boxed or unboxed.
    pub unsafe fn value_of(p: *const u8) -> f64 {
        if is_unboxed(p) {
            untag(p) as f64
        } else {
            double_value(p)
        }
    }
}

// --- Booleans ---

pub mod boolean {
    use super::*;

    pub const VALUE_OFFSET: isize = interior_offset(1);

    pub fn new(heap: &mut Heap, tenure: Tenure, value: bool) -> *mut u8 {
        let addr = heap.allocate_tagged(HeapTag::Boolean, tenure, 2 * W as u32);
        unsafe {
            *addr.offset(VALUE_OFFSET) = value as u8;
        }
        addr
    }

    pub unsafe fn value(p: *const u8) -> bool {
        *p.offset(VALUE_OFFSET) != 0
    }
}

// --- Strings ---

pub mod string {
    use super::*;

    pub const NORMAL: u8 = 0x00;
    pub const CONS: u8 = 0x01;

    pub const HASH_OFFSET: isize = interior_offset(1);
    pub const LENGTH_OFFSET: isize = interior_offset(2);
    pub const VALUE_OFFSET: isize = interior_offset(3);
    pub const LEFT_CONS_OFFSET: isize = interior_offset(3);
    pub const RIGHT_CONS_OFFSET: isize = interior_offset(4);

    /// Concatenations below this length are flattened eagerly.
    pub const MIN_CONS_LENGTH: usize = 24;

    pub fn new(heap: &mut Heap, tenure: Tenure, value: &[u8]) -> *mut u8 {
        let addr = heap.allocate_tagged(
            HeapTag::String,
            tenure,
            (3 * W + value.len()) as u32,
        );
        unsafe {
            set_word_at(addr, HASH_OFFSET, 0);
            set_word_at(addr, LENGTH_OFFSET, value.len());
            std::ptr::copy_nonoverlapping(value.as_ptr(), addr.offset(VALUE_OFFSET), value.len());
        }
        addr
    }

    pub fn new_cons(heap: &mut Heap, tenure: Tenure, left: *mut u8, right: *mut u8) -> *mut u8 {
        let length = unsafe { length(left) + length(right) };
        debug_assert!(length >= MIN_CONS_LENGTH);
        let addr = heap.allocate_tagged(HeapTag::String, tenure, 5 * W as u32);
        unsafe {
            set_representation(addr, CONS);
            set_word_at(addr, HASH_OFFSET, 0);
            set_word_at(addr, LENGTH_OFFSET, length);
            set_word_at(addr, LEFT_CONS_OFFSET, left as usize);
            set_word_at(addr, RIGHT_CONS_OFFSET, right as usize);
        }
        addr
    }

    pub unsafe fn length(p: *const u8) -> usize {
        word_at(p, LENGTH_OFFSET)
    }

    pub unsafe fn left_cons(p: *const u8) -> *mut u8 {
        word_at(p, LEFT_CONS_OFFSET) as *mut u8
    }

    pub unsafe fn right_cons(p: *const u8) -> *mut u8 {
        word_at(p, RIGHT_CONS_OFFSET) as *mut u8
    }

    pub unsafe fn left_cons_slot(p: *mut u8) -> *mut *mut u8 {
        p.offset(LEFT_CONS_OFFSET) as *mut *mut u8
    }

    pub unsafe fn right_cons_slot(p: *mut u8) -> *mut *mut u8 {
        p.offset(RIGHT_CONS_OFFSET) as *mut *mut u8
    }

    /// Copies the string's bytes, flattening cons nodes depth-first.
    pub unsafe fn flatten_into(p: *const u8, out: &mut Vec<u8>) {
        if representation(p) == CONS {
            flatten_into(left_cons(p), out);
            flatten_into(right_cons(p), out);
        } else {
            let len = length(p);
            let bytes = std::slice::from_raw_parts(p.offset(VALUE_OFFSET), len);
            out.extend_from_slice(bytes);
        }
    }

    pub unsafe fn to_vec(p: *const u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(length(p));
        flatten_into(p, &mut out);
        out
    }

    /// djb2 over the flattened content; cached after the first
    /// computation. Zero is reserved to mean "not yet hashed".
    pub unsafe fn hash(p: *mut u8) -> usize {
        let cached = word_at(p, HASH_OFFSET);
        if cached != 0 {
            return cached;
        }
        let bytes = to_vec(p);
        let mut hash: usize = 5381;
        for &b in &bytes {
            hash = hash.wrapping_mul(33).wrapping_add(b as usize);
        }
        if hash == 0 {
            hash = 1;
        }
        set_word_at(p, HASH_OFFSET, hash);
        hash
    }
}

// --- Contexts ---

pub mod context {
    use super::*;

    pub const PARENT_OFFSET: isize = interior_offset(1);
    pub const SLOTS_OFFSET: isize = interior_offset(2);

    /// Interior displacement of slot `index`, shared with emitted
    /// code.
    pub const fn index_disp(index: usize) -> isize {
        interior_offset(3 + index as isize)
    }

    pub fn new(heap: &mut Heap, tenure: Tenure, slots: usize) -> *mut u8 {
        let addr = heap.allocate_tagged(
            HeapTag::Context,
            tenure,
            ((3 + slots) * W) as u32,
        );
        unsafe {
            set_word_at(addr, PARENT_OFFSET, 0);
            set_word_at(addr, SLOTS_OFFSET, slots);
            for i in 0..slots {
                set_word_at(addr, index_disp(i), 0);
            }
        }
        addr
    }

    pub unsafe fn parent(p: *const u8) -> *mut u8 {
        word_at(p, PARENT_OFFSET) as *mut u8
    }

    pub unsafe fn set_parent(p: *mut u8, parent: *mut u8) {
        set_word_at(p, PARENT_OFFSET, parent as usize);
    }

    pub unsafe fn parent_slot(p: *mut u8) -> *mut *mut u8 {
        p.offset(PARENT_OFFSET) as *mut *mut u8
    }

    pub unsafe fn slots(p: *const u8) -> usize {
        word_at(p, SLOTS_OFFSET)
    }

    pub unsafe fn has_slot(p: *const u8, index: usize) -> bool {
        word_at(p, index_disp(index)) != 0
    }

    pub unsafe fn get_slot(p: *const u8, index: usize) -> *mut u8 {
        word_at(p, index_disp(index)) as *mut u8
    }

    pub unsafe fn slot_addr(p: *mut u8, index: usize) -> *mut *mut u8 {
        p.offset(index_disp(index)) as *mut *mut u8
    }

    pub unsafe fn set_slot(p: *mut u8, index: usize, value: *mut u8) {
        set_word_at(p, index_disp(index), value as usize);
    }
}

// --- Maps (object storage) ---

pub mod map {
    use super::*;

    pub const SIZE_OFFSET: isize = interior_offset(1);
    pub const SPACE_OFFSET: isize = interior_offset(2);

    /// A map with `size` slots: `size` key words followed by `size`
    /// value words. Empty slots hold nil in the key position.
    pub fn new_empty(heap: &mut Heap, tenure: Tenure, size: usize) -> *mut u8 {
        debug_assert!(size.is_power_of_two());
        let addr = heap.allocate_tagged(
            HeapTag::Map,
            tenure,
            ((2 + 2 * size) * W) as u32,
        );
        unsafe {
            set_word_at(addr, SIZE_OFFSET, size);
            for i in 0..2 * size {
                set_word_at(addr, SPACE_OFFSET + (i * W) as isize, HeapTag::Nil as usize);
            }
        }
        addr
    }

    pub unsafe fn size(p: *const u8) -> usize {
        word_at(p, SIZE_OFFSET)
    }

    pub unsafe fn key_addr(p: *mut u8, index: usize) -> *mut *mut u8 {
        p.offset(SPACE_OFFSET + (index * W) as isize) as *mut *mut u8
    }

    pub unsafe fn value_addr(p: *mut u8, index: usize) -> *mut *mut u8 {
        let size = size(p);
        p.offset(SPACE_OFFSET + ((size + index) * W) as isize) as *mut *mut u8
    }

    pub unsafe fn is_empty_slot(p: *mut u8, index: usize) -> bool {
        is_nil(*key_addr(p, index))
    }
}

// --- Objects ---

pub mod object {
    use super::*;

    pub const MASK_OFFSET: isize = interior_offset(1);
    pub const MAP_OFFSET: isize = interior_offset(2);

    /// Initial map capacity of a fresh object.
    pub const INITIAL_MAP_SIZE: usize = 16;

    pub fn new_empty(heap: &mut Heap, tenure: Tenure) -> *mut u8 {
        let addr = heap.allocate_tagged(HeapTag::Object, tenure, 3 * W as u32);
        init(heap, addr, INITIAL_MAP_SIZE);
        addr
    }

    /// Allocates and installs a fresh map of `size` slots; the mask
    /// is stored on the object so generated code can probe without
    /// loading the map header.
    pub fn init(heap: &mut Heap, obj: *mut u8, size: usize) {
        let map = map::new_empty(heap, Tenure::New, size);
        unsafe {
            set_word_at(obj, MASK_OFFSET, (size - 1) * W);
            set_word_at(obj, MAP_OFFSET, map as usize);
        }
    }

    pub unsafe fn mask(p: *const u8) -> usize {
        word_at(p, MASK_OFFSET)
    }

    pub unsafe fn map(p: *const u8) -> *mut u8 {
        word_at(p, MAP_OFFSET) as *mut u8
    }

    pub unsafe fn map_slot(p: *mut u8) -> *mut *mut u8 {
        p.offset(MAP_OFFSET) as *mut *mut u8
    }

    pub unsafe fn set_map(p: *mut u8, new_map: *mut u8) {
        let size = map::size(new_map);
        set_word_at(p, MASK_OFFSET, (size - 1) * W);
        set_word_at(p, MAP_OFFSET, new_map as usize);
    }
}

// --- Arrays ---

pub mod array {
    use super::*;

    pub const LENGTH_OFFSET: isize = interior_offset(3);

    pub const VARARG_LENGTH: usize = 16;
    pub const DENSE_LENGTH_MAX: i64 = 128;

    pub fn new_empty(heap: &mut Heap, tenure: Tenure) -> *mut u8 {
        let addr = heap.allocate_tagged(HeapTag::Array, tenure, 4 * W as u32);
        object::init(heap, addr, object::INITIAL_MAP_SIZE);
        unsafe {
            set_word_at(addr, LENGTH_OFFSET, 0);
        }
        addr
    }

    pub unsafe fn length(p: *const u8) -> i64 {
        word_at(p, LENGTH_OFFSET) as i64
    }

    pub unsafe fn set_length(p: *mut u8, length: i64) {
        set_word_at(p, LENGTH_OFFSET, length as usize);
    }

    /// Dense arrays are directly indexed by the generated fast path;
    /// longer or sparse arrays take the runtime route.
    pub unsafe fn is_dense(p: *const u8) -> bool {
        length(p) <= DENSE_LENGTH_MAX
    }
}

// --- Functions ---

pub mod function {
    use super::*;

    pub const PARENT_OFFSET: isize = interior_offset(1);
    pub const CODE_OFFSET: isize = interior_offset(2);
    pub const ROOT_OFFSET: isize = interior_offset(3);
    pub const ARGC_OFFSET: isize = interior_offset(4);

    pub fn new(
        heap: &mut Heap,
        tenure: Tenure,
        parent: *mut u8,
        code: *const u8,
        root: *mut u8,
        argc: u32,
    ) -> *mut u8 {
        let addr = heap.allocate_tagged(HeapTag::Function, tenure, 5 * W as u32);
        unsafe {
            set_word_at(addr, PARENT_OFFSET, parent as usize);
            set_word_at(addr, CODE_OFFSET, code as usize);
            set_word_at(addr, ROOT_OFFSET, root as usize);
            set_word_at(addr, ARGC_OFFSET, argc as usize);
        }
        addr
    }

    /// A binding function wraps a host callback; its parent slot
    /// carries the binding tag so the collector skips it.
    pub fn new_binding(heap: &mut Heap, code: *const u8, root: *mut u8) -> *mut u8 {
        let addr = heap.allocate_tagged(HeapTag::Function, Tenure::New, 5 * W as u32);
        unsafe {
            set_word_at(addr, PARENT_OFFSET, BINDING_CONTEXT_TAG);
            set_word_at(addr, CODE_OFFSET, code as usize);
            set_word_at(addr, ROOT_OFFSET, root as usize);
            set_word_at(addr, ARGC_OFFSET, 0);
        }
        addr
    }

    pub unsafe fn parent(p: *const u8) -> *mut u8 {
        word_at(p, PARENT_OFFSET) as *mut u8
    }

    pub unsafe fn parent_slot(p: *mut u8) -> *mut *mut u8 {
        p.offset(PARENT_OFFSET) as *mut *mut u8
    }

    pub unsafe fn is_binding(p: *const u8) -> bool {
        word_at(p, PARENT_OFFSET) == BINDING_CONTEXT_TAG
    }

    pub unsafe fn code(p: *const u8) -> *const u8 {
        word_at(p, CODE_OFFSET) as *const u8
    }

    pub unsafe fn root(p: *const u8) -> *mut u8 {
        word_at(p, ROOT_OFFSET) as *mut u8
    }

    pub unsafe fn root_slot(p: *mut u8) -> *mut *mut u8 {
        p.offset(ROOT_OFFSET) as *mut *mut u8
    }

    pub unsafe fn argc(p: *const u8) -> u32 {
        word_at(p, ARGC_OFFSET) as u32
    }
}

// --- CData ---

pub mod cdata {
    use super::*;

    pub const SIZE_OFFSET: isize = interior_offset(1);
    pub const DATA_OFFSET: isize = interior_offset(2);

    pub fn new(heap: &mut Heap, tenure: Tenure, size: usize) -> *mut u8 {
        let addr = heap.allocate_tagged(
            HeapTag::CData,
            tenure,
            (2 * W + size) as u32,
        );
        unsafe {
            set_word_at(addr, SIZE_OFFSET, size);
            std::ptr::write_bytes(addr.offset(DATA_OFFSET), 0, size);
        }
        addr
    }

    pub unsafe fn size(p: *const u8) -> usize {
        word_at(p, SIZE_OFFSET)
    }

    pub unsafe fn data(p: *mut u8) -> *mut u8 {
        p.offset(DATA_OFFSET)
    }
}

/// Total byte size of a boxed value, header included. Used by the
/// collector to copy objects.
pub unsafe fn size_of_value(p: *const u8) -> u32 {
    let tag = get_tag(p).expect("boxed value must carry a valid tag");
    let bytes = match tag {
        HeapTag::Nil => unreachable!("nil is never a heap object"),
        HeapTag::Context => (3 + context::slots(p)) * W,
        HeapTag::Boolean => 2 * W,
        HeapTag::Number => W + 8,
        HeapTag::String => {
            if representation(p) == string::CONS {
                5 * W
            } else {
                3 * W + string::length(p)
            }
        }
        HeapTag::Object => 3 * W,
        HeapTag::Array => 4 * W,
        HeapTag::Function => 5 * W,
        HeapTag::CData => 2 * W + cdata::size(p),
        HeapTag::Map => (2 + 2 * map::size(p)) * W,
    };
    bytes as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::DEFAULT_PAGE_SIZE;

    #[test]
    fn integer_tagging_is_bit_exact() {
        assert_eq!(number::tag(0) as usize, 0);
        assert_eq!(number::tag(3) as usize, 6);
        assert_eq!(number::untag(number::tag(-17)), -17);
        assert!(is_unboxed(number::tag(1234)));
    }

    #[test]
    fn nil_is_boxed_but_special() {
        let nil = nil_value();
        assert!(!is_unboxed(nil));
        assert!(is_nil(nil));
    }

    #[test]
    fn boxed_values_have_odd_addresses() {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        let num = number::new(&mut heap, Tenure::New, 1.5);
        assert_eq!(num as usize & 1, 1);
        unsafe {
            assert_eq!(get_tag(num), Some(HeapTag::Number));
            assert_eq!(number::double_value(num), 1.5);
        }
    }

    #[test]
    fn integral_numbers_stay_unboxed() {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        let num = number::new(&mut heap, Tenure::New, 42.0);
        assert!(is_unboxed(num));
        assert_eq!(number::untag(num), 42);
    }

    #[test]
    fn string_hash_is_cached() {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        let s = string::new(&mut heap, Tenure::New, b"hello");
        unsafe {
            let first = string::hash(s);
            assert_ne!(first, 0);
            assert_eq!(string::hash(s), first);
        }
    }

    #[test]
    fn cons_string_flattens() {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        let left = string::new(&mut heap, Tenure::New, b"hello, cruel ");
        let right = string::new(&mut heap, Tenure::New, b"world of cons");
        let cons = string::new_cons(&mut heap, Tenure::New, left, right);
        unsafe {
            assert_eq!(representation(cons), string::CONS);
            assert_eq!(string::to_vec(cons), b"hello, cruel world of cons");
            assert_eq!(string::length(cons), 26);
        }
    }

    #[test]
    fn context_slots_roundtrip() {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        let ctx = context::new(&mut heap, Tenure::New, 4);
        unsafe {
            assert_eq!(context::slots(ctx), 4);
            assert!(!context::has_slot(ctx, 0));
            context::set_slot(ctx, 2, number::tag(7));
            assert_eq!(number::untag(context::get_slot(ctx, 2)), 7);
        }
    }

    #[test]
    fn object_mask_matches_map_size() {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        let obj = object::new_empty(&mut heap, Tenure::New);
        unsafe {
            let map = object::map(obj);
            assert_eq!(map::size(map), object::INITIAL_MAP_SIZE);
            assert_eq!(object::mask(obj), (object::INITIAL_MAP_SIZE - 1) * POINTER_SIZE);
        }
    }
}
