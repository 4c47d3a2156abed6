// Runtime support for Candor generated code.
//
// This crate owns the tagged heap, the copying collector and the
// C-callable slow paths invoked from stubs. Generated code only ever
// sees machine words: unboxed integers (low bit clear) and boxed
// pointers (low bit set, one byte past a heap header). The functions
// here keep implementations small and conservative; nothing in this
// crate panics across a runtime boundary — nonsensical operations
// return nil, matching dynamic-language conventions, and host
// allocation failure aborts.

pub mod gc;
pub mod heap;
pub mod source_map;
pub mod value;

use value::{array, boolean, context, map, number, object, string};

pub use heap::{
    GcType, Heap, HeapTag, RefKind, Space, Tenure, WeakCallback, BINDING_CONTEXT_TAG,
    DEFAULT_PAGE_SIZE, ENTER_FRAME_TAG, MIN_OLD_SPACE_GENERATION, POINTER_SIZE,
};
pub use source_map::SourceMap;

/// Type of host callbacks wrapped by binding functions:
/// `callback(argc, argv) -> value`.
pub type BindingCallback = unsafe extern "C" fn(u32, *const *mut u8) -> *mut u8;

// --- Allocation ---

/// Slow-path allocation behind the inline bump fast path. Requests a
/// collection when a space outgrows its limit; the caller's next
/// `CheckGC` picks it up.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_allocate(heap: *mut Heap, size: usize) -> *mut u8 {
    let heap = &mut *heap;
    // The tag byte is stamped by the caller, as in the inline path.
    heap.allocate_tagged(HeapTag::Nil, Tenure::New, size as u32)
}

/// Cooperative collection entry; `stack_top` is the caller's stack
/// pointer at the safe point.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_collect_garbage(heap: *mut Heap, stack_top: *mut u8) {
    gc::collect_garbage(&mut *heap, stack_top);
}

// --- Property lookup ---

/// Looks up `key` in `obj`, returning the interior offset of the
/// value slot relative to the object's map (an odd word), or nil when
/// the property cannot exist. With `insert != 0` missing string keys
/// are added, growing the map when the probe window is exhausted.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_lookup_property(
    heap: *mut Heap,
    obj: *mut u8,
    key: *mut u8,
    insert: i32,
) -> *mut u8 {
    let heap = &mut *heap;
    lookup_property(heap, obj, key, insert != 0)
}

unsafe fn lookup_property(heap: &mut Heap, obj: *mut u8, key: *mut u8, insert: bool) -> *mut u8 {
    if value::is_unboxed(obj) || value::is_nil(obj) {
        return value::nil_value();
    }

    match value::get_tag(obj) {
        Some(HeapTag::Object) => {}
        Some(HeapTag::Array) => {
            if value::is_unboxed(key) {
                let index = number::untag(key);
                if index >= 0 {
                    return lookup_array_index(heap, obj, index as usize, insert);
                }
                return value::nil_value();
            }
        }
        _ => return value::nil_value(),
    }

    // String keys; unboxed keys on plain objects are stringified.
    let key_bytes = if value::is_unboxed(key) {
        number::untag(key).to_string().into_bytes()
    } else if value::is_heap_object(HeapTag::String, key) {
        string::to_vec(key)
    } else {
        return value::nil_value();
    };

    lookup_string_key(heap, obj, &key_bytes, insert)
}

/// Probe the object's map for a string key: start at `hash & mask`,
/// walk linearly with wraparound. The generated fast path only ever
/// touches the first probe slot; everything else comes through here.
unsafe fn lookup_string_key(
    heap: &mut Heap,
    obj: *mut u8,
    key_bytes: &[u8],
    insert: bool,
) -> *mut u8 {
    let mut hash: usize = 5381;
    for &b in key_bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    if hash == 0 {
        hash = 1;
    }

    loop {
        let m = object::map(obj);
        let size = map::size(m);
        let start = hash & (size - 1);

        for probe in 0..size {
            let index = (start + probe) & (size - 1);
            let slot_key = *map::key_addr(m, index);

            if value::is_nil(slot_key) {
                if !insert {
                    // Empty value slot already holds nil; reading it
                    // yields the right answer.
                    return value_slot_offset(m, index);
                }
                let interned = string::new(heap, Tenure::New, key_bytes);
                // Allocation may have grown the map; re-read it.
                let m = object::map(obj);
                *map::key_addr(m, index) = interned;
                return value_slot_offset(m, index);
            }

            if value::is_heap_object(HeapTag::String, slot_key)
                && string::to_vec(slot_key) == key_bytes
            {
                return value_slot_offset(m, index);
            }
        }

        if !insert {
            return value::nil_value();
        }
        grow_object(heap, obj);
    }
}

unsafe fn lookup_array_index(
    heap: &mut Heap,
    obj: *mut u8,
    index: usize,
    insert: bool,
) -> *mut u8 {
    loop {
        let m = object::map(obj);
        let size = map::size(m);

        if index < size {
            if insert && (index as i64 + 1) > array::length(obj) {
                array::set_length(obj, index as i64 + 1);
            }
            // Dense elements live in the key region, indexed
            // directly.
            return key_slot_offset(index);
        }

        if !insert {
            return value::nil_value();
        }
        grow_object(heap, obj);
    }
}

/// Interior offset of map slot `index` in the key region.
unsafe fn key_slot_offset(index: usize) -> *mut u8 {
    (map::SPACE_OFFSET as usize + index * POINTER_SIZE) as *mut u8
}

/// Interior offset of map slot `index` in the value region:
/// `key offset + mask + W`.
unsafe fn value_slot_offset(m: *mut u8, index: usize) -> *mut u8 {
    let size = map::size(m);
    (map::SPACE_OFFSET as usize + (size + index) * POINTER_SIZE) as *mut u8
}

/// Doubles the object's map, re-probing every live entry into the new
/// table.
unsafe fn grow_object(heap: &mut Heap, obj: *mut u8) {
    let old_map = object::map(obj);
    let old_size = map::size(old_map);
    let is_array = value::get_tag(obj) == Some(HeapTag::Array);

    let new_map = map::new_empty(heap, Tenure::New, old_size * 2);
    // Allocation can move nothing here (GC is cooperative), but the
    // object's map pointer may already have been updated by a nested
    // grow; re-read defensively.
    let old_map = object::map(obj);

    if is_array {
        for i in 0..old_size {
            *map::key_addr(new_map, i) = *map::key_addr(old_map, i);
            *map::value_addr(new_map, i) = *map::value_addr(old_map, i);
        }
    } else {
        let new_size = map::size(new_map);
        for i in 0..old_size {
            let key = *map::key_addr(old_map, i);
            if value::is_nil(key) {
                continue;
            }
            let hash = string::hash(key);
            let start = hash & (new_size - 1);
            for probe in 0..new_size {
                let index = (start + probe) & (new_size - 1);
                if map::is_empty_slot(new_map, index) {
                    *map::key_addr(new_map, index) = key;
                    *map::value_addr(new_map, index) = *map::value_addr(old_map, i);
                    break;
                }
            }
        }
    }

    object::set_map(obj, new_map);
}

// --- Rust-side property helpers (used by the façade and tests) ---

/// Reads `obj[key]`, nil when missing.
pub unsafe fn get_property(heap: &mut Heap, obj: *mut u8, key: *mut u8) -> *mut u8 {
    let offset = lookup_property(heap, obj, key, false);
    if value::is_nil(offset) {
        return value::nil_value();
    }
    let m = object::map(obj);
    *(m.add(offset as usize) as *const *mut u8)
}

/// Writes `obj[key] = val`, inserting the key when needed.
pub unsafe fn set_property(heap: &mut Heap, obj: *mut u8, key: *mut u8, val: *mut u8) {
    let offset = lookup_property(heap, obj, key, true);
    if value::is_nil(offset) {
        return;
    }
    let m = object::map(obj);
    *(m.add(offset as usize) as *mut *mut u8) = val;
}

// --- Coercions ---

unsafe fn is_truthy(v: *mut u8) -> bool {
    if v.is_null() || value::is_nil(v) {
        return false;
    }
    if value::is_unboxed(v) {
        return number::untag(v) != 0;
    }
    match value::get_tag(v) {
        Some(HeapTag::Boolean) => boolean::value(v),
        Some(HeapTag::Number) => {
            let d = number::double_value(v);
            d != 0.0 && !d.is_nan()
        }
        Some(HeapTag::String) => string::length(v) > 0,
        _ => true,
    }
}

unsafe fn root_slot_value(heap: &Heap, index: usize) -> *mut u8 {
    context::get_slot(heap.root_context(), index)
}

fn root_boolean(heap: &Heap, value: bool) -> *mut u8 {
    let index = if value {
        heap::root::TRUE_INDEX
    } else {
        heap::root::FALSE_INDEX
    };
    unsafe { root_slot_value(heap, index) }
}

/// Coerce any value to the canonical True/False from the root
/// context.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_to_boolean(heap: *mut Heap, v: *mut u8) -> *mut u8 {
    let heap = &mut *heap;
    root_boolean(heap, is_truthy(v))
}

unsafe fn to_number(v: *mut u8) -> f64 {
    if v.is_null() || value::is_nil(v) {
        return 0.0;
    }
    if value::is_unboxed(v) {
        return number::untag(v) as f64;
    }
    match value::get_tag(v) {
        Some(HeapTag::Number) => number::double_value(v),
        Some(HeapTag::Boolean) => boolean::value(v) as i64 as f64,
        Some(HeapTag::String) => {
            let bytes = string::to_vec(v);
            std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

// --- Binary operations ---

/// Operator codes shared with the compiler; a closed set matching the
/// language's operator tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BinOpCode {
    Add = 0,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    UShr,
    Eq,
    StrictEq,
    Ne,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    LAnd,
    LOr,
}

impl BinOpCode {
    pub fn from_u32(raw: u32) -> Option<BinOpCode> {
        if raw <= BinOpCode::LOr as u32 {
            // Codes are dense, starting at zero.
            Some(unsafe { std::mem::transmute(raw) })
        } else {
            None
        }
    }
}

/// Full-fat binary operation fallback: string concatenation, numeric
/// coercion, lexicographic and numeric comparisons, short-circuit
/// selection. Comparisons yield the canonical booleans.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_binop(
    heap: *mut Heap,
    op: u32,
    lhs: *mut u8,
    rhs: *mut u8,
) -> *mut u8 {
    let heap = &mut *heap;
    let op = match BinOpCode::from_u32(op) {
        Some(op) => op,
        None => return value::nil_value(),
    };
    binop(heap, op, lhs, rhs)
}

unsafe fn binop(heap: &mut Heap, op: BinOpCode, lhs: *mut u8, rhs: *mut u8) -> *mut u8 {
    use BinOpCode::*;

    let lhs_str = value::is_heap_object(HeapTag::String, lhs);
    let rhs_str = value::is_heap_object(HeapTag::String, rhs);

    match op {
        Add if lhs_str || rhs_str => {
            let left = coerce_string(heap, lhs);
            let right = coerce_string(heap, rhs);
            let total = string::length(left) + string::length(right);
            if total >= string::MIN_CONS_LENGTH {
                string::new_cons(heap, Tenure::New, left, right)
            } else {
                let mut bytes = string::to_vec(left);
                bytes.extend_from_slice(&string::to_vec(right));
                string::new(heap, Tenure::New, &bytes)
            }
        }
        Add | Sub | Mul | Div => {
            let l = to_number(lhs);
            let r = to_number(rhs);
            if op == Div && r == 0.0 {
                // Divide by zero is a non-fatal runtime error.
                return value::nil_value();
            }
            let result = match op {
                Add => l + r,
                Sub => l - r,
                Mul => l * r,
                _ => l / r,
            };
            number::new(heap, Tenure::New, result)
        }
        Mod | BAnd | BOr | BXor | Shl | Shr | UShr => {
            let l = to_number(lhs) as i64;
            let r = to_number(rhs) as i64;
            let result = match op {
                Mod => {
                    if r == 0 {
                        return value::nil_value();
                    }
                    l % r
                }
                BAnd => l & r,
                BOr => l | r,
                BXor => l ^ r,
                Shl => l.wrapping_shl(r as u32),
                Shr => l.wrapping_shr(r as u32),
                _ => ((l as u64).wrapping_shr(r as u32)) as i64,
            };
            number::new(heap, Tenure::New, result as f64)
        }
        Eq | Ne | StrictEq | StrictNe | Lt | Gt | Le | Ge => {
            let result = if lhs_str && rhs_str {
                let l = string::to_vec(lhs);
                let r = string::to_vec(rhs);
                match op {
                    Eq | StrictEq => l == r,
                    Ne | StrictNe => l != r,
                    Lt => l < r,
                    Gt => l > r,
                    Le => l <= r,
                    _ => l >= r,
                }
            } else if matches!(op, StrictEq | StrictNe) && !same_type(lhs, rhs) {
                matches!(op, StrictNe)
            } else {
                let l = to_number(lhs);
                let r = to_number(rhs);
                match op {
                    Eq | StrictEq => l == r,
                    Ne | StrictNe => l != r,
                    Lt => l < r,
                    Gt => l > r,
                    Le => l <= r,
                    _ => l >= r,
                }
            };
            root_boolean(heap, result)
        }
        LAnd => {
            if is_truthy(lhs) {
                rhs
            } else {
                lhs
            }
        }
        LOr => {
            if is_truthy(lhs) {
                lhs
            } else {
                rhs
            }
        }
    }
}

unsafe fn same_type(lhs: *mut u8, rhs: *mut u8) -> bool {
    let kind = |v: *mut u8| -> u8 {
        if value::is_nil(v) {
            0
        } else if value::is_unboxed(v) {
            HeapTag::Number as u8
        } else {
            value::get_tag(v).map(|t| t as u8).unwrap_or(0xff)
        }
    };
    kind(lhs) == kind(rhs)
}

unsafe fn coerce_string(heap: &mut Heap, v: *mut u8) -> *mut u8 {
    if value::is_heap_object(HeapTag::String, v) {
        return v;
    }
    let text = stringify(v);
    string::new(heap, Tenure::New, text.as_bytes())
}

unsafe fn stringify(v: *mut u8) -> String {
    if v.is_null() || value::is_nil(v) {
        return "nil".to_string();
    }
    if value::is_unboxed(v) {
        return number::untag(v).to_string();
    }
    match value::get_tag(v) {
        Some(HeapTag::Number) => {
            let d = number::double_value(v);
            format!("{}", d)
        }
        Some(HeapTag::Boolean) => {
            if boolean::value(v) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        Some(HeapTag::String) => String::from_utf8_lossy(&string::to_vec(v)).into_owned(),
        Some(HeapTag::Object) => "[object]".to_string(),
        Some(HeapTag::Array) => "[array]".to_string(),
        Some(HeapTag::Function) => "[function]".to_string(),
        Some(HeapTag::CData) => "[cdata]".to_string(),
        _ => "nil".to_string(),
    }
}

// --- Introspection ---

/// `sizeof`: array length, string length, 0 otherwise.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_sizeof(_heap: *mut Heap, v: *mut u8) -> *mut u8 {
    if value::is_unboxed(v) || value::is_nil(v) {
        return number::tag(0);
    }
    let size = match value::get_tag(v) {
        Some(HeapTag::Array) => array::length(v),
        Some(HeapTag::String) => string::length(v) as i64,
        _ => 0,
    };
    number::tag(size)
}

/// `typeof`: a type string from the root context.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_typeof(heap: *mut Heap, v: *mut u8) -> *mut u8 {
    let heap = &mut *heap;
    let index = if value::is_unboxed(v) {
        heap::root::NUMBER_TYPE_INDEX
    } else if value::is_nil(v) {
        heap::root::NIL_TYPE_INDEX
    } else {
        match value::get_tag(v) {
            Some(tag) => {
                heap::root::BOOLEAN_TYPE_INDEX + (tag as usize - HeapTag::Boolean as usize)
            }
            None => heap::root::NIL_TYPE_INDEX,
        }
    };
    root_slot_value(heap, index)
}

/// `keysof`: an array of the object's keys, or of an array's indices.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_keysof(heap: *mut Heap, v: *mut u8) -> *mut u8 {
    let heap = &mut *heap;
    if value::is_unboxed(v) || value::is_nil(v) {
        return value::nil_value();
    }
    match value::get_tag(v) {
        Some(HeapTag::Array) => {
            let result = array::new_empty(heap, Tenure::New);
            for i in 0..array::length(v) {
                set_property(heap, result, number::tag(i), number::tag(i));
            }
            result
        }
        Some(HeapTag::Object) => {
            let result = array::new_empty(heap, Tenure::New);
            let m = object::map(v);
            let mut out = 0i64;
            for i in 0..map::size(m) {
                if map::is_empty_slot(m, i) {
                    continue;
                }
                let key = *map::key_addr(m, i);
                set_property(heap, result, number::tag(out), key);
                out += 1;
            }
            result
        }
        _ => value::nil_value(),
    }
}

/// `clone`: shallow object copy sharing no map storage; non-objects
/// clone to nil.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_clone(heap: *mut Heap, v: *mut u8) -> *mut u8 {
    let heap = &mut *heap;
    if value::is_unboxed(v) || value::is_nil(v) || !value::is_heap_object(HeapTag::Object, v) {
        return value::nil_value();
    }

    let src_map = object::map(v);
    let size = map::size(src_map);
    let result = heap.allocate_tagged(HeapTag::Object, Tenure::New, 3 * POINTER_SIZE as u32);
    object::init(heap, result, size);

    // Maps are parallel arrays; clone by straight copy.
    let src_map = object::map(v);
    let dst_map = object::map(result);
    for i in 0..size {
        *map::key_addr(dst_map, i) = *map::key_addr(src_map, i);
        *map::value_addr(dst_map, i) = *map::value_addr(src_map, i);
    }
    result
}

/// `delete obj[key]`: empties the slot. Returns nil.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_delete_property(
    heap: *mut Heap,
    obj: *mut u8,
    key: *mut u8,
) -> *mut u8 {
    let heap = &mut *heap;
    if value::is_unboxed(obj) || value::is_nil(obj) {
        return value::nil_value();
    }
    if !matches!(
        value::get_tag(obj),
        Some(HeapTag::Object) | Some(HeapTag::Array)
    ) {
        return value::nil_value();
    }

    let offset = lookup_property(heap, obj, key, false);
    if value::is_nil(offset) {
        return value::nil_value();
    }
    let m = object::map(obj);
    // Clear the value slot and, for objects, the key slot too.
    *(m.add(offset as usize) as *mut *mut u8) = value::nil_value();
    if value::get_tag(obj) == Some(HeapTag::Object) {
        let key_offset = offset as usize - map::size(m) * POINTER_SIZE;
        *(m.add(key_offset) as *mut *mut u8) = value::nil_value();
    }
    value::nil_value()
}

/// Hash of a string value; used by the property-lookup fast path.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_get_hash(_heap: *mut Heap, s: *mut u8) -> usize {
    if !value::is_heap_object(HeapTag::String, s) {
        return 0;
    }
    string::hash(s)
}

// --- Stack traces ---

/// Builds an Array of `{ line, offset }` Objects for `ip` and every
/// return address found while walking the sentinel chain from
/// `frame`.
#[no_mangle]
pub unsafe extern "C" fn candor_runtime_stack_trace(
    heap: *mut Heap,
    frame: *mut u8,
    ip: *mut u8,
) -> *mut u8 {
    let heap = &mut *heap;
    let result = array::new_empty(heap, Tenure::New);
    let mut index = 0i64;

    let mut push_entry = |heap: &mut Heap, index: &mut i64, code_offset: u32| {
        if let Some(ast_offset) = heap.source_map().lookup(code_offset) {
            let entry = object::new_empty(heap, Tenure::New);
            let line = heap.line_for_offset(ast_offset);
            let line_key = string::new(heap, Tenure::New, b"line");
            let offset_key = string::new(heap, Tenure::New, b"offset");
            set_property(heap, entry, line_key, number::tag(line as i64));
            set_property(heap, entry, offset_key, number::tag(ast_offset as i64));
            set_property(heap, result, number::tag(*index), entry);
            *index += 1;
        }
    };

    let ip_offset = code_offset_of(heap, ip);
    push_entry(heap, &mut index, ip_offset);

    // Hop frame to frame collecting return addresses.
    let mut top = frame;
    while !top.is_null() {
        if *(top as *const usize) == ENTER_FRAME_TAG {
            top = *(top.add(POINTER_SIZE) as *const *mut u8);
            continue;
        }
        let word = *(top as *const *mut u8);
        if heap.is_code_addr(word) {
            let offset = code_offset_of(heap, word);
            push_entry(heap, &mut index, offset);
        }
        top = top.add(POINTER_SIZE);
    }

    result
}

unsafe fn code_offset_of(heap: &Heap, addr: *mut u8) -> u32 {
    heap.code_range_offset(addr as usize).unwrap_or(0)
}

// --- Root context ---

/// Builds the root context: global object, canonical booleans and the
/// `typeof` string table, in `HeapTag` order.
pub fn create_root_context(heap: &mut Heap) -> *mut u8 {
    let root = context::new(heap, Tenure::Old, heap::root::SLOT_COUNT);

    let global = object::new_empty(heap, Tenure::Old);
    let true_value = boolean::new(heap, Tenure::Old, true);
    let false_value = boolean::new(heap, Tenure::Old, false);

    unsafe {
        context::set_slot(root, heap::root::GLOBAL_INDEX, global);
        context::set_slot(root, heap::root::TRUE_INDEX, true_value);
        context::set_slot(root, heap::root::FALSE_INDEX, false_value);

        let type_names: [&[u8]; 8] = [
            b"nil", b"boolean", b"number", b"string", b"object", b"array", b"function", b"cdata",
        ];
        for (i, name) in type_names.iter().enumerate() {
            let s = string::new(heap, Tenure::Old, name);
            context::set_slot(root, heap::root::NIL_TYPE_INDEX + i, s);
        }
    }

    heap.set_root_context(root);
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with_root() -> Box<Heap> {
        let mut heap = Heap::new(DEFAULT_PAGE_SIZE);
        create_root_context(&mut heap);
        heap
    }

    unsafe fn str_key(heap: &mut Heap, s: &str) -> *mut u8 {
        string::new(heap, Tenure::New, s.as_bytes())
    }

    #[test]
    fn object_property_roundtrip() {
        let mut heap = heap_with_root();
        unsafe {
            let obj = object::new_empty(&mut heap, Tenure::New);
            let key = str_key(&mut heap, "answer");
            set_property(&mut heap, obj, key, number::tag(42));

            let key2 = str_key(&mut heap, "answer");
            assert_eq!(number::untag(get_property(&mut heap, obj, key2)), 42);

            let missing = str_key(&mut heap, "missing");
            assert!(value::is_nil(get_property(&mut heap, obj, missing)));
        }
    }

    #[test]
    fn object_grows_past_initial_map() {
        let mut heap = heap_with_root();
        unsafe {
            let obj = object::new_empty(&mut heap, Tenure::New);
            for i in 0..64 {
                let key = str_key(&mut heap, &format!("key{}", i));
                set_property(&mut heap, obj, key, number::tag(i));
            }
            for i in 0..64 {
                let key = str_key(&mut heap, &format!("key{}", i));
                assert_eq!(number::untag(get_property(&mut heap, obj, key)), i);
            }
            assert!(map::size(object::map(obj)) > object::INITIAL_MAP_SIZE);
        }
    }

    #[test]
    fn array_length_tracks_highest_index() {
        let mut heap = heap_with_root();
        unsafe {
            let arr = array::new_empty(&mut heap, Tenure::New);
            set_property(&mut heap, arr, number::tag(3), number::tag(4));
            assert_eq!(array::length(arr), 4);
            assert_eq!(number::untag(get_property(&mut heap, arr, number::tag(3))), 4);
            assert!(value::is_nil(get_property(&mut heap, arr, number::tag(1))));
        }
    }

    #[test]
    fn binop_unboxed_add_overflow_boxes() {
        let mut heap = heap_with_root();
        unsafe {
            let big = number::new(&mut heap, Tenure::New, 9.0e18);
            let r = binop(&mut heap, BinOpCode::Add, big, big);
            assert!(value::is_heap_object(HeapTag::Number, r));
            assert_eq!(number::double_value(r), 1.8e19);
        }
    }

    #[test]
    fn binop_string_concatenation() {
        let mut heap = heap_with_root();
        unsafe {
            let l = str_key(&mut heap, "foo");
            let r = str_key(&mut heap, "bar");
            let joined = binop(&mut heap, BinOpCode::Add, l, r);
            assert_eq!(string::to_vec(joined), b"foobar");

            // Long enough concatenations become cons strings.
            let l = str_key(&mut heap, "aaaaaaaaaaaaaaa");
            let r = str_key(&mut heap, "bbbbbbbbbbbbbbb");
            let cons = binop(&mut heap, BinOpCode::Add, l, r);
            assert_eq!(value::representation(cons), string::CONS);
            assert_eq!(string::length(cons), 30);
        }
    }

    #[test]
    fn binop_comparison_yields_canonical_booleans() {
        let mut heap = heap_with_root();
        unsafe {
            let t = binop(&mut heap, BinOpCode::Lt, number::tag(1), number::tag(2));
            assert_eq!(t, root_slot_value(&heap, heap::root::TRUE_INDEX));
            let f = binop(&mut heap, BinOpCode::Gt, number::tag(1), number::tag(2));
            assert_eq!(f, root_slot_value(&heap, heap::root::FALSE_INDEX));
        }
    }

    #[test]
    fn binop_logic_selects_operand() {
        let mut heap = heap_with_root();
        unsafe {
            let obj = object::new_empty(&mut heap, Tenure::New);
            assert_eq!(binop(&mut heap, BinOpCode::LOr, number::tag(0), obj), obj);
            assert_eq!(binop(&mut heap, BinOpCode::LAnd, number::tag(0), obj), number::tag(0));
        }
    }

    #[test]
    fn typeof_uses_root_type_strings() {
        let mut heap = heap_with_root();
        unsafe {
            let t = candor_runtime_typeof(&mut *heap, number::tag(1));
            assert_eq!(string::to_vec(t), b"number");
            let t = candor_runtime_typeof(&mut *heap, value::nil_value());
            assert_eq!(string::to_vec(t), b"nil");
            let obj = object::new_empty(&mut heap, Tenure::New);
            let t = candor_runtime_typeof(&mut *heap, obj);
            assert_eq!(string::to_vec(t), b"object");
        }
    }

    #[test]
    fn clone_preserves_keys_and_identity_of_values() {
        let mut heap = heap_with_root();
        unsafe {
            let obj = object::new_empty(&mut heap, Tenure::New);
            let key_a = str_key(&mut heap, "a");
            let key_b = str_key(&mut heap, "b");
            set_property(&mut heap, obj, key_a, number::tag(1));
            set_property(&mut heap, obj, key_b, number::tag(2));

            let copy = candor_runtime_clone(&mut *heap, obj);
            assert_ne!(copy, obj);
            let key_a = str_key(&mut heap, "a");
            assert_eq!(number::untag(get_property(&mut heap, copy, key_a)), 1);

            // Writes to the clone don't leak back.
            let key_b2 = str_key(&mut heap, "b");
            set_property(&mut heap, copy, key_b2, number::tag(7));
            let key_b3 = str_key(&mut heap, "b");
            assert_eq!(number::untag(get_property(&mut heap, obj, key_b3)), 2);
        }
    }

    #[test]
    fn delete_property_empties_slot() {
        let mut heap = heap_with_root();
        unsafe {
            let obj = object::new_empty(&mut heap, Tenure::New);
            let key = str_key(&mut heap, "b");
            set_property(&mut heap, obj, key, number::tag(1));
            let key = str_key(&mut heap, "b");
            candor_runtime_delete_property(&mut *heap, obj, key);
            let key = str_key(&mut heap, "b");
            assert!(value::is_nil(get_property(&mut heap, obj, key)));
        }
    }

    #[test]
    fn keysof_object_lists_keys() {
        let mut heap = heap_with_root();
        unsafe {
            let obj = object::new_empty(&mut heap, Tenure::New);
            let key_x = str_key(&mut heap, "x");
            set_property(&mut heap, obj, key_x, number::tag(1));
            let keys = candor_runtime_keysof(&mut *heap, obj);
            assert!(value::is_heap_object(HeapTag::Array, keys));
            assert_eq!(array::length(keys), 1);
            let first = get_property(&mut heap, keys, number::tag(0));
            assert_eq!(string::to_vec(first), b"x");
        }
    }

    #[test]
    fn stack_trace_decodes_through_the_source_map() {
        let mut heap = heap_with_root();

        // A fake code region with two mapped offsets.
        let code = vec![0u8; 128];
        let base = code.as_ptr() as usize;
        heap.register_code_range(base, 128);
        heap.set_source_lines("a = 1\nb = 2\nreturn a + b");
        heap.source_map_mut().push(0, 0);
        heap.source_map_mut().push(40, 6);

        // One enter frame holding a return address into the region.
        let mut stack: Vec<usize> = vec![0; 6];
        stack[0] = base + 48; // return address
        stack[1] = ENTER_FRAME_TAG;
        stack[2] = 0;

        unsafe {
            let trace = candor_runtime_stack_trace(
                &mut *heap,
                stack.as_mut_ptr() as *mut u8,
                (base + 4) as *mut u8,
            );
            assert!(value::is_heap_object(HeapTag::Array, trace));
            assert_eq!(array::length(trace), 2);

            // Top entry is the trace site itself (line 1), the next
            // one the frame's return address (line 2).
            let first = get_property(&mut heap, trace, number::tag(0));
            let line_key = string::new(&mut heap, Tenure::New, b"line");
            assert_eq!(number::untag(get_property(&mut heap, first, line_key)), 1);

            let second = get_property(&mut heap, trace, number::tag(1));
            let line_key = string::new(&mut heap, Tenure::New, b"line");
            assert_eq!(number::untag(get_property(&mut heap, second, line_key)), 2);
        }
    }

    #[test]
    fn sizeof_array_and_string() {
        let mut heap = heap_with_root();
        unsafe {
            let arr = array::new_empty(&mut heap, Tenure::New);
            set_property(&mut heap, arr, number::tag(1), number::tag(9));
            assert_eq!(number::untag(candor_runtime_sizeof(&mut *heap, arr)), 2);
            let s = str_key(&mut heap, "four");
            assert_eq!(number::untag(candor_runtime_sizeof(&mut *heap, s)), 4);
        }
    }
}
