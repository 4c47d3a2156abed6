//! Embedding API tests: values, handles, weak callbacks, GC
//! interaction and compilation.

use std::sync::atomic::{AtomicUsize, Ordering};

use candor::{CWrapper, Isolate, Value};
use candorc::masm::RecordingAssembler;
use candorc::CompileOptions;

#[test]
fn numbers_round_trip() {
    let mut isolate = Isolate::new();

    let small = isolate.integral(42);
    assert!(small.is_number());
    assert_eq!(small.integral(), Some(42));

    let negative = isolate.integral(-17);
    assert_eq!(negative.integral(), Some(-17));

    let double = isolate.number(1.5);
    assert!(double.is_number());
    assert_eq!(double.number_value(), Some(1.5));
}

#[test]
fn tagging_is_bit_exact() {
    let mut isolate = Isolate::new();
    let n = isolate.integral(3);
    // Unboxed: n << 1, low bit clear.
    assert_eq!(n.raw() as usize, 6);
    let s = isolate.string("boxed");
    assert_eq!(s.raw() as usize & 1, 1);
}

#[test]
fn strings_and_booleans() {
    let mut isolate = Isolate::new();
    let s = isolate.string("hello");
    assert_eq!(s.string_value().as_deref(), Some("hello"));

    let t = isolate.boolean(true);
    let f = isolate.boolean(false);
    assert_eq!(t.boolean_value(), Some(true));
    assert_eq!(f.boolean_value(), Some(false));
    // Canonical singletons come from the root context.
    assert_eq!(t, isolate.boolean(true));
}

#[test]
fn object_properties() {
    let mut isolate = Isolate::new();
    let obj = isolate.object();
    let one = isolate.integral(1);
    let two = isolate.integral(2);
    isolate.set_str(obj, "a", one);
    isolate.set_str(obj, "b", two);

    assert_eq!(isolate.get_str(obj, "a").integral(), Some(1));
    assert_eq!(isolate.get_str(obj, "b").integral(), Some(2));
    assert!(isolate.get_str(obj, "missing").is_nil());
}

#[test]
fn array_length_grows() {
    let mut isolate = Isolate::new();
    let arr = isolate.array();
    let key = isolate.integral(3);
    let val = isolate.integral(4);
    isolate.set(arr, key, val);
    assert_eq!(isolate.array_length(arr), 4);
    assert_eq!(isolate.get(arr, key).integral(), Some(4));
}

#[test]
fn handles_survive_collection() {
    let mut isolate = Isolate::new();
    let obj = isolate.object();
    let marker = isolate.integral(7);
    isolate.set_str(obj, "mark", marker);

    let handle = isolate.handle(obj);
    isolate.collect_garbage();
    isolate.collect_garbage();

    let moved = handle.value();
    assert!(moved.is_object());
    assert_eq!(isolate.get_str(moved, "mark").integral(), Some(7));
}

#[test]
fn unref_demotes_to_weak() {
    let mut isolate = Isolate::new();
    let obj = isolate.object();
    let mut handle = isolate.handle(obj);
    handle.unref();

    isolate.collect_garbage();
    assert!(handle.value().is_nil(), "weak handle observes collection");
}

#[test]
fn unrooted_allocations_are_reclaimed() {
    let mut isolate = Isolate::with_page_size(16 * 1024);
    let baseline = isolate.heap().new_space().size();

    for _ in 0..10_000 {
        isolate.object();
    }
    isolate.collect_garbage();

    let after = isolate.heap().new_space().size();
    let page = isolate.heap().new_space().page_size();
    assert!(
        after <= baseline + page,
        "new space should return to within one page: {} vs {}",
        after,
        baseline
    );
}

static WEAK_FIRED: AtomicUsize = AtomicUsize::new(0);

fn weak_callback(_value: *mut u8) {
    WEAK_FIRED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn weak_callback_fires_exactly_once() {
    let mut isolate = Isolate::new();
    let obj = isolate.object();
    isolate.set_weak_callback(obj, weak_callback);

    isolate.collect_garbage();
    isolate.collect_garbage();

    assert_eq!(WEAK_FIRED.load(Ordering::SeqCst), 1);
}

#[test]
fn clone_preserves_keys_and_primitive_identity() {
    let mut isolate = Isolate::new();
    let obj = isolate.object();
    let one = isolate.integral(1);
    let s = isolate.string("shared");
    isolate.set_str(obj, "a", one);
    isolate.set_str(obj, "s", s);

    let copy = isolate.clone_object(obj);
    assert!(copy.is_object());
    assert_ne!(copy, obj);

    // Keys() sets are equal.
    let keys_a = isolate.keys_of(obj);
    let keys_b = isolate.keys_of(copy);
    assert_eq!(isolate.array_length(keys_a), isolate.array_length(keys_b));

    // Values compare equal by primitive identity.
    assert_eq!(isolate.get_str(copy, "a"), one);
    assert_eq!(isolate.get_str(copy, "s"), s);

    // Clone of a non-object is nil.
    assert!(isolate.clone_object(one).is_nil());
}

#[test]
fn typeof_returns_type_strings() {
    let mut isolate = Isolate::new();
    let n = isolate.integral(1);
    let t = isolate.type_of(n);
    assert_eq!(t.string_value().as_deref(), Some("number"));

    let t = isolate.type_of(Value::nil());
    assert_eq!(t.string_value().as_deref(), Some("nil"));

    let obj = isolate.object();
    let t = isolate.type_of(obj);
    assert_eq!(t.string_value().as_deref(), Some("object"));
}

#[test]
fn delete_removes_property() {
    let mut isolate = Isolate::new();
    let obj = isolate.object();
    let v = isolate.integral(5);
    isolate.set_str(obj, "k", v);
    let key = isolate.string("k");
    isolate.delete(obj, key);
    assert!(isolate.get_str(obj, "k").is_nil());
}

// --- CWrapper ---

static WRAPPER_DROPPED: AtomicUsize = AtomicUsize::new(0);

struct NativeThing {
    x: i32,
}

impl Drop for NativeThing {
    fn drop(&mut self) {
        WRAPPER_DROPPED.fetch_add(1, Ordering::SeqCst);
    }
}

impl CWrapper for NativeThing {}

#[test]
fn cwrapper_round_trips_and_drops_on_collection() {
    let mut isolate = Isolate::new();
    let wrapped = NativeThing { x: 11 }.wrap(&mut isolate);
    assert!(wrapped.is_cdata());

    unsafe {
        let native = NativeThing::unwrap(wrapped).expect("unwrap while alive");
        assert_eq!(native.x, 11);
    }

    // Unrooted: two cycles later the destructor ran exactly once.
    isolate.collect_garbage();
    isolate.collect_garbage();
    assert_eq!(WRAPPER_DROPPED.load(Ordering::SeqCst), 1);
}

// --- Compilation ---

#[test]
fn compile_produces_functions_and_interned_literals() {
    let mut isolate = Isolate::new();
    let mut asm = RecordingAssembler::new();
    let script = isolate
        .compile(
            "a = 'interned'\nf() { return a }\nreturn f()",
            &mut asm,
            &CompileOptions::default(),
        )
        .expect("compiles");

    // Module body plus one nested function.
    assert_eq!(script.module.functions.len(), 2);
    assert_eq!(script.module.literals.len(), 1);

    // The interned literal is reachable from the script root.
    let root = script.root.value();
    let (_, slot, _) = script.module.literals[0];
    unsafe {
        let v = candor_runtime::value::context::get_slot(root.raw(), slot);
        let v = Value::from_raw(v);
        assert_eq!(v.string_value().as_deref(), Some("interned"));
    }
}

#[test]
fn compile_populates_the_source_map() {
    let mut isolate = Isolate::new();
    let mut asm = RecordingAssembler::new();
    isolate
        .compile("a = 1\nreturn a + 2", &mut asm, &CompileOptions::default())
        .expect("compiles");

    let map = isolate.heap().source_map();
    assert!(!map.is_empty());
    // Line table resolves offsets for stack traces.
    assert_eq!(isolate.heap().line_for_offset(0), 1);
    assert_eq!(isolate.heap().line_for_offset(6), 2);
}

#[test]
fn script_root_survives_collection() {
    let mut isolate = Isolate::new();
    let mut asm = RecordingAssembler::new();
    let script = isolate
        .compile("return 'rooted literal'", &mut asm, &CompileOptions::default())
        .expect("compiles");

    isolate.collect_garbage();

    let root = script.root.value();
    let (_, slot, _) = script.module.literals[0];
    unsafe {
        let v = Value::from_raw(candor_runtime::value::context::get_slot(root.raw(), slot));
        assert_eq!(v.string_value().as_deref(), Some("rooted literal"));
    }
}

#[test]
fn compile_errors_surface() {
    let _guard = candorc::diagnostics::suppress();
    let mut isolate = Isolate::new();
    let mut asm = RecordingAssembler::new();
    let err = isolate
        .compile("break", &mut asm, &CompileOptions::default())
        .unwrap_err();
    let err = err.downcast::<candorc::CompileError>().unwrap();
    assert!(matches!(err, candorc::CompileError::ExpectedLoop { .. }));
}
