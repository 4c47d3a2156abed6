//! Candor embedding API.
//!
//! An [`Isolate`] owns one heap; values created through it are tagged
//! machine words that stay valid only while rooted. [`Handle`]
//! registers a persistent root that follows its referent across
//! collections; `unref` demotes it to a weak observer. [`CWrapper`]
//! exposes native Rust objects to Candor as CData with a destructor
//! driven by a weak callback.
//!
//! The compiler is reachable through [`Isolate::compile`]; executing
//! the produced code additionally needs a platform assembler and CPU
//! shim, which embedders supply through [`candorc::masm::Assembler`].

use std::cell::Cell;
use std::marker::PhantomData;

use anyhow::Result;

use candor_runtime::heap::{root, Heap, HeapTag, RefKind, Tenure};
use candor_runtime::value::{self, array, boolean, cdata, context, number, string};
use candor_runtime::{gc, WeakCallback, DEFAULT_PAGE_SIZE};

use candorc::hir::Literal;
use candorc::masm::{Assembler, HeapRefs};
use candorc::{CompileOptions, CompiledModule};

thread_local! {
    static CURRENT: Cell<*mut Heap> = const { Cell::new(std::ptr::null_mut()) };
}

/// An opaque Candor value: a tagged machine word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value(*mut u8);

impl Value {
    pub fn raw(self) -> *mut u8 {
        self.0
    }

    pub fn from_raw(raw: *mut u8) -> Value {
        Value(raw)
    }

    pub fn nil() -> Value {
        Value(value::nil_value())
    }

    pub fn is_nil(self) -> bool {
        value::is_nil(self.0)
    }

    pub fn is_number(self) -> bool {
        value::is_unboxed(self.0) || self.has_tag(HeapTag::Number)
    }

    pub fn is_string(self) -> bool {
        self.has_tag(HeapTag::String)
    }

    pub fn is_object(self) -> bool {
        self.has_tag(HeapTag::Object)
    }

    pub fn is_array(self) -> bool {
        self.has_tag(HeapTag::Array)
    }

    pub fn is_function(self) -> bool {
        self.has_tag(HeapTag::Function)
    }

    pub fn is_boolean(self) -> bool {
        self.has_tag(HeapTag::Boolean)
    }

    pub fn is_cdata(self) -> bool {
        self.has_tag(HeapTag::CData)
    }

    fn has_tag(self, tag: HeapTag) -> bool {
        unsafe { value::is_heap_object(tag, self.0) }
    }

    /// Integral value of a number; `None` for everything else.
    pub fn integral(self) -> Option<i64> {
        if value::is_unboxed(self.0) {
            return Some(number::untag(self.0));
        }
        if self.has_tag(HeapTag::Number) {
            let v = unsafe { number::double_value(self.0) };
            return Some(v as i64);
        }
        None
    }

    pub fn number_value(self) -> Option<f64> {
        if value::is_unboxed(self.0) {
            return Some(number::untag(self.0) as f64);
        }
        if self.has_tag(HeapTag::Number) {
            return Some(unsafe { number::double_value(self.0) });
        }
        None
    }

    pub fn boolean_value(self) -> Option<bool> {
        if self.has_tag(HeapTag::Boolean) {
            return Some(unsafe { boolean::value(self.0) });
        }
        None
    }

    pub fn string_value(self) -> Option<String> {
        if self.has_tag(HeapTag::String) {
            let bytes = unsafe { string::to_vec(self.0) };
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        None
    }
}

/// A scoped persistent root. While the handle lives, its referent
/// survives collection and the handle observes relocation.
#[derive(Debug)]
pub struct Handle<T = Value> {
    cell: Box<*mut u8>,
    heap: *mut Heap,
    weak: bool,
    _marker: PhantomData<T>,
}

impl Handle {
    pub fn value(&self) -> Value {
        Value(*self.cell)
    }

    /// Demote to a weak reference: the handle no longer roots its
    /// referent, and reads nil once the referent is collected.
    pub fn unref(&mut self) {
        if !self.weak {
            let slot = self.cell.as_mut() as *mut *mut u8;
            unsafe {
                (*self.heap).make_weak_ref(slot);
            }
            self.weak = true;
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        let slot = self.cell.as_mut() as *mut *mut u8;
        unsafe {
            (*self.heap).dereference(slot);
        }
    }
}

/// One heap plus the thread-local "current isolate" registration used
/// by runtime callbacks.
pub struct Isolate {
    heap: Box<Heap>,
}

impl Isolate {
    pub fn new() -> Isolate {
        Isolate::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: u32) -> Isolate {
        let mut heap = Heap::new(page_size);
        candor_runtime::create_root_context(&mut heap);
        let mut isolate = Isolate { heap };
        CURRENT.with(|c| c.set(isolate.heap.as_mut() as *mut Heap));
        isolate
    }

    pub fn current_heap() -> *mut Heap {
        CURRENT.with(|c| c.get())
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // --- Value constructors ---

    pub fn number(&mut self, v: f64) -> Value {
        Value(number::new(&mut self.heap, Tenure::New, v))
    }

    pub fn integral(&mut self, v: i64) -> Value {
        if number::fits_unboxed(v) {
            Value(number::tag(v))
        } else {
            Value(number::new(&mut self.heap, Tenure::New, v as f64))
        }
    }

    pub fn string(&mut self, s: &str) -> Value {
        Value(string::new(&mut self.heap, Tenure::New, s.as_bytes()))
    }

    pub fn boolean(&mut self, v: bool) -> Value {
        let index = if v { root::TRUE_INDEX } else { root::FALSE_INDEX };
        unsafe { Value(context::get_slot(self.heap.root_context(), index)) }
    }

    pub fn object(&mut self) -> Value {
        Value(value::object::new_empty(&mut self.heap, Tenure::New))
    }

    pub fn array(&mut self) -> Value {
        Value(array::new_empty(&mut self.heap, Tenure::New))
    }

    pub fn cdata(&mut self, size: usize) -> Value {
        Value(cdata::new(&mut self.heap, Tenure::New, size))
    }

    pub fn global(&mut self) -> Value {
        unsafe {
            Value(context::get_slot(
                self.heap.root_context(),
                root::GLOBAL_INDEX,
            ))
        }
    }

    // --- Properties ---

    pub fn get(&mut self, obj: Value, key: Value) -> Value {
        unsafe { Value(candor_runtime::get_property(&mut self.heap, obj.0, key.0)) }
    }

    pub fn set(&mut self, obj: Value, key: Value, val: Value) {
        unsafe { candor_runtime::set_property(&mut self.heap, obj.0, key.0, val.0) }
    }

    pub fn get_str(&mut self, obj: Value, key: &str) -> Value {
        let key = self.string(key);
        self.get(obj, key)
    }

    pub fn set_str(&mut self, obj: Value, key: &str, val: Value) {
        let key = self.string(key);
        self.set(obj, key, val)
    }

    pub fn array_length(&mut self, arr: Value) -> i64 {
        if arr.is_array() {
            unsafe { array::length(arr.0) }
        } else {
            0
        }
    }

    pub fn keys_of(&mut self, obj: Value) -> Value {
        unsafe { Value(candor_runtime::candor_runtime_keysof(&mut *self.heap, obj.0)) }
    }

    pub fn type_of(&mut self, v: Value) -> Value {
        unsafe { Value(candor_runtime::candor_runtime_typeof(&mut *self.heap, v.0)) }
    }

    pub fn clone_object(&mut self, v: Value) -> Value {
        unsafe { Value(candor_runtime::candor_runtime_clone(&mut *self.heap, v.0)) }
    }

    pub fn delete(&mut self, obj: Value, key: Value) {
        unsafe {
            candor_runtime::candor_runtime_delete_property(&mut *self.heap, obj.0, key.0);
        }
    }

    // --- Handles & GC ---

    /// Register a persistent handle keeping `value` alive.
    pub fn handle(&mut self, value: Value) -> Handle {
        let mut cell = Box::new(value.0);
        let slot = cell.as_mut() as *mut *mut u8;
        self.heap.reference(RefKind::Persistent, slot);
        Handle {
            cell,
            heap: self.heap.as_mut() as *mut Heap,
            weak: false,
            _marker: PhantomData,
        }
    }

    /// Register a weak callback fired exactly once when `value`
    /// becomes unreachable.
    pub fn set_weak_callback(&mut self, value: Value, callback: WeakCallback) {
        self.heap.add_weak(value.0, callback);
    }

    pub fn clear_weak_callback(&mut self, value: Value) {
        self.heap.remove_weak(value.0);
    }

    /// Run a collection with embedder-only roots.
    pub fn collect_garbage(&mut self) {
        unsafe { gc::collect_garbage(&mut self.heap, std::ptr::null_mut()) }
    }

    // --- Compilation ---

    /// Compile `source` through the supplied platform assembler. The
    /// returned module's literals are interned into a fresh root
    /// context for the script.
    pub fn compile<A: Assembler>(
        &mut self,
        source: &str,
        asm: &mut A,
        options: &CompileOptions,
    ) -> Result<Script> {
        let refs = HeapRefs::from_heap(&mut self.heap);
        let module = candorc::compile(source, asm, refs, options)?;
        self.heap.set_source_lines(source);

        // Fresh root context: the canonical slots shared with the
        // heap root, plus one slot per interned literal.
        let slots = root::SLOT_COUNT + module.literals.len();
        let script_root = context::new(&mut self.heap, Tenure::Old, slots);
        unsafe {
            for i in 0..root::SLOT_COUNT {
                let v = context::get_slot(self.heap.root_context(), i);
                context::set_slot(script_root, i, v);
            }
            for (_, slot, literal) in &module.literals {
                let v = match literal {
                    Literal::Str(s) => string::new(&mut self.heap, Tenure::Old, s.as_bytes()),
                    Literal::Double(d) => number::new(&mut self.heap, Tenure::Old, *d),
                    _ => unreachable!("only strings and doubles are interned"),
                };
                context::set_slot(script_root, *slot, v);
            }
        }

        let root_handle = self.handle(Value(script_root));

        // The script's source map feeds stack traces.
        let CompiledModule {
            hir,
            functions,
            literals,
            source_map,
            stubs,
        } = module;
        *self.heap.source_map_mut() = source_map;

        Ok(Script {
            module: CompiledModule {
                hir,
                functions,
                literals,
                source_map: candor_runtime::SourceMap::new(),
                stubs,
            },
            root: root_handle,
        })
    }
}

impl Default for Isolate {
    fn default() -> Isolate {
        Isolate::new()
    }
}

/// Executable code produced by a platform assembler: the CPU shim
/// that resolves labels to addresses and enters generated code
/// through the entry stub.
pub trait ExecutableCode {
    fn label_address(&self, label: candorc::masm::Label) -> *const u8;

    /// Invoke the entry stub for `function` with `argc` arguments at
    /// `argv`.
    ///
    /// # Safety
    /// The code must have been emitted for the current isolate's heap
    /// and the arguments must be valid tagged values.
    unsafe fn call_entry(&self, function: *mut u8, argc: u32, argv: *const *mut u8) -> *mut u8;
}

/// A compiled module plus the root context its code addresses.
#[derive(Debug)]
pub struct Script {
    pub module: CompiledModule,
    pub root: Handle,
}

impl Script {
    /// Entry label of the module body.
    pub fn entry_label(&self) -> candorc::masm::Label {
        self.module.functions[0].1
    }

    /// Materialize the module body as a callable Function value.
    pub fn function<E: ExecutableCode>(&self, isolate: &mut Isolate, exec: &E) -> Value {
        let code = exec.label_address(self.entry_label());
        let root = self.root.value().raw();
        Value(value::function::new(
            isolate.heap(),
            Tenure::New,
            std::ptr::null_mut(),
            code,
            root,
            0,
        ))
    }
}

impl Isolate {
    /// Wrap a host callback as a callable binding function.
    pub fn binding(&mut self, callback: candor_runtime::BindingCallback) -> Value {
        let root = self.heap.root_context();
        Value(value::function::new_binding(
            &mut self.heap,
            callback as *const u8,
            root,
        ))
    }

    /// Invoke a Function value through the entry stub. The pending
    /// exception is checked after the boundary crossing, as on every
    /// cross-boundary call.
    pub fn call<E: ExecutableCode>(
        &mut self,
        exec: &E,
        function: Value,
        args: &[Value],
    ) -> Result<Value> {
        if !function.is_function() {
            return Ok(Value::nil());
        }
        let argv: Vec<*mut u8> = args.iter().map(|v| v.0).collect();
        let result = unsafe {
            exec.call_entry(function.0, args.len() as u32, argv.as_ptr())
        };

        let pending = self.heap.pending_exception;
        if !pending.is_null() {
            self.heap.pending_exception = std::ptr::null_mut();
            let message = Value(pending)
                .string_value()
                .unwrap_or_else(|| "uncaught error".to_string());
            anyhow::bail!("{}", message);
        }
        Ok(Value(result))
    }

    /// Stack trace of the most recent Candor frames, decoded through
    /// the source map.
    pub fn stack_trace(&mut self) -> Value {
        let frame = self.heap.last_frame;
        unsafe {
            Value(candor_runtime::candor_runtime_stack_trace(
                &mut *self.heap,
                frame,
                std::ptr::null_mut(),
            ))
        }
    }
}

/// Native objects exposed to Candor as CData. The wrapper stores a
/// boxed pointer in the CData payload; the weak callback drops it
/// when the value becomes unreachable.
pub trait CWrapper: Sized + 'static {
    fn wrap(self, isolate: &mut Isolate) -> Value {
        let cd = isolate.cdata(std::mem::size_of::<*mut Self>());
        let boxed = Box::into_raw(Box::new(self));
        unsafe {
            let payload = cdata::data(cd.raw()) as *mut *mut Self;
            *payload = boxed;
        }
        isolate.set_weak_callback(cd, drop_wrapper::<Self>);
        cd
    }

    /// Borrow the wrapped native object back from a CData value.
    ///
    /// # Safety
    /// `value` must have been produced by `Self::wrap` and not yet
    /// collected.
    unsafe fn unwrap(value: Value) -> Option<&'static mut Self> {
        if !value.is_cdata() {
            return None;
        }
        let payload = cdata::data(value.raw()) as *mut *mut Self;
        (*payload).as_mut()
    }
}

fn drop_wrapper<T: CWrapper>(value: *mut u8) {
    unsafe {
        let payload = cdata::data(value) as *mut *mut T;
        if !(*payload).is_null() {
            drop(Box::from_raw(*payload));
            *payload = std::ptr::null_mut();
        }
    }
}
