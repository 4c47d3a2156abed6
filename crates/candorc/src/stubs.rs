//! Runtime stubs: once-compiled trampolines invoked from generated
//! code.
//!
//! Every stub begins with the standard prologue (`push fp; mov fp,
//! sp`) and ends with `mov sp, fp; pop fp; ret n*W`. Stub call sites
//! in generated code are followed by a `CheckGC` macro — together
//! with function return these are the only cooperative safe points.
//!
//! Register conventions (abstract file, mapped by the platform
//! assembler): `r0` carries the primary value and the result, `r1`
//! and `r2` the secondary operands, `scratch` is never live across a
//! stub call.

use candor_ast::BinOp;
use candor_runtime::value::{array, context, function, map, object, string};
use candor_runtime::{heap::root, HeapTag, POINTER_SIZE};

use crate::masm::{
    Assembler, CallTarget, Condition, Masm, Operand, Register, RuntimeFn, StubKind, WORD,
};

const R0: Register = Register::R(0);
const R1: Register = Register::R(1);
const R2: Register = Register::R(2);
const R3: Register = Register::R(3);
const SCRATCH: Register = Register::Scratch;

fn reg(r: Register) -> Operand {
    Operand::Reg(r)
}

fn imm(v: isize) -> Operand {
    Operand::Imm(v)
}

/// Generate one stub into the macro assembler.
pub fn generate_stub<A: Assembler>(masm: &mut Masm<A>, kind: StubKind) {
    match kind {
        StubKind::Entry => entry_stub(masm),
        StubKind::Allocate => allocate_stub(masm),
        StubKind::AllocateFunction => allocate_function_stub(masm),
        StubKind::AllocateObject => allocate_object_stub(masm),
        StubKind::CallBinding => call_binding_stub(masm),
        StubKind::CollectGarbage => collect_garbage_stub(masm),
        StubKind::CoerceToBoolean => coerce_to_boolean_stub(masm),
        StubKind::Typeof => typeof_stub(masm),
        StubKind::Sizeof => runtime_wrapper_stub(masm, RuntimeFn::Sizeof),
        StubKind::Keysof => runtime_wrapper_stub(masm, RuntimeFn::Keysof),
        StubKind::CloneObject => runtime_wrapper_stub(masm, RuntimeFn::Clone),
        StubKind::DeleteProperty => delete_property_stub(masm),
        StubKind::HashValue => hash_value_stub(masm),
        StubKind::StackTrace => stack_trace_stub(masm),
        StubKind::LookupProperty => lookup_property_stub(masm),
        StubKind::Binary(op) => binop_stub(masm, op),
    }
}

/// Host-to-candor entry: saves callee state, plants the frame
/// sentinel, lays out arguments in reverse order with two-word
/// alignment, and jumps through the function's code pointer.
///
/// Stack arguments: `[fp+2W]` function, `[fp+3W]` tagged argc,
/// `[fp+4W]` argv.
fn entry_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let fn_op = Operand::Mem(Register::Fp, 2 * WORD);
    let argc_op = Operand::Mem(Register::Fp, 3 * WORD);
    let argv_op = Operand::Mem(Register::Fp, 4 * WORD);

    // Preserve callee-saved state of the host.
    masm.push_w(reg(Register::Context));
    masm.push_w(reg(Register::Root));

    masm.asm().mov(reg(R3), fn_op);

    // The compiled function addresses its literals through the root
    // context and captured variables through the parent context.
    masm.asm().mov(
        reg(Register::Root),
        Operand::Mem(R3, function::ROOT_OFFSET as i32),
    );
    masm.asm().mov(
        reg(Register::Context),
        Operand::Mem(R3, function::PARENT_OFFSET as i32),
    );

    masm.enter_frame_prologue();

    // r0 <- untagged argc, r1 <- argv cursor past the last argument
    masm.asm().mov(reg(R0), argc_op);
    masm.untag(R0);

    // Pad to a two-word boundary when argc is odd.
    let even = masm.label();
    masm.asm().test(reg(R0), imm(1));
    masm.asm().jcc(Condition::Eq, even);
    masm.asm().push(imm(HeapTag::Nil as isize));
    masm.bind(even);

    masm.asm().mov(reg(R1), reg(R0));
    masm.asm().sal(reg(R1), imm(WORD.trailing_zeros() as isize));
    masm.asm().add(reg(R1), argv_op);

    // Push arguments right to left.
    let args = masm.label();
    let args_loop = masm.label();
    masm.asm().jmp(args_loop);
    masm.bind(args);
    masm.asm().sub(reg(R1), imm(WORD as isize));
    masm.asm().mov(reg(R2), Operand::Mem(R1, 0));
    masm.asm().push(reg(R2));
    masm.bind(args_loop);
    masm.asm().cmp(reg(R1), argv_op);
    masm.asm().jcc(Condition::Ne, args);

    // argc rides in the return register at call time.
    masm.asm().mov(reg(R0), argc_op);

    // Nullify the rest so the stack walk sees no stale pointers.
    masm.asm().xor(reg(R1), reg(R1));
    masm.asm().xor(reg(R2), reg(R2));

    masm.asm().mov(reg(SCRATCH), reg(R3));
    masm.asm().xor(reg(R3), reg(R3));
    masm.call_function(SCRATCH);

    // Unwind arguments, padding included.
    masm.asm().mov(reg(SCRATCH), argc_op);
    masm.untag(SCRATCH);
    let unwind_even = masm.label();
    masm.asm().test(reg(SCRATCH), imm(1));
    masm.asm().jcc(Condition::Eq, unwind_even);
    masm.asm().add(reg(SCRATCH), imm(1));
    masm.bind(unwind_even);
    masm.asm()
        .sal(reg(SCRATCH), imm(WORD.trailing_zeros() as isize));
    masm.asm().add(reg(Register::Sp), reg(SCRATCH));

    masm.enter_frame_epilogue();

    masm.pop_w(reg(Register::Root));
    masm.pop_w(reg(Register::Context));

    masm.epilogue(0);
}

/// Bump-allocation fast path with runtime fallback.
///
/// Stack arguments: `[fp+2W]` tagged tag, `[fp+3W]` tagged size.
/// Result pointer in `r0`.
fn allocate_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let tag_op = Operand::Mem(Register::Fp, 2 * WORD);
    let size_op = Operand::Mem(Register::Fp, 3 * WORD);

    let runtime_allocate = masm.label();
    let done = masm.label();

    let top = masm.heap.new_space_top;
    let limit = masm.heap.new_space_limit;
    let heapref = masm.heap.heap;

    // new_space top is a pointer to the page's top pointer, hence the
    // double dereference.
    masm.asm().mov(reg(SCRATCH), imm(top as isize));
    masm.asm().mov(reg(SCRATCH), Operand::Mem(SCRATCH, 0));
    masm.asm().mov(reg(R0), Operand::Mem(SCRATCH, 0));
    masm.asm().mov(reg(R1), size_op);
    masm.untag(R1);

    // Add object size to the top
    masm.asm().add(reg(R1), reg(R0));
    masm.asm().jcc(Condition::Carry, runtime_allocate);

    // Check if we exhausted the page
    masm.asm().mov(reg(SCRATCH), imm(limit as isize));
    masm.asm().mov(reg(SCRATCH), Operand::Mem(SCRATCH, 0));
    masm.asm().cmp(reg(R1), Operand::Mem(SCRATCH, 0));
    masm.asm().jcc(Condition::Gt, runtime_allocate);

    // Keep the new top odd so the tag bit survives.
    masm.asm().or(reg(R1), imm(1));

    masm.asm().mov(reg(SCRATCH), imm(top as isize));
    masm.asm().mov(reg(SCRATCH), Operand::Mem(SCRATCH, 0));
    masm.asm().mov(Operand::Mem(SCRATCH, 0), reg(R1));

    masm.asm().jmp(done);

    // Slow path: candor_runtime_allocate(heap, size)
    masm.bind(runtime_allocate);
    masm.asm().xor(reg(R0), reg(R0));
    masm.asm().xor(reg(R1), reg(R1));
    masm.push_w(size_op);
    masm.push_w(imm(heapref as isize));
    masm.asm().call(CallTarget::Runtime(RuntimeFn::Allocate));
    masm.asm().add(reg(Register::Sp), imm(2 * WORD as isize));
    masm.change_align(-2);

    masm.bind(done);

    // Stamp the tag byte.
    masm.asm().mov(reg(SCRATCH), tag_op);
    masm.untag(SCRATCH);
    masm.asm().movb(
        Operand::Mem(R0, candor_runtime::value::TAG_OFFSET as i32),
        reg(SCRATCH),
    );

    masm.epilogue(2);
}

/// Allocates a function object and wires in the current context, the
/// root context, the code pointer and the expected argc.
///
/// Stack arguments: `[fp+2W]` code address, `[fp+3W]` tagged argc.
fn allocate_function_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let addr_op = Operand::Mem(Register::Fp, 2 * WORD);
    let argc_op = Operand::Mem(Register::Fp, 3 * WORD);

    masm.allocate(HeapTag::Function, (5 * POINTER_SIZE) as u32, R0);

    masm.asm().mov(
        Operand::Mem(R0, function::PARENT_OFFSET as i32),
        reg(Register::Context),
    );
    masm.asm().mov(
        Operand::Mem(R0, function::ROOT_OFFSET as i32),
        reg(Register::Root),
    );
    masm.asm().mov(reg(SCRATCH), addr_op);
    masm.asm()
        .mov(Operand::Mem(R0, function::CODE_OFFSET as i32), reg(SCRATCH));
    masm.asm().mov(reg(SCRATCH), argc_op);
    masm.untag(SCRATCH);
    masm.asm()
        .mov(Operand::Mem(R0, function::ARGC_OFFSET as i32), reg(SCRATCH));

    masm.check_gc();
    masm.epilogue(2);
}

/// Allocates an empty Object or Array with a fresh map. The `16`
/// pushed by the lowering is the map slot count of new objects.
///
/// Stack arguments: `[fp+2W]` tagged heap tag, `[fp+3W]` tagged map
/// size (a power of two).
fn allocate_object_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let tag_op = Operand::Mem(Register::Fp, 2 * WORD);
    let size_op = Operand::Mem(Register::Fp, 3 * WORD);

    // Object header: 3 words, plus the length word for arrays.
    let is_array = masm.label();
    let header_done = masm.label();
    masm.asm().mov(reg(R2), tag_op);
    masm.untag(R2);
    masm.asm().cmp(reg(R2), imm(HeapTag::Array as isize));
    masm.asm().jcc(Condition::Eq, is_array);

    masm.allocate(HeapTag::Object, (3 * POINTER_SIZE) as u32, R2);
    masm.asm().jmp(header_done);

    masm.bind(is_array);
    masm.allocate(HeapTag::Array, (4 * POINTER_SIZE) as u32, R2);
    masm.asm()
        .mov(Operand::Mem(R2, array::LENGTH_OFFSET as i32), imm(0));

    masm.bind(header_done);

    // Map: 2 + 2*size words.
    masm.asm().mov(reg(R1), size_op);
    masm.untag(R1);
    masm.asm().mov(reg(R3), reg(R1));
    masm.asm().sal(reg(R3), imm(1));
    masm.asm().add(reg(R3), imm(2));
    masm.asm().sal(reg(R3), imm(WORD.trailing_zeros() as isize));

    // The allocate stub wants tagged operands.
    masm.push_w(reg(R2));
    masm.asm().sal(reg(R3), imm(1));
    masm.push_w(reg(R3));
    masm.push_w(imm((HeapTag::Map as isize) << 1));
    // Reuse the generic allocation path; result lands in r0.
    masm.asm().call(CallTarget::Stub(StubKind::Allocate));
    masm.change_align(-2);
    masm.pop_w(reg(R2));

    masm.asm().mov(reg(R1), size_op);
    masm.untag(R1);
    masm.asm()
        .mov(Operand::Mem(R0, map::SIZE_OFFSET as i32), reg(R1));

    // mask = (size - 1) * W, stored on the object for inline probes.
    masm.asm().mov(reg(R3), reg(R1));
    masm.asm().sub(reg(R3), imm(1));
    masm.asm().sal(reg(R3), imm(WORD.trailing_zeros() as isize));
    masm.asm()
        .mov(Operand::Mem(R2, object::MASK_OFFSET as i32), reg(R3));
    masm.asm()
        .mov(Operand::Mem(R2, object::MAP_OFFSET as i32), reg(R0));

    // Fill both key and value regions with nil.
    masm.asm().mov(reg(R3), reg(R1));
    masm.asm().sal(reg(R3), imm(1));
    masm.asm().mov(reg(SCRATCH), reg(R0));
    masm.asm().add(reg(SCRATCH), imm(map::SPACE_OFFSET));
    let fill = masm.label();
    let fill_done = masm.label();
    masm.bind(fill);
    masm.asm().cmp(reg(R3), imm(0));
    masm.asm().jcc(Condition::Eq, fill_done);
    masm.asm()
        .mov(Operand::Mem(SCRATCH, 0), imm(HeapTag::Nil as isize));
    masm.asm().add(reg(SCRATCH), imm(WORD as isize));
    masm.asm().sub(reg(R3), imm(1));
    masm.asm().jmp(fill);
    masm.bind(fill_done);

    masm.asm().mov(reg(R0), reg(R2));
    masm.check_gc();
    masm.epilogue(2);
}

/// Invokes a host binding: computes argv from the caller's frame,
/// swaps in the host frame bookkeeping and calls the wrapped
/// callback.
///
/// Stack arguments: `[fp+2W]` function, `[fp+3W]` tagged argc.
fn call_binding_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let fn_op = Operand::Mem(Register::Fp, 2 * WORD);
    let argc_op = Operand::Mem(Register::Fp, 3 * WORD);

    // binding(argc, argv): argv points past the last pushed argument
    // of the caller's frame.
    masm.asm().mov(reg(R1), argc_op);
    masm.untag(R1);
    masm.asm().mov(reg(R2), reg(Register::Fp));
    masm.asm().add(reg(R2), imm(4 * WORD as isize));

    // Exit frame: publish the stack top so a re-entering callback
    // can resume the sentinel chain.
    let last_stack = masm.heap.last_stack;
    masm.asm().mov(reg(SCRATCH), imm(last_stack as isize));
    masm.push_w(Operand::Mem(SCRATCH, 0));
    masm.asm().mov(
        Operand::Mem(SCRATCH, 0),
        reg(Register::Sp),
    );

    masm.push_w(reg(R2));
    masm.push_w(reg(R1));

    masm.asm().mov(reg(SCRATCH), fn_op);
    masm.asm()
        .call(CallTarget::Mem(SCRATCH, function::CODE_OFFSET as i32));
    masm.asm().add(reg(Register::Sp), imm(2 * WORD as isize));
    masm.change_align(-2);

    // Restore the previous exit frame.
    masm.asm().mov(reg(SCRATCH), imm(last_stack as isize));
    masm.pop_w(Operand::Mem(SCRATCH, 0));

    masm.check_gc();
    masm.epilogue(2);
}

/// Saves every allocatable register and runs a collection with the
/// current stack pointer as the scan top.
fn collect_garbage_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    for i in 0..crate::lir::LIR_REGISTER_COUNT {
        masm.push_w(reg(Register::R(i as u8)));
    }

    // candor_runtime_collect_garbage(heap, stack_top)
    masm.push_w(reg(Register::Sp));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm()
        .call(CallTarget::Runtime(RuntimeFn::CollectGarbage));
    masm.asm().add(reg(Register::Sp), imm(2 * WORD as isize));
    masm.change_align(-2);

    for i in (0..crate::lir::LIR_REGISTER_COUNT).rev() {
        masm.pop_w(reg(Register::R(i as u8)));
    }

    masm.epilogue(0);
}

/// Canonical True/False for any value; fast paths for unboxed
/// integers, nil and booleans, runtime for the rest.
fn coerce_to_boolean_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let unboxed = masm.label();
    let not_bool = masm.label();
    let truel = masm.label();
    let coerced = masm.label();

    masm.is_unboxed(R0, Some(unboxed), None);
    masm.is_nil(R0, Some(not_bool), None);
    masm.is_heap_object(HeapTag::Boolean, R0, Some(not_bool), None);
    masm.asm().jmp(coerced);

    masm.bind(unboxed);
    let truev = Operand::Mem(Register::Root, context::index_disp(root::TRUE_INDEX) as i32);
    let falsev = Operand::Mem(Register::Root, context::index_disp(root::FALSE_INDEX) as i32);
    masm.asm().cmp(reg(R0), imm(0));
    masm.asm().jcc(Condition::Ne, truel);
    masm.asm().mov(reg(R0), falsev);
    masm.asm().jmp(coerced);
    masm.bind(truel);
    masm.asm().mov(reg(R0), truev);
    masm.asm().jmp(coerced);

    masm.bind(not_bool);
    masm.push_w(reg(R0));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm().call(CallTarget::Runtime(RuntimeFn::ToBoolean));
    masm.asm().add(reg(Register::Sp), imm(2 * WORD as isize));
    masm.change_align(-2);

    masm.bind(coerced);
    masm.check_gc();
    masm.epilogue(0);
}

/// Type string via the root context: unboxed values are numbers, nil
/// has its own entry, everything else maps its tag byte onto the
/// type-string slots.
fn typeof_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let not_unboxed = masm.label();
    let not_nil = masm.label();
    let done = masm.label();

    masm.is_unboxed(R0, None, Some(not_unboxed));
    masm.asm().mov(
        reg(R0),
        imm(context::index_disp(root::NUMBER_TYPE_INDEX)),
    );
    masm.asm().jmp(done);

    masm.bind(not_unboxed);
    masm.is_nil(R0, None, Some(not_nil));
    masm.asm()
        .mov(reg(R0), imm(context::index_disp(root::NIL_TYPE_INDEX)));
    masm.asm().jmp(done);

    masm.bind(not_nil);
    // slot = (tag - Boolean) scaled, relative to the boolean entry
    masm.asm().xor(reg(SCRATCH), reg(SCRATCH));
    masm.asm().movb(
        reg(SCRATCH),
        Operand::Mem(R0, candor_runtime::value::TAG_OFFSET as i32),
    );
    masm.asm()
        .sub(reg(SCRATCH), imm(HeapTag::Boolean as isize));
    masm.asm()
        .sal(reg(SCRATCH), imm(WORD.trailing_zeros() as isize));
    masm.asm().mov(
        reg(R0),
        imm(context::index_disp(root::BOOLEAN_TYPE_INDEX)),
    );
    masm.asm().add(reg(R0), reg(SCRATCH));

    masm.bind(done);
    // r0 holds an offset into the root context.
    masm.asm().add(reg(R0), reg(Register::Root));
    masm.asm().mov(reg(R0), Operand::Mem(R0, 0));

    masm.epilogue(0);
}

/// Thin wrapper calling a matching runtime function with
/// `(heap, r0)`.
fn runtime_wrapper_stub<A: Assembler>(masm: &mut Masm<A>, f: RuntimeFn) {
    masm.prologue();

    masm.push_w(reg(R0));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm().call(CallTarget::Runtime(f));
    masm.asm().add(reg(Register::Sp), imm(2 * WORD as isize));
    masm.change_align(-2);

    masm.check_gc();
    masm.epilogue(0);
}

/// `delete obj[key]`: always runtime, always nil.
fn delete_property_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    // r0 <- receiver, r1 <- property
    masm.push_w(reg(R1));
    masm.push_w(reg(R0));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm()
        .call(CallTarget::Runtime(RuntimeFn::DeleteProperty));
    masm.asm().add(reg(Register::Sp), imm(3 * WORD as isize));
    masm.change_align(-3);

    masm.asm().mov(reg(R0), imm(HeapTag::Nil as isize));
    masm.epilogue(0);
}

/// Cached string hash with a runtime fallback: reads the hash field
/// of the string in `r1` into `r0`.
fn hash_value_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();

    let have_hash = masm.label();
    masm.asm()
        .mov(reg(R0), Operand::Mem(R1, string::HASH_OFFSET as i32));
    masm.asm().cmp(reg(R0), imm(0));
    masm.asm().jcc(Condition::Ne, have_hash);

    masm.push_w(reg(R1));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm().call(CallTarget::Runtime(RuntimeFn::GetHash));
    masm.asm().add(reg(Register::Sp), imm(2 * WORD as isize));
    masm.change_align(-2);

    masm.bind(have_hash);
    masm.epilogue(0);
}

/// Builds the stack-trace array: `r0` carries the ip of the trace
/// site, the frame pointer names the newest frame.
fn stack_trace_stub<A: Assembler>(masm: &mut Masm<A>) {
    // Grab the caller's frame pointer before the prologue clobbers
    // it.
    masm.asm().mov(reg(R1), reg(Register::Fp));

    masm.prologue();

    // candor_runtime_stack_trace(heap, frame, ip)
    masm.push_w(reg(R0));
    masm.push_w(reg(R1));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm().call(CallTarget::Runtime(RuntimeFn::StackTrace));
    masm.asm().add(reg(Register::Sp), imm(3 * WORD as isize));
    masm.change_align(-3);

    masm.check_gc();
    masm.epilogue(0);
}

/// Three-way property lookup dispatching on the receiver tag.
///
/// `r0` <- object, `r1` <- property, `r2` <- change flag. Returns in
/// `r0` the interior offset of the value slot relative to the map
/// (or nil); the caller adds the map pointer.
fn lookup_property_stub<A: Assembler>(masm: &mut Masm<A>) {
    masm.prologue();
    masm.allocate_spills(3);

    let is_object = masm.label();
    let is_array = masm.label();
    let slow_case = masm.label();
    let non_object = masm.label();
    let done = masm.label();

    let object_s = masm.spill_slot(0);
    let key_s = masm.spill_slot(1);
    let change_s = masm.spill_slot(2);
    masm.asm().mov(object_s, reg(R0));
    masm.asm().mov(key_s, reg(R1));
    masm.asm().mov(change_s, reg(R2));

    // Property access on a non-object yields nil.
    masm.is_unboxed(R0, Some(non_object), None);
    masm.is_nil(R0, Some(non_object), None);
    masm.is_heap_object(HeapTag::Object, R0, None, Some(is_object));
    masm.is_heap_object(HeapTag::Array, R0, Some(non_object), Some(is_array));

    // Fast case: object with a string key.
    masm.bind(is_object);
    masm.is_unboxed(R1, Some(slow_case), None);
    masm.is_nil(R1, Some(slow_case), None);
    masm.is_heap_object(HeapTag::String, R1, Some(slow_case), None);

    // r3 <- hash (cached or computed by the hash stub)
    masm.asm().call(CallTarget::Stub(StubKind::HashValue));
    masm.asm().mov(reg(R3), reg(R0));

    // offset = (hash & mask) + kSpaceOffset
    masm.asm().mov(reg(R0), object_s);
    masm.asm()
        .mov(reg(SCRATCH), Operand::Mem(R0, object::MASK_OFFSET as i32));
    masm.asm().and(reg(R3), reg(SCRATCH));
    masm.asm().add(reg(R3), imm(map::SPACE_OFFSET));

    // scratch <- address of the probed key slot
    masm.asm()
        .mov(reg(SCRATCH), Operand::Mem(R0, object::MAP_OFFSET as i32));
    masm.asm().add(reg(SCRATCH), reg(R3));
    masm.asm().mov(reg(SCRATCH), Operand::Mem(SCRATCH, 0));

    // The slot matches when it holds the key or nil.
    let matched = masm.label();
    masm.asm().cmp(reg(SCRATCH), reg(R1));
    masm.asm().jcc(Condition::Eq, matched);
    masm.asm().cmp(reg(SCRATCH), imm(HeapTag::Nil as isize));
    masm.asm().jcc(Condition::Ne, slow_case);

    masm.bind(matched);

    // Insert the key when asked to.
    let no_insert = masm.label();
    masm.asm().mov(reg(R2), change_s);
    masm.asm().cmp(reg(R2), imm(0));
    masm.asm().jcc(Condition::Eq, no_insert);
    masm.asm()
        .mov(reg(SCRATCH), Operand::Mem(R0, object::MAP_OFFSET as i32));
    masm.asm().add(reg(SCRATCH), reg(R3));
    masm.asm().mov(Operand::Mem(SCRATCH, 0), reg(R1));
    masm.bind(no_insert);

    // value offset = key offset + mask + W
    masm.asm()
        .mov(reg(SCRATCH), Operand::Mem(R0, object::MASK_OFFSET as i32));
    masm.asm().mov(reg(R0), reg(R3));
    masm.asm().add(reg(R0), reg(SCRATCH));
    masm.asm().add(reg(R0), imm(WORD as isize));
    masm.asm().jmp(done);

    // Fast case: dense array with an unboxed non-negative key.
    masm.bind(is_array);
    masm.is_unboxed(R1, None, Some(slow_case));
    masm.asm().cmp(reg(R1), imm(0));
    masm.asm().jcc(Condition::Lt, slow_case);
    masm.asm().cmp(
        Operand::Mem(R0, array::LENGTH_OFFSET as i32),
        imm(array::DENSE_LENGTH_MAX as isize),
    );
    masm.asm().jcc(Condition::Gt, slow_case);

    // Index must be under the mask; note the key is tagged, so one
    // scale step is already applied.
    masm.asm()
        .mov(reg(SCRATCH), Operand::Mem(R0, object::MASK_OFFSET as i32));
    masm.asm().mov(reg(R3), reg(R1));
    masm.asm()
        .sal(reg(R3), imm(WORD.trailing_zeros() as isize - 1));
    masm.asm().cmp(reg(R3), reg(SCRATCH));
    masm.asm().jcc(Condition::Gt, slow_case);

    // Grow length when writing past the end.
    let length_set = masm.label();
    masm.asm().mov(reg(R2), change_s);
    masm.asm().cmp(reg(R2), imm(0));
    masm.asm().jcc(Condition::Eq, length_set);
    masm.asm().mov(reg(R2), reg(R1));
    masm.untag(R2);
    masm.asm().add(reg(R2), imm(1));
    masm.asm()
        .cmp(reg(R2), Operand::Mem(R0, array::LENGTH_OFFSET as i32));
    masm.asm().jcc(Condition::Le, length_set);
    masm.asm()
        .mov(Operand::Mem(R0, array::LENGTH_OFFSET as i32), reg(R2));
    masm.bind(length_set);

    masm.asm().mov(reg(R0), reg(R3));
    masm.asm().add(reg(R0), imm(map::SPACE_OFFSET));
    masm.asm().jmp(done);

    // Slow path: candor_runtime_lookup_property(heap, obj, key,
    // change)
    masm.bind(slow_case);
    masm.asm().mov(reg(R0), object_s);
    masm.asm().mov(reg(R1), key_s);
    masm.asm().mov(reg(R2), change_s);
    masm.push_w(reg(R2));
    masm.push_w(reg(R1));
    masm.push_w(reg(R0));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm()
        .call(CallTarget::Runtime(RuntimeFn::LookupProperty));
    masm.asm().add(reg(Register::Sp), imm(4 * WORD as isize));
    masm.change_align(-4);
    masm.asm().jmp(done);

    masm.bind(non_object);
    masm.asm().mov(reg(R0), imm(HeapTag::Nil as isize));

    masm.bind(done);
    masm.finalize_spills();
    masm.epilogue(0);
}

/// Per-operator binary stub: unboxed-integer fast path for
/// arithmetic, bitwise and comparison operators; everything boxed,
/// division, modulo and the short-circuit operators defer to the
/// runtime, which allocates Numbers for boxed operands.
///
/// `r0` <- lhs, `r1` <- rhs; result in `r0`.
fn binop_stub<A: Assembler>(masm: &mut Masm<A>, op: BinOp) {
    masm.prologue();
    masm.allocate_spills(2);

    let call_runtime = masm.label();
    let done = masm.label();

    let lhs_s = masm.spill_slot(0);
    let rhs_s = masm.spill_slot(1);

    // Unsigned shift right is sign-sensitive and goes to the runtime
    // together with division and modulo.
    if !op.is_bool_logic() && !matches!(op, BinOp::Div | BinOp::Mod | BinOp::UShr) {
        // Try working with unboxed numbers
        masm.is_unboxed(R0, None, Some(call_runtime));
        masm.is_unboxed(R1, None, Some(call_runtime));

        if op.is_math() {
            masm.asm().mov(lhs_s, reg(R0));
            masm.asm().mov(rhs_s, reg(R1));

            match op {
                BinOp::Add => masm.asm().add(reg(R0), reg(R1)),
                BinOp::Sub => masm.asm().sub(reg(R0), reg(R1)),
                BinOp::Mul => {
                    masm.untag(R1);
                    masm.asm().imul(reg(R0), reg(R1));
                }
                _ => unreachable!("division never takes the fast path"),
            }

            masm.asm().jcc(Condition::NoOverflow, done);

            // Overflow: restore operands and fall back.
            masm.asm().mov(reg(R0), lhs_s);
            masm.asm().mov(reg(R1), rhs_s);
            masm.asm().jmp(call_runtime);
        } else if op.is_binary() {
            match op {
                BinOp::BAnd => masm.asm().and(reg(R0), reg(R1)),
                BinOp::BOr => masm.asm().or(reg(R0), reg(R1)),
                BinOp::BXor => masm.asm().xor(reg(R0), reg(R1)),
                BinOp::Shl | BinOp::Shr => {
                    masm.untag(R1);
                    match op {
                        BinOp::Shl => masm.asm().sal(reg(R0), reg(R1)),
                        _ => masm.asm().sar(reg(R0), reg(R1)),
                    }
                    // Clear the tag bit the shift may have smeared.
                    masm.asm().sar(reg(R0), imm(1));
                    masm.asm().sal(reg(R0), imm(1));
                }
                _ => unreachable!("modulo and unsigned shifts never take the fast path"),
            }
            masm.asm().jmp(done);
        } else if op.is_logic() {
            // Compare tagged values directly; tagging preserves
            // order.
            let truel = masm.label();
            let cond_end = masm.label();
            masm.asm().cmp(reg(R0), reg(R1));
            masm.asm().jcc(condition_for(op), truel);
            masm.asm().mov(
                reg(R0),
                Operand::Mem(Register::Root, context::index_disp(root::FALSE_INDEX) as i32),
            );
            masm.asm().jmp(cond_end);
            masm.bind(truel);
            masm.asm().mov(
                reg(R0),
                Operand::Mem(Register::Root, context::index_disp(root::TRUE_INDEX) as i32),
            );
            masm.bind(cond_end);
            masm.asm().jmp(done);
        }
    }

    // Boxed operands, division, modulo and boolean logic:
    // candor_runtime_binop(heap, op, lhs, rhs)
    masm.bind(call_runtime);
    masm.push_w(reg(R1));
    masm.push_w(reg(R0));
    masm.push_w(imm(binop_code(op) as isize));
    masm.push_w(imm(masm.heap.heap as isize));
    masm.asm().call(CallTarget::Runtime(RuntimeFn::BinOp));
    masm.asm().add(reg(Register::Sp), imm(4 * WORD as isize));
    masm.change_align(-4);

    masm.bind(done);
    masm.asm().xor(reg(R1), reg(R1));
    masm.check_gc();
    masm.finalize_spills();
    masm.epilogue(0);
}

fn condition_for(op: BinOp) -> Condition {
    match op {
        BinOp::Eq | BinOp::StrictEq => Condition::Eq,
        BinOp::Ne | BinOp::StrictNe => Condition::Ne,
        BinOp::Lt => Condition::Lt,
        BinOp::Gt => Condition::Gt,
        BinOp::Le => Condition::Le,
        BinOp::Ge => Condition::Ge,
        _ => unreachable!("not a comparison operator"),
    }
}

/// Operator code shared with `candor_runtime::BinOpCode`.
pub fn binop_code(op: BinOp) -> u32 {
    use candor_runtime::BinOpCode as C;
    let code = match op {
        BinOp::Add => C::Add,
        BinOp::Sub => C::Sub,
        BinOp::Mul => C::Mul,
        BinOp::Div => C::Div,
        BinOp::Mod => C::Mod,
        BinOp::BAnd => C::BAnd,
        BinOp::BOr => C::BOr,
        BinOp::BXor => C::BXor,
        BinOp::Shl => C::Shl,
        BinOp::Shr => C::Shr,
        BinOp::UShr => C::UShr,
        BinOp::Eq => C::Eq,
        BinOp::StrictEq => C::StrictEq,
        BinOp::Ne => C::Ne,
        BinOp::StrictNe => C::StrictNe,
        BinOp::Lt => C::Lt,
        BinOp::Gt => C::Gt,
        BinOp::Le => C::Le,
        BinOp::Ge => C::Ge,
        BinOp::LAnd => C::LAnd,
        BinOp::LOr => C::LOr,
    };
    code as u32
}
