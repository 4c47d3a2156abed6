//! LIR to machine code.
//!
//! Walks the allocated instruction stream of one function and emits
//! through the macro assembler. Every instruction that carries an AST
//! offset records a `(code_offset, ast_offset)` pair in the source
//! map before emission.
//!
//! Calling convention: arguments are pushed right to left with a Nil
//! pad when argc is odd; argc rides in `r0` at call time and is
//! spilled to `[fp - 2W]` in the prologue; the return value flows
//! back through `r0`; every prologue is `push fp; mov fp, sp`,
//! spill-slot allocation, argc save, optional context allocation.

use std::collections::HashMap;

use candor_runtime::value::{array, boolean, context, function, object};
use candor_runtime::{HeapTag, SourceMap, POINTER_SIZE};

use crate::hir::{BlockId, InstrId, Literal};
use crate::lir::gap::{resolve_parallel_moves, MoveLoc};
use crate::lir::{LGen, LInstrId, LKind, Location, UseId};
use crate::masm::{
    register_by_index, Assembler, CallTarget, Condition, Label, Masm, Operand, Register, StubKind,
    WORD,
};

const R0: Register = Register::R(0);
const R1: Register = Register::R(1);
const R2: Register = Register::R(2);
const SCRATCH: Register = Register::Scratch;

fn reg(r: Register) -> Operand {
    Operand::Reg(r)
}

fn imm(v: isize) -> Operand {
    Operand::Imm(v)
}

/// Cross-function context: function entry labels and root-context
/// slots for interned literals.
#[derive(Debug, Default)]
pub struct CodegenCtx {
    /// Function entry block -> label bound at its prologue.
    pub fn_labels: HashMap<BlockId, Label>,
    /// Interned string/double literal -> root context slot.
    pub literal_slots: HashMap<InstrId, usize>,
}

pub struct Codegen<'a, 'h, A: Assembler> {
    gen: &'a LGen<'h>,
    ctx: &'a CodegenCtx,
    block_labels: HashMap<BlockId, Label>,
    /// Frame slot holding the post-call stack pointer around calls.
    sp_save_slot: i32,
    /// Frame slot preserving the context register across calls.
    ctx_save_slot: i32,
    _assembler: std::marker::PhantomData<fn(A)>,
}

impl<'a, 'h, A: Assembler> Codegen<'a, 'h, A> {
    pub fn generate(
        gen: &'a LGen<'h>,
        ctx: &'a CodegenCtx,
        masm: &mut Masm<A>,
        map: &mut SourceMap,
    ) {
        let mut codegen = Codegen {
            gen,
            ctx,
            block_labels: HashMap::new(),
            sp_save_slot: gen.spill_index,
            ctx_save_slot: gen.spill_index + 1,
            _assembler: std::marker::PhantomData,
        };

        for &b in &gen.block_order {
            let label = masm.label();
            codegen.block_labels.insert(b, label);
        }

        for &i in &gen.stream {
            let instr = &gen.instrs[i];
            if let Some(hir) = instr.hir {
                if let Some(offset) = gen.hir.instrs[hir].ast_offset {
                    map.push(masm.offset(), offset);
                }
            }
            codegen.instruction(masm, i);
        }
    }

    fn target_label(&self, block: BlockId) -> Label {
        self.block_labels[&block]
    }

    fn use_operand(&self, masm: &Masm<A>, use_id: UseId) -> Operand {
        let interval = self.gen.uses[use_id].interval;
        match self.gen.intervals[interval].location {
            Location::Register(index) => Operand::Reg(register_by_index(index)),
            Location::Spill(Some(index)) => masm.spill_slot(index),
            other => unreachable!("unallocated interval {:?} at codegen", other),
        }
    }

    fn move_loc(&self, interval: usize) -> MoveLoc {
        match self.gen.intervals[interval].location {
            Location::Register(index) => MoveLoc::Register(index),
            Location::Spill(Some(index)) => MoveLoc::Spill(index),
            other => unreachable!("unallocated interval {:?} in gap", other),
        }
    }

    /// Register/memory-safe move; memory-to-memory goes through
    /// scratch.
    fn emit_move(&self, masm: &mut Masm<A>, dst: Operand, src: Operand) {
        if dst == src {
            return;
        }
        match (dst, src) {
            (Operand::Mem(..), Operand::Mem(..)) => {
                masm.asm().mov(reg(SCRATCH), src);
                masm.asm().mov(dst, reg(SCRATCH));
            }
            _ => masm.asm().mov(dst, src),
        }
    }

    fn loc_operand(&self, masm: &Masm<A>, loc: MoveLoc) -> Operand {
        match loc {
            MoveLoc::Register(index) => Operand::Reg(register_by_index(index)),
            MoveLoc::Spill(index) => masm.spill_slot(index),
        }
    }

    fn instruction(&mut self, masm: &mut Masm<A>, i: LInstrId) {
        let instr = &self.gen.instrs[i];

        match &instr.kind {
            LKind::Label => {
                let label = self.target_label(instr.block);
                masm.bind(label);
            }
            LKind::Nop | LKind::Phi => {
                // Phi is semantic only; the moves in predecessors do
                // the work.
            }
            LKind::Gap => {
                let scratch = instr
                    .gap_scratch
                    .map(|iv| self.move_loc(iv))
                    .unwrap_or(MoveLoc::Spill(self.sp_save_slot));
                let pairs: Vec<(MoveLoc, MoveLoc)> = instr
                    .gap_pairs
                    .iter()
                    .map(|&(from, to)| (self.move_loc(from), self.move_loc(to)))
                    .collect();
                for (src, dst) in resolve_parallel_moves(&pairs, scratch) {
                    let src = self.loc_operand(masm, src);
                    let dst = self.loc_operand(masm, dst);
                    self.emit_move(masm, dst, src);
                }
            }
            LKind::Move => {
                let dst = self.use_operand(masm, instr.result.unwrap());
                let src = self.use_operand(masm, instr.inputs[0]);
                self.emit_move(masm, dst, src);
            }
            LKind::Entry { context_slots } => {
                masm.prologue();
                masm.allocate_spills(self.gen.spill_index as u32 + 2);

                // Save argc
                let argc = masm.argc_slot();
                masm.asm().mov(argc, reg(R0));

                if *context_slots > 0 {
                    self.allocate_context(masm, *context_slots);
                }
            }
            LKind::Return => {
                masm.asm()
                    .mov(reg(Register::Sp), reg(Register::Fp));
                masm.asm().pop(reg(Register::Fp));
                masm.asm().ret(0);
            }
            LKind::Goto => {
                let label = self.target_label(instr.targets[0]);
                masm.asm().jmp(label);
            }
            LKind::Branch => {
                // Coerce the value to a boolean first
                masm.asm().call(CallTarget::Stub(StubKind::CoerceToBoolean));
                masm.asm().cmpb(
                    Operand::Mem(R0, boolean::VALUE_OFFSET as i32),
                    imm(0),
                );
                masm.asm()
                    .jcc(Condition::Eq, self.target_label(instr.targets[1]));
                masm.asm().jmp(self.target_label(instr.targets[0]));
            }
            LKind::Literal(lit) => {
                let dst = self.use_operand(masm, instr.result.unwrap());
                match lit {
                    Literal::Int(v) => {
                        self.emit_move(masm, dst, imm((*v as isize) << 1));
                    }
                    Literal::True => self.root_slot_load(
                        masm,
                        dst,
                        candor_runtime::heap::root::TRUE_INDEX,
                    ),
                    Literal::False => self.root_slot_load(
                        masm,
                        dst,
                        candor_runtime::heap::root::FALSE_INDEX,
                    ),
                    Literal::Str(_) | Literal::Double(_) => {
                        let hir = instr.hir.expect("interned literal has a hir node");
                        let slot = *self
                            .ctx
                            .literal_slots
                            .get(&hir)
                            .expect("literal interned before codegen");
                        self.root_slot_load(masm, dst, slot);
                    }
                }
            }
            LKind::Nil => {
                let dst = self.use_operand(masm, instr.result.unwrap());
                self.emit_move(masm, dst, imm(HeapTag::Nil as isize));
            }
            LKind::BinOp(op) => {
                // r0 <- lhs, r1 <- rhs; result in r0
                masm.asm().call(CallTarget::Stub(StubKind::Binary(*op)));
            }
            LKind::Not => {
                // r0 <- value
                masm.asm().call(CallTarget::Stub(StubKind::CoerceToBoolean));

                let on_false = masm.label();
                let done = masm.label();
                masm.asm().cmpb(
                    Operand::Mem(R0, boolean::VALUE_OFFSET as i32),
                    imm(0),
                );
                masm.asm().jcc(Condition::Eq, on_false);
                self.root_slot_load(
                    masm,
                    reg(R0),
                    candor_runtime::heap::root::FALSE_INDEX,
                );
                masm.asm().jmp(done);
                masm.bind(on_false);
                self.root_slot_load(masm, reg(R0), candor_runtime::heap::root::TRUE_INDEX);
                masm.bind(done);
            }
            LKind::LoadContext { depth, index } => {
                let dst = self.use_operand(masm, instr.result.unwrap());
                let dst_reg = match dst {
                    Operand::Reg(r) => r,
                    _ => unreachable!("LoadContext result is a register use"),
                };
                if *depth == -1 {
                    // Global object lookup
                    masm.asm().mov(
                        reg(dst_reg),
                        Operand::Mem(
                            Register::Root,
                            context::index_disp(candor_runtime::heap::root::GLOBAL_INDEX) as i32,
                        ),
                    );
                    return;
                }
                masm.asm().mov(reg(dst_reg), reg(Register::Context));
                for _ in 0..*depth {
                    masm.asm().mov(
                        reg(dst_reg),
                        Operand::Mem(dst_reg, context::PARENT_OFFSET as i32),
                    );
                }
                masm.asm().mov(
                    reg(dst_reg),
                    Operand::Mem(dst_reg, context::index_disp(*index) as i32),
                );
            }
            LKind::StoreContext { depth, index } => {
                let walk = match self.use_operand(masm, instr.scratches[0]) {
                    Operand::Reg(r) => r,
                    _ => unreachable!("scratch uses are registers"),
                };
                let src = self.use_operand(masm, instr.inputs[0]);
                masm.asm().mov(reg(walk), reg(Register::Context));
                for _ in 0..*depth {
                    masm.asm()
                        .mov(reg(walk), Operand::Mem(walk, context::PARENT_OFFSET as i32));
                }
                masm.asm()
                    .mov(Operand::Mem(walk, context::index_disp(*index) as i32), src);
            }
            LKind::LoadProperty => {
                // r0 <- object, r1 <- key
                masm.push_w(reg(R0));
                masm.push_w(reg(R0));
                masm.asm().mov(reg(R2), imm(0));
                masm.asm().call(CallTarget::Stub(StubKind::LookupProperty));

                let done = masm.label();
                masm.pop_w(reg(R1));
                masm.pop_w(reg(R1));

                masm.is_nil(R0, Some(done), None);
                masm.asm()
                    .mov(reg(R1), Operand::Mem(R1, object::MAP_OFFSET as i32));
                masm.asm().add(reg(R0), reg(R1));
                masm.asm().mov(reg(R0), Operand::Mem(R0, 0));
                masm.bind(done);
            }
            LKind::StoreProperty => {
                // r0 <- object, r1 <- key, r2 <- value; the change
                // flag rides in r2 across the stub, so the value is
                // parked on the stack.
                masm.push_w(reg(R2));
                masm.push_w(reg(R0));
                masm.asm().mov(reg(R2), imm(1));
                masm.asm().call(CallTarget::Stub(StubKind::LookupProperty));

                // The returned offset is odd; make it look unboxed
                // across the GC check.
                masm.asm().sub(reg(R0), imm(1));
                masm.check_gc();
                masm.asm().add(reg(R0), imm(1));

                masm.pop_w(reg(R1)); // object
                masm.pop_w(reg(R2)); // value

                let done = masm.label();
                masm.is_nil(R0, Some(done), None);
                masm.asm()
                    .mov(reg(R1), Operand::Mem(R1, object::MAP_OFFSET as i32));
                masm.asm().add(reg(R0), reg(R1));
                masm.asm().mov(Operand::Mem(R0, 0), reg(R2));
                masm.bind(done);
            }
            LKind::DeleteProperty => {
                // r0 <- object, r1 <- key
                masm.asm().call(CallTarget::Stub(StubKind::DeleteProperty));
            }
            LKind::Call => {
                // r0 <- argc (tagged), r1 <- fn
                let not_function = masm.label();
                let even_argc = masm.label();
                let done = masm.label();

                // Remember where the stack pointer must return to:
                // argc words (padded to even) above the current top.
                let sp_save = masm.spill_slot(self.sp_save_slot);
                let ctx_save = masm.spill_slot(self.ctx_save_slot);
                masm.asm().mov(reg(SCRATCH), reg(R0));
                masm.asm().test(reg(SCRATCH), imm(2));
                masm.asm().jcc(Condition::Eq, even_argc);
                masm.asm().add(reg(SCRATCH), imm(2));
                masm.bind(even_argc);
                masm.asm()
                    .sal(reg(SCRATCH), imm(WORD.trailing_zeros() as isize - 1));
                masm.asm().add(reg(SCRATCH), reg(Register::Sp));
                masm.asm().mov(sp_save, reg(SCRATCH));
                masm.asm().mov(ctx_save, reg(Register::Context));

                masm.is_unboxed(R1, Some(not_function), None);
                masm.is_nil(R1, Some(not_function), None);
                masm.is_heap_object(HeapTag::Function, R1, Some(not_function), None);

                // Bindings and compiled functions share the function
                // tag; dispatch on the binding marker.
                let binding = masm.label();
                let invoke_done = masm.label();
                masm.asm().cmp(
                    Operand::Mem(R1, function::PARENT_OFFSET as i32),
                    imm(candor_runtime::BINDING_CONTEXT_TAG as isize),
                );
                masm.asm().jcc(Condition::Eq, binding);

                // Enter the callee's context chain.
                masm.asm().mov(
                    reg(Register::Context),
                    Operand::Mem(R1, function::PARENT_OFFSET as i32),
                );
                masm.asm().mov(reg(SCRATCH), reg(R1));
                masm.asm().xor(reg(R1), reg(R1));
                masm.call_function(SCRATCH);
                masm.asm().jmp(invoke_done);

                masm.bind(binding);
                masm.push_w(reg(R0));
                masm.push_w(reg(R1));
                masm.asm().call(CallTarget::Stub(StubKind::CallBinding));
                masm.change_align(-2);

                masm.bind(invoke_done);

                // Clear dead registers for the stack walk.
                masm.asm().mov(reg(R1), imm(HeapTag::Nil as isize));
                masm.asm().mov(reg(R2), imm(HeapTag::Nil as isize));

                masm.asm().jmp(done);
                masm.bind(not_function);
                masm.asm().mov(reg(R0), imm(HeapTag::Nil as isize));

                masm.bind(done);
                // Unwind the pushed arguments and restore the
                // caller's context chain.
                masm.asm().mov(reg(Register::Sp), sp_save);
                masm.asm().mov(reg(Register::Context), ctx_save);
            }
            LKind::LoadArg => {
                let result = self.use_operand(masm, instr.result.unwrap());
                let index = self.use_operand(masm, instr.inputs[0]);

                let oob = masm.label();
                let skip = masm.label();

                // The index is a tagged number.
                let argc = masm.argc_slot();
                masm.asm().mov(reg(SCRATCH), index);
                masm.asm().cmp(reg(SCRATCH), argc);
                masm.asm().jcc(Condition::Ge, oob);

                masm.untag(SCRATCH);
                masm.asm().add(reg(SCRATCH), imm(2));
                masm.asm()
                    .sal(reg(SCRATCH), imm(WORD.trailing_zeros() as isize));
                masm.asm().add(reg(SCRATCH), reg(Register::Fp));
                self.emit_move(masm, result, Operand::Mem(SCRATCH, 0));

                masm.asm().jmp(skip);
                masm.bind(oob);
                // Arguments that were never passed read as nil.
                self.emit_move(masm, result, imm(HeapTag::Nil as isize));
                masm.bind(skip);
            }
            LKind::StoreArg => {
                let src = self.use_operand(masm, instr.inputs[0]);
                masm.asm().push(src);
            }
            LKind::AlignStack => {
                let even = masm.label();
                let input = self.use_operand(masm, instr.inputs[0]);
                masm.asm().test(input, imm(2));
                masm.asm().jcc(Condition::Eq, even);
                masm.asm().push(imm(HeapTag::Nil as isize));
                masm.bind(even);
            }
            LKind::LoadVarArg => self.load_vararg(masm, i),
            LKind::StoreVarArg => self.store_vararg(masm, i),
            LKind::AllocateObject => {
                masm.push_w(imm((object::INITIAL_MAP_SIZE as isize) << 1));
                masm.push_w(imm((HeapTag::Object as isize) << 1));
                masm.asm().call(CallTarget::Stub(StubKind::AllocateObject));
                masm.change_align(-2);
            }
            LKind::AllocateArray => {
                masm.push_w(imm((object::INITIAL_MAP_SIZE as isize) << 1));
                masm.push_w(imm((HeapTag::Array as isize) << 1));
                masm.asm().call(CallTarget::Stub(StubKind::AllocateObject));
                masm.change_align(-2);
            }
            LKind::Sizeof => {
                masm.asm().call(CallTarget::Stub(StubKind::Sizeof));
            }
            LKind::Typeof => {
                masm.asm().call(CallTarget::Stub(StubKind::Typeof));
            }
            LKind::Keysof => {
                masm.asm().call(CallTarget::Stub(StubKind::Keysof));
            }
            LKind::Clone => {
                masm.asm().call(CallTarget::Stub(StubKind::CloneObject));
            }
            LKind::Function { body, argc } => {
                let scratch0 = match self.use_operand(masm, instr.scratches[0]) {
                    Operand::Reg(r) => r,
                    _ => unreachable!("scratch uses are registers"),
                };
                let label = *self
                    .ctx
                    .fn_labels
                    .get(body)
                    .expect("function body label allocated");
                masm.asm().mov_label(reg(scratch0), label);
                masm.push_w(imm((*argc as isize) << 1));
                masm.push_w(reg(scratch0));
                masm.asm()
                    .call(CallTarget::Stub(StubKind::AllocateFunction));
                masm.change_align(-2);
            }
            LKind::CollectGarbage => {
                masm.asm().call(CallTarget::Stub(StubKind::CollectGarbage));
            }
            LKind::GetStackTrace => {
                // Pass the current ip so the top frame resolves.
                let here = masm.label();
                masm.bind(here);
                masm.asm().mov_label(reg(R0), here);
                masm.asm().call(CallTarget::Stub(StubKind::StackTrace));
            }
        }
    }

    fn root_slot_load(&self, masm: &mut Masm<A>, dst: Operand, slot: usize) {
        let src = Operand::Mem(Register::Root, context::index_disp(slot) as i32);
        match dst {
            Operand::Reg(_) => masm.asm().mov(dst, src),
            _ => {
                masm.asm().mov(reg(SCRATCH), src);
                masm.asm().mov(dst, reg(SCRATCH));
            }
        }
    }

    /// Prologue context allocation: the captured-variable context of
    /// this activation, chained to the caller's.
    fn allocate_context(&self, masm: &mut Masm<A>, slots: usize) {
        let bytes = ((3 + slots) * POINTER_SIZE) as u32;
        masm.allocate(HeapTag::Context, bytes, R1);

        masm.asm()
            .mov(Operand::Mem(R1, context::SLOTS_OFFSET as i32), imm(slots as isize));
        masm.asm().mov(
            Operand::Mem(R1, context::PARENT_OFFSET as i32),
            reg(Register::Context),
        );
        for i in 0..slots {
            masm.asm().mov(
                Operand::Mem(R1, context::index_disp(i) as i32),
                imm(0),
            );
        }
        masm.asm().mov(reg(Register::Context), reg(R1));
        masm.asm().xor(reg(R1), reg(R1));
        masm.check_gc();
    }

    /// Loads the tail of the caller's arguments into a fresh array.
    /// `r0` holds the tagged start offset; the array lands in `r1`.
    fn load_vararg(&self, masm: &mut Masm<A>, i: LInstrId) {
        let _ = &self.gen.instrs[i];

        // A fresh array for the rest arguments.
        masm.push_w(reg(R0));
        masm.push_w(imm((array::VARARG_LENGTH as isize) << 1));
        masm.push_w(imm((HeapTag::Array as isize) << 1));
        masm.asm().call(CallTarget::Stub(StubKind::AllocateObject));
        masm.change_align(-2);
        masm.asm().mov(reg(R2), reg(R0));
        masm.pop_w(reg(R0));

        let arr_s = masm.spill_slot(self.sp_save_slot);
        masm.asm().mov(arr_s, reg(R2));

        let loop_start = masm.label();
        let end = masm.label();

        // r0 <- stack offset of the next argument (tagged),
        // r1 <- array index (tagged)
        masm.asm().mov(reg(R1), imm(0));

        masm.bind(loop_start);
        let argc = masm.argc_slot();
        masm.asm().cmp(reg(R0), argc);
        masm.asm().jcc(Condition::Ge, end);

        // Fetch the argument from the frame.
        masm.asm().mov(reg(SCRATCH), reg(R0));
        masm.untag(SCRATCH);
        masm.asm().add(reg(SCRATCH), imm(2));
        masm.asm()
            .sal(reg(SCRATCH), imm(WORD.trailing_zeros() as isize));
        masm.asm().add(reg(SCRATCH), reg(Register::Fp));
        masm.asm().mov(reg(R2), Operand::Mem(SCRATCH, 0));

        // array[index] = value; the store keeps the loop registers on
        // the stack across the stub call.
        masm.push_w(reg(R0));
        masm.push_w(reg(R1));
        masm.push_w(reg(R2));
        masm.asm().mov(reg(R0), arr_s);
        // r1 already holds the tagged index key
        masm.asm().mov(reg(R2), imm(1));
        masm.asm().call(CallTarget::Stub(StubKind::LookupProperty));
        masm.asm().mov(reg(SCRATCH), reg(R0));
        masm.asm().mov(reg(R0), arr_s);
        masm.asm()
            .mov(reg(R0), Operand::Mem(R0, object::MAP_OFFSET as i32));
        masm.asm().add(reg(SCRATCH), reg(R0));
        masm.pop_w(reg(R2));
        masm.asm().mov(Operand::Mem(SCRATCH, 0), reg(R2));
        masm.pop_w(reg(R1));
        masm.pop_w(reg(R0));

        // index++, offset++
        masm.asm().add(reg(R1), imm(2));
        masm.asm().add(reg(R0), imm(2));
        masm.asm().jmp(loop_start);

        masm.bind(end);
        masm.asm().mov(reg(R1), arr_s);
        masm.asm().xor(reg(R2), reg(R2));
        masm.check_gc();
    }

    /// Pushes every element of a vararg array onto the stack in
    /// reverse order. `r0` holds the array.
    ///
    /// The index register survives the lookup stub by travelling
    /// through the stack, not a clobbered register.
    fn store_vararg(&self, masm: &mut Masm<A>, i: LInstrId) {
        let _ = &self.gen.instrs[i];

        let not_array = masm.label();
        let loop_start = masm.label();
        let end = masm.label();

        masm.is_unboxed(R0, Some(not_array), None);
        masm.is_nil(R0, Some(not_array), None);
        masm.is_heap_object(HeapTag::Array, R0, Some(not_array), None);

        let arr_s = masm.spill_slot(self.sp_save_slot);
        masm.asm().mov(arr_s, reg(R0));

        // r1 <- tagged index, counting down from the length.
        masm.asm()
            .mov(reg(R1), Operand::Mem(R0, array::LENGTH_OFFSET as i32));
        masm.tag_number(R1);

        masm.bind(loop_start);
        masm.asm().cmp(reg(R1), imm(0));
        masm.asm().jcc(Condition::Eq, end);
        masm.asm().sub(reg(R1), imm(2));

        // array[index]
        masm.push_w(reg(R1));
        masm.asm().mov(reg(R0), arr_s);
        masm.asm().mov(reg(R2), imm(0));
        masm.asm().call(CallTarget::Stub(StubKind::LookupProperty));

        let push_nil = masm.label();
        let pushed = masm.label();
        masm.is_nil(R0, Some(push_nil), None);
        masm.asm().mov(reg(SCRATCH), arr_s);
        masm.asm().mov(
            reg(SCRATCH),
            Operand::Mem(SCRATCH, object::MAP_OFFSET as i32),
        );
        masm.asm().add(reg(R0), reg(SCRATCH));
        masm.asm().mov(reg(R0), Operand::Mem(R0, 0));
        masm.asm().jmp(pushed);
        masm.bind(push_nil);
        masm.asm().mov(reg(R0), imm(HeapTag::Nil as isize));
        masm.bind(pushed);

        // Recover the index and swap the value into its place.
        masm.pop_w(reg(R1));
        masm.asm().push(reg(R0));

        masm.asm().jmp(loop_start);

        masm.bind(end);
        masm.bind(not_array);
        masm.asm().xor(reg(R2), reg(R2));
    }
}
