//! Low-level IR and the register allocation pipeline.
//!
//! LIR is a linear list of instructions over *intervals*: numbered
//! live ranges on the instruction axis, each a list of half-open
//! `[start, end)` subranges plus a list of uses annotated register or
//! any. Fixed intervals shadow physical registers 1:1.
//!
//! The pipeline, run once per function:
//!
//! 1. flatten blocks (predecessors first, loop headers on first visit)
//! 2. generate instructions (subclass-dispatched lowering)
//! 3. local liveness (`live_gen` / `live_kill`)
//! 4. global liveness to fixed point
//! 5. build intervals in reverse block order
//! 6. walk intervals (linear scan, Wimmer/Mössenböck variant)
//! 7. resolve data flow (per-edge parallel-move gaps)
//! 8. allocate spill slots, reusing expired ones
//!
//! Instruction ids are even so split points can land on odd positions
//! between instructions.

pub mod allocator;
pub mod gap;

use std::collections::{HashMap, HashSet, VecDeque};

use candor_ast::BinOp;

use crate::hir::{BlockId, Hir, InstrId, Kind as HirKind, Literal};

/// Number of allocatable registers exposed by the macro assembler.
pub const LIR_REGISTER_COUNT: usize = 10;

pub type LInstrId = usize;
pub type IntervalId = usize;
pub type UseId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKind {
    Any,
    Register,
}

#[derive(Debug, Clone, Copy)]
pub struct LUse {
    pub interval: IntervalId,
    pub kind: UseKind,
    pub instr: LInstrId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LRange {
    pub start: i32,
    pub end: i32,
}

/// Where an interval currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Virtual,
    Register(usize),
    /// Spill slot; `None` until AllocateSpills assigns an index.
    Spill(Option<i32>),
}

#[derive(Debug)]
pub struct LInterval {
    pub location: Location,
    pub fixed: bool,
    /// Sorted by start; built back to front.
    pub ranges: Vec<LRange>,
    /// Sorted by instruction id.
    pub uses: Vec<UseId>,
    pub split_parent: Option<IntervalId>,
    pub split_children: Vec<IntervalId>,
}

impl LInterval {
    fn new() -> LInterval {
        LInterval {
            location: Location::Virtual,
            fixed: false,
            ranges: Vec::new(),
            uses: Vec::new(),
            split_parent: None,
            split_children: Vec::new(),
        }
    }

    pub fn start(&self) -> i32 {
        self.ranges.first().map(|r| r.start).unwrap_or(0)
    }

    pub fn end(&self) -> i32 {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    pub fn is_register(&self) -> bool {
        matches!(self.location, Location::Register(_))
    }

    pub fn is_stackslot(&self) -> bool {
        matches!(self.location, Location::Spill(_))
    }

    pub fn register_index(&self) -> Option<usize> {
        match self.location {
            Location::Register(i) => Some(i),
            _ => None,
        }
    }

    pub fn spill_index(&self) -> Option<i32> {
        match self.location {
            Location::Spill(i) => i,
            _ => None,
        }
    }
}

/// Instruction kinds; `Gap` carries its parallel moves.
#[derive(Debug, Clone, PartialEq)]
pub enum LKind {
    Label,
    Gap,
    Move,
    Phi,
    Goto,
    Branch,
    Entry { context_slots: usize },
    Return,
    Nop,
    Literal(Literal),
    Nil,
    BinOp(BinOp),
    Not,
    LoadContext { depth: i32, index: usize },
    StoreContext { depth: i32, index: usize },
    LoadProperty,
    StoreProperty,
    DeleteProperty,
    Call,
    LoadArg,
    StoreArg,
    LoadVarArg,
    StoreVarArg,
    AllocateObject,
    AllocateArray,
    Sizeof,
    Typeof,
    Keysof,
    Clone,
    Function { body: BlockId, argc: u32 },
    AlignStack,
    CollectGarbage,
    GetStackTrace,
}

#[derive(Debug)]
pub struct LInstruction {
    /// Even position on the linear axis.
    pub id: i32,
    pub kind: LKind,
    pub inputs: Vec<UseId>,
    pub scratches: Vec<UseId>,
    pub result: Option<UseId>,
    pub hir: Option<InstrId>,
    pub block: BlockId,
    /// Kills every register across the instruction.
    pub has_call: bool,
    /// Successor labels for control instructions.
    pub targets: Vec<BlockId>,
    /// Parallel moves of a gap: `(from, to)` interval pairs.
    pub gap_pairs: Vec<(IntervalId, IntervalId)>,
    /// Scratch spill interval of a gap, for cycle breaking.
    pub gap_scratch: Option<IntervalId>,
}

#[derive(Debug, Default)]
pub struct LBlock {
    pub start_id: i32,
    pub end_id: i32,
    pub instrs: Vec<LInstrId>,
    pub live_gen: HashSet<IntervalId>,
    pub live_kill: HashSet<IntervalId>,
    pub live_in: HashSet<IntervalId>,
    pub live_out: HashSet<IntervalId>,
}

pub struct LGen<'h> {
    pub hir: &'h Hir,
    pub instrs: Vec<LInstruction>,
    /// The linear instruction stream (arena indices in order).
    pub stream: Vec<LInstrId>,
    pub intervals: Vec<LInterval>,
    pub uses: Vec<LUse>,
    /// Indexed by HIR block id; only flattened blocks are filled in.
    pub blocks: HashMap<BlockId, LBlock>,
    pub block_order: Vec<BlockId>,
    /// Fixed intervals, one per physical register.
    pub registers: [IntervalId; LIR_REGISTER_COUNT],
    /// Result interval of each HIR instruction.
    pub virtual_of: HashMap<InstrId, IntervalId>,
    /// Label instruction of each block.
    pub labels: HashMap<BlockId, LInstrId>,

    instr_id: i32,
    current_block: BlockId,
    pub spill_index: i32,

    // Linear-scan state
    pub(crate) unhandled: Vec<IntervalId>,
    pub(crate) active: Vec<IntervalId>,
    pub(crate) inactive: Vec<IntervalId>,
    pub(crate) unhandled_spills: Vec<IntervalId>,
}

impl<'h> LGen<'h> {
    /// Run the whole pipeline for the function rooted at `root`.
    pub fn new(hir: &'h Hir, root: BlockId) -> LGen<'h> {
        let mut gen = LGen {
            hir,
            instrs: Vec::new(),
            stream: Vec::new(),
            intervals: Vec::new(),
            uses: Vec::new(),
            blocks: HashMap::new(),
            block_order: Vec::new(),
            registers: [0; LIR_REGISTER_COUNT],
            virtual_of: HashMap::new(),
            labels: HashMap::new(),
            instr_id: 0,
            current_block: root,
            spill_index: 0,
            unhandled: Vec::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            unhandled_spills: Vec::new(),
        };

        for i in 0..LIR_REGISTER_COUNT {
            let id = gen.create_interval();
            gen.intervals[id].location = Location::Register(i);
            gen.intervals[id].fixed = true;
            gen.registers[i] = id;
        }

        gen.flatten_blocks(root);
        gen.generate_instructions();
        gen.compute_local_live_sets();
        gen.compute_global_live_sets();
        gen.build_intervals();
        gen.walk_intervals();
        gen.resolve_data_flow();
        gen.allocate_spills();
        gen
    }

    pub fn create_interval(&mut self) -> IntervalId {
        self.intervals.push(LInterval::new());
        self.intervals.len() - 1
    }

    pub fn create_virtual(&mut self) -> IntervalId {
        self.create_interval()
    }

    fn new_use(&mut self, interval: IntervalId, kind: UseKind, instr: LInstrId) -> UseId {
        let id = self.uses.len();
        self.uses.push(LUse {
            interval,
            kind,
            instr,
        });
        // Keep the interval's use list sorted by instruction id.
        let pos = self.intervals[interval]
            .uses
            .partition_point(|&u| self.instrs[self.uses[u].instr].id <= self.instrs[instr].id);
        self.intervals[interval].uses.insert(pos, id);
        id
    }

    fn new_instr(&mut self, kind: LKind) -> LInstrId {
        let id = self.instrs.len();
        self.instrs.push(LInstruction {
            id: 0,
            kind,
            inputs: Vec::new(),
            scratches: Vec::new(),
            result: None,
            hir: None,
            block: self.current_block,
            has_call: false,
            targets: Vec::new(),
            gap_pairs: Vec::new(),
            gap_scratch: None,
        });
        id
    }

    /// Append an instruction to the stream, assigning the next even
    /// id.
    fn add(&mut self, kind: LKind) -> LInstrId {
        let id = self.new_instr(kind);
        self.instrs[id].id = self.instr_id;
        self.instr_id += 2;
        self.stream.push(id);
        self.blocks
            .get_mut(&self.current_block)
            .expect("current block flattened")
            .instrs
            .push(id);
        id
    }

    fn add_input(&mut self, instr: LInstrId, interval: IntervalId, kind: UseKind) {
        let use_id = self.new_use(interval, kind, instr);
        self.instrs[instr].inputs.push(use_id);
    }

    fn add_scratch(&mut self, instr: LInstrId) {
        let interval = self.create_virtual();
        let use_id = self.new_use(interval, UseKind::Register, instr);
        self.instrs[instr].scratches.push(use_id);
    }

    fn set_result(&mut self, instr: LInstrId, interval: IntervalId, kind: UseKind) {
        let use_id = self.new_use(interval, kind, instr);
        self.instrs[instr].result = Some(use_id);
    }

    /// Result interval of a HIR instruction, created on demand.
    fn interval_of(&mut self, hir_instr: InstrId) -> IntervalId {
        if let Some(&iv) = self.virtual_of.get(&hir_instr) {
            return iv;
        }
        let iv = self.create_virtual();
        self.virtual_of.insert(hir_instr, iv);
        iv
    }

    // --- 1. Flatten blocks ---

    fn flatten_blocks(&mut self, root: BlockId) {
        // Unreachable blocks (dead code after terminators) must not
        // count as predecessors.
        let mut reachable: HashSet<BlockId> = HashSet::new();
        let mut dfs = vec![root];
        while let Some(b) = dfs.pop() {
            if reachable.insert(b) {
                dfs.extend(self.hir.blocks[b].succs.iter().copied());
            }
        }

        let mut visits: HashMap<BlockId, usize> = HashMap::new();
        let mut work_queue: VecDeque<BlockId> = VecDeque::new();
        work_queue.push_back(root);

        while let Some(b) = work_queue.pop_front() {
            let seen = visits.entry(b).or_insert(0);
            *seen += 1;

            let block = &self.hir.blocks[b];
            let pred_count = block
                .preds
                .iter()
                .filter(|p| reachable.contains(p))
                .count();
            if pred_count == 0 {
                // Root block
                if *seen != 1 {
                    continue;
                }
            } else if block.is_loop {
                // Loop start: emit on first visit only
                if *seen != 1 {
                    continue;
                }
            } else if *seen != pred_count {
                // Regular block: wait for every predecessor
                continue;
            }

            self.blocks.insert(b, LBlock::default());
            self.block_order.push(b);

            for &succ in block.succs.iter().rev() {
                work_queue.push_front(succ);
            }
        }
    }

    // --- 2. Generate instructions ---

    fn generate_instructions(&mut self) {
        for i in 0..self.block_order.len() {
            let b = self.block_order[i];
            self.current_block = b;
            let label = self.add(LKind::Label);
            self.labels.insert(b, label);

            for j in 0..self.hir.blocks[b].instrs.len() {
                let hir_instr = self.hir.blocks[b].instrs[j];
                if self.hir.instrs[hir_instr].removed {
                    continue;
                }
                self.visit_instruction(hir_instr);
            }
        }
    }

    /// Move `instr`'s value into a fixed register before the current
    /// instruction; returns the fixed interval.
    fn to_fixed(&mut self, hir_instr: InstrId, reg: usize) -> IntervalId {
        let arg = self.interval_of(hir_instr);
        let fixed = self.registers[reg];
        let mv = self.add(LKind::Move);
        self.set_result(mv, fixed, UseKind::Register);
        self.add_input(mv, arg, UseKind::Any);
        fixed
    }

    /// Bind `instr`'s result to a fixed register, then move it into a
    /// fresh virtual interval so downstream uses see a virtual.
    fn result_from_fixed(&mut self, lir: LInstrId, hir_instr: InstrId, reg: usize) {
        let fixed = self.registers[reg];
        self.set_result(lir, fixed, UseKind::Register);

        let res = self.interval_of(hir_instr);
        let mv = self.add(LKind::Move);
        self.set_result(mv, res, UseKind::Any);
        self.add_input(mv, fixed, UseKind::Register);
    }

    fn visit_instruction(&mut self, hir_instr: InstrId) {
        let kind = self.hir.instrs[hir_instr].kind.clone();
        let args = self.hir.instrs[hir_instr].args.clone();

        match kind {
            HirKind::Entry { context_slots } => {
                let instr = self.add(LKind::Entry { context_slots });
                self.instrs[instr].hir = Some(hir_instr);
            }
            HirKind::Literal(lit) => {
                let instr = self.add(LKind::Literal(lit));
                let res = self.interval_of(hir_instr);
                self.set_result(instr, res, UseKind::Any);
                self.instrs[instr].hir = Some(hir_instr);
            }
            HirKind::Nil => {
                let instr = self.add(LKind::Nil);
                let res = self.interval_of(hir_instr);
                self.set_result(instr, res, UseKind::Any);
            }
            HirKind::BinOp(op) => {
                // lhs -> r0, rhs -> r1; stub returns in r0.
                self.to_fixed(args[0], 0);
                self.to_fixed(args[1], 1);
                let instr = self.add(LKind::BinOp(op));
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_input(instr, self.registers[1], UseKind::Register);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::Not => {
                self.to_fixed(args[0], 0);
                let instr = self.add(LKind::Not);
                self.instrs[instr].has_call = true;
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::LoadContext { depth, index } => {
                let instr = self.add(LKind::LoadContext { depth, index });
                let res = self.interval_of(hir_instr);
                self.set_result(instr, res, UseKind::Register);
            }
            HirKind::StoreContext { depth, index } => {
                let instr = self.add(LKind::StoreContext { depth, index });
                let arg = self.interval_of(args[0]);
                self.add_input(instr, arg, UseKind::Register);
                self.add_scratch(instr);
            }
            HirKind::LoadProperty => {
                self.to_fixed(args[0], 0);
                self.to_fixed(args[1], 1);
                let instr = self.add(LKind::LoadProperty);
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_input(instr, self.registers[1], UseKind::Register);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::StoreProperty => {
                self.to_fixed(args[0], 0);
                self.to_fixed(args[1], 1);
                self.to_fixed(args[2], 2);
                let instr = self.add(LKind::StoreProperty);
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_input(instr, self.registers[1], UseKind::Register);
                self.add_input(instr, self.registers[2], UseKind::Register);
            }
            HirKind::DeleteProperty => {
                self.to_fixed(args[0], 0);
                self.to_fixed(args[1], 1);
                let instr = self.add(LKind::DeleteProperty);
                self.instrs[instr].has_call = true;
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_input(instr, self.registers[1], UseKind::Register);
            }
            HirKind::Call => {
                // fn -> r1, argc -> r0; the return value flows
                // through r0.
                self.to_fixed(args[1], 0);
                self.to_fixed(args[0], 1);
                let instr = self.add(LKind::Call);
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_input(instr, self.registers[1], UseKind::Register);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::LoadArg => {
                let instr = self.add(LKind::LoadArg);
                let arg = self.interval_of(args[0]);
                self.add_input(instr, arg, UseKind::Register);
                self.add_scratch(instr);
                let res = self.interval_of(hir_instr);
                self.set_result(instr, res, UseKind::Register);
            }
            HirKind::LoadVarArg => {
                self.to_fixed(args[0], 0);
                let instr = self.add(LKind::LoadVarArg);
                self.instrs[instr].has_call = true;
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_scratch(instr);
                self.result_from_fixed(instr, hir_instr, 1);
            }
            HirKind::StoreArg => {
                let instr = self.add(LKind::StoreArg);
                let arg = self.interval_of(args[0]);
                self.add_input(instr, arg, UseKind::Register);
            }
            HirKind::StoreVarArg => {
                self.to_fixed(args[0], 0);
                let instr = self.add(LKind::StoreVarArg);
                self.instrs[instr].has_call = true;
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.add_scratch(instr);
            }
            HirKind::AllocateObject => {
                let instr = self.add(LKind::AllocateObject);
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::AllocateArray => {
                let instr = self.add(LKind::AllocateArray);
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::Sizeof | HirKind::Typeof | HirKind::Keysof | HirKind::Clone => {
                self.to_fixed(args[0], 0);
                let instr = self.add(match kind {
                    HirKind::Sizeof => LKind::Sizeof,
                    HirKind::Typeof => LKind::Typeof,
                    HirKind::Keysof => LKind::Keysof,
                    _ => LKind::Clone,
                });
                self.instrs[instr].has_call = true;
                self.add_input(instr, self.registers[0], UseKind::Register);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::Function { body, argc } => {
                let instr = self.add(LKind::Function { body, argc });
                self.instrs[instr].has_call = true;
                self.add_scratch(instr);
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::AlignStack => {
                let instr = self.add(LKind::AlignStack);
                let arg = self.interval_of(args[0]);
                self.add_input(instr, arg, UseKind::Register);
            }
            HirKind::CollectGarbage => {
                let instr = self.add(LKind::CollectGarbage);
                self.instrs[instr].has_call = true;
            }
            HirKind::GetStackTrace => {
                let instr = self.add(LKind::GetStackTrace);
                self.instrs[instr].has_call = true;
                self.result_from_fixed(instr, hir_instr, 0);
            }
            HirKind::Goto => self.visit_goto(hir_instr),
            HirKind::Phi => {
                // The self-input keeps the phi interval in live_gen of
                // its block, so predecessor moves connect to it.
                let iv = self.interval_of(hir_instr);
                let instr = self.add(LKind::Phi);
                self.add_input(instr, iv, UseKind::Any);
                self.set_result(instr, iv, UseKind::Any);
            }
            HirKind::If => {
                self.to_fixed(args[0], 0);
                let instr = self.add(LKind::Branch);
                self.instrs[instr].has_call = true;
                self.instrs[instr].hir = Some(hir_instr);
                self.add_input(instr, self.registers[0], UseKind::Register);
                let block = self.hir.instrs[hir_instr].block;
                self.instrs[instr].targets = self.hir.blocks[block].succs.clone();
            }
            HirKind::Return => {
                self.to_fixed(args[0], 0);
                let instr = self.add(LKind::Return);
                self.add_input(instr, self.registers[0], UseKind::Register);
            }
        }
    }

    /// Gotos materialize phi moves: each phi of the successor gets a
    /// `Move` of this predecessor's input.
    fn visit_goto(&mut self, hir_instr: InstrId) {
        let block = self.hir.instrs[hir_instr].block;
        let succ = self.hir.blocks[block].succs[0];
        let parent_index = if self.hir.blocks[succ].preds[0] == block {
            0
        } else {
            1
        };

        for &phi in &self.hir.blocks[succ].instrs.clone() {
            if !matches!(self.hir.instrs[phi].kind, HirKind::Phi) || self.hir.instrs[phi].removed {
                continue;
            }
            let inputs = self.hir.instrs[phi].args.clone();
            if parent_index >= inputs.len() {
                continue;
            }
            let phi_interval = self.interval_of(phi);
            let input_interval = self.interval_of(inputs[parent_index]);

            let mv = self.add(LKind::Move);
            self.set_result(mv, phi_interval, UseKind::Any);
            self.add_input(mv, input_interval, UseKind::Any);
        }

        let goto = self.add(LKind::Goto);
        self.instrs[goto].targets = self.hir.blocks[block].succs.clone();
    }

    // --- 3. Local liveness ---

    fn compute_local_live_sets(&mut self) {
        for &b in &self.block_order {
            let block = &self.blocks[&b];
            let instr_ids = block.instrs.clone();

            let mut live_gen = HashSet::new();
            let mut live_kill = HashSet::new();

            for &i in &instr_ids {
                let instr = &self.instrs[i];
                for &input in &instr.inputs {
                    let iv = self.uses[input].interval;
                    if !live_kill.contains(&iv) {
                        live_gen.insert(iv);
                    }
                }
                for &scratch in &instr.scratches {
                    live_kill.insert(self.uses[scratch].interval);
                }
                if let Some(result) = instr.result {
                    live_kill.insert(self.uses[result].interval);
                }
            }

            let block = self.blocks.get_mut(&b).unwrap();
            block.live_gen = live_gen;
            block.live_kill = live_kill;
        }
    }

    // --- 4. Global liveness ---

    fn compute_global_live_sets(&mut self) {
        loop {
            let mut change = false;

            for &b in self.block_order.iter().rev() {
                // Every successor's input adds to current's output
                let mut live_out = self.blocks[&b].live_out.clone();
                for &succ in &self.hir.blocks[b].succs {
                    if let Some(succ_block) = self.blocks.get(&succ) {
                        for &iv in &succ_block.live_in {
                            if live_out.insert(iv) {
                                change = true;
                            }
                        }
                    }
                }

                // live_in = live_gen ∪ (live_out − live_kill)
                let block = &self.blocks[&b];
                let mut live_in = block.live_in.clone();
                for &iv in &block.live_gen {
                    if live_in.insert(iv) {
                        change = true;
                    }
                }
                for &iv in &live_out {
                    if !block.live_kill.contains(&iv) && live_in.insert(iv) {
                        change = true;
                    }
                }

                let block = self.blocks.get_mut(&b).unwrap();
                block.live_out = live_out;
                block.live_in = live_in;
            }

            if !change {
                break;
            }
        }
    }

    // --- 5. Build intervals ---

    fn build_intervals(&mut self) {
        for &b in self.block_order.clone().iter().rev() {
            let (start_id, end_id) = {
                let block = &self.blocks[&b];
                let start = self.instrs[*block.instrs.first().unwrap()].id;
                let end = self.instrs[*block.instrs.last().unwrap()].id;
                (start, end)
            };
            {
                let block = self.blocks.get_mut(&b).unwrap();
                block.start_id = start_id;
                block.end_id = end_id;
            }

            // Full block range for everything live out; shortened
            // later if the block defines it.
            for iv in self.blocks[&b].live_out.clone() {
                self.add_range(iv, start_id, end_id + 2);
            }

            for &i in self.blocks[&b].instrs.clone().iter().rev() {
                let id = self.instrs[i].id;

                if self.instrs[i].has_call {
                    // Calls kill every register across the
                    // instruction.
                    for r in 0..LIR_REGISTER_COUNT {
                        let reg = self.registers[r];
                        if self.covers(reg, id) {
                            continue;
                        }
                        self.add_range(reg, id, id + 1);
                        self.new_use(reg, UseKind::Register, i);
                    }
                }

                if let Some(result) = self.instrs[i].result {
                    let res = self.uses[result].interval;
                    if self.intervals[res].ranges.is_empty() {
                        // Result used nowhere except the instruction
                        // itself.
                        self.add_range(res, id, id + 1);
                    } else if !self.blocks[&b].live_in.contains(&res) {
                        self.intervals[res].ranges[0].start = id;
                    }
                }

                for s in 0..self.instrs[i].scratches.len() {
                    let scratch = self.uses[self.instrs[i].scratches[s]].interval;
                    // Scratches live only right before the
                    // instruction, so fixed intervals don't spill
                    // them.
                    self.add_range(scratch, id - 1, id);
                }

                for inp in 0..self.instrs[i].inputs.len() {
                    let input = self.uses[self.instrs[i].inputs[inp]].interval;
                    if !self.covers(input, id) {
                        self.add_range(input, start_id, id);
                    }
                }
            }
        }
    }

    // --- Interval primitives ---

    /// Insert `[start, end)` keeping the range list sorted, merging
    /// overlapping and adjacent ranges.
    pub fn add_range(&mut self, interval: IntervalId, start: i32, end: i32) {
        let ranges = &mut self.intervals[interval].ranges;
        let pos = ranges.partition_point(|r| r.start < start);
        ranges.insert(pos, LRange { start, end });

        let mut merged: Vec<LRange> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }

    pub fn covers(&self, interval: IntervalId, pos: i32) -> bool {
        for range in &self.intervals[interval].ranges {
            if range.start > pos {
                return false;
            }
            if range.end > pos {
                return true;
            }
        }
        false
    }

    pub fn find_intersection(&self, a: IntervalId, b: IntervalId) -> Option<i32> {
        for ra in &self.intervals[a].ranges {
            for rb in &self.intervals[b].ranges {
                if ra.start >= rb.start && ra.start < rb.end {
                    return Some(ra.start);
                }
                if rb.start >= ra.start && rb.start < ra.end {
                    return Some(rb.start);
                }
            }
        }
        None
    }

    /// First use at or after `pos`, optionally register-typed only.
    /// Searches split children too.
    pub fn use_after(&self, interval: IntervalId, pos: i32, filter: Option<UseKind>) -> Option<UseId> {
        for &u in &self.intervals[interval].uses {
            let use_ = &self.uses[u];
            if self.instrs[use_.instr].id >= pos
                && (filter.is_none() || Some(use_.kind) == filter)
            {
                return Some(u);
            }
        }
        for &child in &self.intervals[interval].split_children {
            if let Some(u) = self.use_after(child, pos, filter) {
                return Some(u);
            }
        }
        None
    }

    /// The split child (or parent) covering `pos`.
    pub fn child_at(&self, interval: IntervalId, pos: i32) -> Option<IntervalId> {
        let parent = self.intervals[interval].split_parent.unwrap_or(interval);
        if self.covers(parent, pos) {
            return Some(parent);
        }
        for &child in &self.intervals[parent].split_children {
            if self.covers(child, pos) {
                return Some(child);
            }
        }
        None
    }

    pub fn is_block_start(&self, pos: i32) -> bool {
        self.block_order
            .iter()
            .any(|b| self.blocks[b].start_id == pos)
    }

    // --- 7. Resolve data flow ---

    fn resolve_data_flow(&mut self) {
        for idx in 0..self.block_order.len() {
            let b = self.block_order[idx];
            let succs = self.hir.blocks[b].succs.clone();

            for &succ in &succs {
                if !self.blocks.contains_key(&succ) {
                    continue;
                }
                let b_end = self.blocks[&b].end_id;
                let succ_start = self.blocks[&succ].start_id;

                let mut live_in: Vec<IntervalId> =
                    self.blocks[&succ].live_in.iter().copied().collect();
                live_in.sort_unstable();
                let mut pending: Vec<(IntervalId, IntervalId)> = Vec::new();

                for iv in live_in {
                    let parent = self.intervals[iv].split_parent.unwrap_or(iv);
                    if self.intervals[parent].split_children.is_empty() {
                        continue;
                    }
                    let left = self.child_at(parent, b_end);
                    let right = self.child_at(parent, succ_start);
                    if let (Some(left), Some(right)) = (left, right) {
                        if left != right {
                            pending.push((left, right));
                        }
                    }
                }

                if !pending.is_empty() {
                    let pos = if succs.len() == 2 {
                        // Gap goes into the branch target
                        succ_start + 1
                    } else {
                        // Or before the join
                        b_end - 1
                    };
                    let gap = self.get_gap(pos);
                    for pair in pending {
                        self.instrs[gap].gap_pairs.push(pair);
                    }
                }
            }

            // Remove unconditional gotos between adjacent blocks;
            // attach labels everywhere else.
            let control = *self.blocks[&b].instrs.last().unwrap();
            let is_goto = self.instrs[control].kind == LKind::Goto;
            let next_block = self.block_order.get(idx + 1).copied();

            if is_goto && !succs.is_empty() && next_block == Some(succs[0]) {
                self.blocks.get_mut(&b).unwrap().instrs.pop();
                self.stream.retain(|&i| i != control);
                self.instrs[control].kind = LKind::Nop;
            }
        }
    }

    /// Find or create the gap at odd position `pos`.
    pub fn get_gap(&mut self, pos: i32) -> LInstrId {
        let mut insert_at = self.stream.len();
        for (idx, &i) in self.stream.iter().enumerate() {
            if self.instrs[i].id < pos {
                continue;
            }
            if self.instrs[i].id == pos {
                return i;
            }
            insert_at = idx;
            break;
        }

        // A gap owns a temporary spill for cycle breaking.
        let tmp = self.create_virtual();
        self.add_range(tmp, pos - 1, pos + 1);
        self.spill(tmp);

        let gap = self.new_instr(LKind::Gap);
        self.instrs[gap].id = pos;
        self.instrs[gap].gap_scratch = Some(tmp);
        let block = self.instrs[self.stream[insert_at - 1]].block;
        self.instrs[gap].block = block;
        self.stream.insert(insert_at, gap);

        // Insert into the owning block's list too.
        let block_instrs = self.blocks[&block].instrs.clone();
        let block_pos = block_instrs
            .iter()
            .position(|&i| self.instrs[i].id > pos)
            .unwrap_or(block_instrs.len());
        self.blocks
            .get_mut(&block)
            .unwrap()
            .instrs
            .insert(block_pos, gap);

        gap
    }

    pub fn spill(&mut self, interval: IntervalId) {
        debug_assert!(!self.intervals[interval].is_stackslot());
        self.intervals[interval].location = Location::Spill(None);
        self.unhandled_spills.push(interval);
    }

    // --- Debug printing ---

    pub fn print(&self) -> String {
        let mut out = String::new();
        for &b in &self.block_order {
            out.push_str(&format!("# Block {}\n", b));
            for &i in &self.blocks[&b].instrs {
                let instr = &self.instrs[i];
                let loc = |u: &UseId| -> String {
                    let iv = self.uses[*u].interval;
                    match self.intervals[iv].location {
                        Location::Register(r) => format!("r{}", r),
                        Location::Spill(Some(s)) => format!("[{}]", s),
                        Location::Spill(None) => "[?]".to_string(),
                        Location::Virtual => format!("v{}", iv),
                    }
                };
                let inputs: Vec<String> = instr.inputs.iter().map(|u| loc(u)).collect();
                let result = instr.result.as_ref().map(|u| loc(u));
                out.push_str(&format!(
                    "{:3}: {:?}{}{}\n",
                    instr.id,
                    instr.kind,
                    if inputs.is_empty() {
                        String::new()
                    } else {
                        format!(" {}", inputs.join(", "))
                    },
                    result.map(|r| format!(" -> {}", r)).unwrap_or_default(),
                ));
            }
        }
        out
    }
}
