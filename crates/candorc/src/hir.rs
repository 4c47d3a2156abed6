//! High-level IR: SSA over a graph of basic blocks.
//!
//! The AST is walked once. Stack locals are renamed through per-block
//! environments (no dominance computation — scope slots do the work);
//! captured variables go through LoadContext/StoreContext. Join
//! points insert binary phis for every variable that differs across
//! predecessors; loop headers insert phis whose second input is
//! filled after the body is lowered, then pruned when degenerate.
//!
//! Instruction ids are even (`i0, i2, ...`) so later passes can use
//! odd positions between instructions.

use std::collections::{BTreeMap, VecDeque};

use candor_ast::{BinOp, Expr, Module, PropertyKey, Stmt, UnOp};

use crate::scope::{Resolution, ScopeAnalysis};
use crate::CompileError;

pub type InstrId = usize;
pub type BlockId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Double(f64),
    Str(String),
    True,
    False,
}

impl Literal {
    pub fn text(&self) -> String {
        match self {
            Literal::Int(v) => v.to_string(),
            Literal::Double(v) => format!("{}", v),
            Literal::Str(s) => s.clone(),
            Literal::True => "true".to_string(),
            Literal::False => "false".to_string(),
        }
    }
}

/// Instruction kinds; a closed set dispatched by match in every pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Entry { context_slots: usize },
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
    Phi,
    Goto,
    If,
    Return,
    AlignStack,
    CollectGarbage,
    GetStackTrace,
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub kind: Kind,
    pub args: Vec<InstrId>,
    pub uses: Vec<InstrId>,
    pub block: BlockId,
    pub ast_offset: Option<u32>,
    pub removed: bool,
}

#[derive(Debug, Default)]
pub struct Block {
    pub instrs: Vec<InstrId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub is_loop: bool,
    pub ended: bool,
}

/// The finished HIR of a whole module: one block graph spanning every
/// function, with each function owning a contiguous range of blocks
/// reachable from its entry.
#[derive(Debug, Default)]
pub struct Hir {
    pub instrs: Vec<Instr>,
    pub blocks: Vec<Block>,
    /// Entry block of every function, module first.
    pub entries: Vec<BlockId>,
}

impl Hir {
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    /// Even display id, as in `i4 = BinOp(i0, i2)`.
    pub fn display_id(id: InstrId) -> usize {
        id * 2
    }

    pub fn print(&self) -> String {
        let mut out = String::new();
        for (block_id, block) in self.blocks.iter().enumerate() {
            if block.instrs.is_empty() {
                continue;
            }
            out.push_str(&format!("# Block {}\n", block_id));
            for &id in &block.instrs {
                let instr = &self.instrs[id];
                if instr.removed {
                    continue;
                }
                out.push_str(&self.print_instr(id));
                out.push('\n');
            }
        }
        out
    }

    fn print_instr(&self, id: InstrId) -> String {
        let instr = &self.instrs[id];
        let name = match &instr.kind {
            Kind::Entry { context_slots } => {
                return format!("i{} = Entry[{}]", Self::display_id(id), context_slots)
            }
            Kind::Literal(lit) => {
                return format!("i{} = Literal[{}]", Self::display_id(id), lit.text())
            }
            Kind::Function { body, .. } => {
                return format!("i{} = Function[b{}]", Self::display_id(id), body)
            }
            Kind::Nil => "Nil",
            Kind::BinOp(_) => "BinOp",
            Kind::Not => "Not",
            Kind::LoadContext { .. } => "LoadContext",
            Kind::StoreContext { .. } => "StoreContext",
            Kind::LoadProperty => "LoadProperty",
            Kind::StoreProperty => "StoreProperty",
            Kind::DeleteProperty => "DeleteProperty",
            Kind::Call => "Call",
            Kind::LoadArg => "LoadArg",
            Kind::StoreArg => "StoreArg",
            Kind::LoadVarArg => "LoadVarArg",
            Kind::StoreVarArg => "StoreVarArg",
            Kind::AllocateObject => "AllocateObject",
            Kind::AllocateArray => "AllocateArray",
            Kind::Sizeof => "Sizeof",
            Kind::Typeof => "Typeof",
            Kind::Keysof => "Keysof",
            Kind::Clone => "Clone",
            Kind::Phi => "Phi",
            Kind::Goto => "Goto",
            Kind::If => "If",
            Kind::Return => "Return",
            Kind::AlignStack => "AlignStack",
            Kind::CollectGarbage => "CollectGarbage",
            Kind::GetStackTrace => "GetStackTrace",
        };
        if instr.args.is_empty() {
            format!("i{} = {}", Self::display_id(id), name)
        } else {
            let args: Vec<String> = instr
                .args
                .iter()
                .map(|&a| format!("i{}", Self::display_id(a)))
                .collect();
            format!("i{} = {}({})", Self::display_id(id), name, args.join(", "))
        }
    }
}

/// Per-block SSA environment: variable name -> defining instruction.
type Env = BTreeMap<String, InstrId>;

struct PendingFunction {
    block: BlockId,
    scope: usize,
    params: Vec<candor_ast::Param>,
    body: Vec<Stmt>,
}

struct LoopInfo {
    header: BlockId,
    after: BlockId,
}

pub struct Builder {
    hir: Hir,
    analysis: ScopeAnalysis,
    scope: usize,
    current: BlockId,
    env: Env,
    last_value: Option<InstrId>,
    loops: Vec<LoopInfo>,
    pending: VecDeque<PendingFunction>,
}

/// Build the HIR of a module.
pub fn build(module: &Module) -> Result<Hir, CompileError> {
    let analysis = ScopeAnalysis::analyze(module);
    let root_scope = analysis
        .scope_id((module.span.start, module.span.end))
        .expect("module scope");

    let mut builder = Builder {
        hir: Hir::default(),
        analysis,
        scope: root_scope,
        current: 0,
        env: Env::new(),
        last_value: None,
        loops: Vec::new(),
        pending: VecDeque::new(),
    };

    let root = builder.new_block();
    builder.hir.entries.push(root);
    builder.current = root;
    builder.lower_function_body(root_scope, &[], &module.body)?;

    while let Some(pending) = builder.pending.pop_front() {
        builder.hir.entries.push(pending.block);
        builder.current = pending.block;
        builder.scope = pending.scope;
        builder.env = Env::new();
        builder.last_value = None;
        builder.lower_function_body(pending.scope, &pending.params, &pending.body)?;
    }

    Ok(builder.hir)
}

impl Builder {
    fn new_block(&mut self) -> BlockId {
        self.hir.blocks.push(Block::default());
        self.hir.blocks.len() - 1
    }

    fn create(&mut self, kind: Kind, args: Vec<InstrId>, offset: Option<u32>) -> InstrId {
        let id = self.hir.instrs.len();
        for &arg in &args {
            self.hir.instrs[arg].uses.push(id);
        }
        self.hir.instrs.push(Instr {
            kind,
            args,
            uses: Vec::new(),
            block: self.current,
            ast_offset: offset,
            removed: false,
        });
        id
    }

    fn append(&mut self, id: InstrId) {
        self.hir.instrs[id].block = self.current;
        self.hir.blocks[self.current].instrs.push(id);
    }

    fn add(&mut self, kind: Kind, args: Vec<InstrId>) -> InstrId {
        self.add_at(kind, args, None)
    }

    fn add_at(&mut self, kind: Kind, args: Vec<InstrId>, offset: Option<u32>) -> InstrId {
        if self.hir.blocks[self.current].ended {
            // Dead code after a terminator lands in an unreachable
            // block.
            let dead = self.new_block();
            self.current = dead;
        }
        let id = self.create(kind, args, offset);
        self.append(id);
        id
    }

    fn link(&mut self, from: BlockId, to: BlockId) {
        self.hir.blocks[from].succs.push(to);
        self.hir.blocks[to].preds.push(from);
    }

    fn end_with_goto(&mut self, target: BlockId) {
        self.add(Kind::Goto, vec![]);
        let from = self.current;
        self.hir.blocks[from].ended = true;
        self.link(from, target);
    }

    fn end_with_if(&mut self, cond: InstrId, then_b: BlockId, else_b: BlockId) {
        self.add(Kind::If, vec![cond]);
        let from = self.current;
        self.hir.blocks[from].ended = true;
        self.link(from, then_b);
        self.link(from, else_b);
    }

    fn end_with_return(&mut self, value: InstrId) {
        self.add(Kind::Return, vec![value]);
        let from = self.current;
        self.hir.blocks[from].ended = true;
    }

    fn replace_uses(&mut self, old: InstrId, new: InstrId) {
        let uses = std::mem::take(&mut self.hir.instrs[old].uses);
        for &user in &uses {
            for arg in &mut self.hir.instrs[user].args {
                if *arg == old {
                    *arg = new;
                }
            }
            self.hir.instrs[new].uses.push(user);
        }
        for value in self.env.values_mut() {
            if *value == old {
                *value = new;
            }
        }
    }

    // --- Function bodies ---

    fn lower_function_body(
        &mut self,
        scope: usize,
        params: &[candor_ast::Param],
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let context_slots = self.analysis.context_slots(scope);
        self.add(Kind::Entry { context_slots }, vec![]);

        self.lower_params(scope, params)?;

        for stmt in body {
            self.stmt(stmt)?;
        }

        if !self.hir.blocks[self.current].ended {
            let value = match self.last_value {
                Some(v) => v,
                None => self.add(Kind::Nil, vec![]),
            };
            self.end_with_return(value);
        }
        Ok(())
    }

    fn lower_params(
        &mut self,
        scope: usize,
        params: &[candor_ast::Param],
    ) -> Result<(), CompileError> {
        let vararg_pos = params.iter().position(|p| p.vararg);
        let mut vararg_instr = None;

        for (i, param) in params.iter().enumerate() {
            let value = match vararg_pos {
                Some(vp) if i == vp => {
                    let index = self.add(Kind::Literal(Literal::Int(vp as i64)), vec![]);
                    let va = self.add(Kind::LoadVarArg, vec![index]);
                    vararg_instr = Some((index, va));
                    va
                }
                Some(vp) if i > vp => {
                    // Arguments past the rest parameter sit after the
                    // vararg array on the stack.
                    let (vp_index, va) = vararg_instr.expect("vararg lowered first");
                    let base = if i - vp == 1 {
                        vp_index
                    } else {
                        self.add(
                            Kind::Literal(Literal::Int((vp + (i - vp - 1)) as i64)),
                            vec![],
                        )
                    };
                    let size = self.add(Kind::Sizeof, vec![va]);
                    let index = self.add(Kind::BinOp(BinOp::Add), vec![base, size]);
                    self.add(Kind::LoadArg, vec![index])
                }
                _ => {
                    let index = self.add(Kind::Literal(Literal::Int(i as i64)), vec![]);
                    self.add(Kind::LoadArg, vec![index])
                }
            };

            match self.analysis.resolve(scope, &param.name) {
                Resolution::Stack => {
                    self.env.insert(param.name.clone(), value);
                }
                Resolution::Context { depth, index } => {
                    self.add(
                        Kind::StoreContext {
                            depth: depth as i32,
                            index,
                        },
                        vec![value],
                    );
                }
                Resolution::Global => {
                    return Err(CompileError::IncorrectLhs {
                        offset: param.span.start,
                    })
                }
            }
        }
        Ok(())
    }

    // --- Statements ---

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(e) => {
                let value = self.expr(e)?;
                self.last_value = Some(value);
            }
            Stmt::Return(s) => {
                let value = match &s.value {
                    Some(e) => self.expr(e)?,
                    None => self.add(Kind::Nil, vec![]),
                };
                self.end_with_return(value);
            }
            Stmt::If(s) => self.lower_if(s)?,
            Stmt::While(s) => self.lower_while(s)?,
            Stmt::Break(span) => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.after)
                    .ok_or(CompileError::ExpectedLoop { offset: span.start })?;
                self.end_with_goto(target);
            }
            Stmt::Continue(span) => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.header)
                    .ok_or(CompileError::ExpectedLoop { offset: span.start })?;
                self.end_with_goto(target);
            }
        }
        Ok(())
    }

    fn lower_if(&mut self, s: &candor_ast::IfStmt) -> Result<(), CompileError> {
        let cond = self.expr(&s.cond)?;
        let base_env = self.env.clone();

        let then_b = self.new_block();
        let else_b = self.new_block();
        self.end_with_if(cond, then_b, else_b);

        // Then branch
        self.current = then_b;
        self.env = base_env.clone();
        for stmt in &s.then_body {
            self.stmt(stmt)?;
        }
        let then_end = self.current;
        let then_ended = self.hir.blocks[then_end].ended;
        let then_env = self.env.clone();

        // Else branch
        self.current = else_b;
        self.env = base_env.clone();
        if let Some(else_body) = &s.else_body {
            for stmt in else_body {
                self.stmt(stmt)?;
            }
        }
        let else_end = self.current;
        let else_ended = self.hir.blocks[else_end].ended;
        let else_env = self.env.clone();

        // Join
        let join = self.new_block();
        if !then_ended {
            self.current = then_end;
            self.end_with_goto(join);
        }
        if !else_ended {
            self.current = else_end;
            self.end_with_goto(join);
        }
        self.current = join;
        self.env = base_env;

        if !then_ended && !else_ended {
            self.merge_envs(&then_env, &else_env);
        } else if !then_ended {
            self.env = then_env;
        } else if !else_ended {
            self.env = else_env;
        }
        Ok(())
    }

    /// Insert binary phis for variables whose SSA value differs
    /// between the two fall-through predecessors.
    fn merge_envs(&mut self, left: &Env, right: &Env) {
        let mut names: Vec<&String> = left.keys().collect();
        for name in right.keys() {
            if !left.contains_key(name) {
                names.push(name);
            }
        }

        for name in names {
            let l = left.get(name).copied();
            let r = right.get(name).copied();
            match (l, r) {
                (Some(l), Some(r)) if l == r => {
                    self.env.insert(name.clone(), l);
                }
                (l, r) => {
                    let l = match l {
                        Some(v) => v,
                        None => self.add(Kind::Nil, vec![]),
                    };
                    let r = match r {
                        Some(v) => v,
                        None => self.add(Kind::Nil, vec![]),
                    };
                    let phi = self.add(Kind::Phi, vec![l, r]);
                    self.env.insert(name.clone(), phi);
                }
            }
        }
    }

    fn lower_while(&mut self, s: &candor_ast::WhileStmt) -> Result<(), CompileError> {
        let header = self.new_block();
        self.hir.blocks[header].is_loop = true;
        self.end_with_goto(header);

        // Loop phis for every live variable; second inputs are filled
        // after the body is lowered.
        self.current = header;
        let entry_env = self.env.clone();
        let mut phis: Vec<(String, InstrId)> = Vec::new();
        for (name, &value) in &entry_env {
            let phi = self.add(Kind::Phi, vec![value]);
            phis.push((name.clone(), phi));
        }
        for (name, phi) in &phis {
            self.env.insert(name.clone(), *phi);
        }

        let cond = self.expr(&s.cond)?;
        let cond_env = self.env.clone();

        let body_b = self.new_block();
        let after = self.new_block();
        self.end_with_if(cond, body_b, after);

        self.current = body_b;
        self.env = cond_env.clone();
        self.loops.push(LoopInfo { header, after });
        for stmt in &s.body {
            self.stmt(stmt)?;
        }
        self.loops.pop();

        let body_ended = self.hir.blocks[self.current].ended;
        let back_env = self.env.clone();
        if !body_ended {
            self.end_with_goto(header);
        }

        self.current = after;
        self.env = cond_env;

        // Fill or prune the loop phis.
        for (name, phi) in phis {
            let incoming = if body_ended {
                None
            } else {
                back_env.get(&name).copied()
            };
            match incoming {
                Some(v) if v != phi && Some(v) != self.hir.instrs[phi].args.first().copied() => {
                    self.hir.instrs[phi].args.push(v);
                    self.hir.instrs[v].uses.push(phi);
                }
                _ => {
                    // Degenerate phi: forward the entry value.
                    let entry = self.hir.instrs[phi].args[0];
                    self.hir.instrs[phi].removed = true;
                    self.replace_uses(phi, entry);
                    if self.hir.instrs[phi].args.is_empty() {
                        self.hir.instrs[phi].kind = Kind::Nil;
                    }
                }
            }
        }
        Ok(())
    }

    // --- Expressions ---

    fn offset(e: &Expr) -> Option<u32> {
        Some(e.span().start as u32)
    }

    fn expr(&mut self, e: &Expr) -> Result<InstrId, CompileError> {
        match e {
            Expr::Nil(_) => Ok(self.add(Kind::Nil, vec![])),
            Expr::True(_) => Ok(self.add(Kind::Literal(Literal::True), vec![])),
            Expr::False(_) => Ok(self.add(Kind::Literal(Literal::False), vec![])),
            Expr::Number { value, .. } => {
                let lit = parse_number(value);
                Ok(self.add_at(Kind::Literal(lit), vec![], Self::offset(e)))
            }
            Expr::Str { value, .. } => Ok(self.add_at(
                Kind::Literal(Literal::Str(value.clone())),
                vec![],
                Self::offset(e),
            )),
            Expr::Ident { sym, span } => self.load_name(sym, span.start),
            Expr::Assign { target, value, .. } => self.lower_assign(target, value),
            Expr::Binary { op, lhs, rhs, .. } => self.lower_binary(*op, lhs, rhs, Self::offset(e)),
            Expr::Unary { op, expr, span } => self.lower_unary(*op, expr, span.start),
            Expr::Member { obj, prop, .. } => {
                let obj = self.expr(obj)?;
                let key = self.expr(prop)?;
                Ok(self.add_at(Kind::LoadProperty, vec![obj, key], Self::offset(e)))
            }
            Expr::Call {
                callee,
                args,
                colon,
                span,
            } => self.lower_call(callee, args, *colon, span.start),
            Expr::VarArg { span, .. } => {
                // A spread outside call arguments has nothing to bind
                // to.
                Err(CompileError::IncorrectLhs { offset: span.start })
            }
            Expr::ObjectLit { entries, .. } => {
                let obj = self.add_at(Kind::AllocateObject, vec![], Self::offset(e));
                for (key, value) in entries {
                    let value = self.expr(value)?;
                    let key = self.property_key(key);
                    self.add(Kind::StoreProperty, vec![obj, key, value]);
                }
                Ok(obj)
            }
            Expr::ArrayLit { elements, .. } => {
                let arr = self.add_at(Kind::AllocateArray, vec![], Self::offset(e));
                for (i, element) in elements.iter().enumerate() {
                    let key = self.add(Kind::Literal(Literal::Int(i as i64)), vec![]);
                    let value = self.expr(element)?;
                    self.add(Kind::StoreProperty, vec![arr, key, value]);
                }
                Ok(arr)
            }
            Expr::Function {
                name,
                params,
                body,
                span,
            } => {
                let block = self.new_block();
                let scope = self
                    .analysis
                    .scope_id((span.start, span.end))
                    .expect("function scope collected");
                let func = self.add_at(
                    Kind::Function {
                        body: block,
                        argc: params.len() as u32,
                    },
                    vec![],
                    Self::offset(e),
                );
                self.pending.push_back(PendingFunction {
                    block,
                    scope,
                    params: params.clone(),
                    body: body.clone(),
                });
                if let Some(name) = name {
                    self.assign_name(name, func, span.start)?;
                }
                Ok(func)
            }
            Expr::Delete { member, span } => {
                let (obj, key) = match member.as_ref() {
                    Expr::Member { obj, prop, .. } => {
                        let obj = self.expr(obj)?;
                        let key = self.expr(prop)?;
                        (obj, key)
                    }
                    _ => return Err(CompileError::IncorrectLhs { offset: span.start }),
                };
                self.add(Kind::DeleteProperty, vec![obj, key]);
                Ok(self.add(Kind::Nil, vec![]))
            }
            Expr::Typeof { expr, .. } => {
                let v = self.expr(expr)?;
                Ok(self.add(Kind::Typeof, vec![v]))
            }
            Expr::Sizeof { expr, .. } => {
                let v = self.expr(expr)?;
                Ok(self.add(Kind::Sizeof, vec![v]))
            }
            Expr::Keysof { expr, .. } => {
                let v = self.expr(expr)?;
                Ok(self.add(Kind::Keysof, vec![v]))
            }
            Expr::Clone { expr, .. } => {
                let v = self.expr(expr)?;
                Ok(self.add(Kind::Clone, vec![v]))
            }
        }
    }

    fn property_key(&mut self, key: &PropertyKey) -> InstrId {
        let lit = match key {
            PropertyKey::Ident(s, _) | PropertyKey::Str(s, _) => Literal::Str(s.clone()),
            PropertyKey::Number(n, _) => parse_number(n),
        };
        self.add(Kind::Literal(lit), vec![])
    }

    fn load_name(&mut self, name: &str, offset: usize) -> Result<InstrId, CompileError> {
        let _ = offset;
        match self.analysis.resolve(self.scope, name) {
            Resolution::Stack => match self.env.get(name) {
                Some(&value) => Ok(value),
                None => Ok(self.add(Kind::Nil, vec![])),
            },
            Resolution::Context { depth, index } => Ok(self.add(
                Kind::LoadContext {
                    depth: depth as i32,
                    index,
                },
                vec![],
            )),
            Resolution::Global => Ok(self.add(
                Kind::LoadContext {
                    depth: -1,
                    index: 0,
                },
                vec![],
            )),
        }
    }

    fn assign_name(
        &mut self,
        name: &str,
        value: InstrId,
        offset: usize,
    ) -> Result<(), CompileError> {
        match self.analysis.resolve(self.scope, name) {
            Resolution::Stack => {
                self.env.insert(name.to_string(), value);
                Ok(())
            }
            Resolution::Context { depth, index } => {
                self.add(
                    Kind::StoreContext {
                        depth: depth as i32,
                        index,
                    },
                    vec![value],
                );
                Ok(())
            }
            Resolution::Global => Err(CompileError::IncorrectLhs { offset }),
        }
    }

    fn lower_assign(&mut self, target: &Expr, value: &Expr) -> Result<InstrId, CompileError> {
        match target {
            Expr::Ident { sym, span } => {
                let value = self.expr(value)?;
                self.assign_name(sym, value, span.start)?;
                Ok(value)
            }
            Expr::Member { obj, prop, .. } => {
                let obj = self.expr(obj)?;
                let value = self.expr(value)?;
                let key = self.expr(prop)?;
                self.add(Kind::StoreProperty, vec![obj, key, value]);
                Ok(value)
            }
            other => Err(CompileError::IncorrectLhs {
                offset: other.span().start,
            }),
        }
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        offset: Option<u32>,
    ) -> Result<InstrId, CompileError> {
        if op.is_bool_logic() {
            return self.lower_short_circuit(op, lhs, rhs);
        }
        let lhs = self.expr(lhs)?;
        let rhs = self.expr(rhs)?;
        Ok(self.add_at(Kind::BinOp(op), vec![lhs, rhs], offset))
    }

    /// `&&` / `||` lower to an If selecting between the raw LHS and
    /// the evaluated RHS, joined by a phi.
    fn lower_short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<InstrId, CompileError> {
        let lhs = self.expr(lhs)?;
        let base_env = self.env.clone();

        let rhs_b = self.new_block();
        let skip_b = self.new_block();
        match op {
            BinOp::LAnd => self.end_with_if(lhs, rhs_b, skip_b),
            _ => self.end_with_if(lhs, skip_b, rhs_b),
        }

        self.current = rhs_b;
        self.env = base_env.clone();
        let rhs = self.expr(rhs)?;
        let rhs_end = self.current;
        let rhs_env = self.env.clone();

        let join = self.new_block();
        self.current = rhs_end;
        self.end_with_goto(join);
        self.current = skip_b;
        self.end_with_goto(join);

        self.current = join;
        self.env = base_env;
        // Variables assigned while evaluating the RHS merge at the
        // join as usual.
        let skip_env = self.env.clone();
        self.merge_envs(&rhs_env, &skip_env);

        // Inputs follow predecessor order: the RHS block linked
        // first, the skip edge second.
        Ok(self.add(Kind::Phi, vec![rhs, lhs]))
    }

    fn lower_unary(
        &mut self,
        op: UnOp,
        inner: &Expr,
        offset: usize,
    ) -> Result<InstrId, CompileError> {
        match op {
            UnOp::Not => {
                let v = self.expr(inner)?;
                Ok(self.add(Kind::Not, vec![v]))
            }
            UnOp::Plus | UnOp::Minus => {
                let zero = self.add(Kind::Literal(Literal::Int(0)), vec![]);
                let v = self.expr(inner)?;
                let op = if op == UnOp::Plus {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                Ok(self.add(Kind::BinOp(op), vec![zero, v]))
            }
            UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec => {
                let old = self.expr(inner)?;
                let one = self.add(Kind::Literal(Literal::Int(1)), vec![]);
                let bin = if matches!(op, UnOp::PreInc | UnOp::PostInc) {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                let new = self.add(Kind::BinOp(bin), vec![old, one]);
                match inner {
                    Expr::Ident { sym, span } => self.assign_name(sym, new, span.start)?,
                    Expr::Member { obj, prop, .. } => {
                        let obj = self.expr(obj)?;
                        let key = self.expr(prop)?;
                        self.add(Kind::StoreProperty, vec![obj, key, new]);
                    }
                    _ => return Err(CompileError::IncorrectLhs { offset }),
                }
                Ok(if matches!(op, UnOp::PostInc | UnOp::PostDec) {
                    old
                } else {
                    new
                })
            }
        }
    }

    fn lower_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        colon: bool,
        offset: usize,
    ) -> Result<InstrId, CompileError> {
        // Runtime intrinsics keep their magic names.
        if let Expr::Ident { sym, .. } = callee {
            if sym == "__$gc" && args.is_empty() {
                self.add(Kind::CollectGarbage, vec![]);
                return Ok(self.add(Kind::Nil, vec![]));
            }
            if sym == "__$trace" && args.is_empty() {
                return Ok(self.add(Kind::GetStackTrace, vec![]));
            }
        }

        // Evaluate arguments left to right, buffering the stores so
        // they can be appended after the stack has been aligned.
        let mut stores: Vec<InstrId> = Vec::new();
        let mut plain_count = 0i64;
        let mut vararg_sizes: Vec<InstrId> = Vec::new();

        for arg in args {
            match arg {
                Expr::VarArg { expr, .. } => {
                    let value = self.expr(expr)?;
                    let store = self.create(Kind::StoreVarArg, vec![value], None);
                    stores.push(store);
                    vararg_sizes.push(value);
                }
                _ => {
                    let value = self.expr(arg)?;
                    let store = self.create(Kind::StoreArg, vec![value], None);
                    stores.push(store);
                }
            }
        }

        if colon {
            plain_count += 1;
        }
        plain_count += (args.len() - vararg_sizes.len()) as i64;

        let mut argc = self.add(Kind::Literal(Literal::Int(plain_count)), vec![]);
        for va in &vararg_sizes {
            let size = self.add(Kind::Sizeof, vec![*va]);
            argc = self.add(Kind::BinOp(BinOp::Add), vec![argc, size]);
        }

        // Resolve the callee; colon calls pass the receiver as a
        // trailing self argument.
        let fn_instr = if colon {
            let (obj, prop) = match callee {
                Expr::Member {
                    obj,
                    prop,
                    computed: false,
                    ..
                } => (obj, prop),
                _ => return Err(CompileError::CallWithoutVariable { offset }),
            };
            let receiver = match obj.as_ref() {
                Expr::Ident { sym, span } => self.load_name(sym, span.start)?,
                _ => return Err(CompileError::CallWithoutVariable { offset }),
            };
            let store = self.create(Kind::StoreArg, vec![receiver], None);
            stores.push(store);

            let key = self.expr(prop)?;
            self.add_at(Kind::LoadProperty, vec![receiver, key], Some(offset as u32))
        } else {
            self.expr(callee)?
        };

        self.add(Kind::AlignStack, vec![argc]);
        for &store in stores.iter().rev() {
            self.append(store);
        }

        Ok(self.add_at(Kind::Call, vec![fn_instr, argc], Some(offset as u32)))
    }
}

fn parse_number(text: &str) -> Literal {
    if let Ok(v) = text.parse::<i64>() {
        Literal::Int(v)
    } else {
        Literal::Double(text.parse::<f64>().unwrap_or(f64::NAN))
    }
}
