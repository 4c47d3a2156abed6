//! Candor compiler core.
//!
//! Lowers an AST through SSA HIR, then to LIR with linear-scan
//! register allocation, then to native code through an abstract macro
//! assembler. The pipeline is strictly one-directional:
//!
//! ```text
//! AST -> HIR -> LIR -> machine code
//! ```
//!
//! The lexer/parser (`candor_parser`), the platform assembler (an
//! implementation of [`masm::Assembler`]) and the heap
//! (`candor_runtime`) are collaborators; this crate owns everything
//! in between.

pub mod codegen;
pub mod diagnostics;
pub mod hir;
pub mod lir;
pub mod masm;
pub mod scope;
pub mod stubs;

use std::collections::HashMap;
use std::fmt;

use candor_runtime::heap::root;
use candor_runtime::SourceMap;

use crate::codegen::{Codegen, CodegenCtx};
use crate::hir::{Hir, InstrId, Kind, Literal};
use crate::lir::LGen;
use crate::masm::{Assembler, HeapRefs, Label, Masm, StubKind};

/// Compile-time errors; the closed taxonomy surfaced through
/// `pending_exception` at runtime boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Assignment target is not an lvalue.
    IncorrectLhs { offset: usize },
    /// Method call without a receiver variable.
    CallWithoutVariable { offset: usize },
    /// `break`/`continue` outside a loop.
    ExpectedLoop { offset: usize },
    /// Lexer/parser failure.
    Parse { message: String },
}

impl CompileError {
    pub fn offset(&self) -> Option<usize> {
        match self {
            CompileError::IncorrectLhs { offset }
            | CompileError::CallWithoutVariable { offset }
            | CompileError::ExpectedLoop { offset } => Some(*offset),
            CompileError::Parse { .. } => None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::IncorrectLhs { .. } => write!(f, "incorrect lhs"),
            CompileError::CallWithoutVariable { .. } => {
                write!(f, "can't call method without a receiver variable")
            }
            CompileError::ExpectedLoop { .. } => {
                write!(f, "break/continue allowed only inside a loop")
            }
            CompileError::Parse { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Compilation options, separated from CLI argument parsing.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Path of the source, for diagnostics only.
    pub file: Option<String>,
    pub print_hir: bool,
    pub print_lir: bool,
    pub print_asm: bool,
}

/// Parse source into an AST module, reporting diagnostics on
/// failure.
pub fn parse(source: &str, options: &CompileOptions) -> anyhow::Result<candor_ast::Module> {
    match candor_parser::parse_module(source) {
        Ok(module) => Ok(module),
        Err(errors) => {
            let offset = errors.first().map(|e| e.span().start);
            let message = errors
                .first()
                .map(|e| format!("{:?}", e))
                .unwrap_or_else(|| "parse error".to_string());
            diagnostics::report_error(options.file.as_deref(), Some(source), offset, &message);
            Err(CompileError::Parse { message }.into())
        }
    }
}

/// Build SSA HIR for a module, reporting diagnostics on failure.
pub fn build_hir(source: &str, options: &CompileOptions) -> anyhow::Result<Hir> {
    let module = parse(source, options)?;
    match hir::build(&module) {
        Ok(hir) => Ok(hir),
        Err(err) => {
            diagnostics::report_error(
                options.file.as_deref(),
                Some(source),
                err.offset(),
                &err.to_string(),
            );
            Err(err.into())
        }
    }
}

/// Printed HIR of a module, in the `iN = Kind(...)` format.
pub fn print_hir(source: &str) -> anyhow::Result<String> {
    let hir = build_hir(source, &CompileOptions::default())?;
    Ok(hir.print())
}

/// The result of compiling a module through a macro assembler.
#[derive(Debug)]
pub struct CompiledModule {
    pub hir: Hir,
    /// Per-function entry: (HIR entry block, code label, code offset
    /// at emission).
    pub functions: Vec<(hir::BlockId, Label, u32)>,
    /// Literals to intern into the root context:
    /// HIR instruction -> (root slot, literal).
    pub literals: Vec<(InstrId, usize, Literal)>,
    pub source_map: SourceMap,
    /// Stub entry labels.
    pub stubs: HashMap<&'static str, Label>,
}

/// Interned string/double literals get root-context slots after the
/// fixed entries.
fn intern_literals(hir: &Hir) -> Vec<(InstrId, usize, Literal)> {
    let mut out = Vec::new();
    let mut next_slot = root::SLOT_COUNT;
    for (id, instr) in hir.instrs.iter().enumerate() {
        if instr.removed {
            continue;
        }
        if let Kind::Literal(lit @ (Literal::Str(_) | Literal::Double(_))) = &instr.kind {
            out.push((id, next_slot, lit.clone()));
            next_slot += 1;
        }
    }
    out
}

/// Compile a whole module: stubs first, then every function through
/// the LIR pipeline and the code generator.
pub fn compile<A: Assembler>(
    source: &str,
    asm: &mut A,
    heap_refs: HeapRefs,
    options: &CompileOptions,
) -> anyhow::Result<CompiledModule> {
    let hir = build_hir(source, options)?;

    if options.print_hir {
        println!("{}", hir.print());
    }

    let literals = intern_literals(&hir);

    let mut ctx = CodegenCtx::default();
    for (id, slot, _) in &literals {
        ctx.literal_slots.insert(*id, *slot);
    }
    for &entry in &hir.entries {
        let label = asm.new_label();
        ctx.fn_labels.insert(entry, label);
    }

    // Stubs are emitted once, ahead of any function.
    let mut stub_labels: HashMap<&'static str, Label> = HashMap::new();
    {
        let mut masm = Masm::new(asm, heap_refs);
        for (name, kind) in [
            ("entry", StubKind::Entry),
            ("allocate", StubKind::Allocate),
            ("allocate_function", StubKind::AllocateFunction),
            ("allocate_object", StubKind::AllocateObject),
            ("call_binding", StubKind::CallBinding),
            ("collect_garbage", StubKind::CollectGarbage),
            ("coerce_to_boolean", StubKind::CoerceToBoolean),
            ("typeof", StubKind::Typeof),
            ("sizeof", StubKind::Sizeof),
            ("keysof", StubKind::Keysof),
            ("lookup_property", StubKind::LookupProperty),
            ("clone_object", StubKind::CloneObject),
            ("delete_property", StubKind::DeleteProperty),
            ("hash_value", StubKind::HashValue),
            ("stack_trace", StubKind::StackTrace),
        ] {
            let label = masm.label();
            masm.bind(label);
            stub_labels.insert(name, label);
            stubs::generate_stub(&mut masm, kind);
        }
        for op in [
            candor_ast::BinOp::Add,
            candor_ast::BinOp::Sub,
            candor_ast::BinOp::Mul,
            candor_ast::BinOp::Div,
            candor_ast::BinOp::Mod,
            candor_ast::BinOp::BAnd,
            candor_ast::BinOp::BOr,
            candor_ast::BinOp::BXor,
            candor_ast::BinOp::Shl,
            candor_ast::BinOp::Shr,
            candor_ast::BinOp::UShr,
            candor_ast::BinOp::Eq,
            candor_ast::BinOp::StrictEq,
            candor_ast::BinOp::Ne,
            candor_ast::BinOp::StrictNe,
            candor_ast::BinOp::Lt,
            candor_ast::BinOp::Gt,
            candor_ast::BinOp::Le,
            candor_ast::BinOp::Ge,
            candor_ast::BinOp::LAnd,
            candor_ast::BinOp::LOr,
        ] {
            stubs::generate_stub(&mut masm, StubKind::Binary(op));
        }
    }

    let mut source_map = SourceMap::new();
    let mut functions = Vec::new();

    for &entry in &hir.entries {
        let gen = LGen::new(&hir, entry);

        if options.print_lir {
            println!("{}", gen.print());
        }

        let label = ctx.fn_labels[&entry];
        let offset = asm.offset();
        asm.bind(label);

        let mut masm = Masm::new(asm, heap_refs);
        Codegen::generate(&gen, &ctx, &mut masm, &mut source_map);

        functions.push((entry, label, offset));
    }

    Ok(CompiledModule {
        hir,
        functions,
        literals,
        source_map,
        stubs: stub_labels,
    })
}
