//! Stub emission tests over the recording assembler.

use candorc::masm::{HeapRefs, Masm, RecordingAssembler, StubKind};
use candorc::stubs::generate_stub;

fn emit(kind: StubKind) -> Vec<String> {
    let mut asm = RecordingAssembler::new();
    let mut masm = Masm::new(&mut asm, HeapRefs::for_testing());
    generate_stub(&mut masm, kind);
    asm.lines
}

fn text(kind: StubKind) -> String {
    emit(kind).join("\n")
}

const ALL_STUBS: &[StubKind] = &[
    StubKind::Entry,
    StubKind::Allocate,
    StubKind::AllocateFunction,
    StubKind::AllocateObject,
    StubKind::CallBinding,
    StubKind::CollectGarbage,
    StubKind::CoerceToBoolean,
    StubKind::Typeof,
    StubKind::Sizeof,
    StubKind::Keysof,
    StubKind::LookupProperty,
    StubKind::CloneObject,
    StubKind::DeleteProperty,
    StubKind::HashValue,
    StubKind::StackTrace,
    StubKind::Binary(candor_ast::BinOp::Add),
    StubKind::Binary(candor_ast::BinOp::Div),
    StubKind::Binary(candor_ast::BinOp::Lt),
    StubKind::Binary(candor_ast::BinOp::LAnd),
];

#[test]
fn every_stub_has_standard_prologue_and_epilogue() {
    for &kind in ALL_STUBS {
        let lines = emit(kind);
        // StackTrace snapshots the caller's fp first; everything else
        // opens with the frame push.
        let prologue_at = lines
            .iter()
            .position(|l| l == "push fp")
            .unwrap_or(usize::MAX);
        assert!(
            prologue_at <= 1,
            "{:?} should start with the standard prologue, got {:?}",
            kind,
            &lines[..3.min(lines.len())]
        );
        assert_eq!(
            lines[prologue_at + 1], "mov fp, sp",
            "{:?} prologue shape",
            kind
        );

        let n = lines.len();
        assert!(lines[n - 1].starts_with("ret "), "{:?} ends with ret", kind);
        assert_eq!(lines[n - 2], "pop fp", "{:?} epilogue shape", kind);
        assert_eq!(lines[n - 3], "mov sp, fp", "{:?} epilogue shape", kind);
    }
}

#[test]
fn allocate_stub_uses_double_indirection() {
    let text = text(StubKind::Allocate);
    // top is a pointer to the page's top pointer.
    assert!(
        text.contains("mov scratch, [scratch+0]\nmov r0, [scratch+0]"),
        "fast path loads top through two dereferences:\n{}",
        text
    );
    // Fallback into the host allocator.
    assert!(text.contains("call runtime:Allocate"), "{}", text);
    // The new top keeps the tag bit.
    assert!(text.contains("or r1, 0x1"), "{}", text);
}

#[test]
fn allocate_function_checks_gc_after_allocation() {
    let lines = emit(StubKind::AllocateFunction);
    let alloc = lines
        .iter()
        .position(|l| l == "call stub:Allocate")
        .expect("allocates through the allocate stub");
    let gc = lines
        .iter()
        .position(|l| l == "call stub:CollectGarbage")
        .expect("stub call site is followed by a GC check");
    assert!(gc > alloc, "CheckGC comes after the allocation");
}

#[test]
fn entry_stub_plants_frame_sentinel() {
    let text = text(StubKind::Entry);
    assert!(
        text.contains("push 0xfeedbeee"),
        "enter-frame sentinel pushed:\n{}",
        text
    );
    // Odd argc pads with one nil for two-word alignment.
    assert!(text.contains("push 0x1"), "nil padding:\n{}", text);
    // The call goes through the function's code pointer.
    assert!(
        text.contains(&format!(
            "call [scratch+{}]",
            candor_runtime::value::function::CODE_OFFSET
        )),
        "{}",
        text
    );
}

#[test]
fn binop_add_has_fast_path_and_runtime_fallback() {
    let text = text(StubKind::Binary(candor_ast::BinOp::Add));
    assert!(text.contains("add r0, r1"), "unboxed fast path:\n{}", text);
    assert!(
        text.contains("jnooverflow"),
        "overflow guard on the fast path:\n{}",
        text
    );
    assert!(
        text.contains("call runtime:BinOp"),
        "boxed fallback:\n{}",
        text
    );
}

#[test]
fn binop_div_always_defers_to_runtime() {
    let text = text(StubKind::Binary(candor_ast::BinOp::Div));
    assert!(!text.contains("add r0, r1"));
    assert!(text.contains("call runtime:BinOp"), "{}", text);
}

#[test]
fn binop_logic_defers_to_runtime() {
    // && and || always go through the runtime.
    let text = text(StubKind::Binary(candor_ast::BinOp::LAnd));
    assert!(!text.contains("cmp r0, r1"));
    assert!(text.contains("call runtime:BinOp"), "{}", text);
}

#[test]
fn comparison_yields_canonical_booleans() {
    let text = text(StubKind::Binary(candor_ast::BinOp::Lt));
    assert!(text.contains("cmp r0, r1"), "{}", text);
    // True/False loaded from the root context.
    assert!(text.contains("[root+"), "{}", text);
}

#[test]
fn lookup_property_probes_with_mask() {
    let text = text(StubKind::LookupProperty);
    // hash & mask + space offset
    assert!(text.contains("and r3, scratch"), "{}", text);
    assert!(
        text.contains(&format!("add r3, {:#x}", candor_runtime::value::map::SPACE_OFFSET)),
        "{}",
        text
    );
    assert!(text.contains("call runtime:LookupProperty"), "{}", text);
    assert!(text.contains("call stub:HashValue"), "{}", text);
}

#[test]
fn collect_garbage_stub_passes_stack_top() {
    let lines = emit(StubKind::CollectGarbage);
    let call = lines
        .iter()
        .position(|l| l == "call runtime:CollectGarbage")
        .expect("calls the runtime collector");
    assert!(
        lines[..call].iter().any(|l| l == "push sp"),
        "stack top is the second argument: {:?}",
        lines
    );
    // All allocatable registers are saved so the stack walk sees
    // them.
    for i in 0..candorc::lir::LIR_REGISTER_COUNT {
        assert!(
            lines[..call].iter().any(|l| l == &format!("push r{}", i)),
            "r{} saved before collection",
            i
        );
    }
}
