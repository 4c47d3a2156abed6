//! End-to-end emission tests: source through the full pipeline into
//! the recording assembler.

use candorc::masm::{HeapRefs, RecordingAssembler};
use candorc::CompileOptions;

fn compile(src: &str) -> (RecordingAssembler, candorc::CompiledModule) {
    let mut asm = RecordingAssembler::new();
    let module = candorc::compile(src, &mut asm, HeapRefs::for_testing(), &CompileOptions::default())
        .expect("source compiles");
    (asm, module)
}

#[test]
fn addition_goes_through_the_binary_stub() {
    let (asm, module) = compile("return 1 + 2");
    let text = asm.text();
    assert!(text.contains("call stub:Binary(Add)"), "{}", text);
    assert_eq!(module.functions.len(), 1);
}

#[test]
fn function_prologue_saves_argc() {
    let (asm, _) = compile("return 1");
    let text = asm.text();
    // push fp; mov fp, sp; spill allocation; argc spilled to
    // [fp - 2W].
    let word = candor_runtime::POINTER_SIZE as i32;
    assert!(
        text.contains(&format!("mov [fp-{}], r0", 2 * word)),
        "argc saved in the prologue:\n{}",
        text
    );
}

#[test]
fn returns_restore_the_frame() {
    let (asm, _) = compile("return 1");
    let text = asm.text();
    assert!(text.contains("mov sp, fp\npop fp\nret 0"), "{}", text);
}

#[test]
fn captured_variables_allocate_a_context() {
    let (asm, _) = compile("a = 1\nf() { return a }\nreturn f()");
    let text = asm.text();
    // The module prologue allocates the context through the allocate
    // stub and chains it to the caller's.
    assert!(text.contains("call stub:Allocate"), "{}", text);
    assert!(text.contains("mov ctx, r1"), "{}", text);
}

#[test]
fn calls_align_and_unwind_the_stack() {
    let (asm, _) = compile("f(a) { return a }\nreturn f(1)");
    let text = asm.text();
    // AlignStack pads odd argc with nil.
    assert!(text.contains("test"), "{}", text);
    // The callee's code pointer is loaded from the function object.
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
fn source_map_entries_are_sorted() {
    let (_, module) = compile("a = 1\nb = a + 2\nreturn b");
    assert!(!module.source_map.is_empty());
    // Lookups resolve to byte offsets inside the source.
    assert!(module.source_map.lookup(u32::MAX).is_some());
}

#[test]
fn literals_are_interned_in_order() {
    let (_, module) = compile("a = 'hello'\nb = 'world'\nreturn a");
    let slots: Vec<usize> = module.literals.iter().map(|(_, slot, _)| *slot).collect();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0], candor_runtime::heap::root::SLOT_COUNT);
    assert_eq!(slots[1], candor_runtime::heap::root::SLOT_COUNT + 1);
}

#[test]
fn every_function_gets_an_entry_label() {
    let (_, module) = compile("f() { return 1 }\ng() { return 2 }\nreturn f() + g()");
    assert_eq!(module.functions.len(), 3);
    let mut offsets: Vec<u32> = module.functions.iter().map(|f| f.2).collect();
    let sorted = offsets.clone();
    offsets.sort_unstable();
    assert_eq!(offsets, sorted, "functions are emitted in order");
}

#[test]
fn nil_is_the_tagged_singleton() {
    let (asm, _) = compile("return nil");
    let text = asm.text();
    assert!(text.contains("0x1"), "{}", text);
}
