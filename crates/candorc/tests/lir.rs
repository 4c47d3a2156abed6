//! Register allocation tests: structural invariants of the allocated
//! LIR over a spread of programs.

mod common;

use std::collections::HashMap;

use common::hir_for;

use candorc::lir::{LGen, LKind, Location, UseKind, LIR_REGISTER_COUNT};

const SOURCES: &[&str] = &[
    "return 1 + 2",
    "a = 1\nb = 2\nc = a + b\nreturn c * b + a",
    "a = { x: 1, y: 2 }\nreturn a.x + a.y",
    "i = 10\ns = 0\nwhile (--i) {\n  s = s + i\n}\nreturn s",
    "f(a, b) { return a + b }\nreturn f(1, 2)",
    "if (1 < 2) {\n  a = 1\n} else {\n  a = 2\n}\nreturn a",
    "fn(a, b..., c) { return a + b[0] + c }\nreturn fn(1, 2, [3,4]...)",
    "a = [1, 2, 3]\nreturn sizeof a",
];

fn each_function(src: &str, mut check: impl FnMut(&LGen)) {
    let hir = hir_for(src).expect("source compiles");
    for &entry in &hir.entries {
        let gen = LGen::new(&hir, entry);
        check(&gen);
    }
}

#[test]
fn instruction_ids_are_even_and_increasing() {
    for src in SOURCES {
        each_function(src, |gen| {
            let mut last = -1;
            for &i in &gen.stream {
                let id = gen.instrs[i].id;
                assert!(id > last, "ids must increase: {} after {}", id, last);
                if gen.instrs[i].kind == LKind::Gap {
                    assert_eq!(id % 2, 1, "gaps sit on odd positions");
                } else {
                    assert_eq!(id % 2, 0, "instructions sit on even positions");
                }
                last = id;
            }
        });
    }
}

#[test]
fn register_uses_are_allocated() {
    for src in SOURCES {
        each_function(src, |gen| {
            for use_ in &gen.uses {
                if use_.kind == UseKind::Register {
                    let interval = &gen.intervals[use_.interval];
                    assert!(
                        matches!(interval.location, Location::Register(_)),
                        "register-typed use at instruction {} has {:?} (source {:?})",
                        gen.instrs[use_.instr].id,
                        interval.location,
                        src
                    );
                }
            }
        });
    }
}

#[test]
fn no_register_is_assigned_twice_at_any_position() {
    for src in SOURCES {
        each_function(src, |gen| {
            let max_pos = gen
                .stream
                .iter()
                .map(|&i| gen.instrs[i].id)
                .max()
                .unwrap_or(0);

            for pos in 0..=max_pos {
                let mut occupants: HashMap<usize, usize> = HashMap::new();
                for (id, interval) in gen.intervals.iter().enumerate() {
                    let reg = match interval.location {
                        Location::Register(r) => r,
                        _ => continue,
                    };
                    if !gen.covers(id, pos) {
                        continue;
                    }
                    if let Some(&other) = occupants.get(&reg) {
                        panic!(
                            "register r{} held by intervals {} and {} at {} (source {:?})",
                            reg, other, id, pos, src
                        );
                    }
                    occupants.insert(reg, id);
                }
                assert!(occupants.len() <= LIR_REGISTER_COUNT);
            }
        });
    }
}

#[test]
fn spill_slots_do_not_overlap() {
    for src in SOURCES {
        each_function(src, |gen| {
            let spills: Vec<usize> = (0..gen.intervals.len())
                .filter(|&i| matches!(gen.intervals[i].location, Location::Spill(Some(_))))
                .collect();

            for (a_pos, &a) in spills.iter().enumerate() {
                for &b in &spills[a_pos + 1..] {
                    if gen.intervals[a].spill_index() != gen.intervals[b].spill_index() {
                        continue;
                    }
                    assert!(
                        gen.find_intersection(a, b).is_none(),
                        "spill slot {:?} shared by intersecting intervals {} and {}",
                        gen.intervals[a].spill_index(),
                        a,
                        b
                    );
                }
            }
        });
    }
}

#[test]
fn split_children_partition_the_parent() {
    for src in SOURCES {
        each_function(src, |gen| {
            for (id, interval) in gen.intervals.iter().enumerate() {
                for &child in &interval.split_children {
                    assert_eq!(gen.intervals[child].split_parent, Some(id));
                    // Child ranges start at or after the parent's end.
                    assert!(
                        gen.intervals[child].start() >= gen.intervals[id].end(),
                        "split child {} overlaps parent {}",
                        child,
                        id
                    );
                }
            }
        });
    }
}

#[test]
fn adjacent_goto_is_removed() {
    // Straight-line control flow needs no jumps between consecutive
    // blocks.
    let hir = hir_for("if (1) {\n  a = 1\n} else {\n  a = 2\n}\nreturn a").unwrap();
    let gen = LGen::new(&hir, hir.entries[0]);
    let gotos = gen
        .stream
        .iter()
        .filter(|&&i| gen.instrs[i].kind == LKind::Goto)
        .count();
    // Of the three forward edges (then, else, fall-through), at least
    // the one onto the next block in emission order is elided.
    assert!(gotos < 3, "expected at least one goto to be elided");
}

#[test]
fn calls_keep_no_virtual_in_registers_across_them() {
    // Every interval allocated a register must not cover a call
    // position unless it is the call's own fixed interval.
    for src in SOURCES {
        each_function(src, |gen| {
            for &i in &gen.stream {
                if !gen.instrs[i].has_call {
                    continue;
                }
                let pos = gen.instrs[i].id;
                for (id, interval) in gen.intervals.iter().enumerate() {
                    if interval.fixed || !interval.is_register() {
                        continue;
                    }
                    // A virtual interval holding a register across a
                    // call would be clobbered.
                    assert!(
                        !(gen.covers(id, pos) && gen.covers(id, pos + 1)),
                        "interval {} keeps a register across call at {} (source {:?})",
                        id,
                        pos,
                        src
                    );
                }
            }
        });
    }
}
