//! Parallel-move resolution for gaps.
//!
//! A gap is a set of simultaneous moves `{dst_i <- src_i}` inserted
//! between two instructions. Emission must linearise them without
//! clobbering: a move is safe once nothing still reads its
//! destination, and cycles (`a<-b, b<-a`) are broken through the
//! gap's own scratch spill slot — one temporary per cycle, no extra
//! allocation.

/// A resolved move endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveLoc {
    Register(usize),
    Spill(i32),
}

/// Order `pairs` into an executable move sequence, using `scratch`
/// to break cycles.
pub fn resolve_parallel_moves(
    pairs: &[(MoveLoc, MoveLoc)],
    scratch: MoveLoc,
) -> Vec<(MoveLoc, MoveLoc)> {
    let mut pending: Vec<(MoveLoc, MoveLoc)> = pairs
        .iter()
        .copied()
        .filter(|(src, dst)| src != dst)
        .collect();
    let mut out = Vec::with_capacity(pending.len() + 1);

    while !pending.is_empty() {
        // Emit every move whose destination nobody still reads.
        let safe = pending
            .iter()
            .position(|&(_, dst)| !pending.iter().any(|&(src, _)| src == dst));

        match safe {
            Some(index) => {
                let mv = pending.remove(index);
                out.push(mv);
            }
            None => {
                // Every remaining move is part of a cycle: park one
                // source in the scratch slot and retarget its
                // readers.
                let (src, _) = pending[0];
                out.push((src, scratch));
                for mv in &mut pending {
                    if mv.0 == src {
                        mv.0 = scratch;
                    }
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRATCH: MoveLoc = MoveLoc::Spill(99);

    fn apply(moves: &[(MoveLoc, MoveLoc)], state: &mut std::collections::HashMap<MoveLoc, i32>) {
        for &(src, dst) in moves {
            let value = state[&src];
            state.insert(dst, value);
        }
    }

    #[test]
    fn straight_moves_preserve_order() {
        let pairs = vec![
            (MoveLoc::Register(0), MoveLoc::Register(1)),
            (MoveLoc::Register(2), MoveLoc::Register(3)),
        ];
        let moves = resolve_parallel_moves(&pairs, SCRATCH);
        assert_eq!(moves.len(), 2);
    }

    #[test]
    fn chain_is_emitted_back_to_front() {
        // b <- a, c <- b : c must be written before b is clobbered.
        let pairs = vec![
            (MoveLoc::Register(0), MoveLoc::Register(1)),
            (MoveLoc::Register(1), MoveLoc::Register(2)),
        ];
        let moves = resolve_parallel_moves(&pairs, SCRATCH);

        let mut state = std::collections::HashMap::new();
        state.insert(MoveLoc::Register(0), 10);
        state.insert(MoveLoc::Register(1), 11);
        state.insert(MoveLoc::Register(2), 12);
        apply(&moves, &mut state);
        assert_eq!(state[&MoveLoc::Register(1)], 10);
        assert_eq!(state[&MoveLoc::Register(2)], 11);
    }

    #[test]
    fn swap_cycle_uses_scratch_once() {
        let pairs = vec![
            (MoveLoc::Register(0), MoveLoc::Register(1)),
            (MoveLoc::Register(1), MoveLoc::Register(0)),
        ];
        let moves = resolve_parallel_moves(&pairs, SCRATCH);
        assert_eq!(moves.len(), 3);
        assert_eq!(moves.iter().filter(|m| m.1 == SCRATCH).count(), 1);

        let mut state = std::collections::HashMap::new();
        state.insert(MoveLoc::Register(0), 10);
        state.insert(MoveLoc::Register(1), 11);
        apply(&moves, &mut state);
        assert_eq!(state[&MoveLoc::Register(0)], 11);
        assert_eq!(state[&MoveLoc::Register(1)], 10);
    }

    #[test]
    fn three_way_rotation() {
        let pairs = vec![
            (MoveLoc::Register(0), MoveLoc::Register(1)),
            (MoveLoc::Register(1), MoveLoc::Register(2)),
            (MoveLoc::Register(2), MoveLoc::Register(0)),
        ];
        let moves = resolve_parallel_moves(&pairs, SCRATCH);

        let mut state = std::collections::HashMap::new();
        state.insert(MoveLoc::Register(0), 10);
        state.insert(MoveLoc::Register(1), 11);
        state.insert(MoveLoc::Register(2), 12);
        apply(&moves, &mut state);
        assert_eq!(state[&MoveLoc::Register(1)], 10);
        assert_eq!(state[&MoveLoc::Register(2)], 11);
        assert_eq!(state[&MoveLoc::Register(0)], 12);
    }

    #[test]
    fn self_moves_are_dropped() {
        let pairs = vec![(MoveLoc::Register(0), MoveLoc::Register(0))];
        assert!(resolve_parallel_moves(&pairs, SCRATCH).is_empty());
    }

    #[test]
    fn mixed_register_and_spill() {
        let pairs = vec![
            (MoveLoc::Spill(0), MoveLoc::Register(1)),
            (MoveLoc::Register(1), MoveLoc::Spill(0)),
        ];
        let moves = resolve_parallel_moves(&pairs, SCRATCH);
        let mut state = std::collections::HashMap::new();
        state.insert(MoveLoc::Spill(0), 20);
        state.insert(MoveLoc::Register(1), 21);
        apply(&moves, &mut state);
        assert_eq!(state[&MoveLoc::Spill(0)], 21);
        assert_eq!(state[&MoveLoc::Register(1)], 20);
    }
}
