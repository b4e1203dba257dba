//! Bolero fuzzer for transmit descriptor ownership.
//!
//! Properties tested:
//! - A descriptor is never handed to two holders at once
//! - Taking succeeds whenever a descriptor is free or stashed
//! - Claims from an earlier turn are always refused
//! - Every descriptor is on the ring, held or stashed, never two of these

use bolero::check;
use rpmsg_fuzz::desc_model::{execute_and_verify, OwnershipOp, MAX_DESCS, MIN_DESCS};

fn main() {
    check!()
        .with_type::<(u8, Vec<OwnershipOpInput>)>()
        .for_each(|(count_byte, ops)| {
            let count = (*count_byte as u16 % (MAX_DESCS - MIN_DESCS + 1)) + MIN_DESCS;
            let ops: Vec<OwnershipOp> = ops.iter().map(|op| op.to_ownership_op()).collect();

            if let Err(e) = execute_and_verify(count, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

/// Fuzz-friendly input type for ownership operations.
#[derive(Debug, Clone, bolero::TypeGenerator)]
enum OwnershipOpInput {
    Take,
    Send(u8),
    Drop(u8),
    PeerReturn,
    Replay(u8),
}

impl OwnershipOpInput {
    fn to_ownership_op(&self) -> OwnershipOp {
        match self {
            OwnershipOpInput::Take => OwnershipOp::Take,
            OwnershipOpInput::Send(n) => OwnershipOp::Send(*n),
            OwnershipOpInput::Drop(n) => OwnershipOp::Drop(*n),
            OwnershipOpInput::PeerReturn => OwnershipOp::PeerReturn,
            OwnershipOpInput::Replay(n) => OwnershipOp::Replay(*n),
        }
    }
}

#[cfg(test)]
mod tests {
    use rpmsg_fuzz::desc_model::{execute_and_verify, OwnershipOp};

    #[test]
    fn test_replay_after_stash() {
        let ops = vec![
            OwnershipOp::Take,
            OwnershipOp::Drop(0),
            OwnershipOp::Take,
            OwnershipOp::Replay(0),
            OwnershipOp::Send(0),
            OwnershipOp::Replay(0),
            OwnershipOp::Replay(1),
        ];
        execute_and_verify(2, &ops).unwrap();
    }

    #[test]
    fn test_exhaustion_cycle() {
        let mut ops = Vec::new();
        for _ in 0..3 {
            for _ in 0..5 {
                ops.push(OwnershipOp::Take);
            }
            for _ in 0..4 {
                ops.push(OwnershipOp::Send(0));
            }
            for _ in 0..4 {
                ops.push(OwnershipOp::PeerReturn);
            }
        }
        execute_and_verify(4, &ops).unwrap();
    }
}
