//! Bolero fuzzer for split vring offer/take/return/reclaim.
//!
//! Properties tested:
//! - Both rings are FIFO
//! - Neither ring ever holds more than `num` entries
//! - Every descriptor has exactly one owner
//! - Free-running indices wrap past `u16::MAX` cleanly

use bolero::check;
use rpmsg_fuzz::vring_model::{execute_and_verify, VringOp, MAX_NUM, MIN_NUM};

fn main() {
    check!()
        .with_type::<(u8, u16, Vec<VringOpInput>)>()
        .for_each(|(num_byte, start, ops)| {
            let num = (*num_byte as u16 % (MAX_NUM - MIN_NUM + 1)) + MIN_NUM;
            let ops: Vec<VringOp> = ops.iter().map(|op| op.to_vring_op()).collect();

            if let Err(e) = execute_and_verify(num, *start, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

/// Fuzz-friendly input type for vring operations.
#[derive(Debug, Clone, bolero::TypeGenerator)]
enum VringOpInput {
    Offer(u8),
    Take,
    Return(u8, u32),
    Reclaim,
}

impl VringOpInput {
    fn to_vring_op(&self) -> VringOp {
        match self {
            VringOpInput::Offer(n) => VringOp::Offer(*n),
            VringOpInput::Take => VringOp::Take,
            VringOpInput::Return(n, len) => VringOp::Return(*n, *len),
            VringOpInput::Reclaim => VringOp::Reclaim,
        }
    }
}

#[cfg(test)]
mod tests {
    use rpmsg_fuzz::vring_model::{execute_and_verify, VringOp};

    #[test]
    fn test_fill_and_drain() {
        let mut ops = Vec::new();
        for _ in 0..4 {
            ops.push(VringOp::Offer(0));
        }
        // Nothing left to offer.
        ops.push(VringOp::Offer(0));
        for n in 0..4 {
            ops.push(VringOp::Take);
            ops.push(VringOp::Return(0, n * 10));
        }
        for _ in 0..5 {
            ops.push(VringOp::Reclaim);
        }
        execute_and_verify(4, 0, &ops).unwrap();
    }

    #[test]
    fn test_out_of_order_return() {
        let ops = vec![
            VringOp::Offer(0),
            VringOp::Offer(0),
            VringOp::Offer(0),
            VringOp::Take,
            VringOp::Take,
            VringOp::Take,
            VringOp::Return(2, 1),
            VringOp::Return(0, 2),
            VringOp::Reclaim,
            VringOp::Offer(1),
            VringOp::Return(0, 3),
            VringOp::Reclaim,
            VringOp::Reclaim,
        ];
        execute_and_verify(8, u16::MAX, &ops).unwrap();
    }
}
