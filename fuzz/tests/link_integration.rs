//! Bolero fuzzer for a master/remote link over one shared region.
//!
//! Properties tested:
//! - Messages arrive once each and in send order
//! - Unreachable sends are counted and do not leak buffers
//! - Held receive buffers throttle the sender and are recovered on release
//! - After a full drain, every send is accounted for

use bolero::check;
use rpmsg_fuzz::link_integration::{execute_and_verify, LinkOp};

fn main() {
    check!()
        .with_type::<(u8, Vec<LinkOpInput>)>()
        .for_each(|(count_byte, ops)| {
            // 2, 4 or 8 buffers per direction
            let buffer_count = 2u16 << (*count_byte % 3);
            let ops: Vec<LinkOp> = ops.iter().map(|op| op.to_link_op()).collect();

            if let Err(e) = execute_and_verify(buffer_count, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

/// Fuzz-friendly input type for link operations.
#[derive(Debug, Clone, bolero::TypeGenerator)]
enum LinkOpInput {
    Send(u16),
    SendVoid(u16),
    SendNocopy(u16),
    AllocDrop,
    Pump,
    Poll,
    Hold(bool),
    Release(u8),
    DropHeld(u8),
}

impl LinkOpInput {
    fn to_link_op(&self) -> LinkOp {
        match self {
            LinkOpInput::Send(len) => LinkOp::Send {
                len: *len,
                void: false,
            },
            LinkOpInput::SendVoid(len) => LinkOp::Send {
                len: *len,
                void: true,
            },
            LinkOpInput::SendNocopy(len) => LinkOp::SendNocopy(*len),
            LinkOpInput::AllocDrop => LinkOp::AllocDrop,
            LinkOpInput::Pump => LinkOp::Pump,
            LinkOpInput::Poll => LinkOp::Poll,
            LinkOpInput::Hold(on) => LinkOp::Hold(*on),
            LinkOpInput::Release(n) => LinkOp::Release(*n),
            LinkOpInput::DropHeld(n) => LinkOp::DropHeld(*n),
        }
    }
}

#[cfg(test)]
mod tests {
    use rpmsg_fuzz::link_integration::{execute_and_verify, LinkOp};

    #[test]
    fn test_unpumped_backlog_drains() {
        // Nobody pumps: the ring fills, sends are refused, the final drain
        // still has to account for everything that went out.
        let ops: Vec<LinkOp> = (0..10)
            .map(|n| LinkOp::Send {
                len: n,
                void: n % 3 == 0,
            })
            .collect();
        execute_and_verify(2, &ops).unwrap();
    }

    #[test]
    fn test_poll_without_interrupts() {
        let mut ops = Vec::new();
        for n in 0..12 {
            ops.push(LinkOp::Send { len: n, void: false });
            ops.push(LinkOp::Poll);
        }
        execute_and_verify(4, &ops).unwrap();
    }
}
