//! Drives a real master/remote pair over one shared region.
//!
//! Notifications go through a deferred loopback, so the fuzzer decides when
//! interrupts fire, when the remote polls and how long it sits on receive
//! buffers. Properties checked:
//! - Messages to a bound endpoint arrive once each, in send order
//! - Messages to an unbound address are counted and their buffers recycled
//! - Held receive buffers are accounted for and never exceed the ring
//! - Once everything is released and drained, nothing is lost

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rpmsg_core::{ErrorKind, Timeout};
use rpmsg_transport_shm::{
    Delivery, LoopbackPlatform, RpmsgLite, RxBuffer, SharedMemory, ShmConfig,
};

/// Local address of the sending endpoint.
pub const SRC_ADDR: u32 = 40;
/// Remote endpoint every bound send goes to.
pub const SINK_ADDR: u32 = 41;
/// Nothing is ever bound here.
pub const VOID_ADDR: u32 = 99;
/// Payload capacity of each buffer.
pub const PAYLOAD: usize = 64;

/// Operations that can be performed on the link.
#[derive(Clone, Copy, Debug)]
pub enum LinkOp {
    /// Copy-send `len` bytes to the sink (or into the void).
    Send { len: u16, void: bool },
    /// Allocate, fill and send without the copy path.
    SendNocopy(u16),
    /// Allocate a transmit buffer and drop it unsent.
    AllocDrop,
    /// Deliver every latched notification.
    Pump,
    /// Drain the remote's receive ring without an interrupt.
    Poll,
    /// Start or stop holding received buffers.
    Hold(bool),
    /// Release the n-th held buffer through the instance.
    Release(u8),
    /// Drop the n-th held buffer.
    DropHeld(u8),
}

#[derive(Default)]
struct Sink {
    hold: AtomicBool,
    seen: Mutex<Vec<u32>>,
    held: Mutex<Vec<RxBuffer>>,
}

struct Harness {
    master: RpmsgLite,
    remote: RpmsgLite,
    a: Arc<LoopbackPlatform>,
    b: Arc<LoopbackPlatform>,
    sink: Arc<Sink>,
}

impl Harness {
    fn new(buffer_count: u16) -> Result<Self, String> {
        let config = ShmConfig::default()
            .with_buffer_count(buffer_count)
            .with_buffer_payload_size(PAYLOAD)
            .with_vring_align(16)
            .with_link_timeout(Timeout::NonBlocking);
        let size = config.region_size().map_err(|e| e.to_string())?;
        let shm = SharedMemory::new(size).map_err(|e| e.to_string())?;

        let (a, b) = LoopbackPlatform::pair(Delivery::Deferred);
        let master = RpmsgLite::master_init(shm.clone(), 0, config.clone(), a.clone())
            .map_err(|e| e.to_string())?;
        let remote =
            RpmsgLite::remote_init(shm, 0, config, b.clone()).map_err(|e| e.to_string())?;

        let harness = Self {
            master,
            remote,
            a,
            b,
            sink: Arc::default(),
        };
        harness.pump();
        if !harness.remote.is_link_up() {
            return Err("remote never saw the master's kick".into());
        }

        let sink = harness.sink.clone();
        harness
            .remote
            .create_ept(SINK_ADDR, move |msg: RxBuffer| {
                let mut word = [0u8; 4];
                word.copy_from_slice(&msg.payload()[..4]);
                if let Ok(mut seen) = sink.seen.lock() {
                    seen.push(u32::from_le_bytes(word));
                }
                if sink.hold.load(Ordering::Relaxed) {
                    if let Ok(mut held) = sink.held.lock() {
                        held.push(msg);
                    }
                }
            })
            .map_err(|e| e.to_string())?;
        Ok(harness)
    }

    fn pump(&self) {
        while self.a.deliver_pending() + self.b.deliver_pending() > 0 {}
    }

    fn take_held(&self, n: u8) -> Option<RxBuffer> {
        let mut held = self.sink.held.lock().ok()?;
        if held.is_empty() {
            return None;
        }
        let i = n as usize % held.len();
        Some(held.remove(i))
    }

    fn held_len(&self) -> usize {
        self.sink.held.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn seen(&self) -> Vec<u32> {
        self.sink.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn frame(seq: u32, len: u16) -> Vec<u8> {
    let len = 4 + len as usize % (PAYLOAD - 3);
    let mut data = vec![seq as u8; len];
    data[..4].copy_from_slice(&seq.to_le_bytes());
    data
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(buffer_count: u16, ops: &[LinkOp]) -> Result<(), String> {
    let harness = Harness::new(buffer_count)?;
    let result = run_ops(&harness, buffer_count as usize, ops);

    // Break the handler -> held buffer -> instance cycle either way.
    harness.sink.hold.store(false, Ordering::Relaxed);
    if let Ok(mut held) = harness.sink.held.lock() {
        held.clear();
    }
    let _ = harness.remote.deinit();
    let _ = harness.master.deinit();
    result
}

fn run_ops(h: &Harness, buffer_count: usize, ops: &[LinkOp]) -> Result<(), String> {
    let ept = h
        .master
        .create_ept(SRC_ADDR, |_msg: RxBuffer| {})
        .map_err(|e| e.to_string())?;
    let mut seq = 0u32;
    let mut expected: Vec<u32> = Vec::new();
    let mut voided = 0u64;

    for (i, op) in ops.iter().enumerate() {
        match *op {
            LinkOp::Send { len, void } => {
                let dst = if void { VOID_ADDR } else { SINK_ADDR };
                match h.master.send(&ept, dst, &frame(seq, len), Timeout::NonBlocking) {
                    Ok(()) if void => voided += 1,
                    Ok(()) => expected.push(seq),
                    Err(e) if e.kind() == ErrorKind::ResourceExhausted => {}
                    Err(e) => return Err(format!("op {}: send failed: {}", i, e)),
                }
                seq += 1;
            }
            LinkOp::SendNocopy(len) => match h.master.alloc_tx_buffer(Timeout::NonBlocking) {
                Ok(mut buf) => {
                    let data = frame(seq, len);
                    buf.payload_mut()[..data.len()].copy_from_slice(&data);
                    h.master
                        .send_nocopy(&ept, SINK_ADDR, buf, data.len())
                        .map_err(|e| format!("op {}: send_nocopy failed: {}", i, e))?;
                    expected.push(seq);
                    seq += 1;
                }
                Err(e) if e.kind() == ErrorKind::ResourceExhausted => {}
                Err(e) => return Err(format!("op {}: alloc failed: {}", i, e)),
            },
            LinkOp::AllocDrop => match h.master.alloc_tx_buffer(Timeout::NonBlocking) {
                Ok(buf) => drop(buf),
                Err(e) if e.kind() == ErrorKind::ResourceExhausted => {}
                Err(e) => return Err(format!("op {}: alloc failed: {}", i, e)),
            },
            LinkOp::Pump => h.pump(),
            LinkOp::Poll => {
                h.remote.poll();
            }
            LinkOp::Hold(on) => h.sink.hold.store(on, Ordering::Relaxed),
            LinkOp::Release(n) => {
                if let Some(msg) = h.take_held(n) {
                    h.remote
                        .release_rx_buffer(msg)
                        .map_err(|e| format!("op {}: release failed: {}", i, e))?;
                }
            }
            LinkOp::DropHeld(n) => drop(h.take_held(n)),
        }

        verify_link_invariants(h, buffer_count, &expected, i)?;
    }

    // Let everything settle and account for every send.
    h.sink.hold.store(false, Ordering::Relaxed);
    while let Some(msg) = h.take_held(0) {
        drop(msg);
    }
    h.pump();
    h.remote.poll();
    h.pump();

    let seen = h.seen();
    if seen != expected {
        return Err(format!(
            "after drain: delivered {} messages, sent {} to the sink",
            seen.len(),
            expected.len()
        ));
    }
    let stats = h.remote.stats();
    if stats.unreachable != voided {
        return Err(format!(
            "after drain: {} unreachable counted, {} sent into the void",
            stats.unreachable, voided
        ));
    }
    let sent = h.master.stats().tx_messages;
    if stats.rx_messages + stats.unreachable != sent {
        return Err(format!(
            "after drain: master sent {}, remote took {} + {}",
            sent, stats.rx_messages, stats.unreachable
        ));
    }
    if h.remote.rx_outstanding() != 0 {
        return Err(format!(
            "after drain: remote still holds {} buffers",
            h.remote.rx_outstanding()
        ));
    }
    Ok(())
}

/// Verify link invariants.
fn verify_link_invariants(
    h: &Harness,
    buffer_count: usize,
    expected: &[u32],
    op_idx: usize,
) -> Result<(), String> {
    // Invariant 1: what arrived so far is a prefix of what was sent, in order
    let seen = h.seen();
    if !expected.starts_with(&seen) {
        return Err(format!(
            "after op {}: delivery order {:?} is not a prefix of {:?}",
            op_idx, seen, expected
        ));
    }

    // Invariant 2: the instance agrees on how many buffers the sink holds
    if h.remote.rx_outstanding() != h.held_len() {
        return Err(format!(
            "after op {}: remote reports {} held, sink has {}",
            op_idx,
            h.remote.rx_outstanding(),
            h.held_len()
        ));
    }

    // Invariant 3: neither side can have more buffers out than the ring has
    if h.held_len() > buffer_count || h.master.tx_outstanding() > buffer_count {
        return Err(format!(
            "after op {}: {} held, {} in flight, ring of {}",
            op_idx,
            h.held_len(),
            h.master.tx_outstanding(),
            buffer_count
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_drain() {
        let ops = vec![
            LinkOp::Send { len: 10, void: false },
            LinkOp::Send { len: 0, void: true },
            LinkOp::Pump,
            LinkOp::Send { len: 60, void: false },
            LinkOp::Poll,
        ];
        execute_and_verify(4, &ops).unwrap();
    }

    #[test]
    fn test_hold_blocks_then_recovers() {
        let mut ops = vec![LinkOp::Hold(true)];
        for _ in 0..4 {
            ops.push(LinkOp::Send { len: 8, void: false });
            ops.push(LinkOp::Pump);
        }
        // Ring is held dry; this one is refused.
        ops.push(LinkOp::Send { len: 8, void: false });
        ops.push(LinkOp::Release(0));
        ops.push(LinkOp::DropHeld(1));
        ops.push(LinkOp::Hold(false));
        ops.push(LinkOp::SendNocopy(12));
        ops.push(LinkOp::AllocDrop);
        ops.push(LinkOp::Pump);
        execute_and_verify(4, &ops).unwrap();
    }
}
