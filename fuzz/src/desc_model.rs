//! In-memory model of transmit descriptor ownership for property-based testing.
//!
//! Mirrors the bookkeeping the pool keeps next to each vring: a descriptor is
//! on the ring (free or in flight), held by a caller, or stashed after its
//! holder dropped it unsent. Every take bumps the descriptor's generation, so
//! a claim outlives its turn only as a stale claim.

use std::collections::VecDeque;

/// Minimum descriptor count for fuzzing.
pub const MIN_DESCS: u16 = 2;
/// Maximum descriptor count for fuzzing.
pub const MAX_DESCS: u16 = 32;

/// Descriptor states matching pool.rs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    OnRing,
    Held,
    Stashed,
}

/// A caller's claim on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    pub idx: u16,
    pub generation: u32,
}

/// In-memory model of the transmit side of one link.
pub struct OwnershipModel {
    state: Vec<DescState>,
    generation: Vec<u32>,
    stash: Vec<u16>,
    /// Free descriptors, in the order the ring hands them out.
    free: VecDeque<u16>,
    /// Descriptors sent and not yet returned by the peer, oldest first.
    in_flight: VecDeque<u16>,
}

impl OwnershipModel {
    pub fn new(count: u16) -> Self {
        let count = count.clamp(MIN_DESCS, MAX_DESCS);
        Self {
            state: vec![DescState::OnRing; count as usize],
            generation: vec![0; count as usize],
            stash: Vec::new(),
            free: (0..count).collect(),
            in_flight: VecDeque::new(),
        }
    }

    /// Take a descriptor: a stashed one first, then the ring.
    pub fn take(&mut self) -> Option<Claim> {
        let idx = match self.stash.pop() {
            Some(idx) => idx,
            None => self.free.pop_front()?,
        };
        let i = idx as usize;
        self.state[i] = DescState::Held;
        self.generation[i] = self.generation[i].wrapping_add(1);
        Some(Claim {
            idx,
            generation: self.generation[i],
        })
    }

    /// Hand a held descriptor to the peer.
    pub fn send(&mut self, claim: Claim) -> Result<(), OwnershipError> {
        self.check_held(claim)?;
        self.state[claim.idx as usize] = DescState::OnRing;
        self.in_flight.push_back(claim.idx);
        Ok(())
    }

    /// The holder dropped its claim unsent.
    pub fn unalloc(&mut self, claim: Claim) -> Result<(), OwnershipError> {
        self.check_held(claim)?;
        self.state[claim.idx as usize] = DescState::Stashed;
        self.stash.push(claim.idx);
        Ok(())
    }

    /// The peer consumed the oldest in-flight descriptor and gave it back.
    pub fn peer_return(&mut self) -> Option<u16> {
        let idx = self.in_flight.pop_front()?;
        self.free.push_back(idx);
        Some(idx)
    }

    fn check_held(&self, claim: Claim) -> Result<(), OwnershipError> {
        let i = claim.idx as usize;
        match self.state.get(i) {
            None => Err(OwnershipError::OutOfRange(claim.idx)),
            Some(DescState::Held) if self.generation[i] == claim.generation => Ok(()),
            Some(_) => Err(OwnershipError::Stale(claim.idx)),
        }
    }

    pub fn count(&self, wanted: DescState) -> usize {
        self.state.iter().filter(|s| **s == wanted).count()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipError {
    Stale(u16),
    OutOfRange(u16),
}

/// Operations that can be performed on the model.
#[derive(Clone, Copy, Debug)]
pub enum OwnershipOp {
    Take,
    /// Send the n-th live claim.
    Send(u8),
    /// Drop the n-th live claim unsent.
    Drop(u8),
    PeerReturn,
    /// Replay the n-th dead claim; must be refused.
    Replay(u8),
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(count: u16, ops: &[OwnershipOp]) -> Result<(), String> {
    let mut model = OwnershipModel::new(count);
    let mut live: Vec<Claim> = Vec::new();
    let mut dead: Vec<Claim> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            OwnershipOp::Take => {
                let available = model.len() - model.count(DescState::Held) - model.in_flight();
                match model.take() {
                    Some(claim) => {
                        if live.iter().any(|c| c.idx == claim.idx) {
                            return Err(format!("op {}: descriptor {} handed out twice", i, claim.idx));
                        }
                        live.push(claim);
                    }
                    None if available == 0 => {}
                    None => {
                        return Err(format!("op {}: take failed with {} available", i, available))
                    }
                }
            }
            OwnershipOp::Send(n) | OwnershipOp::Drop(n) => {
                if live.is_empty() {
                    continue;
                }
                let claim = live.remove(n as usize % live.len());
                let result = match op {
                    OwnershipOp::Send(_) => model.send(claim),
                    _ => model.unalloc(claim),
                };
                result.map_err(|e| format!("op {}: live claim refused: {:?}", i, e))?;
                dead.push(claim);
            }
            OwnershipOp::PeerReturn => {
                model.peer_return();
            }
            OwnershipOp::Replay(n) => {
                if dead.is_empty() {
                    continue;
                }
                let claim = dead[n as usize % dead.len()];
                if model.send(claim).is_ok() || model.unalloc(claim).is_ok() {
                    return Err(format!("op {}: dead claim {:?} accepted", i, claim));
                }
            }
        }

        verify_ownership_invariants(&model, &live, i)?;
    }

    Ok(())
}

/// Verify ownership invariants.
fn verify_ownership_invariants(
    model: &OwnershipModel,
    live: &[Claim],
    op_idx: usize,
) -> Result<(), String> {
    // Invariant 1: held descriptors are exactly the live claims
    if model.count(DescState::Held) != live.len() {
        return Err(format!(
            "after op {}: {} held but {} live claims",
            op_idx,
            model.count(DescState::Held),
            live.len()
        ));
    }

    // Invariant 2: every descriptor is in exactly one place
    let placed = model.free.len() + model.in_flight.len() + model.stash.len() + live.len();
    if placed != model.len() {
        return Err(format!(
            "after op {}: {} descriptors accounted for, {} exist",
            op_idx,
            placed,
            model.len()
        ));
    }

    // Invariant 3: stash entries are Stashed, ring entries OnRing
    for idx in &model.stash {
        if model.state[*idx as usize] != DescState::Stashed {
            return Err(format!("after op {}: stashed {} not Stashed", op_idx, idx));
        }
    }
    for idx in model.free.iter().chain(model.in_flight.iter()) {
        if model.state[*idx as usize] != DescState::OnRing {
            return Err(format!("after op {}: ring entry {} not OnRing", op_idx, idx));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_reuse_bumps_generation() {
        let mut model = OwnershipModel::new(2);
        let first = model.take().unwrap();
        model.unalloc(first).unwrap();
        let again = model.take().unwrap();
        assert_eq!(again.idx, first.idx);
        assert_ne!(again.generation, first.generation);
        assert_eq!(model.send(first), Err(OwnershipError::Stale(first.idx)));
        model.send(again).unwrap();
    }

    #[test]
    fn test_exhaustion_and_return() {
        let mut model = OwnershipModel::new(2);
        let a = model.take().unwrap();
        let b = model.take().unwrap();
        assert!(model.take().is_none());
        model.send(a).unwrap();
        model.send(b).unwrap();
        assert!(model.take().is_none());
        assert_eq!(model.peer_return(), Some(a.idx));
        assert_eq!(model.take().map(|c| c.idx), Some(a.idx));
    }
}
