//! In-memory model of a split vring for property-based testing.
//!
//! The driver side offers descriptors on the avail ring and takes them back
//! off the used ring; the device side takes them off the avail ring and
//! returns them on the used ring. Indices are free-running `u16`s, so a
//! model started near `u16::MAX` exercises the wrap on every run.

use std::collections::VecDeque;

/// Minimum descriptor count (must be power of 2).
pub const MIN_NUM: u16 = 2;
/// Maximum descriptor count for fuzzing (keep small to find edge cases faster).
pub const MAX_NUM: u16 = 64;

/// Where a descriptor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Held by the driver, free to fill.
    Driver,
    /// Published on the avail ring.
    Avail,
    /// Taken by the device.
    Device,
    /// Published on the used ring.
    Used,
}

/// In-memory model of one vring.
pub struct VringModel {
    num: u16,
    avail_ring: Vec<u16>,
    /// Shared: producer index of the avail ring.
    avail_idx: u16,
    /// Device-local: next avail entry to take.
    avail_cons: u16,
    used_ring: Vec<(u32, u32)>,
    /// Shared: producer index of the used ring.
    used_idx: u16,
    /// Driver-local: next used entry to take.
    used_cons: u16,
    owner: Vec<Owner>,
}

impl VringModel {
    /// Create a vring of `num` descriptors with every index at `start`.
    pub fn new(num: u16, start: u16) -> Self {
        let num = num.next_power_of_two().clamp(MIN_NUM, MAX_NUM);
        Self {
            num,
            avail_ring: vec![0; num as usize],
            avail_idx: start,
            avail_cons: start,
            used_ring: vec![(0, 0); num as usize],
            used_idx: start,
            used_cons: start,
            owner: vec![Owner::Driver; num as usize],
        }
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.num - 1
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn owner(&self, idx: u16) -> Option<Owner> {
        self.owner.get(idx as usize).copied()
    }

    /// Descriptors currently owned by `who`.
    pub fn owned_by(&self, who: Owner) -> Vec<u16> {
        (0..self.num).filter(|i| self.owner[*i as usize] == who).collect()
    }

    /// Driver publishes `idx` on the avail ring.
    pub fn add_avail(&mut self, idx: u16) -> Result<(), VringModelError> {
        self.expect(idx, Owner::Driver)?;
        let slot = (self.avail_idx & self.mask()) as usize;
        self.avail_ring[slot] = idx;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.owner[idx as usize] = Owner::Avail;
        Ok(())
    }

    /// Device takes the next avail entry.
    pub fn get_avail(&mut self) -> Option<u16> {
        if self.avail_cons == self.avail_idx {
            return None;
        }
        let idx = self.avail_ring[(self.avail_cons & self.mask()) as usize];
        self.avail_cons = self.avail_cons.wrapping_add(1);
        self.owner[idx as usize] = Owner::Device;
        Some(idx)
    }

    /// Device returns `idx` with `len` bytes written.
    pub fn add_used(&mut self, idx: u16, len: u32) -> Result<(), VringModelError> {
        self.expect(idx, Owner::Device)?;
        let slot = (self.used_idx & self.mask()) as usize;
        self.used_ring[slot] = (idx as u32, len);
        self.used_idx = self.used_idx.wrapping_add(1);
        self.owner[idx as usize] = Owner::Used;
        Ok(())
    }

    /// Driver takes the next used entry.
    pub fn get_used(&mut self) -> Option<(u16, u32)> {
        if self.used_cons == self.used_idx {
            return None;
        }
        let (id, len) = self.used_ring[(self.used_cons & self.mask()) as usize];
        self.used_cons = self.used_cons.wrapping_add(1);
        let idx = id as u16;
        self.owner[idx as usize] = Owner::Driver;
        Some((idx, len))
    }

    /// Entries on the avail ring not yet taken.
    pub fn avail_pending(&self) -> u16 {
        self.avail_idx.wrapping_sub(self.avail_cons)
    }

    /// Entries on the used ring not yet taken.
    pub fn used_pending(&self) -> u16 {
        self.used_idx.wrapping_sub(self.used_cons)
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    fn expect(&self, idx: u16, want: Owner) -> Result<(), VringModelError> {
        match self.owner(idx) {
            Some(found) if found == want => Ok(()),
            Some(found) => Err(VringModelError::WrongOwner { idx, want, found }),
            None => Err(VringModelError::OutOfRange { idx, num: self.num }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VringModelError {
    WrongOwner { idx: u16, want: Owner, found: Owner },
    OutOfRange { idx: u16, num: u16 },
}

/// Operations that can be performed on the vring.
#[derive(Clone, Copy, Debug)]
pub enum VringOp {
    /// Driver offers the n-th descriptor it holds.
    Offer(u8),
    /// Device takes from the avail ring.
    Take,
    /// Device returns the n-th descriptor it holds, with a length.
    Return(u8, u32),
    /// Driver reclaims from the used ring.
    Reclaim,
}

/// Execute a sequence of operations and verify invariants.
pub fn execute_and_verify(num: u16, start: u16, ops: &[VringOp]) -> Result<(), String> {
    let mut ring = VringModel::new(num, start);
    let mut avail_fifo: VecDeque<u16> = VecDeque::new();
    let mut used_fifo: VecDeque<(u16, u32)> = VecDeque::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            VringOp::Offer(n) => {
                let held = ring.owned_by(Owner::Driver);
                if held.is_empty() {
                    continue;
                }
                let idx = held[n as usize % held.len()];
                ring.add_avail(idx)
                    .map_err(|e| format!("op {}: offer {} failed: {:?}", i, idx, e))?;
                avail_fifo.push_back(idx);
            }
            VringOp::Take => match (ring.get_avail(), avail_fifo.pop_front()) {
                (Some(got), Some(want)) if got == want => {}
                (None, None) => {}
                (got, want) => {
                    return Err(format!("op {}: took {:?} from avail, expected {:?}", i, got, want))
                }
            },
            VringOp::Return(n, len) => {
                let held = ring.owned_by(Owner::Device);
                if held.is_empty() {
                    continue;
                }
                let idx = held[n as usize % held.len()];
                ring.add_used(idx, len)
                    .map_err(|e| format!("op {}: return {} failed: {:?}", i, idx, e))?;
                used_fifo.push_back((idx, len));
            }
            VringOp::Reclaim => match (ring.get_used(), used_fifo.pop_front()) {
                (Some(got), Some(want)) if got == want => {}
                (None, None) => {}
                (got, want) => {
                    return Err(format!("op {}: reclaimed {:?}, expected {:?}", i, got, want))
                }
            },
        }

        verify_vring_invariants(&ring, &avail_fifo, &used_fifo, i)?;
    }

    Ok(())
}

/// Verify vring invariants.
fn verify_vring_invariants(
    ring: &VringModel,
    avail: &VecDeque<u16>,
    used: &VecDeque<(u16, u32)>,
    op_idx: usize,
) -> Result<(), String> {
    // Invariant 1: pending counts match the shadow queues
    if ring.avail_pending() as usize != avail.len() || ring.used_pending() as usize != used.len() {
        return Err(format!(
            "after op {}: pending avail={} used={} but shadow avail={} used={}",
            op_idx,
            ring.avail_pending(),
            ring.used_pending(),
            avail.len(),
            used.len()
        ));
    }

    // Invariant 2: neither ring holds more than num entries
    if ring.avail_pending() > ring.num() || ring.used_pending() > ring.num() {
        return Err(format!("after op {}: ring over capacity", op_idx));
    }

    // Invariant 3: every descriptor is in exactly one place
    let counts = [Owner::Driver, Owner::Avail, Owner::Device, Owner::Used]
        .map(|who| ring.owned_by(who).len());
    if counts.iter().sum::<usize>() != ring.num() as usize {
        return Err(format!("after op {}: ownership counts {:?}", op_idx, counts));
    }
    if counts[1] != avail.len() || counts[3] != used.len() {
        return Err(format!(
            "after op {}: owners {:?} disagree with ring contents",
            op_idx, counts
        ));
    }

    // Invariant 4: no descriptor appears twice on a ring
    let mut seen = vec![false; ring.num() as usize];
    for idx in avail.iter().copied().chain(used.iter().map(|(idx, _)| *idx)) {
        if std::mem::replace(&mut seen[idx as usize], true) {
            return Err(format!("after op {}: descriptor {} queued twice", op_idx, idx));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut ring = VringModel::new(4, 0);
        ring.add_avail(2).unwrap();
        assert_eq!(ring.get_avail(), Some(2));
        ring.add_used(2, 40).unwrap();
        assert_eq!(ring.get_used(), Some((2, 40)));
        assert_eq!(ring.owner(2), Some(Owner::Driver));
    }

    #[test]
    fn test_double_offer_rejected() {
        let mut ring = VringModel::new(4, 0);
        ring.add_avail(1).unwrap();
        assert!(matches!(
            ring.add_avail(1),
            Err(VringModelError::WrongOwner { idx: 1, .. })
        ));
    }

    #[test]
    fn test_wrap_past_u16() {
        let mut ring = VringModel::new(4, u16::MAX - 2);
        for round in 0..70_000u32 {
            let idx = (round % 4) as u16;
            ring.add_avail(idx).unwrap();
            assert_eq!(ring.get_avail(), Some(idx));
            ring.add_used(idx, round).unwrap();
            assert_eq!(ring.get_used(), Some((idx, round)));
        }
        assert_eq!(ring.avail_idx(), (u16::MAX - 2).wrapping_add(70_000u32 as u16));
    }
}
