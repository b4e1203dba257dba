//! Differential model of endpoint address allocation.
//!
//! A `BTreeSet` of bound addresses is the reference; every operation is
//! applied to it and to a live instance, and the two must agree on which
//! address was bound, which calls failed and how many endpoints exist.

use std::collections::BTreeSet;

use rpmsg_core::{ErrorKind, ADDR_ANY};
use rpmsg_transport_shm::{
    Delivery, Endpoint, LoopbackPlatform, RpmsgLite, RxBuffer, SharedMemory, ShmConfig,
};

/// Addresses below this are only bound explicitly.
pub const RESERVED: u32 = 8;
/// Explicit addresses are drawn from `0..ADDR_SPACE`.
pub const ADDR_SPACE: u32 = 24;

/// Reference allocator.
#[derive(Debug, Default)]
pub struct AddressModel {
    bound: BTreeSet<u32>,
}

impl AddressModel {
    pub fn bind(&mut self, addr: Option<u32>) -> Option<u32> {
        let addr = match addr {
            Some(addr) => addr,
            None => (RESERVED..ADDR_ANY).find(|a| !self.bound.contains(a))?,
        };
        self.bound.insert(addr).then_some(addr)
    }

    pub fn unbind(&mut self, addr: u32) -> bool {
        self.bound.remove(&addr)
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

/// Operations that can be performed on the registry.
#[derive(Clone, Copy, Debug)]
pub enum EndpointOp {
    /// Bind an explicit address, taken modulo [`ADDR_SPACE`].
    Bind(u8),
    /// Bind with [`ADDR_ANY`].
    BindAny,
    /// Destroy the n-th live endpoint.
    Destroy(u8),
}

/// Execute a sequence of operations against the model and a real instance.
pub fn execute_and_verify(ops: &[EndpointOp]) -> Result<(), String> {
    let config = ShmConfig::default()
        .with_buffer_count(2)
        .with_vring_align(16)
        .with_reserved_addresses(RESERVED);
    let size = config.region_size().map_err(|e| e.to_string())?;
    let shm = SharedMemory::new(size).map_err(|e| e.to_string())?;
    // The remote side never attaches; its platform only has to outlive the run.
    let (local, _peer) = LoopbackPlatform::pair(Delivery::Deferred);
    let link = RpmsgLite::master_init(shm, 0, config, local).map_err(|e| e.to_string())?;

    let result = run_ops(&link, ops);
    link.deinit().map_err(|e| e.to_string())?;
    result
}

fn run_ops(link: &RpmsgLite, ops: &[EndpointOp]) -> Result<(), String> {
    let mut model = AddressModel::default();
    let mut live: Vec<Endpoint> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            EndpointOp::Bind(_) | EndpointOp::BindAny => {
                let requested = match *op {
                    EndpointOp::Bind(raw) => Some(raw as u32 % ADDR_SPACE),
                    _ => None,
                };
                let expected = model.bind(requested);
                let got = link.create_ept(requested.unwrap_or(ADDR_ANY), |_msg: RxBuffer| {});
                match (got, expected) {
                    (Ok(ept), Some(addr)) if ept.addr() == addr => live.push(ept),
                    (Err(e), None) if e.kind() == ErrorKind::AddressInUse => {}
                    (got, expected) => {
                        return Err(format!(
                            "op {}: bind {:?} gave {:?}, model says {:?}",
                            i, requested, got, expected
                        ))
                    }
                }
            }
            EndpointOp::Destroy(n) => {
                if live.is_empty() {
                    continue;
                }
                let ept = live.remove(n as usize % live.len());
                let addr = ept.addr();
                if !model.unbind(addr) {
                    return Err(format!("op {}: live endpoint {} unknown to model", i, addr));
                }
                link.destroy_ept(ept)
                    .map_err(|e| format!("op {}: destroy {} failed: {}", i, addr, e))?;
            }
        }

        if link.endpoint_count() != model.len() {
            return Err(format!(
                "after op {}: instance has {} endpoints, model {}",
                i,
                link.endpoint_count(),
                model.len()
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_fills_lowest_gap() {
        let mut model = AddressModel::default();
        assert_eq!(model.bind(None), Some(RESERVED));
        assert_eq!(model.bind(Some(RESERVED + 1)), Some(RESERVED + 1));
        assert_eq!(model.bind(None), Some(RESERVED + 2));
        assert!(model.unbind(RESERVED));
        assert_eq!(model.bind(None), Some(RESERVED));
    }

    #[test]
    fn test_explicit_reserved_address() {
        let mut model = AddressModel::default();
        assert_eq!(model.bind(Some(3)), Some(3));
        assert_eq!(model.bind(Some(3)), None);
        assert_eq!(model.bind(None), Some(RESERVED));
    }
}
