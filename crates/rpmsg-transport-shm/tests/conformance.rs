//! Conformance scenarios over every platform this crate ships.

use rpmsg_testkit::{attach_pair, LinkFactory, LinkPair, TestError};
use rpmsg_transport_shm::{Delivery, DoorbellPlatform, LoopbackPlatform, ShmConfig};

/// Loopback that runs the peer's ISR on the notifying thread.
struct ImmediateLoopback;

impl LinkFactory for ImmediateLoopback {
    fn connect_pair(config: ShmConfig) -> Result<LinkPair, TestError> {
        let (a, b) = LoopbackPlatform::pair(Delivery::Immediate);
        let (master, remote) = attach_pair(&config, a, b)?;
        Ok(LinkPair::new(master, remote))
    }
}

/// Loopback whose notifications only move when the scenario pumps.
struct DeferredLoopback;

impl LinkFactory for DeferredLoopback {
    fn connect_pair(config: ShmConfig) -> Result<LinkPair, TestError> {
        let (a, b) = LoopbackPlatform::pair(Delivery::Deferred);
        let (master, remote) = attach_pair(&config, a.clone(), b.clone())?;
        Ok(LinkPair::new(master, remote).with_pump(move || {
            // Deliver until both sides are quiet: a handler may reply.
            while a.deliver_pending() + b.deliver_pending() > 0 {}
        }))
    }
}

/// Socketpair doorbells with an ISR task per side.
struct SocketDoorbell;

impl LinkFactory for SocketDoorbell {
    fn connect_pair(config: ShmConfig) -> Result<LinkPair, TestError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| TestError::Setup(e.to_string()))?;

        let (a, b) = {
            let _enter = rt.enter();
            let (a, b) = DoorbellPlatform::pair().map_err(|e| TestError::Setup(e.to_string()))?;
            a.spawn();
            b.spawn();
            (a, b)
        };

        let (master, remote) = attach_pair(&config, a, b)?;
        Ok(LinkPair::new(master, remote).with_guard(rt))
    }
}

macro_rules! conformance {
    ($factory:ident, $prefix:ident) => {
        mod $prefix {
            use super::*;

            #[test]
            fn link_up() {
                rpmsg_testkit::run_link_up::<$factory>();
            }

            #[test]
            fn hello_delivery() {
                rpmsg_testkit::run_hello_delivery::<$factory>();
            }

            #[test]
            fn oversize_rejected() {
                rpmsg_testkit::run_oversize_rejected::<$factory>();
            }

            #[test]
            fn tx_exhaustion_recovery() {
                rpmsg_testkit::run_tx_exhaustion_recovery::<$factory>();
            }

            #[test]
            fn unreachable_counted() {
                rpmsg_testkit::run_unreachable_counted::<$factory>();
            }

            #[test]
            fn fifo_order() {
                rpmsg_testkit::run_fifo_order::<$factory>();
            }

            #[test]
            fn ping_pong() {
                rpmsg_testkit::run_ping_pong::<$factory>();
            }

            #[test]
            fn address_uniqueness() {
                rpmsg_testkit::run_address_uniqueness::<$factory>();
            }

            #[test]
            fn nocopy_send() {
                rpmsg_testkit::run_nocopy_send::<$factory>();
            }

            #[test]
            fn hold_and_release() {
                rpmsg_testkit::run_hold_and_release::<$factory>();
            }

            #[test]
            fn link_timeout() {
                rpmsg_testkit::run_link_timeout::<$factory>();
            }

            #[test]
            fn deinit_rejects_use() {
                rpmsg_testkit::run_deinit_rejects_use::<$factory>();
            }
        }
    };
}

conformance!(ImmediateLoopback, immediate_loopback);
conformance!(DeferredLoopback, deferred_loopback);
conformance!(SocketDoorbell, socket_doorbell);
