//! Fuzzing harnesses for the rpmsg shared-memory transport.
//!
//! The vring and descriptor models are plain in-memory replicas used to
//! check the ring and ownership algorithms in isolation. The endpoint and
//! link harnesses drive real instances over a heap region and a deferred
//! loopback platform.

pub mod desc_model;
pub mod endpoint_model;
pub mod link_integration;
pub mod vring_model;
