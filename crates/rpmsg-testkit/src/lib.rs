//! rpmsg-testkit: Conformance scenarios for rpmsg platforms.
//!
//! Provides the `LinkFactory` trait and shared scenarios that every way of
//! wiring a master and a remote together must pass.
//!
//! # Usage
//!
//! Each platform implements `LinkFactory` and runs the shared scenarios:
//!
//! ```ignore
//! use rpmsg_testkit::{LinkFactory, LinkPair, TestError};
//!
//! struct MyLinkFactory;
//!
//! impl LinkFactory for MyLinkFactory {
//!     fn connect_pair(config: ShmConfig) -> Result<LinkPair, TestError> {
//!         /* build a master and a remote over one region */
//!     }
//! }
//!
//! #[test]
//! fn my_platform_hello_delivery() {
//!     rpmsg_testkit::run_hello_delivery::<MyLinkFactory>();
//! }
//! ```
//!
//! Scenarios are synchronous. Factories whose notifications need a hand to
//! move (a deferred loopback, say) install a pump that the scenarios call
//! while they wait.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rpmsg_core::{ErrorKind, Platform, RpmsgError, Timeout, ADDR_ANY};
use rpmsg_transport_shm::{
    Endpoint, LinkPolicy, RpmsgLite, RxBuffer, SharedMemory, ShmConfig,
};

/// How long a scenario waits for something the peer has to do.
const SETTLE: Duration = Duration::from_secs(2);

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Link creation failed.
    Setup(String),
    /// An rpmsg call failed.
    Rpmsg(RpmsgError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Rpmsg(e) => write!(f, "rpmsg error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpmsgError> for TestError {
    fn from(e: RpmsgError) -> Self {
        TestError::Rpmsg(e)
    }
}

/// A master and a remote on the same region.
pub struct LinkPair {
    pub master: RpmsgLite,
    pub remote: RpmsgLite,
    pump: Box<dyn Fn() + Send + Sync>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl LinkPair {
    pub fn new(master: RpmsgLite, remote: RpmsgLite) -> Self {
        Self {
            master,
            remote,
            pump: Box::new(|| {}),
            _guard: None,
        }
    }

    /// Run `pump` whenever a scenario waits on the peer.
    pub fn with_pump(mut self, pump: impl Fn() + Send + Sync + 'static) -> Self {
        self.pump = Box::new(pump);
        self
    }

    /// Keep `guard` (a runtime, say) alive as long as the pair.
    pub fn with_guard(mut self, guard: impl Any + Send) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub fn pump(&self) {
        (self.pump)()
    }

    /// Pump until `cond` holds or [`SETTLE`] runs out.
    pub fn wait_until(&self, what: &str, mut cond: impl FnMut() -> bool) -> Result<(), TestError> {
        let deadline = Instant::now() + SETTLE;
        loop {
            self.pump();
            if cond() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TestError::Assertion(format!("timed out waiting for {}", what)));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Send, pumping and retrying while the sender is out of buffers.
    pub fn send_retry(
        &self,
        from: &RpmsgLite,
        ept: &Endpoint,
        dst: u32,
        data: &[u8],
    ) -> Result<(), TestError> {
        let deadline = Instant::now() + SETTLE;
        loop {
            match from.send(ept, dst, data, Timeout::NonBlocking) {
                Ok(()) => return Ok(()),
                Err(RpmsgError::NoBuffers) if Instant::now() < deadline => {
                    self.pump();
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Factory trait for creating linked instance pairs for testing.
pub trait LinkFactory: 'static {
    /// Build a master and a remote with `config` on a fresh region.
    fn connect_pair(config: ShmConfig) -> Result<LinkPair, TestError>;
}

/// The configuration scenarios run with: 4 buffers of 512 bytes per
/// direction, which is a 4 KiB arena.
pub fn scenario_config() -> ShmConfig {
    ShmConfig::default()
        .with_buffer_count(4)
        .with_buffer_payload_size(496)
        .with_vring_align(16)
        .with_pa_base(0x2000_0000)
        .with_poll_interval(Duration::from_micros(200))
}

/// Allocate a region for `config` and attach a master and a remote to it.
pub fn attach_pair(
    config: &ShmConfig,
    master_platform: Arc<dyn Platform>,
    remote_platform: Arc<dyn Platform>,
) -> Result<(RpmsgLite, RpmsgLite), TestError> {
    let size = config.region_size()?;
    let shm = SharedMemory::new(size).map_err(|e| TestError::Setup(e.to_string()))?;
    let master = RpmsgLite::master_init(shm.clone(), 0, config.clone(), master_platform)?;
    let remote = RpmsgLite::remote_init(shm, 0, config.clone(), remote_platform)?;
    Ok((master, remote))
}

// ============================================================================
// Inbox
// ============================================================================

/// One message as an endpoint saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub src: u32,
    pub dst: u32,
    pub payload: Vec<u8>,
}

/// Collects what an endpoint receives.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    got: Arc<Mutex<Vec<Received>>>,
}

impl Inbox {
    /// A handler that copies every message into this inbox.
    pub fn handler(&self) -> impl Fn(RxBuffer) + Send + Sync + 'static {
        let got = self.got.clone();
        move |msg: RxBuffer| {
            got.lock().push(Received {
                src: msg.src(),
                dst: msg.dst(),
                payload: msg.payload().to_vec(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.got.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<Received> {
        std::mem::take(&mut *self.got.lock())
    }
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg()))
    }
}

fn link_up(pair: &LinkPair) -> Result<(), TestError> {
    pair.wait_until("link up", || {
        pair.master.is_link_up() && pair.remote.is_link_up()
    })
}

// ============================================================================
// Test scenarios
// ============================================================================

/// Both sides reach link-up.
pub fn run_link_up<F: LinkFactory>() {
    let result = run_link_up_inner::<F>();
    if let Err(e) = result {
        panic!("run_link_up failed: {}", e);
    }
}

fn run_link_up_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;
    pair.master.wait_for_link_up(Timeout::NonBlocking)?;
    pair.remote.wait_for_link_up(Timeout::NonBlocking)?;

    let arena = pair.master.arena();
    ensure(arena.total == 4096 && arena.remaining == 0, || {
        format!("expected a fully carved 4 KiB arena, got {:?}", arena)
    })
}

/// The remote sends "hello" from 20 to an endpoint at 10 on the master.
pub fn run_hello_delivery<F: LinkFactory>() {
    let result = run_hello_delivery_inner::<F>();
    if let Err(e) = result {
        panic!("run_hello_delivery failed: {}", e);
    }
}

fn run_hello_delivery_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let inbox = Inbox::default();
    let _ept = pair.master.create_ept(10, inbox.handler())?;
    let src = pair.remote.create_ept(20, |_msg: RxBuffer| {})?;

    pair.remote.send(&src, 10, b"hello", Timeout::NonBlocking)?;
    pair.wait_until("hello", || !inbox.is_empty())?;

    let got = inbox.take();
    let expected = vec![Received {
        src: 20,
        dst: 10,
        payload: b"hello".to_vec(),
    }];
    ensure(got == expected, || format!("expected {:?}, got {:?}", expected, got))?;
    ensure(pair.master.stats().rx_messages == 1, || {
        format!("rx_messages = {}", pair.master.stats().rx_messages)
    })
}

/// A payload one byte over capacity fails before anything is enqueued.
pub fn run_oversize_rejected<F: LinkFactory>() {
    let result = run_oversize_rejected_inner::<F>();
    if let Err(e) = result {
        panic!("run_oversize_rejected failed: {}", e);
    }
}

fn run_oversize_rejected_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let ept = pair.master.create_ept(ADDR_ANY, |_msg: RxBuffer| {})?;
    let data = vec![0xa5; pair.master.max_payload() + 1];
    match pair.master.send(&ept, 10, &data, Timeout::NonBlocking) {
        Err(e) if e.kind() == ErrorKind::InvalidArgument => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected invalid-argument, got {:?}",
                other
            )))
        }
    }

    let stats = pair.master.stats();
    ensure(stats.tx_messages == 0, || format!("tx_messages = {}", stats.tx_messages))?;
    ensure(pair.master.tx_outstanding() == 0, || {
        "oversize send leaked a buffer".to_string()
    })
}

/// Held receive buffers starve the sender until one is released.
pub fn run_tx_exhaustion_recovery<F: LinkFactory>() {
    let result = run_tx_exhaustion_recovery_inner::<F>();
    if let Err(e) = result {
        panic!("run_tx_exhaustion_recovery failed: {}", e);
    }
}

fn run_tx_exhaustion_recovery_inner<F: LinkFactory>() -> Result<(), TestError> {
    let config = scenario_config();
    let count = config.buffer_count as usize;
    let pair = F::connect_pair(config)?;
    link_up(&pair)?;

    let held = Arc::new(Mutex::new(Vec::new()));
    let sink = held.clone();
    let _ept = pair
        .master
        .create_ept(10, move |msg: RxBuffer| sink.lock().push(msg))?;
    let src = pair.remote.create_ept(20, |_msg: RxBuffer| {})?;

    for i in 0..count {
        pair.remote.send(&src, 10, &[i as u8], Timeout::NonBlocking)?;
    }
    pair.wait_until("all buffers held", || held.lock().len() == count)?;

    match pair.remote.alloc_tx_buffer(Timeout::NonBlocking) {
        Err(e) if e.kind() == ErrorKind::ResourceExhausted => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected resource-exhausted, got {:?}",
                other
            )))
        }
    }

    let first = held.lock().remove(0);
    ensure(first.payload() == [0], || {
        format!("first held buffer carries {:?}", first.payload())
    })?;
    pair.master.release_rx_buffer(first)?;

    pair.wait_until("a free tx buffer", || {
        pair.remote.alloc_tx_buffer(Timeout::NonBlocking).is_ok()
    })?;

    held.lock().clear();
    ensure(pair.master.rx_outstanding() == 0, || {
        format!("{} rx buffers still held", pair.master.rx_outstanding())
    })
}

/// A message for an unbound address is counted and dropped.
pub fn run_unreachable_counted<F: LinkFactory>() {
    let result = run_unreachable_counted_inner::<F>();
    if let Err(e) = result {
        panic!("run_unreachable_counted failed: {}", e);
    }
}

fn run_unreachable_counted_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let src = pair.remote.create_ept(20, |_msg: RxBuffer| {})?;
    pair.remote.send(&src, 99, b"nobody home", Timeout::NonBlocking)?;
    pair.wait_until("unreachable counted", || pair.master.stats().unreachable == 1)?;

    ensure(pair.master.is_link_up(), || "link went down".to_string())?;
    ensure(pair.master.rx_outstanding() == 0, || {
        "dropped message kept its buffer".to_string()
    })?;

    // The link still works.
    let inbox = Inbox::default();
    let _ept = pair.master.create_ept(99, inbox.handler())?;
    pair.remote.send(&src, 99, b"now", Timeout::NonBlocking)?;
    pair.wait_until("delivery after drop", || inbox.len() == 1)
}

/// Many more messages than buffers arrive in order.
pub fn run_fifo_order<F: LinkFactory>() {
    let result = run_fifo_order_inner::<F>();
    if let Err(e) = result {
        panic!("run_fifo_order failed: {}", e);
    }
}

fn run_fifo_order_inner<F: LinkFactory>() -> Result<(), TestError> {
    const MESSAGES: u32 = 200;

    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let inbox = Inbox::default();
    let _ept = pair.remote.create_ept(30, inbox.handler())?;
    let src = pair.master.create_ept(40, |_msg: RxBuffer| {})?;

    for i in 0..MESSAGES {
        pair.send_retry(&pair.master, &src, 30, &i.to_le_bytes())?;
    }
    pair.wait_until("every message", || inbox.len() == MESSAGES as usize)?;

    let order: Vec<u32> = inbox
        .take()
        .into_iter()
        .map(|r| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&r.payload);
            u32::from_le_bytes(word)
        })
        .collect();
    let expected: Vec<u32> = (0..MESSAGES).collect();
    ensure(order == expected, || format!("out of order: {:?}", order))
}

/// The remote echoes every message back, incremented, from its handler.
pub fn run_ping_pong<F: LinkFactory>() {
    let result = run_ping_pong_inner::<F>();
    if let Err(e) = result {
        panic!("run_ping_pong failed: {}", e);
    }
}

fn run_ping_pong_inner<F: LinkFactory>() -> Result<(), TestError> {
    const ROUNDS: u32 = 50;

    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let remote = pair.remote.clone();
    let echo: Arc<Mutex<Option<Endpoint>>> = Arc::new(Mutex::new(None));
    let slot = echo.clone();
    let ept = pair.remote.create_ept(ADDR_ANY, move |msg: RxBuffer| {
        let mut word = [0u8; 4];
        word.copy_from_slice(&msg.payload()[..4]);
        let reply = u32::from_le_bytes(word) + 1;
        let to = msg.src();
        drop(msg);
        if let Some(ept) = slot.lock().as_ref() {
            if let Err(e) = remote.send(ept, to, &reply.to_le_bytes(), Timeout::NonBlocking) {
                tracing::warn!(error = %e, "echo failed");
            }
        }
    })?;
    let echo_addr = ept.addr();
    *echo.lock() = Some(ept);

    let inbox = Inbox::default();
    let src = pair.master.create_ept(ADDR_ANY, inbox.handler())?;

    for round in 0..ROUNDS {
        pair.master
            .send(&src, echo_addr, &(round * 2).to_le_bytes(), Timeout::NonBlocking)?;
        pair.wait_until("pong", || !inbox.is_empty())?;

        let got = inbox.take();
        let expected = (round * 2 + 1).to_le_bytes().to_vec();
        ensure(got.len() == 1 && got[0].payload == expected, || {
            format!("round {}: got {:?}", round, got)
        })?;
        ensure(got[0].src == echo_addr, || {
            format!("pong from {} instead of {}", got[0].src, echo_addr)
        })?;
    }

    // Break the handler -> instance cycle.
    pair.remote.deinit()?;
    Ok(())
}

/// Addresses stay unique; automatic ones are the lowest free.
pub fn run_address_uniqueness<F: LinkFactory>() {
    let result = run_address_uniqueness_inner::<F>();
    if let Err(e) = result {
        panic!("run_address_uniqueness failed: {}", e);
    }
}

fn run_address_uniqueness_inner<F: LinkFactory>() -> Result<(), TestError> {
    let config = scenario_config();
    let reserved = config.reserved_addresses;
    let pair = F::connect_pair(config)?;

    let _ten = pair.master.create_ept(10, |_msg: RxBuffer| {})?;
    match pair.master.create_ept(10, |_msg: RxBuffer| {}) {
        Err(RpmsgError::AddressInUse(10)) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected address-in-use, got {:?}",
                other
            )))
        }
    }

    let a = pair.master.create_ept(ADDR_ANY, |_msg: RxBuffer| {})?;
    let b = pair.master.create_ept(ADDR_ANY, |_msg: RxBuffer| {})?;
    ensure(a.addr() == reserved && b.addr() == reserved + 1, || {
        format!("auto addresses {} and {}", a.addr(), b.addr())
    })?;

    pair.master.destroy_ept(a)?;
    let c = pair.master.create_ept(ADDR_ANY, |_msg: RxBuffer| {})?;
    ensure(c.addr() == reserved, || {
        format!("freed address not reused, got {}", c.addr())
    })?;

    // The same address on the other side is a different endpoint.
    let _remote_ten = pair.remote.create_ept(10, |_msg: RxBuffer| {})?;
    Ok(())
}

/// A buffer filled in place goes out without a copy.
pub fn run_nocopy_send<F: LinkFactory>() {
    let result = run_nocopy_send_inner::<F>();
    if let Err(e) = result {
        panic!("run_nocopy_send failed: {}", e);
    }
}

fn run_nocopy_send_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let inbox = Inbox::default();
    let _ept = pair.remote.create_ept(30, inbox.handler())?;
    let src = pair.master.create_ept(40, |_msg: RxBuffer| {})?;

    let mut buf = pair.master.alloc_tx_buffer(Timeout::NonBlocking)?;
    ensure(buf.capacity() == pair.master.max_payload(), || {
        format!("capacity {}", buf.capacity())
    })?;
    let len = buf.capacity();
    for (i, byte) in buf.payload_mut().iter_mut().enumerate() {
        *byte = i as u8;
    }
    pair.master.send_nocopy(&src, 30, buf, len)?;
    pair.wait_until("nocopy message", || inbox.len() == 1)?;

    let got = inbox.take();
    let expected: Vec<u8> = (0..len).map(|i| i as u8).collect();
    ensure(got[0].payload == expected, || "payload mismatch".to_string())?;

    // Too long for the buffer: rejected, and the buffer is not lost.
    let buf = pair.master.alloc_tx_buffer(Timeout::NonBlocking)?;
    let over = buf.capacity() + 1;
    ensure(pair.master.send_nocopy(&src, 30, buf, over).is_err(), || {
        "oversize nocopy send accepted".to_string()
    })?;
    ensure(pair.master.tx_outstanding() == 1, || {
        format!("{} tx buffers outstanding", pair.master.tx_outstanding())
    })
}

/// A handler keeps a buffer and releases it later.
pub fn run_hold_and_release<F: LinkFactory>() {
    let result = run_hold_and_release_inner::<F>();
    if let Err(e) = result {
        panic!("run_hold_and_release failed: {}", e);
    }
}

fn run_hold_and_release_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let held = Arc::new(Mutex::new(None::<RxBuffer>));
    let sink = held.clone();
    let _ept = pair
        .remote
        .create_ept(30, move |msg: RxBuffer| *sink.lock() = Some(msg))?;
    let src = pair.master.create_ept(40, |_msg: RxBuffer| {})?;

    pair.master.send(&src, 30, b"keep me", Timeout::NonBlocking)?;
    pair.wait_until("held message", || held.lock().is_some())?;
    ensure(pair.remote.rx_outstanding() == 1, || {
        format!("{} rx buffers held", pair.remote.rx_outstanding())
    })?;

    let msg = held
        .lock()
        .take()
        .ok_or_else(|| TestError::Assertion("message vanished".to_string()))?;
    ensure(msg.payload() == b"keep me", || {
        format!("held payload {:?}", msg.payload())
    })?;
    ensure(msg.src() == 40 && msg.dst() == 30, || {
        format!("held header {:?}", msg.header())
    })?;

    pair.remote.release_rx_buffer(msg)?;
    ensure(pair.remote.rx_outstanding() == 0, || {
        "release did not return the buffer".to_string()
    })
}

/// `wait_for_link_up` times out when nothing brings the link up.
pub fn run_link_timeout<F: LinkFactory>() {
    let result = run_link_timeout_inner::<F>();
    if let Err(e) = result {
        panic!("run_link_timeout failed: {}", e);
    }
}

fn run_link_timeout_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config().with_link_policy(LinkPolicy::External))?;

    match pair.master.wait_for_link_up(Timeout::NonBlocking) {
        Err(e) if e.is_timeout() => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected immediate timeout, got {:?}",
                other
            )))
        }
    }

    let wait = Duration::from_millis(30);
    let start = Instant::now();
    match pair.master.wait_for_link_up(Timeout::After(wait)) {
        Err(e) if e.is_timeout() => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected timeout, got {:?}",
                other
            )))
        }
    }
    let elapsed = start.elapsed();
    ensure(elapsed >= wait && elapsed < wait * 20, || {
        format!("waited {:?} for a {:?} timeout", elapsed, wait)
    })?;

    pair.master.signal_link_up()?;
    pair.master.wait_for_link_up(Timeout::After(wait))?;
    Ok(())
}

/// After deinit every call fails and buffers outstanding are discarded.
pub fn run_deinit_rejects_use<F: LinkFactory>() {
    let result = run_deinit_rejects_use_inner::<F>();
    if let Err(e) = result {
        panic!("run_deinit_rejects_use failed: {}", e);
    }
}

fn run_deinit_rejects_use_inner<F: LinkFactory>() -> Result<(), TestError> {
    let pair = F::connect_pair(scenario_config())?;
    link_up(&pair)?;

    let ept = pair.master.create_ept(10, |_msg: RxBuffer| {})?;
    let buf = pair.master.alloc_tx_buffer(Timeout::NonBlocking)?;
    pair.master.deinit()?;

    match pair.master.send(&ept, 20, b"late", Timeout::NonBlocking) {
        Err(e) if e.kind() == ErrorKind::NotReady => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected not-ready, got {:?}",
                other
            )))
        }
    }
    ensure(pair.master.deinit().is_err(), || "double deinit accepted".to_string())?;
    ensure(pair.master.destroy_ept(ept).is_err(), || {
        "destroy_ept after deinit accepted".to_string()
    })?;
    ensure(pair.master.endpoint_count() == 0, || "endpoints survived deinit".to_string())?;
    drop(buf);
    Ok(())
}
