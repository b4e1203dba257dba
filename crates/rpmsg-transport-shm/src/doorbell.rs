//! Socketpair doorbell platform.
//!
//! Each side of a link holds one end of a Unix datagram socketpair. A
//! notification is one datagram carrying the virtqueue id as a little-endian
//! `u32`. A tokio task per side ([`DoorbellPlatform::run_isr_loop`]) waits for
//! the socket to become readable and calls the registered ISRs, the way a
//! dedicated interrupt thread would on an RTOS.
//!
//! ```ignore
//! let (master_pf, remote_pf) = DoorbellPlatform::pair()?;
//! master_pf.spawn();
//! remote_pf.spawn();
//! let master = RpmsgLite::master_init(shm.clone(), 0, config.clone(), master_pf)?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rpmsg_core::{Isr, Platform, RpmsgError};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Bytes of one doorbell datagram.
const RING_SIZE: usize = 4;

/// One end of a doorbell socketpair.
pub struct Doorbell {
    async_fd: AsyncFd<OwnedFd>,
}

impl Doorbell {
    /// Both ends of a fresh socketpair. Must run inside a tokio runtime.
    pub fn create_pair() -> io::Result<(Self, Self)> {
        let (a, b) = create_socketpair()?;
        Ok((Self::from_owned_fd(a)?, Self::from_owned_fd(b)?))
    }

    /// Wrap one end of a socketpair, e.g. one inherited from a parent.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            async_fd: AsyncFd::new(fd)?,
        })
    }

    /// Wrap an inherited raw descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socketpair end that nothing else owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: the caller hands us ownership of an open fd.
        Self::from_owned_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Raise `vq_id` at the other end.
    ///
    /// If the socket buffer is full the ring is dropped; the peer has a
    /// backlog of rings to work through and will drain the vrings anyway.
    pub fn ring(&self, vq_id: u32) {
        let buf = vq_id.to_le_bytes();
        // SAFETY: fd is open for our lifetime and buf outlives the call.
        let ret = unsafe {
            libc::send(
                self.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::WouldBlock {
                tracing::trace!(vq_id, "doorbell full, ring coalesced");
            } else {
                tracing::warn!(vq_id, error = %err, "doorbell ring failed");
            }
        }
    }

    /// Wait for at least one ring and return every ring queued so far.
    pub async fn wait(&self) -> io::Result<Vec<u32>> {
        loop {
            let mut guard = self.async_fd.ready(Interest::READABLE).await?;
            let rings = self.drain()?;
            if !rings.is_empty() {
                return Ok(rings);
            }
            guard.clear_ready();
        }
    }

    /// Read every queued ring without blocking.
    pub fn drain(&self) -> io::Result<Vec<u32>> {
        let mut rings = Vec::new();
        let mut buf = [0u8; RING_SIZE];
        loop {
            // SAFETY: fd is open for our lifetime and buf is writable.
            let ret = unsafe {
                libc::recv(
                    self.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };

            match ret {
                n if n == RING_SIZE as isize => rings.push(u32::from_le_bytes(buf)),
                n if n > 0 => tracing::warn!(len = n, "short doorbell datagram ignored"),
                0 => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() == ErrorKind::WouldBlock {
                        return Ok(rings);
                    }
                    return Err(err);
                }
            }
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doorbell")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

/// Create a Unix domain socketpair (SOCK_DGRAM, non-blocking).
fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    // SAFETY: fds has room for the two descriptors socketpair writes.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: socketpair succeeded, so both fds are open and ours.
    let fd0 = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let fd1 = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((fd0, fd1))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ============================================================================
// Platform
// ============================================================================

#[derive(Default)]
struct Lines {
    isrs: HashMap<u32, Weak<dyn Isr>>,
    /// Rings that arrived before their ISR was registered.
    latched: BTreeSet<u32>,
}

/// [`Platform`] over a [`Doorbell`].
pub struct DoorbellPlatform {
    doorbell: Doorbell,
    lines: Mutex<Lines>,
    shutdown: Notify,
}

impl DoorbellPlatform {
    pub fn new(doorbell: Doorbell) -> Arc<Self> {
        Arc::new(Self {
            doorbell,
            lines: Mutex::new(Lines::default()),
            shutdown: Notify::new(),
        })
    }

    /// Two platforms wired to each other. Must run inside a tokio runtime.
    pub fn pair() -> io::Result<(Arc<Self>, Arc<Self>)> {
        let (a, b) = Doorbell::create_pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Spawn [`run_isr_loop`](Self::run_isr_loop) on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<io::Result<()>> {
        tokio::spawn(self.clone().run_isr_loop())
    }

    /// Wait for rings and run the matching ISRs until [`close`](Self::close)
    /// is called or the peer's end goes away.
    pub async fn run_isr_loop(self: Arc<Self>) -> io::Result<()> {
        loop {
            let rings = tokio::select! {
                rings = self.doorbell.wait() => rings,
                _ = self.shutdown.notified() => {
                    tracing::debug!(fd = self.doorbell.as_raw_fd(), "isr loop closed");
                    return Ok(());
                }
            };
            let rings = match rings {
                Ok(rings) => rings,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    tracing::debug!("doorbell peer closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            for vq_id in rings {
                self.dispatch(vq_id);
            }
        }
    }

    /// Stop the ISR loop.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    fn dispatch(&self, vq_id: u32) {
        let isr = {
            let mut lines = self.lines.lock();
            let isr = lines.isrs.get(&vq_id).cloned();
            if isr.is_none() {
                lines.latched.insert(vq_id);
            }
            isr
        };
        match isr.and_then(|w| w.upgrade()) {
            Some(isr) => isr.on_notify(vq_id),
            None => tracing::trace!(vq_id, "ring with no live isr"),
        }
    }
}

impl Platform for DoorbellPlatform {
    fn init_interrupt(&self, vq_id: u32, isr: Weak<dyn Isr>) -> Result<(), RpmsgError> {
        let latched = {
            let mut lines = self.lines.lock();
            if lines.isrs.contains_key(&vq_id) {
                return Err(RpmsgError::InvalidArgument(
                    "interrupt already registered for this virtqueue",
                ));
            }
            lines.isrs.insert(vq_id, isr.clone());
            lines.latched.remove(&vq_id)
        };
        if latched {
            if let Some(isr) = isr.upgrade() {
                isr.on_notify(vq_id);
            }
        }
        Ok(())
    }

    fn deinit_interrupt(&self, vq_id: u32) -> Result<(), RpmsgError> {
        let mut lines = self.lines.lock();
        lines.latched.remove(&vq_id);
        lines
            .isrs
            .remove(&vq_id)
            .map(|_| ())
            .ok_or(RpmsgError::InvalidArgument(
                "no interrupt registered for this virtqueue",
            ))
    }

    fn notify(&self, vq_id: u32) {
        self.doorbell.ring(vq_id);
    }
}

impl std::fmt::Debug for DoorbellPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorbellPlatform")
            .field("doorbell", &self.doorbell)
            .field("registered", &self.lines.lock().isrs.len())
            .finish()
    }
}
