//! Readiness waiting for transport sockets.
//!
//! The resolver never calls an OS multiplexing primitive directly. It hands a
//! socket and a deadline to a [`Selector`], which reports whether the socket
//! became readable before the deadline. Backends are interchangeable and
//! injected per resolver; tests substitute their own.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
#[cfg(unix)]
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

pub type ReadyFuture<'a> = Pin<Box<dyn Future<Output = io::Result<bool>> + Send + 'a>>;

/// A socket a selector can wait on.
#[derive(Debug, Clone, Copy)]
pub enum Watched<'a> {
    Udp(&'a UdpSocket),
    Tcp(&'a TcpStream),
}

impl Watched<'_> {
    async fn readable(self) -> io::Result<()> {
        match self {
            Watched::Udp(s) => s.readable().await,
            Watched::Tcp(s) => s.readable().await,
        }
    }

    /// A duplicate descriptor for the same socket, so a wait on the blocking
    /// pool never touches a descriptor number the caller may close and reuse.
    #[cfg(unix)]
    fn dup_fd(self) -> io::Result<std::os::fd::OwnedFd> {
        use std::os::fd::AsFd;
        match self {
            Watched::Udp(s) => s.as_fd().try_clone_to_owned(),
            Watched::Tcp(s) => s.as_fd().try_clone_to_owned(),
        }
    }
}

pub trait Selector: Send + Sync + fmt::Debug {
    /// Resolves to `true` once `socket` is readable, or `false` once
    /// `deadline` passes first. Never busy-waits.
    fn wait_for_readable<'a>(&'a self, socket: Watched<'a>, deadline: Instant) -> ReadyFuture<'a>;

    fn name(&self) -> &'static str;
}

/// Waits through tokio's reactor (epoll, kqueue or IOCP underneath).
#[derive(Debug, Default, Clone, Copy)]
pub struct ReactorSelector;

impl Selector for ReactorSelector {
    fn wait_for_readable<'a>(&'a self, socket: Watched<'a>, deadline: Instant) -> ReadyFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout_at(deadline, socket.readable()).await {
                Ok(res) => res.map(|()| true),
                Err(_elapsed) => Ok(false),
            }
        })
    }

    fn name(&self) -> &'static str {
        "reactor"
    }
}

/// Waits with a plain `poll(2)` call on the blocking pool.
///
/// The waiting future owns no reactor registration, so it behaves the same
/// regardless of the runtime flavor the resolver runs on. Dropping the
/// future raises a cancel flag; the blocking side polls in short slices and
/// returns at the next slice boundary.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PollSelector;

#[cfg(unix)]
impl Selector for PollSelector {
    fn wait_for_readable<'a>(&'a self, socket: Watched<'a>, deadline: Instant) -> ReadyFuture<'a> {
        let deadline = deadline.into_std();
        Box::pin(async move {
            use std::os::fd::AsRawFd;

            let fd = socket.dup_fd()?;
            let cancel = CancelOnDrop::default();
            let flag = Arc::clone(&cancel.0);
            tokio::task::spawn_blocking(move || poll_readable(fd.as_raw_fd(), deadline, &flag))
                .await
                .map_err(io::Error::other)?
        })
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

/// Longest single `poll(2)` call; bounds how late a cancellation is noticed.
#[cfg(unix)]
const POLL_SLICE: std::time::Duration = std::time::Duration::from_millis(50);

#[cfg(unix)]
#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

#[cfg(unix)]
impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[cfg(unix)]
fn poll_readable(
    fd: std::os::fd::RawFd,
    deadline: std::time::Instant,
    cancelled: &AtomicBool,
) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        if cancelled.load(Ordering::Acquire) {
            return Ok(false);
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let slice = remaining.min(POLL_SLICE);
        // Round up so a sub-millisecond remainder still blocks instead of spinning.
        let mut timeout_ms = slice.as_millis() as libc::c_int;
        if timeout_ms == 0 && !slice.is_zero() {
            timeout_ms = 1;
        }
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            if remaining <= POLL_SLICE {
                return Ok(false);
            }
            continue;
        }
        // Errors and hangups count as readable: the following recv reports them.
        return Ok(pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0);
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    Reactor,
    Poll,
}

impl SelectorKind {
    pub fn build(self) -> Arc<dyn Selector> {
        match self {
            SelectorKind::Reactor => Arc::new(ReactorSelector),
            #[cfg(unix)]
            SelectorKind::Poll => Arc::new(PollSelector),
            #[cfg(not(unix))]
            SelectorKind::Poll => {
                tracing::warn!(target = "selector", "poll selector unavailable on this platform, using reactor");
                Arc::new(ReactorSelector)
            }
        }
    }
}

pub fn default_selector() -> Arc<dyn Selector> {
    SelectorKind::default().build()
}
