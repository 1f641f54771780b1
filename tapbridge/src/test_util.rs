//! Test helpers shared by the bridge and session tests.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Shared view of a [`Tracked`] endpoint's lifetime.
#[derive(Debug, Clone, Default)]
pub struct TrackedCounters {
    drops: Arc<AtomicUsize>,
}

impl TrackedCounters {
    /// How many times the endpoint has been released.
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

/// An in-memory endpoint standing in for a serial port or TAP interface.
///
/// The other end of the pipe is handed out by [`Tracked::take_peer`]. Drops
/// are counted so tests can check that every endpoint is released exactly
/// once.
#[derive(Debug)]
pub struct Tracked {
    inner: DuplexStream,
    peer: Option<DuplexStream>,
    counters: TrackedCounters,
    fail_reads: bool,
    fail_writes: bool,
}

impl Tracked {
    pub fn new() -> Self {
        Self::with_capacity(PIPE_CAPACITY)
    }

    /// Writes stall once `capacity` bytes sit unread in the pipe.
    pub fn with_capacity(capacity: usize) -> Self {
        let (inner, peer) = duplex(capacity);
        Self {
            inner,
            peer: Some(peer),
            counters: TrackedCounters::default(),
            fail_reads: false,
            fail_writes: false,
        }
    }

    /// Every read fails with an I/O error.
    pub fn failing_reads() -> Self {
        let mut endpoint = Self::new();
        endpoint.fail_reads = true;
        endpoint
    }

    /// Every write fails with an I/O error.
    pub fn failing_writes() -> Self {
        let mut endpoint = Self::new();
        endpoint.fail_writes = true;
        endpoint
    }

    pub fn counters(&self) -> TrackedCounters {
        self.counters.clone()
    }

    pub fn take_peer(&mut self) -> DuplexStream {
        self.peer.take().expect("peer already taken")
    }
}

fn injected() -> io::Error {
    io::Error::other("injected failure")
}

impl AsyncRead for Tracked {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fail_reads {
            return Poll::Ready(Err(injected()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Tracked {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fail_writes {
            return Poll::Ready(Err(injected()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.drops.fetch_add(1, Ordering::SeqCst);
    }
}
