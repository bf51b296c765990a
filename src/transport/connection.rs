//! Closable connections
//!
//! A [`CloseHandle`] is a close-once broadcast shared between a connection
//! and anything that may need to tear it down from another task. Once
//! closed, [`ClosableStream`] fails every read and write, which unwinds
//! whatever protocol is running on top of it.

use super::Connection;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::Sleep;

const READ: usize = 0;
const WRITE: usize = 1;

#[derive(Default)]
struct CloseState {
    closed: AtomicBool,
    notify: Notify,
    wakers: Mutex<[Option<Waker>; 2]>,
}

/// Close-once signal for a connection
#[derive(Clone, Default)]
pub struct CloseHandle {
    state: Arc<CloseState>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the connection
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.notify.notify_waiters();
        let wakers = std::mem::take(&mut *self.wakers());
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Whether both handles refer to the same connection
    pub fn same_as(&self, other: &CloseHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    // Register before checking `is_closed` so a concurrent close always
    // finds the waker.
    fn register(&self, slot: usize, waker: &Waker) {
        let mut wakers = self.wakers();
        match &mut wakers[slot] {
            Some(existing) if existing.will_wake(waker) => {}
            entry => *entry = Some(waker.clone()),
        }
    }

    fn wakers(&self) -> std::sync::MutexGuard<'_, [Option<Waker>; 2]> {
        self.state
            .wakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes a connection when dropped unless disarmed
///
/// Held across multi-stage establishment so every early return releases
/// what was already opened.
pub struct CloseOnDrop {
    handle: CloseHandle,
    armed: bool,
}

impl CloseOnDrop {
    pub fn new(handle: CloseHandle) -> Self {
        Self { handle, armed: true }
    }

    /// Keep the connection open and hand back its handle
    pub fn disarm(mut self) -> CloseHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.close();
        }
    }
}

/// Base connection: a stream that can be closed from any task
pub struct ClosableStream<S> {
    inner: S,
    handle: CloseHandle,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> ClosableStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_handle(inner, CloseHandle::new())
    }

    pub fn with_handle(inner: S, handle: CloseHandle) -> Self {
        Self {
            inner,
            handle,
            read_timeout: None,
            write_timeout: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Fail reads or writes that make no progress within the timeout
    pub fn with_timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn handle(&self) -> &CloseHandle {
        &self.handle
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// Poll the pending-operation deadline, arming it on first use
fn deadline_expired(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    let expired = sleep.as_mut().poll(cx).is_ready();
    if expired {
        *deadline = None;
    }
    expired
}

impl<S: AsyncRead + Unpin> AsyncRead for ClosableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.handle.register(READ, cx.waker());
        if this.handle.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if deadline_expired(&mut this.read_deadline, this.read_timeout, cx) {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ClosableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.handle.register(WRITE, cx.waker());
        if this.handle.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if deadline_expired(&mut this.write_deadline, this.write_timeout, cx) {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handle.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> Connection for ClosableStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }
}

impl<S> Drop for ClosableStream<S> {
    fn drop(&mut self) {
        self.handle.close();
    }
}
