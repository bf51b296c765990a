//! Tunnel layer - one established, authenticated connection to a server
//!
//! Provides:
//! - Establishment (negotiate, dial, obfuscate, SSH handshake)
//! - Port forwards through the secure session
//! - Keepalive monitoring
//! - Idempotent teardown

mod establish;
mod keepalive;

pub use establish::{establish_tunnel, Layers};

use crate::config::ServerEntry;
use crate::protocol::TunnelProtocol;
use crate::ssh::{PortForward, SshSession};
use crate::transport::CloseHandle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel closed")]
    Closed,

    #[error("No active tunnel")]
    NoActiveTunnel,
}

/// What components that use a tunnel depend on
///
/// Implemented by a single [`Tunnel`] and by
/// [`TunnelPool`](crate::pool::TunnelPool), which spreads dials over many.
#[async_trait]
pub trait Tunneler: Send + Sync {
    /// Open a port forward to `remote_addr` through the tunnel
    async fn dial(&self, remote_addr: &str) -> crate::Result<PortForward>;

    /// Report that a component using the tunnel has failed
    fn signal_failure(&self);
}

/// An established tunnel to a server
///
/// A tunnel never reconnects: once closed, the caller establishes a new one.
pub struct Tunnel {
    server_entry: Arc<ServerEntry>,
    session_id: String,
    protocol: TunnelProtocol,
    session_started: AtomicBool,
    /// Base transport connection; closing it unwinds every layer
    conn: CloseHandle,
    ssh: Arc<dyn SshSession>,
    keepalive_quit: CloseHandle,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    port_forward_failures: mpsc::Sender<()>,
    port_forward_failure_rx: Mutex<Option<mpsc::Receiver<()>>>,
    port_forward_failure_threshold: usize,
}

impl Tunnel {
    /// Take ownership of an established session and start its keepalive monitor
    pub(crate) fn new(
        server_entry: Arc<ServerEntry>,
        session_id: String,
        protocol: TunnelProtocol,
        conn: CloseHandle,
        ssh: Arc<dyn SshSession>,
        keepalive_period: Duration,
        port_forward_failure_threshold: usize,
    ) -> Self {
        let keepalive_quit = CloseHandle::new();
        let keepalive_task = keepalive::spawn(
            ssh.clone(),
            conn.clone(),
            keepalive_quit.clone(),
            keepalive_period,
            server_entry.ip_address.clone(),
        );

        // Large enough to hold the threshold number of reports; reporters
        // drop anything beyond that instead of blocking.
        let threshold = port_forward_failure_threshold.max(1);
        let (port_forward_failures, rx) = mpsc::channel(threshold);

        Self {
            server_entry,
            session_id,
            protocol,
            session_started: AtomicBool::new(false),
            conn,
            ssh,
            keepalive_quit,
            keepalive_task: Mutex::new(Some(keepalive_task)),
            port_forward_failures,
            port_forward_failure_rx: Mutex::new(Some(rx)),
            port_forward_failure_threshold: threshold,
        }
    }

    /// Stable identifier shared by every tunnel to the same server
    pub fn server_id(&self) -> &str {
        &self.server_entry.ip_address
    }

    pub fn server_entry(&self) -> &ServerEntry {
        &self.server_entry
    }

    /// Session identifier sent to the server in the auth payload
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn protocol(&self) -> TunnelProtocol {
        self.protocol
    }

    pub fn is_session_started(&self) -> bool {
        self.session_started.load(Ordering::Acquire)
    }

    /// Mark the tunnel as carrying application traffic (one-way)
    pub fn set_session_started(&self) {
        self.session_started.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Wait until the tunnel is closed, by any path
    pub async fn closed(&self) {
        self.conn.closed().await
    }

    /// Establish a port forward through the tunnel
    pub async fn dial(&self, remote_addr: &str) -> crate::Result<PortForward> {
        if self.is_closed() {
            return Err(TunnelError::Closed.into());
        }
        Ok(self.ssh.dial(remote_addr).await?)
    }

    /// Terminate the tunnel because an associated component failed
    pub fn signal_failure(&self) {
        warn!(server = %self.server_id(), "tunnel received failure signal");
        self.close();
    }

    /// Stop the keepalive monitor and close the base connection
    ///
    /// Safe to call any number of times from any task.
    pub fn close(&self) {
        if self.keepalive_quit.close() {
            debug!(server = %self.server_id(), "keepalive monitor stopped");
        }
        if self.conn.close() {
            info!(server = %self.server_id(), protocol = %self.protocol, "tunnel closed");
        }
    }

    /// Close the tunnel and wait for the keepalive monitor to exit
    pub async fn shutdown(&self) {
        self.close();
        let task = lock(&self.keepalive_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Record a failed port forward without blocking
    ///
    /// Returns `false` when the report was dropped because the threshold
    /// number of reports is already queued.
    pub fn report_port_forward_failure(&self) -> bool {
        self.port_forward_failures.try_send(()).is_ok()
    }

    /// Receiver for port forward failure reports (available once)
    pub fn take_port_forward_failures(&self) -> Option<mpsc::Receiver<()>> {
        lock(&self.port_forward_failure_rx).take()
    }

    pub fn port_forward_failure_threshold(&self) -> usize {
        self.port_forward_failure_threshold
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("server", &self.server_entry.ip_address)
            .field("protocol", &self.protocol)
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Tunneler for Tunnel {
    async fn dial(&self, remote_addr: &str) -> crate::Result<PortForward> {
        Tunnel::dial(self, remote_addr).await
    }

    fn signal_failure(&self) {
        Tunnel::signal_failure(self)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
