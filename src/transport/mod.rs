//! Transport layer
//!
//! Every layer of the tunnel is a [`Connection`]: a byte stream with a
//! [`CloseHandle`]. Wrapping layers hand out the handle of the connection
//! they wrap, so closing any layer's handle closes the base connection and
//! unwinds the whole stack.
//!
//! Backends:
//! - direct TCP ([`TcpDialer`]), registered with [`PendingConns`]
//! - indirect HTTP / meek ([`IndirectDialer`]), supplied by the embedder

mod connection;
mod pending;
mod tcp;

pub use connection::{CloseHandle, CloseOnDrop, ClosableStream};
pub use pending::{PendingConns, PendingRemoval};
pub use tcp::{dial_tcp, TcpDialer};

use crate::config::{DeviceBinding, ServerEntry};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device binding failed: {0}")]
    DeviceBinding(String),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Connection interrupted")]
    Interrupted,

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A byte-stream connection to a server
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Handle that closes this connection and everything beneath it
    fn close_handle(&self) -> CloseHandle;
}

/// Owned, type-erased connection
pub type BoxConnection = Box<dyn Connection>;

/// Binds sockets to a device before they connect (e.g. a VPN "protect" call)
pub trait DeviceBinder: Send + Sync {
    fn bind(&self, socket: &TcpSocket, binding: &DeviceBinding) -> io::Result<()>;
}

/// Dial configuration shared by every transport stage
#[derive(Clone)]
pub struct DialConfig {
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Per-read timeout
    pub read_timeout: Option<Duration>,
    /// Per-write timeout
    pub write_timeout: Option<Duration>,
    /// Registry of interruptible in-flight connections
    pub pending_conns: Option<Arc<PendingConns>>,
    /// Device binding parameters
    pub device_binding: Option<DeviceBinding>,
    /// Platform hook applying the device binding
    pub device_binder: Option<Arc<dyn DeviceBinder>>,
}

impl Default for DialConfig {
    fn default() -> Self {
        crate::Config::default().dial_config(None, None)
    }
}

/// Direct transport: a network dial to `host:port`
#[async_trait]
pub trait DirectDialer: Send + Sync {
    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxConnection, TransportError>;
}

/// Indirect HTTP transport (meek), optionally domain-fronted
///
/// The session id travels with the transport so the server can correlate
/// session stats before the SSH layer starts. Connections from this dialer
/// are not registered in [`PendingConns`]; their underlying HTTP
/// connections are managed by the implementation.
#[async_trait]
pub trait IndirectDialer: Send + Sync {
    async fn dial(
        &self,
        server_entry: &ServerEntry,
        session_id: &str,
        use_fronting: bool,
        config: &DialConfig,
    ) -> Result<BoxConnection, TransportError>;
}
