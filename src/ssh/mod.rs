//! Secure session layer
//!
//! The SSH protocol itself comes from a library behind [`SshConnector`].
//! This module owns what the tunnel decides on top of it: the pinned host
//! key check and the password payload that carries the session id.

mod client;

pub use client::RusshConnector;

use crate::transport::BoxConnection;
use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Secure session errors
#[derive(Debug, Error)]
pub enum SshError {
    #[error("unexpected host public key")]
    HostKeyMismatch,

    #[error("invalid pinned host key: {0}")]
    InvalidHostKey(String),

    #[error("server rejected credentials")]
    AuthenticationRejected,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("port forward to {addr} failed: {reason}")]
    PortForward { addr: String, reason: String },

    #[error("keepalive failed: {0}")]
    Keepalive(String),

    #[error("session closed")]
    SessionClosed,

    #[error("serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A logical channel through the session
pub trait PortForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PortForwardStream for T {}

/// Owned port forward connection
pub type PortForward = Box<dyn PortForwardStream>;

/// Accepts the server iff it presents the pinned key
#[derive(Clone, PartialEq, Eq)]
pub struct HostKeyVerifier {
    expected: Vec<u8>,
}

impl HostKeyVerifier {
    /// Pin raw SSH wire-format key bytes
    pub fn new(expected: Vec<u8>) -> Self {
        Self { expected }
    }

    /// Pin a key stored as base64 of its wire encoding
    pub fn from_base64(encoded: &str) -> Result<Self, SshError> {
        let expected = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| SshError::InvalidHostKey(e.to_string()))?;
        if expected.is_empty() {
            return Err(SshError::InvalidHostKey("empty key".to_string()));
        }
        Ok(Self::new(expected))
    }

    /// Check the key the server presented during key exchange
    pub fn verify(&self, presented: &[u8]) -> Result<(), SshError> {
        if self.expected.as_slice() != presented {
            return Err(SshError::HostKeyMismatch);
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostKeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostKeyVerifier({} bytes)", self.expected.len())
    }
}

/// Password credential sent to the server
#[derive(Debug, Serialize)]
struct PasswordPayload<'a> {
    #[serde(rename = "SessionId")]
    session_id: &'a str,
    #[serde(rename = "SshPassword")]
    ssh_password: &'a str,
}

/// Serialize the session id and server-assigned password as the SSH password
pub fn password_payload(session_id: &str, ssh_password: &str) -> Result<String, SshError> {
    Ok(serde_json::to_string(&PasswordPayload {
        session_id,
        ssh_password,
    })?)
}

/// Everything the SSH client needs for one handshake
#[derive(Debug, Clone)]
pub struct SshParams {
    pub username: String,
    /// Serialized [`password_payload`]
    pub password: String,
    pub host_key: HostKeyVerifier,
    /// Silence after which the session sends a keepalive request
    pub keepalive_interval: Option<Duration>,
}

/// Runs the SSH client handshake over an established connection
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Handshake, verify the host key and authenticate
    ///
    /// A host key rejected by `params.host_key` must surface as
    /// [`SshError::HostKeyMismatch`].
    async fn connect(
        &self,
        conn: BoxConnection,
        params: SshParams,
    ) -> Result<Arc<dyn SshSession>, SshError>;
}

/// Multiplexable, authenticated session
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Probe the session; fails once a keepalive request went unanswered
    /// or the session is otherwise gone
    async fn send_keepalive(&self) -> Result<(), SshError>;

    /// Open a direct-tcpip channel to `remote_addr` (`host:port`)
    async fn dial(&self, remote_addr: &str) -> Result<PortForward, SshError>;
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
