//! # Relay Tunnel
//!
//! Builds a single obfuscated, multi-layer tunnel to a relay server and
//! exposes it as a "dial through me" capability.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Tunneler (dial, fail)                │
//! │            Tunnel  /  TunnelPool (orchestrator)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Secure Session                      │
//! │      (SSH, pinned host key, password payload)        │
//! ├─────────────────────────────────────────────────────┤
//! │               Obfuscation Layer (opt.)               │
//! │          (shared-secret obfuscated SSH wrap)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │        (direct TCP, or meek / domain-fronted)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Closing the base transport connection unwinds every layer above it.

pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod pool;
pub mod protocol;
pub mod ssh;
pub mod transport;
pub mod tunnel;

pub use config::{Config, ServerEntry};
pub use pool::TunnelPool;
pub use protocol::TunnelProtocol;
pub use tunnel::{establish_tunnel, Layers, Tunnel, Tunneler};

use std::fmt;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Establishment stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Negotiation,
    SessionId,
    Transport,
    Obfuscation,
    HostKey,
    SecureSession,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Negotiation => "protocol negotiation",
            Stage::SessionId => "session id generation",
            Stage::Transport => "transport dial",
            Stage::Obfuscation => "obfuscation handshake",
            Stage::HostKey => "host key decoding",
            Stage::SecureSession => "ssh handshake",
        };
        f.write_str(name)
    }
}

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capability mismatch: {0}")]
    Negotiation(#[from] protocol::NegotiationError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh::SshError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{stage} failed for server {server}: {source}")]
    Establish {
        stage: Stage,
        server: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Annotate an error with the stage and server it happened at
    pub fn establish(stage: Stage, server: &str, source: impl Into<Error>) -> Self {
        Error::Establish {
            stage,
            server: server.to_string(),
            source: Box::new(source.into()),
        }
    }

    /// Stage the error was raised in, if it came from establishment
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Establish { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Error with any establishment annotation removed
    pub fn root(&self) -> &Error {
        match self {
            Error::Establish { source, .. } => source.root(),
            other => other,
        }
    }

    /// Requested or auto-selected protocol not supported by the server
    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self.root(), Error::Negotiation(_))
    }

    /// Host key mismatch or credential rejection
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self.root(),
            Error::Ssh(ssh::SshError::HostKeyMismatch) | Error::Ssh(ssh::SshError::AuthenticationRejected)
        )
    }

    /// Dial or connect error at the transport or obfuscation layer
    pub fn is_transport_failure(&self) -> bool {
        matches!(self.root(), Error::Transport(_) | Error::Obfuscation(_))
    }
}
