//! Obfuscation layer
//!
//! Wraps a transport connection in a shared-secret obfuscation handshake
//! (obfuscated SSH) so the stream resists passive protocol fingerprinting.
//! The cipher itself is supplied by the embedder through [`Obfuscator`];
//! the wrapped connection must forward its close handle to the connection
//! it wraps.

use crate::transport::BoxConnection;
use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Obfuscation layer errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid obfuscation key")]
    InvalidKey,

    #[error("No obfuscator installed")]
    Unavailable,
}

/// Shared-secret obfuscation wrap
#[async_trait]
pub trait Obfuscator: Send + Sync {
    /// Run the obfuscation handshake over `conn`
    ///
    /// On failure `conn` is dropped; the caller still closes the base
    /// connection through its own handle.
    async fn wrap(
        &self,
        conn: BoxConnection,
        obfuscation_key: &str,
    ) -> Result<BoxConnection, ObfuscationError>;
}
