//! Randomness for tunnel identifiers
//!
//! Session identifiers are generated from the system CSPRNG and hex encoded.

use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Length of a session identifier in random bytes (hex doubles it)
pub const SESSION_ID_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Random generation failed")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a session identifier for the server API
///
/// Sent inside the SSH password payload and, for meek, with the transport
/// itself so the server can attribute session stats before SSH starts.
pub fn make_session_id() -> Result<String, CryptoError> {
    let mut id = [0u8; SESSION_ID_LEN];
    random_bytes(&mut id)?;
    Ok(hex::encode(id))
}
