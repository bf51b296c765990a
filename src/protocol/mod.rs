//! Tunnel protocol tokens and negotiation
//!
//! A protocol token names a full layer stack. The capability a server must
//! advertise for a protocol is the token with its `-OSSH` suffix removed.
//! The meek capabilities are taken to imply obfuscated SSH support.

use crate::config::ServerEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol negotiation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("server does not have required capability {0}")]
    MissingCapability(String),

    #[error("server does not have any supported capabilities")]
    NoSupportedCapability,

    #[error("unknown tunnel protocol: {0}")]
    UnknownProtocol(String),
}

const OBFUSCATION_SUFFIX: &str = "-OSSH";

/// Supported tunnel protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelProtocol {
    /// Plain SSH over TCP
    #[serde(rename = "SSH")]
    Ssh,
    /// Obfuscated SSH over TCP
    #[serde(rename = "OSSH")]
    ObfuscatedSsh,
    /// Obfuscated SSH over meek, without domain fronting
    #[serde(rename = "UNFRONTED-MEEK-OSSH")]
    UnfrontedMeek,
    /// Obfuscated SSH over domain-fronted meek
    #[serde(rename = "FRONTED-MEEK-OSSH")]
    FrontedMeek,
}

/// Supported protocols in default preference order
pub const SUPPORTED_TUNNEL_PROTOCOLS: [TunnelProtocol; 4] = [
    TunnelProtocol::FrontedMeek,
    TunnelProtocol::UnfrontedMeek,
    TunnelProtocol::ObfuscatedSsh,
    TunnelProtocol::Ssh,
];

impl TunnelProtocol {
    /// Wire-visible protocol token
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Ssh => "SSH",
            TunnelProtocol::ObfuscatedSsh => "OSSH",
            TunnelProtocol::UnfrontedMeek => "UNFRONTED-MEEK-OSSH",
            TunnelProtocol::FrontedMeek => "FRONTED-MEEK-OSSH",
        }
    }

    /// Capability token a server must advertise to support this protocol
    pub fn required_capability(&self) -> &'static str {
        let token = self.as_str();
        token.strip_suffix(OBFUSCATION_SUFFIX).unwrap_or(token)
    }

    /// Uses the indirect HTTP (meek) transport
    pub fn uses_meek(&self) -> bool {
        matches!(self, TunnelProtocol::UnfrontedMeek | TunnelProtocol::FrontedMeek)
    }

    /// Uses domain fronting on the meek transport
    pub fn uses_fronting(&self) -> bool {
        matches!(self, TunnelProtocol::FrontedMeek)
    }

    /// Wraps the transport in the obfuscation layer
    pub fn uses_obfuscation(&self) -> bool {
        !matches!(self, TunnelProtocol::Ssh)
    }

    /// Server port to dial for this protocol
    ///
    /// Fronted meek reaches the server through the fronting domain, so it
    /// has no server port of its own.
    pub fn port(&self, server_entry: &ServerEntry) -> Option<u16> {
        match self {
            TunnelProtocol::FrontedMeek => None,
            TunnelProtocol::UnfrontedMeek | TunnelProtocol::ObfuscatedSsh => {
                Some(server_entry.ssh_obfuscated_port)
            }
            TunnelProtocol::Ssh => Some(server_entry.ssh_port),
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelProtocol {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SUPPORTED_TUNNEL_PROTOCOLS
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| NegotiationError::UnknownProtocol(s.to_string()))
    }
}

/// Select the tunnel protocol for a server
///
/// A required protocol is used as-is if the server has its capability.
/// Otherwise the first supported protocol, in preference order, whose
/// capability the server advertises wins.
pub fn select_protocol(
    required: Option<TunnelProtocol>,
    server_entry: &ServerEntry,
) -> Result<TunnelProtocol, NegotiationError> {
    select_protocol_among(required, server_entry, |_| true)
}

/// [`select_protocol`] restricted to the protocols `available` accepts
///
/// The restriction only applies to automatic selection; a required
/// protocol is checked against the server's capabilities alone.
pub fn select_protocol_among<F>(
    required: Option<TunnelProtocol>,
    server_entry: &ServerEntry,
    available: F,
) -> Result<TunnelProtocol, NegotiationError>
where
    F: Fn(TunnelProtocol) -> bool,
{
    if let Some(protocol) = required {
        let capability = protocol.required_capability();
        if !server_entry.has_capability(capability) {
            return Err(NegotiationError::MissingCapability(capability.to_string()));
        }
        return Ok(protocol);
    }

    SUPPORTED_TUNNEL_PROTOCOLS
        .iter()
        .copied()
        .filter(|p| available(*p))
        .find(|p| server_entry.has_capability(p.required_capability()))
        .ok_or(NegotiationError::NoSupportedCapability)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(capabilities: &[&str]) -> ServerEntry {
        ServerEntry {
            ip_address: "192.0.2.1".to_string(),
            region: "US".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            ssh_port: 22,
            ssh_obfuscated_port: 443,
            ssh_obfuscated_key: "key".to_string(),
            ssh_host_key: String::new(),
            ssh_username: "user".to_string(),
            ssh_password: "pass".to_string(),
        }
    }

    #[test]
    fn test_required_capabilities() {
        assert_eq!(TunnelProtocol::FrontedMeek.required_capability(), "FRONTED-MEEK");
        assert_eq!(TunnelProtocol::UnfrontedMeek.required_capability(), "UNFRONTED-MEEK");
        assert_eq!(TunnelProtocol::ObfuscatedSsh.required_capability(), "OSSH");
        assert_eq!(TunnelProtocol::Ssh.required_capability(), "SSH");
    }

    #[test]
    fn test_auto_select_ossh_only() {
        let server = entry(&["OSSH"]);
        let selected = select_protocol(None, &server).unwrap();
        assert_eq!(selected, TunnelProtocol::ObfuscatedSsh);
        assert_eq!(selected.port(&server), Some(443));
    }

    #[test]
    fn test_auto_select_prefers_fronted_meek() {
        let server = entry(&["SSH", "OSSH", "FRONTED-MEEK"]);
        assert_eq!(select_protocol(None, &server).unwrap(), TunnelProtocol::FrontedMeek);
    }

    #[test]
    fn test_auto_select_preference_order() {
        let server = entry(&["SSH", "UNFRONTED-MEEK", "OSSH"]);
        assert_eq!(select_protocol(None, &server).unwrap(), TunnelProtocol::UnfrontedMeek);

        let server = entry(&["SSH"]);
        assert_eq!(select_protocol(None, &server).unwrap(), TunnelProtocol::Ssh);
    }

    #[test]
    fn test_auto_select_none_supported() {
        let server = entry(&["VPN", "handshake"]);
        assert_eq!(
            select_protocol(None, &server),
            Err(NegotiationError::NoSupportedCapability)
        );
    }

    #[test]
    fn test_forced_protocol_mismatch() {
        let server = entry(&["OSSH"]);
        assert_eq!(
            select_protocol(Some(TunnelProtocol::Ssh), &server),
            Err(NegotiationError::MissingCapability("SSH".to_string()))
        );
    }

    #[test]
    fn test_auto_select_among_available() {
        let server = entry(&["FRONTED-MEEK", "OSSH", "SSH"]);
        let plain_only = |p: TunnelProtocol| !p.uses_obfuscation();
        assert_eq!(
            select_protocol_among(None, &server, plain_only).unwrap(),
            TunnelProtocol::Ssh
        );

        let server = entry(&["FRONTED-MEEK", "OSSH"]);
        assert_eq!(
            select_protocol_among(None, &server, plain_only),
            Err(NegotiationError::NoSupportedCapability)
        );

        // a required protocol is not filtered
        assert_eq!(
            select_protocol_among(Some(TunnelProtocol::ObfuscatedSsh), &server, plain_only),
            Ok(TunnelProtocol::ObfuscatedSsh)
        );
    }

    #[test]
    fn test_forced_protocol_skips_preference() {
        let server = entry(&["FRONTED-MEEK", "OSSH", "SSH"]);
        assert_eq!(
            select_protocol(Some(TunnelProtocol::Ssh), &server).unwrap(),
            TunnelProtocol::Ssh
        );
    }

    #[test]
    fn test_meek_capability_implies_obfuscation() {
        // no OSSH capability advertised, meek still selected
        let server = entry(&["UNFRONTED-MEEK"]);
        let selected = select_protocol(None, &server).unwrap();
        assert_eq!(selected, TunnelProtocol::UnfrontedMeek);
        assert!(selected.uses_obfuscation());
    }

    #[test]
    fn test_token_round_trip() {
        for protocol in SUPPORTED_TUNNEL_PROTOCOLS {
            assert_eq!(protocol.as_str().parse::<TunnelProtocol>().unwrap(), protocol);
        }
        assert!("MEEK".parse::<TunnelProtocol>().is_err());
    }

    #[test]
    fn test_layer_flags() {
        assert!(TunnelProtocol::FrontedMeek.uses_fronting());
        assert!(!TunnelProtocol::UnfrontedMeek.uses_fronting());
        assert!(!TunnelProtocol::ObfuscatedSsh.uses_meek());
        assert!(!TunnelProtocol::Ssh.uses_obfuscation());
        assert_eq!(TunnelProtocol::FrontedMeek.port(&entry(&[])), None);
    }
}
