//! Server entry: everything needed to reach and authenticate one relay server

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A relay server as advertised by the server list
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Server IP address (also the server's stable identifier)
    pub ip_address: String,
    /// Region code
    #[serde(default)]
    pub region: String,
    /// Advertised capability tokens (e.g. "SSH", "OSSH", "FRONTED-MEEK")
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Plain SSH port
    #[serde(default)]
    pub ssh_port: u16,
    /// Obfuscated SSH port
    #[serde(default)]
    pub ssh_obfuscated_port: u16,
    /// Obfuscation shared secret
    #[serde(default)]
    pub ssh_obfuscated_key: String,
    /// Pinned host public key (base64 of the SSH wire encoding)
    pub ssh_host_key: String,
    /// SSH username
    pub ssh_username: String,
    /// SSH password, sent inside the auth payload
    pub ssh_password: String,
}

impl ServerEntry {
    /// Load a single server entry from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read server entry: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse server entry: {}", e)))
    }

    /// Check whether the server advertises a capability
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

// Secrets stay out of logs
impl fmt::Debug for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEntry")
            .field("ip_address", &self.ip_address)
            .field("region", &self.region)
            .field("capabilities", &self.capabilities)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_obfuscated_port", &self.ssh_obfuscated_port)
            .field("ssh_username", &self.ssh_username)
            .finish_non_exhaustive()
    }
}
