//! Tunnel establishment
//!
//! Strictly sequential: negotiate → transport → obfuscation → SSH. Every
//! stage error is annotated with the stage and server. Anything opened
//! before a failing stage is closed before the error is returned.

use super::Tunnel;
use crate::config::{Config, ServerEntry};
use crate::crypto::make_session_id;
use crate::obfuscation::{ObfuscationError, Obfuscator};
use crate::protocol::{select_protocol_among, TunnelProtocol};
use crate::ssh::{password_payload, HostKeyVerifier, RusshConnector, SshConnector, SshParams};
use crate::transport::{
    BoxConnection, CloseOnDrop, DeviceBinder, DialConfig, DirectDialer, IndirectDialer,
    PendingConns, PendingRemoval, TcpDialer, TransportError,
};
use crate::{Error, Stage};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// The layer implementations a tunnel is built from
#[derive(Clone)]
pub struct Layers {
    /// Direct network dial
    pub direct: Arc<dyn DirectDialer>,
    /// Meek transport, required for the meek protocols
    pub indirect: Option<Arc<dyn IndirectDialer>>,
    /// Obfuscated SSH wrap, required for every protocol but plain SSH
    pub obfuscator: Option<Arc<dyn Obfuscator>>,
    /// SSH client
    pub ssh: Arc<dyn SshConnector>,
    /// Platform hook for device binding
    pub device_binder: Option<Arc<dyn DeviceBinder>>,
}

impl Layers {
    /// Direct TCP transport with the given SSH client
    pub fn new(ssh: Arc<dyn SshConnector>) -> Self {
        Self {
            direct: Arc::new(TcpDialer),
            indirect: None,
            obfuscator: None,
            ssh,
            device_binder: None,
        }
    }

    pub fn with_direct(mut self, direct: Arc<dyn DirectDialer>) -> Self {
        self.direct = direct;
        self
    }

    pub fn with_indirect(mut self, indirect: Arc<dyn IndirectDialer>) -> Self {
        self.indirect = Some(indirect);
        self
    }

    pub fn with_obfuscator(mut self, obfuscator: Arc<dyn Obfuscator>) -> Self {
        self.obfuscator = Some(obfuscator);
        self
    }

    pub fn with_device_binder(mut self, binder: Arc<dyn DeviceBinder>) -> Self {
        self.device_binder = Some(binder);
        self
    }

    /// Every layer `protocol` needs is installed
    pub fn supports(&self, protocol: TunnelProtocol) -> bool {
        self.missing(protocol).is_none()
    }

    fn missing(&self, protocol: TunnelProtocol) -> Option<(Stage, Error)> {
        if protocol.uses_meek() && self.indirect.is_none() {
            let e = TransportError::Unavailable("no meek dialer installed".to_string());
            return Some((Stage::Transport, e.into()));
        }
        if protocol.uses_obfuscation() && self.obfuscator.is_none() {
            return Some((Stage::Obfuscation, ObfuscationError::Unavailable.into()));
        }
        None
    }
}

impl Default for Layers {
    fn default() -> Self {
        Self::new(Arc::new(RusshConnector::default()))
    }
}

/// Establish a tunnel to `server_entry`
///
/// Uses `config.tunnel_protocol` when set, otherwise the first protocol
/// the server advertises that `layers` can carry. A protocol whose layers
/// are not installed fails before anything is dialed. The server is
/// authenticated with the pinned host key in its entry. Direct dials are
/// registered in `pending_conns` for the duration of the attempt so an
/// orchestrator can interrupt it.
pub async fn establish_tunnel(
    config: &Config,
    layers: &Layers,
    pending_conns: Option<Arc<PendingConns>>,
    server_entry: Arc<ServerEntry>,
) -> crate::Result<Tunnel> {
    config.validate()?;
    let server = server_entry.ip_address.as_str();

    let protocol =
        select_protocol_among(config.tunnel_protocol, &server_entry, |p| layers.supports(p))
            .map_err(at(Stage::Negotiation, server))?;
    if let Some((stage, e)) = layers.missing(protocol) {
        return Err(Error::establish(stage, server, e));
    }
    info!(
        "connecting to {} in region {} using {}",
        server, server_entry.region, protocol
    );

    let host_key = HostKeyVerifier::from_base64(&server_entry.ssh_host_key)
        .map_err(at(Stage::HostKey, server))?;

    // Generated before dialing: meek carries it with the transport
    let session_id = make_session_id().map_err(at(Stage::SessionId, server))?;
    let password = password_payload(&session_id, &server_entry.ssh_password)
        .map_err(at(Stage::SecureSession, server))?;

    let dial_config = config.dial_config(pending_conns.clone(), layers.device_binder.clone());
    let conn = dial_transport(protocol, &server_entry, &session_id, layers, &dial_config)
        .await
        .map_err(at(Stage::Transport, server))?;

    let base = conn.close_handle();
    let release = CloseOnDrop::new(base.clone());
    let _pending = pending_conns.map(|registry| PendingRemoval::new(registry, base));

    let conn = if protocol.uses_obfuscation() {
        let obfuscator = layers
            .obfuscator
            .as_ref()
            .ok_or(ObfuscationError::Unavailable)
            .map_err(at(Stage::Obfuscation, server))?;
        obfuscator
            .wrap(conn, &server_entry.ssh_obfuscated_key)
            .await
            .map_err(at(Stage::Obfuscation, server))?
    } else {
        conn
    };

    let params = SshParams {
        username: server_entry.ssh_username.clone(),
        password,
        host_key,
        keepalive_interval: Some(config.keepalive_period()),
    };
    let ssh = layers
        .ssh
        .connect(conn, params)
        .await
        .map_err(at(Stage::SecureSession, server))?;

    debug!(server = %server, session_id = %session_id, "tunnel established");
    let base = release.disarm();
    Ok(Tunnel::new(
        server_entry.clone(),
        session_id,
        protocol,
        base,
        ssh,
        config.keepalive_period(),
        config.port_forward_failure_threshold,
    ))
}

/// Annotate a stage error with where it happened
fn at<E: Into<Error>>(stage: Stage, server: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::establish(stage, server, e)
}

async fn dial_transport(
    protocol: TunnelProtocol,
    server_entry: &ServerEntry,
    session_id: &str,
    layers: &Layers,
    dial_config: &DialConfig,
) -> Result<BoxConnection, TransportError> {
    if protocol.uses_meek() {
        let indirect = layers
            .indirect
            .as_ref()
            .ok_or_else(|| TransportError::Unavailable("no meek dialer installed".to_string()))?;
        return indirect
            .dial(server_entry, session_id, protocol.uses_fronting(), dial_config)
            .await;
    }

    let port = protocol.port(server_entry).ok_or_else(|| {
        TransportError::Unavailable(format!("{} has no server port", protocol))
    })?;
    let addr = server_address(&server_entry.ip_address, port);
    layers.direct.dial(&addr, dial_config).await
}

/// `ip:port`, bracketing IPv6 addresses
fn server_address(ip_address: &str, port: u16) -> String {
    match ip_address.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{}:{}", ip_address, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_address() {
        assert_eq!(server_address("192.0.2.1", 443), "192.0.2.1:443");
        assert_eq!(server_address("2001:db8::1", 22), "[2001:db8::1]:22");
        assert_eq!(server_address("relay.example", 22), "relay.example:22");
    }
}
