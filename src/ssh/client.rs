//! SSH client backed by russh

use super::{
    split_host_port, HostKeyVerifier, PortForward, SshConnector, SshError, SshParams, SshSession,
};
use crate::transport::BoxConnection;
use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// Originator reported for direct-tcpip channels
const ORIGINATOR_ADDRESS: &str = "127.0.0.1";
const ORIGINATOR_PORT: u32 = 0;

const KEEPALIVE_MAX_UNANSWERED: usize = 1;

/// Client handler that accepts only the pinned host key
struct PinnedKeyHandler {
    verifier: HostKeyVerifier,
    mismatch: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for PinnedKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.verifier.verify(&server_public_key.public_key_bytes()) {
            Ok(()) => Ok(true),
            Err(_) => {
                self.mismatch.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// [`SshConnector`] using the russh client
///
/// Each session sends `keepalive@openssh.com` requests after
/// `SshParams::keepalive_interval` of silence from the server and shuts
/// down once more than `keepalive_max` in a row go unanswered.
#[derive(Debug, Clone)]
pub struct RusshConnector {
    keepalive_max: usize,
}

impl RusshConnector {
    pub fn new() -> Self {
        Self {
            keepalive_max: KEEPALIVE_MAX_UNANSWERED,
        }
    }

    /// Unanswered keepalives tolerated before the session is torn down (at least 1)
    pub fn with_keepalive_max(mut self, keepalive_max: usize) -> Self {
        self.keepalive_max = keepalive_max.max(1);
        self
    }

    fn session_config(&self, keepalive_interval: Option<Duration>) -> client::Config {
        client::Config {
            keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(
        &self,
        conn: BoxConnection,
        params: SshParams,
    ) -> Result<Arc<dyn SshSession>, SshError> {
        let config = Arc::new(self.session_config(params.keepalive_interval));
        let mismatch = Arc::new(AtomicBool::new(false));
        let handler = PinnedKeyHandler {
            verifier: params.host_key,
            mismatch: mismatch.clone(),
        };

        let mut handle = match client::connect_stream(config, conn, handler).await {
            Ok(handle) => handle,
            Err(_) if mismatch.load(Ordering::SeqCst) => return Err(SshError::HostKeyMismatch),
            Err(e) => return Err(SshError::Handshake(e.to_string())),
        };

        let accepted = handle
            .authenticate_password(params.username, params.password)
            .await
            .map_err(|e| SshError::Handshake(e.to_string()))?;
        if !accepted {
            return Err(SshError::AuthenticationRejected);
        }

        debug!("SSH session authenticated");
        Ok(Arc::new(RusshSession { handle }))
    }
}

struct RusshSession {
    handle: client::Handle<PinnedKeyHandler>,
}

#[async_trait]
impl SshSession for RusshSession {
    // The session runs its own keepalive exchange and ends on a missed
    // reply; the probe reports whether it is still running.
    async fn send_keepalive(&self) -> Result<(), SshError> {
        if self.handle.is_closed() {
            return Err(SshError::SessionClosed);
        }
        Ok(())
    }

    async fn dial(&self, remote_addr: &str) -> Result<PortForward, SshError> {
        let (host, port) = split_host_port(remote_addr).ok_or_else(|| SshError::PortForward {
            addr: remote_addr.to_string(),
            reason: "invalid address".to_string(),
        })?;

        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, ORIGINATOR_ADDRESS, ORIGINATOR_PORT)
            .await
            .map_err(|e| SshError::PortForward {
                addr: remote_addr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(Box::pin(channel.into_stream())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::password_payload;
    use crate::transport::{ClosableStream, CloseHandle};
    use russh::server::{self, Auth, Msg, Session};
    use russh::Channel;
    use russh_keys::key::KeyPair;
    use std::sync::Mutex;
    use tokio::io::{duplex, split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    const PASSWORD: &str = "relay-password";

    #[derive(Clone, Default)]
    struct RelayServer {
        passwords: Arc<Mutex<Vec<String>>>,
        forwards: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl server::Handler for RelayServer {
        type Error = russh::Error;

        async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
            self.passwords.lock().unwrap().push(password.to_string());
            let accepted = serde_json::from_str::<serde_json::Value>(password)
                .map(|payload| payload["SshPassword"] == PASSWORD)
                .unwrap_or(false);
            if accepted {
                Ok(Auth::Accept)
            } else {
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }

        async fn channel_open_direct_tcpip(
            &mut self,
            channel: Channel<Msg>,
            host_to_connect: &str,
            port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut Session,
        ) -> Result<bool, Self::Error> {
            self.forwards
                .lock()
                .unwrap()
                .push(format!("{}:{}", host_to_connect, port_to_connect));
            tokio::spawn(async move {
                let mut stream = channel.into_stream();
                let mut buf = [0u8; 64];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(true)
        }
    }

    /// Copy `from` into `to`, discarding everything once `muted` is set
    async fn pump<R, W>(mut from: R, mut to: W, muted: Arc<AtomicBool>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match from.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if muted.load(Ordering::SeqCst) {
                continue;
            }
            if to.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    }

    struct Link {
        conn: BoxConnection,
        base: CloseHandle,
        server_muted: Arc<AtomicBool>,
    }

    /// Run a russh server with `key` behind an in-memory link
    fn start_server(key: KeyPair, server: RelayServer) -> Link {
        let (client_io, client_peer) = duplex(64 * 1024);
        let (server_io, server_peer) = duplex(64 * 1024);

        let config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        });
        tokio::spawn(async move {
            if let Ok(session) = server::run_stream(config, server_io, server).await {
                let _ = session.await;
            }
        });

        let server_muted = Arc::new(AtomicBool::new(false));
        let (client_read, client_write) = split(client_peer);
        let (server_read, server_write) = split(server_peer);
        tokio::spawn(pump(
            client_read,
            server_write,
            Arc::new(AtomicBool::new(false)),
        ));
        tokio::spawn(pump(server_read, client_write, server_muted.clone()));

        let conn = ClosableStream::new(client_io);
        let base = conn.handle().clone();
        Link {
            conn: Box::new(conn),
            base,
            server_muted,
        }
    }

    fn host_key(key: &KeyPair) -> HostKeyVerifier {
        HostKeyVerifier::new(key.clone_public_key().unwrap().public_key_bytes())
    }

    fn params(host_key: HostKeyVerifier, ssh_password: &str) -> SshParams {
        SshParams {
            username: "relay-user".to_string(),
            password: password_payload("00112233445566778899aabbccddeeff", ssh_password)
                .unwrap(),
            host_key,
            keepalive_interval: Some(Duration::from_millis(100)),
        }
    }

    async fn wait_closed(session: &Arc<dyn SshSession>) -> Result<(), SshError> {
        for _ in 0..100 {
            session.send_keepalive().await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    #[test]
    fn test_session_config_keepalive() {
        let config = RusshConnector::new()
            .with_keepalive_max(0)
            .session_config(Some(Duration::from_secs(60)));
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.keepalive_max, 1);

        let config = RusshConnector::default().session_config(None);
        assert_eq!(config.keepalive_interval, None);
        assert_eq!(config.keepalive_max, KEEPALIVE_MAX_UNANSWERED);
    }

    #[tokio::test]
    async fn test_pinned_key_and_password_payload() {
        let key = KeyPair::generate_ed25519().unwrap();
        let server = RelayServer::default();
        let link = start_server(key.clone(), server.clone());

        let session = RusshConnector::default()
            .connect(link.conn, params(host_key(&key), PASSWORD))
            .await
            .unwrap();
        assert!(session.send_keepalive().await.is_ok());

        let passwords = server.passwords.lock().unwrap().clone();
        assert_eq!(passwords.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&passwords[0]).unwrap();
        assert_eq!(payload["SessionId"], "00112233445566778899aabbccddeeff");
        assert_eq!(payload["SshPassword"], PASSWORD);
    }

    #[tokio::test]
    async fn test_unpinned_server_key_rejected() {
        let key = KeyPair::generate_ed25519().unwrap();
        let other = KeyPair::generate_ed25519().unwrap();
        let server = RelayServer::default();
        let link = start_server(key, server.clone());

        let result = RusshConnector::default()
            .connect(link.conn, params(host_key(&other), PASSWORD))
            .await;

        assert!(matches!(result, Err(SshError::HostKeyMismatch)));
        assert!(link.base.is_closed());
        assert!(server.passwords.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let key = KeyPair::generate_ed25519().unwrap();
        let link = start_server(key.clone(), RelayServer::default());

        let result = RusshConnector::default()
            .connect(link.conn, params(host_key(&key), "stale-password"))
            .await;

        assert!(matches!(result, Err(SshError::AuthenticationRejected)));
    }

    #[tokio::test]
    async fn test_direct_tcpip_port_forward() {
        let key = KeyPair::generate_ed25519().unwrap();
        let server = RelayServer::default();
        let link = start_server(key.clone(), server.clone());
        let session = RusshConnector::default()
            .connect(link.conn, params(host_key(&key), PASSWORD))
            .await
            .unwrap();

        let mut forward = session.dial("example.com:443").await.unwrap();
        forward.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        forward.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        assert_eq!(
            server.forwards.lock().unwrap().as_slice(),
            ["example.com:443".to_string()]
        );

        assert!(matches!(
            session.dial("example.com").await,
            Err(SshError::PortForward { .. })
        ));
    }

    #[tokio::test]
    async fn test_keepalive_answered_keeps_session() {
        let key = KeyPair::generate_ed25519().unwrap();
        let link = start_server(key.clone(), RelayServer::default());
        let base = link.base.clone();
        let session = RusshConnector::default()
            .connect(link.conn, params(host_key(&key), PASSWORD))
            .await
            .unwrap();

        // Several keepalive intervals with the server replying
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(session.send_keepalive().await.is_ok());
        assert!(!base.is_closed());
    }

    #[tokio::test]
    async fn test_unanswered_keepalive_fails_session() {
        let key = KeyPair::generate_ed25519().unwrap();
        let link = start_server(key.clone(), RelayServer::default());
        let base = link.base.clone();
        let session = RusshConnector::default()
            .connect(link.conn, params(host_key(&key), PASSWORD))
            .await
            .unwrap();
        assert!(session.send_keepalive().await.is_ok());

        link.server_muted.store(true, Ordering::SeqCst);

        assert!(matches!(
            wait_closed(&session).await,
            Err(SshError::SessionClosed)
        ));
        // Session teardown releases the base connection
        tokio::time::timeout(Duration::from_secs(2), base.closed())
            .await
            .expect("base connection left open");
        assert!(matches!(
            session.dial("example.com:443").await,
            Err(SshError::PortForward { .. })
        ));
    }
}
