//! Direct TCP transport

use super::{
    BoxConnection, ClosableStream, CloseHandle, DialConfig, DirectDialer, TransportError,
};
use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

/// Dials servers directly over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl DirectDialer for TcpDialer {
    async fn dial(&self, addr: &str, config: &DialConfig) -> Result<BoxConnection, TransportError> {
        dial_tcp(addr, config).await
    }
}

/// Dial `addr` and wrap the stream as a closable base connection
///
/// The connection is registered in the config's pending registry before
/// connecting, so [`PendingConns::close_all`](super::PendingConns::close_all)
/// interrupts the dial itself as well as any handshake running over it.
/// The caller removes it once establishment is settled.
pub async fn dial_tcp(addr: &str, config: &DialConfig) -> Result<BoxConnection, TransportError> {
    let handle = CloseHandle::new();
    if let Some(pending) = &config.pending_conns {
        if !pending.add(&handle) {
            return Err(TransportError::Interrupted);
        }
    }

    let result = tokio::select! {
        result = connect(addr, config) => result,
        _ = handle.closed() => Err(TransportError::Interrupted),
    };

    match result {
        Ok(stream) => Ok(Box::new(
            ClosableStream::with_handle(stream, handle)
                .with_timeouts(config.read_timeout, config.write_timeout),
        )),
        Err(e) => {
            if let Some(pending) = &config.pending_conns {
                pending.remove(&handle);
            }
            handle.close();
            Err(e)
        }
    }
}

async fn connect(addr: &str, config: &DialConfig) -> Result<TcpStream, TransportError> {
    let connect = async {
        let remote = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no address for {}", addr)))?;

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(binding) = &config.device_binding {
            let binder = config.device_binder.as_ref().ok_or_else(|| {
                TransportError::DeviceBinding("no device binder installed".to_string())
            })?;
            binder
                .bind(&socket, binding)
                .map_err(|e| TransportError::DeviceBinding(e.to_string()))?;
        }

        let stream = socket.connect(remote).await?;
        stream.set_nodelay(true).ok();
        Ok::<_, TransportError>(stream)
    };

    tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| TransportError::Timeout)?
}
