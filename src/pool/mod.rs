//! Pool of established tunnels
//!
//! [`TunnelPool`] serves the same [`Tunneler`] contract as a single tunnel,
//! spreading port forwards round-robin over its members. Failed port
//! forwards are reported to the tunnel that served them; a per-tunnel
//! monitor fails the tunnel once its failure threshold is reached and
//! drops it from the pool when it closes.

use crate::ssh::PortForward;
use crate::tunnel::{Tunnel, TunnelError, Tunneler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Orchestrator over several tunnels
#[derive(Default)]
pub struct TunnelPool {
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    next: AtomicUsize,
}

impl TunnelPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add an established tunnel and start monitoring it
    ///
    /// Tunnels are deduplicated by server: if the pool already holds a live
    /// tunnel to the same server, the new one is closed and `None` returned.
    pub fn add(self: &Arc<Self>, tunnel: Tunnel) -> Option<Arc<Tunnel>> {
        let tunnel = Arc::new(tunnel);
        {
            let mut tunnels = self.lock();
            let duplicate = tunnels
                .iter()
                .any(|t| t.server_id() == tunnel.server_id() && !t.is_closed());
            if duplicate {
                drop(tunnels);
                info!(server = %tunnel.server_id(), "discarding duplicate tunnel");
                tunnel.close();
                return None;
            }
            tunnels.push(tunnel.clone());
        }

        let failures = tunnel.take_port_forward_failures();
        tokio::spawn(monitor_tunnel(Arc::downgrade(self), tunnel.clone(), failures));
        Some(tunnel)
    }

    pub fn remove(&self, tunnel: &Arc<Tunnel>) {
        self.lock().retain(|t| !Arc::ptr_eq(t, tunnel));
    }

    /// Live tunnels currently in the pool
    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.lock().iter().filter(|t| !t.is_closed()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and remove every tunnel
    pub fn close_all(&self) {
        let tunnels = std::mem::take(&mut *self.lock());
        for tunnel in tunnels {
            tunnel.close();
        }
    }

    fn next_tunnel(&self) -> Option<Arc<Tunnel>> {
        let active = self.tunnels();
        if active.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % active.len();
        Some(active[index].clone())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Tunnel>>> {
        self.tunnels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TunnelPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[async_trait]
impl Tunneler for TunnelPool {
    async fn dial(&self, remote_addr: &str) -> crate::Result<PortForward> {
        let tunnel = self.next_tunnel().ok_or(TunnelError::NoActiveTunnel)?;
        match tunnel.dial(remote_addr).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                if !tunnel.report_port_forward_failure() {
                    debug!(server = %tunnel.server_id(), "port forward failure report dropped");
                }
                Err(e)
            }
        }
    }

    /// Fail every tunnel in the pool
    fn signal_failure(&self) {
        warn!("tunnel pool received failure signal");
        let tunnels = std::mem::take(&mut *self.lock());
        for tunnel in tunnels {
            tunnel.signal_failure();
        }
    }
}

/// Fail `tunnel` after its threshold of port forward failures and remove
/// it from the pool once closed
async fn monitor_tunnel(
    pool: Weak<TunnelPool>,
    tunnel: Arc<Tunnel>,
    failures: Option<mpsc::Receiver<()>>,
) {
    let threshold = tunnel.port_forward_failure_threshold();
    let mut total = 0;

    match failures {
        Some(mut failures) => loop {
            tokio::select! {
                _ = tunnel.closed() => break,
                Some(()) = failures.recv() => {
                    total += 1;
                    if total >= threshold {
                        warn!(
                            server = %tunnel.server_id(),
                            "port forward failure threshold {} reached", threshold
                        );
                        tunnel.signal_failure();
                        break;
                    }
                }
            }
        },
        None => tunnel.closed().await,
    }

    if let Some(pool) = pool.upgrade() {
        pool.remove(&tunnel);
    }
    debug!(server = %tunnel.server_id(), "tunnel left pool");
}
