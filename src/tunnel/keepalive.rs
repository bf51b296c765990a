//! SSH keepalive monitor

use crate::ssh::SshSession;
use crate::transport::CloseHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Probe the session every `period` until `quit` fires
///
/// A failed probe closes the base connection directly, which fails the
/// tunnel for its owner, and ends the monitor.
pub(super) fn spawn(
    ssh: Arc<dyn SshSession>,
    conn: CloseHandle,
    quit: CloseHandle,
    period: Duration,
    server: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = quit.closed() => break,
                _ = ticker.tick() => {}
            }

            let probe = tokio::select! {
                result = ssh.send_keepalive() => result,
                _ = quit.closed() => break,
            };

            if let Err(e) = probe {
                warn!(server = %server, "ssh keep alive failed: {}", e);
                conn.close();
                return;
            }
        }

        debug!(server = %server, "keepalive monitor exiting");
    })
}
