//! Ping/pong liveness supervision.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Method used for liveness checks.
pub const PING_METHOD: &str = "ping";

/// Outcome of the keepalive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// A ping went unanswered within the pong timeout.
    TimedOut,
    /// The loop was cancelled externally.
    Cancelled,
}

/// Run liveness checks for `conn` until a ping times out or `cancel` fires.
///
/// Inbound traffic arms the check; once armed, further traffic does not
/// re-arm it. After `ping_interval` a `ping` request is sent. If its
/// response does not arrive within `pong_timeout`, the loop returns
/// [`KeepaliveOutcome::TimedOut`] and the caller closes the connection.
/// Only one check is ever in flight.
pub async fn run_keepalive(
    conn: &Connection,
    ping_interval: Duration,
    pong_timeout: Duration,
    cancel: CancellationToken,
) -> KeepaliveOutcome {
    loop {
        // Idle until traffic arms the timer
        tokio::select! {
            biased;
            () = cancel.cancelled() => return KeepaliveOutcome::Cancelled,
            () = conn.activity() => {}
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return KeepaliveOutcome::Cancelled,
            () = time::sleep(ping_interval) => {}
        }

        let (tx, rx) = oneshot::channel();
        if let Err(e) = conn.request(PING_METHOD, None, move |outcome| {
            let _ = tx.send(outcome);
        }) {
            debug!(error = %e, "ping not sent");
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return KeepaliveOutcome::Cancelled,
            pong = rx => {
                if let Ok(Err(e)) = pong {
                    // Any answer proves liveness
                    debug!(error = %e, "ping answered with error");
                }
            }
            () = time::sleep(pong_timeout) => {
                warn!(?pong_timeout, "no pong received");
                return KeepaliveOutcome::TimedOut;
            }
        }
    }
}
