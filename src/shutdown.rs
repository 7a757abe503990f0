//! # Shutdown Coordinator
//!
//! Both sides run the same teardown sequence, whether shutdown starts
//! locally (signal, fatal link error) or remotely (received ProgramClose):
//!
//! 1. Stop accepting new work (the caller does this before invoking
//!    [`run`]: ingress aborts its accept loops, egress simply stops
//!    dispatching frames).
//! 2. Locally initiated only: emit one ProgramClose so the peer can run
//!    its own sequence concurrently.
//! 3. Emit a Disconnect for every session still in the table, then cancel
//!    their pumps.
//! 4. Wait, bounded, for the pumps to drain and close their sockets.
//! 5. Wait, bounded, for the link writer to flush the device.
//!
//! Exit status is 0 on success, 1 when a bounded wait expired or the
//! trigger was a link fault (a corrupt stream must exit non-zero).

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::link::LinkWriter;
use crate::session::{ActiveSessions, SessionState, SessionTable};

/// Bounded wait for per-session sockets to drain and close.
pub const SOCKET_DRAIN_WAIT: Duration = Duration::from_secs(3);

/// Bounded wait for the link writer to flush the device.
pub const LINK_FLUSH_WAIT: Duration = Duration::from_secs(3);

/// What set the shutdown in motion. Local triggers announce themselves to
/// the peer with a ProgramClose; the remote trigger is the announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Operator signal (Ctrl-C / SIGINT).
    Signal,
    /// The link failed: device I/O error, EOF, or a corrupt frame stream.
    LinkFault,
    /// The peer sent ProgramClose.
    PeerClose,
}

impl Trigger {
    fn is_local(self) -> bool {
        matches!(self, Trigger::Signal | Trigger::LinkFault)
    }
}

/// Run the teardown sequence and return the process exit code.
pub async fn run(
    trigger: Trigger,
    table: &SessionTable,
    link: &LinkWriter,
    active: &ActiveSessions,
) -> i32 {
    info!(trigger = ?trigger, sessions = table.len(), "beginning shutdown");
    let mut failed = trigger == Trigger::LinkFault;

    if trigger.is_local() {
        // Best effort: after a link fault the writer may already be dead.
        if let Err(e) = link.program_close().await {
            debug!(error = %e, "could not announce ProgramClose");
        }
    }

    // Disconnect every remaining session first, then cancel the pumps, so
    // each Disconnect is on the wire before its socket starts closing.
    let handles = table.drain();
    for handle in &handles {
        handle.set_state(SessionState::HalfClosed);
        if let Err(e) = link.disconnect(handle.id).await {
            debug!(session = %handle.id.short_hex(), error = %e, "could not emit Disconnect");
        }
    }
    for handle in &handles {
        handle.cancel();
    }

    if timeout(SOCKET_DRAIN_WAIT, active.wait_idle()).await.is_err() {
        warn!(
            remaining = active.count(),
            "session sockets did not drain in time, force-destroying"
        );
        failed = true;
    }
    for handle in &handles {
        handle.set_state(SessionState::Closed);
    }

    match timeout(LINK_FLUSH_WAIT, link.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            // The device is unwritable; nothing left to preserve.
            debug!(error = %e, "link flush failed");
        }
        Err(_) => {
            warn!("link did not flush in time");
            failed = true;
        }
    }

    let code = i32::from(failed);
    info!(exit_code = code, "shutdown complete");
    code
}
