//! # Egress Session Manager
//!
//! The side where sessions terminate. There are no listeners: a Data frame
//! for an unknown id births the session and starts a dial to the routing
//! target named in the frame. Payloads arriving while the dial is in
//! flight queue on the session's channel and flush, in order, once the
//! socket is up; a failed dial drops them and answers with one Disconnect.
//!
//! Routing fields on frames after the first are ignored, as are the fields
//! on anything travelling back toward ingress.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::frame::{Command, Frame};
use crate::link::{self, LinkEvent, LinkWriter};
use crate::session::{
    close_without_notify, spawn_session_pumps, ActiveSessions, SessionHandle, SessionTable,
};
use crate::shutdown::{self, Trigger};

/// Bound on a dial to the routing target. A timeout is handled exactly
/// like a refused connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the egress side over the given link device until shutdown,
/// returning the process exit code.
pub async fn run<L>(device: L) -> Result<i32>
where
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let (device_r, device_w) = tokio::io::split(device);
    let (link, mut events) = link::start(device_r, device_w);
    let table = Arc::new(SessionTable::new());
    let active = ActiveSessions::new();

    let trigger = dispatch_loop(&mut events, &table, &link, &active).await;

    // Once the loop exits no further frame is dispatched, so no unknown id
    // can start a dial: new work is refused by construction.
    Ok(shutdown::run(trigger, &table, &link, &active).await)
}

async fn dispatch_loop(
    events: &mut mpsc::Receiver<LinkEvent>,
    table: &Arc<SessionTable>,
    link: &LinkWriter,
    active: &ActiveSessions,
) -> Trigger {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                return Trigger::Signal;
            }
            event = events.recv() => match event {
                Some(LinkEvent::Frame(frame)) => {
                    if let Some(trigger) = dispatch_frame(frame, table, link, active).await {
                        return trigger;
                    }
                }
                Some(LinkEvent::Fatal(e)) => {
                    warn!(error = %e, "link failed");
                    return Trigger::LinkFault;
                }
                None => {
                    warn!("link reader stopped");
                    return Trigger::LinkFault;
                }
            }
        }
    }
}

async fn dispatch_frame(
    frame: Frame,
    table: &Arc<SessionTable>,
    link: &LinkWriter,
    active: &ActiveSessions,
) -> Option<Trigger> {
    match frame.cmd {
        Command::Data => match table.get(frame.session) {
            Some(session) => {
                if session.deliver(frame.payload).await.is_err() {
                    warn!(
                        session = %frame.session.short_hex(),
                        "dropping payload for closed session"
                    );
                }
            }
            None => {
                open_session(frame, table, link, active).await;
            }
        },
        Command::Disconnect => {
            if close_without_notify(table, frame.session) {
                info!(session = %frame.session.short_hex(), "peer disconnected session");
            } else {
                warn!(
                    session = %frame.session.short_hex(),
                    "disconnect for unknown session"
                );
            }
        }
        Command::ProgramClose => {
            info!("peer announced ProgramClose");
            return Some(Trigger::PeerClose);
        }
    }
    None
}

/// First Data frame for an unseen id: record the session and dial the
/// routing target it names. The frame's payload is the first thing queued.
async fn open_session(
    frame: Frame,
    table: &Arc<SessionTable>,
    link: &LinkWriter,
    active: &ActiveSessions,
) {
    let (handle, data_rx) = SessionHandle::channel(frame.session, frame.target, None);
    if let Err(e) = table.insert(handle.clone()) {
        // Lost a race with a concurrent dispatch of the same id; cannot
        // happen with a single dispatch loop, but insert is checked anyway.
        warn!(error = %e, "not opening duplicate session");
        return;
    }

    info!(
        session = %frame.session.short_hex(),
        target = %frame.target,
        "session opened, dialling"
    );

    if handle.deliver(frame.payload).await.is_err() {
        debug!(session = %frame.session.short_hex(), "session closed before dial started");
        return;
    }

    let table = Arc::clone(table);
    let link = link.clone();
    let active = active.clone();
    tokio::spawn(async move {
        match timeout(DIAL_TIMEOUT, TcpStream::connect(handle.target)).await {
            Ok(Ok(stream)) => {
                debug!(session = %handle.id.short_hex(), target = %handle.target, "dial complete");
                spawn_session_pumps(stream, handle, data_rx, table, link, active);
            }
            Ok(Err(e)) => {
                error!(
                    session = %handle.id.short_hex(),
                    target = %handle.target,
                    error = %e,
                    "dial failed, dropping queued payloads"
                );
                fail_dial(&table, &link, handle).await;
            }
            Err(_) => {
                error!(
                    session = %handle.id.short_hex(),
                    target = %handle.target,
                    "dial timed out, dropping queued payloads"
                );
                fail_dial(&table, &link, handle).await;
            }
        }
    });
}

async fn fail_dial(table: &SessionTable, link: &LinkWriter, handle: SessionHandle) {
    if table.remove(handle.id).is_some() {
        handle.cancel();
        if let Err(e) = link.disconnect(handle.id).await {
            debug!(session = %handle.id.short_hex(), error = %e, "could not notify peer of failed dial");
        }
    }
    // data_rx was moved into the dial task and is dropped here with it,
    // discarding whatever queued while the dial was in flight.
}
