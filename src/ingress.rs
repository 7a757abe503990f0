//! # Ingress Session Manager
//!
//! The side where sessions originate. For every entry in the mapping table
//! it binds a TCP listener; each accepted client becomes a session with a
//! freshly minted id and the mapping's dial target, echoed in every Data
//! frame so the egress side knows where to connect.
//!
//! The manager's run loop owns the link event stream: Data frames are
//! routed to the session's payload channel, Disconnects close the session
//! without a reply, and ProgramClose (or a fatal link event, or Ctrl-C)
//! hands control to the shutdown coordinator.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{MappingTable, PortMapping};
use crate::frame::{Command, Frame};
use crate::link::{self, LinkEvent, LinkWriter};
use crate::session::{
    close_without_notify, spawn_session_pumps, ActiveSessions, SessionHandle, SessionId,
    SessionTable,
};
use crate::shutdown::{self, Trigger};

/// Pause after a failed accept before retrying, so a transient resource
/// exhaustion does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run the ingress side over the given link device until shutdown,
/// returning the process exit code.
///
/// All listeners are bound before any traffic is served; a port that
/// cannot be bound is an initialisation failure.
pub async fn run<L>(device: L, mappings: MappingTable) -> Result<i32>
where
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let (device_r, device_w) = tokio::io::split(device);
    let (link, mut events) = link::start(device_r, device_w);
    let table = Arc::new(SessionTable::new());
    let active = ActiveSessions::new();

    let mut listeners = Vec::with_capacity(mappings.entries().len());
    for mapping in mappings.entries() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, mapping.local_port))
            .await
            .with_context(|| format!("binding listen port {}", mapping.local_port))?;
        info!(
            port = mapping.local_port,
            target = %mapping.target(),
            description = %mapping.description,
            "listening"
        );
        listeners.push((listener, mapping.clone()));
    }

    let accept_tasks: Vec<JoinHandle<()>> = listeners
        .into_iter()
        .map(|(listener, mapping)| {
            tokio::spawn(accept_loop(
                listener,
                mapping,
                Arc::clone(&table),
                link.clone(),
                active.clone(),
            ))
        })
        .collect();

    let trigger = dispatch_loop(&mut events, &table).await;

    // Step 1 of shutdown: no new sessions.
    for task in &accept_tasks {
        task.abort();
    }

    Ok(shutdown::run(trigger, &table, &link, &active).await)
}

async fn dispatch_loop(
    events: &mut mpsc::Receiver<LinkEvent>,
    table: &Arc<SessionTable>,
) -> Trigger {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                return Trigger::Signal;
            }
            event = events.recv() => match event {
                Some(LinkEvent::Frame(frame)) => {
                    if let Some(trigger) = dispatch_frame(frame, table).await {
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

/// Handle one frame from the peer. Returns a trigger when the frame ends
/// normal operation.
async fn dispatch_frame(frame: Frame, table: &SessionTable) -> Option<Trigger> {
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
                warn!(
                    session = %frame.session.short_hex(),
                    len = frame.payload.len(),
                    "dropping payload for unknown session"
                );
            }
        },
        Command::Disconnect => {
            // Close the local socket; never answer with a Disconnect.
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

async fn accept_loop(
    listener: TcpListener,
    mapping: PortMapping,
    table: Arc<SessionTable>,
    link: LinkWriter,
    active: ActiveSessions,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = match SessionId::generate() {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, peer = %peer, "cannot mint session id, refusing client");
                        continue;
                    }
                };

                let (handle, data_rx) =
                    SessionHandle::channel(id, mapping.target(), Some(mapping.local_port));
                if let Err(e) = table.insert(handle.clone()) {
                    // 128 random bits colliding means the CSPRNG is lying.
                    warn!(error = %e, "refusing client with duplicate session id");
                    continue;
                }

                info!(
                    session = %id.short_hex(),
                    port = mapping.local_port,
                    peer = %peer,
                    target = %mapping.target(),
                    open_on_port = table.sessions_on_port(mapping.local_port),
                    "session opened"
                );
                spawn_session_pumps(
                    stream,
                    handle,
                    data_rx,
                    Arc::clone(&table),
                    link.clone(),
                    active.clone(),
                );
            }
            Err(e) => {
                warn!(port = mapping.local_port, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
