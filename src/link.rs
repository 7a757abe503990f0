//! # Link Writer and Link Reader
//!
//! The UART is the sole shared writable resource, so every frame write goes
//! through one serialisation point: the link writer actor. The public
//! [`LinkWriter`] handle is cheap to clone; the actor owns the device's
//! write half and emits each submitted frame with a single `write_all`,
//! which keeps frames whole with respect to each other. The command channel
//! is bounded, so a slow device suspends submitters instead of dropping
//! frames.
//!
//! [`start`] also spawns the read task: device chunks feed a [`Framer`] and
//! decoded frames are delivered in order as [`LinkEvent::Frame`]. Device
//! read errors and framing errors end the task with one terminal
//! [`LinkEvent::Fatal`]; the link is binary, functioning or shutting down.
//!
//! The layer is generic over `AsyncRead`/`AsyncWrite` so tests can run both
//! tunnel sides over an in-memory duplex pipe.

use std::io;
use std::net::SocketAddrV4;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::frame::Frame;
use crate::framer::{Framer, FramingError};
use crate::session::SessionId;

/// Bound on queued frame submissions. Backpressure, not a drop threshold.
pub const LINK_CHANNEL_CAPACITY: usize = 64;

/// Read size for the device → framer direction.
pub const LINK_READ_BUFFER: usize = 4096;

// ============================================================================
// Errors and events
// ============================================================================

/// The link writer actor has stopped; no further frames can be sent.
#[derive(Debug, Clone, Copy)]
pub struct LinkClosed;

impl std::fmt::Display for LinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("link writer is closed")
    }
}

impl std::error::Error for LinkClosed {}

/// Terminal link failure, reported once via [`LinkEvent::Fatal`].
#[derive(Debug)]
pub enum LinkError {
    /// Device read or write failed, or the device reached EOF.
    Io(io::Error),
    /// The byte stream decoded to an impossible frame.
    Framing(FramingError),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Io(e) => write!(f, "link I/O error: {}", e),
            LinkError::Framing(e) => write!(f, "link framing error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

/// What the link reader hands to the session manager.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(Frame),
    Fatal(LinkError),
}

// ============================================================================
// LinkWriter handle
// ============================================================================

enum LinkCommand {
    Frame(Frame),
    Flush(oneshot::Sender<io::Result<()>>),
}

/// Handle to the link writer actor. Cheap to clone; every tunnel task that
/// emits frames holds one.
#[derive(Clone)]
pub struct LinkWriter {
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl LinkWriter {
    /// Submit one whole frame. Suspends while the link is backed up.
    pub async fn send(&self, frame: Frame) -> Result<(), LinkClosed> {
        self.cmd_tx
            .send(LinkCommand::Frame(frame))
            .await
            .map_err(|_| LinkClosed)
    }

    /// Submit a Data frame for `session`.
    pub async fn data(
        &self,
        session: SessionId,
        target: SocketAddrV4,
        payload: Vec<u8>,
    ) -> Result<(), LinkClosed> {
        self.send(Frame::data(session, target, payload)).await
    }

    /// Submit the session's Disconnect.
    pub async fn disconnect(&self, session: SessionId) -> Result<(), LinkClosed> {
        self.send(Frame::disconnect(session)).await
    }

    /// Announce imminent termination to the peer. The carried session id is
    /// fresh random by convention; recipients ignore it either way.
    pub async fn program_close(&self) -> Result<(), LinkClosed> {
        let session = SessionId::generate().unwrap_or_else(|e| {
            warn!(error = %e, "CSPRNG unavailable for ProgramClose id, sending zeros");
            SessionId::from_bytes([0u8; 16])
        });
        self.send(Frame::program_close(session)).await
    }

    /// Flush the device once every prior submission has been written.
    pub async fn flush(&self) -> io::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Flush(reply_tx))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, LinkClosed))?;
        reply_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, LinkClosed))?
    }
}

// ============================================================================
// Actor and reader task
// ============================================================================

/// Spawn the writer actor and reader task over the two halves of the link
/// device. Returns the writer handle and the in-order event stream.
pub fn start<R, W>(reader: R, writer: W) -> (LinkWriter, mpsc::Receiver<LinkEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

    tokio::spawn(write_loop(writer, cmd_rx, event_tx.clone()));
    tokio::spawn(read_loop(reader, event_tx));

    (LinkWriter { cmd_tx }, event_rx)
}

async fn write_loop<W>(
    mut writer: W,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    event_tx: mpsc::Sender<LinkEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            LinkCommand::Frame(frame) => {
                trace!(
                    cmd = ?frame.cmd,
                    session = %frame.session.short_hex(),
                    len = frame.payload.len(),
                    "writing frame"
                );
                let bytes = frame.encode();
                if let Err(e) = writer.write_all(&bytes).await {
                    error!(error = %e, "link write failed");
                    let _ = event_tx.send(LinkEvent::Fatal(LinkError::Io(e))).await;
                    return;
                }
            }
            LinkCommand::Flush(reply) => {
                let _ = reply.send(writer.flush().await);
            }
        }
    }
    debug!("link writer stopped");
}

async fn read_loop<R>(mut reader: R, event_tx: mpsc::Sender<LinkEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = Framer::new();
    let mut buf = vec![0u8; LINK_READ_BUFFER];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("link device EOF");
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "link device closed");
                let _ = event_tx.send(LinkEvent::Fatal(LinkError::Io(eof))).await;
                return;
            }
            Ok(n) => {
                framer.push(&buf[..n]);
                loop {
                    match framer.next_frame() {
                        Ok(Some(frame)) => {
                            if event_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "link stream corrupt");
                            let _ = event_tx.send(LinkEvent::Fatal(LinkError::Framing(e))).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "link read failed");
                let _ = event_tx.send(LinkEvent::Fatal(LinkError::Io(e))).await;
                return;
            }
        }
    }
}
