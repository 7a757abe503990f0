//! # Wire Frame Codec
//!
//! Every unit transferred over the serial link is a frame with a fixed
//! 27-byte header and a variable payload:
//!
//! ```text
//! offset size field
//!   0    1    cmd         (u8)
//!   1   16    session_id  (128-bit opaque)
//!  17    4    target_ip   (IPv4, octet per byte)
//!  21    2    target_port (u16, big-endian)
//!  23    4    data_len    (u32, big-endian)
//!  27    n    payload
//! ```
//!
//! The routing fields are informational except on the first Data frame the
//! egress side sees for an unknown session, where they name the dial target.
//! Disconnect and ProgramClose carry no payload and zeroed routing fields.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::session::SessionId;

/// Fixed size of the frame header preceding the payload.
pub const FRAME_HEADER_SIZE: usize = 27;

/// Hard ceiling on `data_len`. A header announcing more than this means the
/// link is corrupt: there is no resync heuristic, the tunnel shuts down.
pub const MAX_DATA_LEN: usize = 16 * 1024 * 1024;

/// Command byte: payload is a chunk of TCP bytes for the session.
pub const CMD_DATA: u8 = 0x01;

/// Command byte: peer requests closure of the session.
pub const CMD_DISCONNECT: u8 = 0x03;

/// Command byte: peer is about to terminate; recipient begins shutdown.
pub const CMD_PROGRAM_CLOSE: u8 = 0x05;

/// Frame command set. Unknown command bytes are not representable here;
/// [`Command::from_u8`] returns `None` and the framer skips the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Data,
    Disconnect,
    ProgramClose,
}

impl Command {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            CMD_DATA => Some(Command::Data),
            CMD_DISCONNECT => Some(Command::Disconnect),
            CMD_PROGRAM_CLOSE => Some(Command::ProgramClose),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Command::Data => CMD_DATA,
            Command::Disconnect => CMD_DISCONNECT,
            Command::ProgramClose => CMD_PROGRAM_CLOSE,
        }
    }
}

/// A decoded frame, or one about to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Command,
    pub session: SessionId,
    pub target: SocketAddrV4,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A Data frame carrying one chunk of TCP bytes. Zero-length payloads
    /// are valid and decode to zero-byte socket writes on the far side.
    pub fn data(session: SessionId, target: SocketAddrV4, payload: Vec<u8>) -> Self {
        Self {
            cmd: Command::Data,
            session,
            target,
            payload,
        }
    }

    /// A Disconnect request for `session`. Routing fields are zeroed;
    /// the recipient keys off the session id alone.
    pub fn disconnect(session: SessionId) -> Self {
        Self {
            cmd: Command::Disconnect,
            session,
            target: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            payload: Vec::new(),
        }
    }

    /// A ProgramClose announcement. The session id is caller-chosen
    /// (conventionally fresh random) and ignored by recipients.
    pub fn program_close(session: SessionId) -> Self {
        Self {
            cmd: Command::ProgramClose,
            session,
            target: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            payload: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Produce the wire image of this frame, header then payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.cmd.as_u8());
        buf.extend_from_slice(self.session.as_bytes());
        buf.extend_from_slice(&self.target.ip().octets());
        buf.extend_from_slice(&self.target.port().to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// A parsed header. The payload is not touched; the framer uses `data_len`
/// to decide when the full frame has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd_byte: u8,
    pub session: SessionId,
    pub target: SocketAddrV4,
    pub data_len: usize,
}

impl FrameHeader {
    /// Parse the first [`FRAME_HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than a header; callers check first.
    pub fn parse(buf: &[u8]) -> Self {
        assert!(buf.len() >= FRAME_HEADER_SIZE);

        let mut session = [0u8; 16];
        session.copy_from_slice(&buf[1..17]);

        let ip = Ipv4Addr::new(buf[17], buf[18], buf[19], buf[20]);
        let port = u16::from_be_bytes([buf[21], buf[22]]);
        let data_len = u32::from_be_bytes([buf[23], buf[24], buf[25], buf[26]]) as usize;

        Self {
            cmd_byte: buf[0],
            session: SessionId::from_bytes(session),
            target: SocketAddrV4::new(ip, port),
            data_len,
        }
    }
}
