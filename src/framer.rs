//! # Stream Reassembler
//!
//! The serial link delivers bytes in arbitrary chunk sizes. The [`Framer`]
//! buffers those chunks and yields whole frames in order, retaining at most
//! one in-progress frame: the consumed prefix is dropped as soon as a frame
//! is emitted, so peak buffer size is bounded by the header plus the largest
//! `data_len` seen.
//!
//! The framer is single-reader and knows nothing about the rest of the
//! system's concurrency.

use tracing::warn;

use crate::frame::{Command, Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_DATA_LEN};

/// Fatal framing failure. The link carries no resync marker, so the only
/// safe response is to declare the link corrupt and shut the tunnel down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingError {
    /// The announced `data_len` that exceeded [`MAX_DATA_LEN`].
    pub data_len: usize,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame announces {} payload bytes, ceiling is {}",
            self.data_len, MAX_DATA_LEN
        )
    }
}

impl std::error::Error for FramingError {}

/// Reassembles the UART byte stream into frames.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk read from the link.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered (trailing partial frame, if any).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame, if the buffer holds one.
    ///
    /// Frames with an unknown command byte are consumed, logged, and
    /// skipped; the caller never sees them. `Ok(None)` means more bytes are
    /// needed. An oversize `data_len` is unrecoverable.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            if self.buf.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let header = FrameHeader::parse(&self.buf);
            if header.data_len > MAX_DATA_LEN {
                return Err(FramingError {
                    data_len: header.data_len,
                });
            }

            let total = FRAME_HEADER_SIZE + header.data_len;
            if self.buf.len() < total {
                return Ok(None);
            }

            let cmd = Command::from_u8(header.cmd_byte);
            let payload = self.buf[FRAME_HEADER_SIZE..total].to_vec();
            self.buf.drain(..total);

            match cmd {
                Some(cmd) => {
                    return Ok(Some(Frame {
                        cmd,
                        session: header.session,
                        target: header.target,
                        payload,
                    }));
                }
                None => {
                    // Header stays in sync; only this frame is lost.
                    warn!(
                        cmd = format!("{:#04x}", header.cmd_byte),
                        session = %header.session.short_hex(),
                        len = header.data_len,
                        "skipping frame with unknown command"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use crate::frame::CMD_DATA;
    use crate::session::SessionId;

    fn target() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9000)
    }

    fn sample_frames() -> Vec<Frame> {
        let a = SessionId::from_bytes([1; 16]);
        let b = SessionId::from_bytes([2; 16]);
        vec![
            Frame::data(a, target(), b"first".to_vec()),
            Frame::data(b, target(), vec![0u8; 300]),
            Frame::data(a, target(), Vec::new()),
            Frame::disconnect(a),
            Frame::program_close(b),
        ]
    }

    fn collect(framer: &mut Framer) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = framer.next_frame().expect("framing error") {
            out.push(frame);
        }
        out
    }

    #[test]
    fn round_trips_under_any_chunking() {
        let frames = sample_frames();
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.encode()).collect();

        // One byte at a time, various odd strides, and one giant chunk.
        for chunk_size in [1usize, 2, 3, 7, 26, 27, 28, wire.len()] {
            let mut framer = Framer::new();
            let mut out = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                framer.push(chunk);
                out.extend(collect(&mut framer));
            }
            assert_eq!(out, frames, "chunk_size = {chunk_size}");
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn partial_frame_is_retained() {
        let frame = Frame::data(SessionId::from_bytes([3; 16]), target(), vec![9; 50]);
        let wire = frame.encode();

        let mut framer = Framer::new();
        framer.push(&wire[..FRAME_HEADER_SIZE + 10]);
        assert_eq!(framer.next_frame().unwrap(), None);
        assert_eq!(framer.buffered(), FRAME_HEADER_SIZE + 10);

        framer.push(&wire[FRAME_HEADER_SIZE + 10..]);
        assert_eq!(framer.next_frame().unwrap(), Some(frame));
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn unknown_command_is_skipped_in_place() {
        let good = Frame::data(SessionId::from_bytes([4; 16]), target(), b"ok".to_vec());

        // Hand-craft a frame with cmd 0x7F and a 4-byte payload.
        let mut unknown = Frame::data(SessionId::from_bytes([5; 16]), target(), vec![0; 4]).encode();
        unknown[0] = 0x7F;

        let mut framer = Framer::new();
        framer.push(&unknown);
        framer.push(&good.encode());

        assert_eq!(framer.next_frame().unwrap(), Some(good));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn oversize_data_len_is_fatal() {
        let mut wire = Frame::data(SessionId::from_bytes([6; 16]), target(), Vec::new()).encode();
        let bad_len = (MAX_DATA_LEN as u32 + 1).to_be_bytes();
        wire[23..27].copy_from_slice(&bad_len);

        let mut framer = Framer::new();
        framer.push(&wire);
        let err = framer.next_frame().unwrap_err();
        assert_eq!(err.data_len, MAX_DATA_LEN + 1);
    }

    #[test]
    fn header_alone_is_not_enough_for_payload_frames() {
        let frame = Frame::data(SessionId::from_bytes([7; 16]), target(), vec![1, 2, 3, 4]);
        let wire = frame.encode();

        let mut framer = Framer::new();
        framer.push(&wire[..FRAME_HEADER_SIZE]);
        assert_eq!(framer.next_frame().unwrap(), None);

        framer.push(&wire[FRAME_HEADER_SIZE..]);
        assert_eq!(framer.next_frame().unwrap().unwrap().cmd, Command::Data);
    }

    #[test]
    fn interleaved_sessions_come_out_in_wire_order() {
        let a = SessionId::from_bytes([8; 16]);
        let b = SessionId::from_bytes([9; 16]);
        let frames = vec![
            Frame::data(a, target(), vec![0xAA; 10]),
            Frame::data(b, target(), vec![0xBB; 10]),
            Frame::data(a, target(), vec![0xAA; 10]),
            Frame::disconnect(b),
        ];
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.encode()).collect();

        let mut framer = Framer::new();
        framer.push(&wire);
        assert_eq!(collect(&mut framer), frames);
    }

    #[test]
    fn cmd_byte_passthrough() {
        let frame = Frame::data(SessionId::from_bytes([10; 16]), target(), Vec::new());
        assert_eq!(frame.encode()[0], CMD_DATA);
    }
}
