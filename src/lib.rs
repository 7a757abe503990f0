//! # Serimux - TCP Sessions over a Serial Link
//!
//! Serimux tunnels independent TCP sessions through one serial (UART)
//! link. It runs as a symmetric pair: the **ingress** process accepts
//! client connections on configured local ports, the **egress** process
//! dials the configured targets, and a compact binary framing multiplexes
//! every session over the shared wire.
//!
//! ## Architecture
//!
//! Concurrency follows the actor pattern: the link writer is the single
//! owner of the device's write half and receives whole frames over a
//! bounded channel, which is what keeps frames atomic on the wire and
//! turns a slow device into backpressure instead of loss. Each session
//! runs two small pump tasks joined by a shared cancellation flag.
//!
//! ```text
//! TCP client ──► ingress pumps ──► link writer ──► UART ──► framer
//!                                                              │
//! TCP target ◄── egress pumps ◄── session table ◄── dispatch ◄─┘
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `frame` | Wire frame codec (27-byte header + payload) |
//! | `framer` | Reassembles device chunks into whole frames |
//! | `link` | Serialised frame writer and in-order frame reader |
//! | `session` | Session ids, table, per-session pump tasks |
//! | `ingress` | Listens, mints sessions, routes by the mapping table |
//! | `egress` | Dials on first Data frame for an unknown session |
//! | `shutdown` | Orderly bilateral teardown with bounded waits |
//! | `config` | Static `portMappings` table loader |
//!
//! The link layer is generic over `AsyncRead`/`AsyncWrite`; only the
//! binary names the serial device.

pub mod config;
pub mod egress;
pub mod frame;
pub mod framer;
pub mod ingress;
pub mod link;
pub mod session;
pub mod shutdown;

pub use config::{MappingTable, PortMapping};
pub use frame::{Command, Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_DATA_LEN};
pub use framer::{Framer, FramingError};
pub use link::{LinkEvent, LinkWriter};
pub use session::{SessionHandle, SessionId, SessionState, SessionTable};
pub use shutdown::Trigger;
