//! Shutdown-protocol tests at the process-runner seam.
//!
//! Each case spawns one side's runner over an in-memory duplex pipe,
//! drives the peer by hand, and asserts the exit code the runner returns,
//! which is the same code the binary passes to `process::exit`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Once;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use serimux::config::MappingTable;
use serimux::frame::{Command, Frame, MAX_DATA_LEN};
use serimux::framer::Framer;
use serimux::session::SessionId;
use serimux::{egress, ingress};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const PIPE_CAPACITY: usize = 64 * 1024;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(44_000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn single_mapping(local_port: u16) -> MappingTable {
    let doc = format!(
        r#"{{ "portMappings": [ {{ "localPort": {local_port},
             "remoteHost": "127.0.0.1", "remotePort": 9000,
             "description": "test" }} ] }}"#
    );
    MappingTable::from_json(&doc).expect("test mapping")
}

struct WirePeer {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    framer: Framer,
}

impl WirePeer {
    fn new(side: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(side);
        Self {
            read,
            write,
            framer: Framer::new(),
        }
    }

    async fn send(&mut self, frame: &Frame) {
        self.write
            .write_all(&frame.encode())
            .await
            .expect("wire write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.expect("wire write");
    }

    /// Next frame, or None once the side under test hangs up.
    async fn next_frame(&mut self) -> Option<Frame> {
        timeout(TEST_TIMEOUT, async {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.framer.next_frame().expect("wire corrupt") {
                    return Some(frame);
                }
                match self.read.read(&mut buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => self.framer.push(&buf[..n]),
                }
            }
        })
        .await
        .expect("timed out waiting for the wire")
    }
}

#[tokio::test]
async fn ingress_runs_full_shutdown_on_peer_program_close() {
    init_tracing();
    let local_port = next_port();

    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let runner = tokio::spawn(ingress::run(near, single_mapping(local_port)));
    let mut peer = WirePeer::new(far);

    // One live session with a byte in flight.
    let mut client = timeout(TEST_TIMEOUT, async {
        loop {
            match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(stream) => return stream,
                Err(_) => sleep(Duration::from_millis(25)).await,
            }
        }
    })
    .await
    .expect("listener never came up");
    client.write_all(b"x").await.unwrap();

    let data = peer.next_frame().await.expect("wire closed early");
    assert_eq!(data.cmd, Command::Data);

    peer.send(&Frame::program_close(SessionId::generate().unwrap()))
        .await;

    // Remote-initiated shutdown: the session is disconnected on the wire,
    // the client is closed, no ProgramClose comes back, and the runner
    // exits cleanly.
    let disconnect = peer.next_frame().await.expect("no Disconnect before close");
    assert_eq!(disconnect.cmd, Command::Disconnect);
    assert_eq!(disconnect.session, data.session);

    let mut buf = [0u8; 8];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .expect("client not closed during shutdown")
        .unwrap();
    assert_eq!(n, 0);

    let code = timeout(TEST_TIMEOUT, runner)
        .await
        .expect("runner did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);

    // Whatever remains on the wire, none of it is a ProgramClose.
    while let Some(frame) = peer.next_frame().await {
        assert_ne!(frame.cmd, Command::ProgramClose);
    }
}

#[tokio::test]
async fn egress_exits_clean_on_program_close() {
    init_tracing();
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let runner = tokio::spawn(egress::run(far));
    let mut peer = WirePeer::new(near);

    peer.send(&Frame::program_close(SessionId::generate().unwrap()))
        .await;

    let code = timeout(TEST_TIMEOUT, runner)
        .await
        .expect("runner did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn oversize_frame_is_fatal_and_announced() {
    init_tracing();
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let runner = tokio::spawn(egress::run(far));
    let mut peer = WirePeer::new(near);

    // A header announcing one byte over the ceiling.
    let mut wire =
        Frame::data(SessionId::generate().unwrap(), bogus_target(), Vec::new()).encode();
    wire[23..27].copy_from_slice(&(MAX_DATA_LEN as u32 + 1).to_be_bytes());
    peer.send_raw(&wire).await;

    // The corrupt link is fatal: non-zero exit, and since device writes
    // still succeed, the peer is told to shut down too.
    let code = timeout(TEST_TIMEOUT, runner)
        .await
        .expect("runner did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(code, 1);

    let frame = peer.next_frame().await.expect("no announcement");
    assert_eq!(frame.cmd, Command::ProgramClose);
}

#[tokio::test]
async fn device_eof_is_fatal_with_nonzero_exit() {
    init_tracing();
    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let runner = tokio::spawn(egress::run(far));

    drop(near);

    let code = timeout(TEST_TIMEOUT, runner)
        .await
        .expect("runner did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(code, 1);
}

#[tokio::test]
async fn bytes_sent_before_program_close_still_arrive() {
    init_tracing();
    let local_port = next_port();

    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
    let runner = tokio::spawn(ingress::run(near, single_mapping(local_port)));
    let mut peer = WirePeer::new(far);

    let mut client = timeout(TEST_TIMEOUT, async {
        loop {
            match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(stream) => return stream,
                Err(_) => sleep(Duration::from_millis(25)).await,
            }
        }
    })
    .await
    .expect("listener never came up");
    client.write_all(b"seed").await.unwrap();
    let data = peer.next_frame().await.expect("wire closed early");
    let id = data.session;

    // Queue return-path payloads, then close the program. The queued
    // bytes must reach the client before its socket closes.
    peer.send(&Frame::data(id, bogus_target(), b"fin".to_vec()))
        .await;
    peer.send(&Frame::program_close(SessionId::generate().unwrap()))
        .await;

    let mut received = [0u8; 3];
    timeout(TEST_TIMEOUT, client.read_exact(&mut received))
        .await
        .expect("drained payload lost in shutdown")
        .unwrap();
    assert_eq!(&received, b"fin");

    let code = timeout(TEST_TIMEOUT, runner)
        .await
        .expect("runner did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
}

fn bogus_target() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000)
}
