//! Shared helpers for the end-to-end tests: an in-process server bound
//! to an ephemeral port, plus small wire-level client utilities.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::catalog::Catalog;
use gantry_core::clock::MachineClock;
use gantry_core::vfs::VirtualFs;
use gantry_daemon::server::{Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long any single test read may take before the test fails. Long
/// enough to sit out the server's 10 s inactivity timeout.
pub const READ_DEADLINE: Duration = Duration::from_secs(15);

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Spawns a server on an ephemeral port with the stock catalog and
    /// seeded filesystem.
    pub async fn spawn() -> Self {
        let catalog = Catalog::from_json(gantry_daemon::COMMAND_CATALOG_JSON)
            .expect("embedded catalog parses");
        let vfs = VirtualFs::from_json(gantry_daemon::VIRTUAL_FILES_JSON);
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let server = Server::bind(
            &config,
            Arc::new(catalog),
            Arc::new(vfs),
            Arc::new(MachineClock::new()),
        )
        .await
        .expect("bind ephemeral port");
        let addr = server.local_addr().expect("local addr");

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect to server")
}

pub async fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.expect("write to server");
}

/// Reads until (and including) `stop`.
pub async fn read_until(stream: &mut TcpStream, stop: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tokio::time::timeout(READ_DEADLINE, stream.read(&mut byte))
            .await
            .expect("read deadline exceeded")
            .expect("read from server");
        assert!(n > 0, "server closed before delimiter; got {out:?}");
        out.push(byte[0]);
        if byte[0] == stop {
            return out;
        }
    }
}

/// Reads one LF-terminated line, without the terminator.
pub async fn read_line(stream: &mut TcpStream) -> String {
    let mut raw = read_until(stream, b'\n').await;
    raw.pop();
    String::from_utf8(raw).expect("utf-8 reply")
}

/// Asserts nothing arrives within `window`.
pub async fn expect_silence(stream: &mut TcpStream, window: Duration) {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(window, stream.read(&mut byte)).await {
        Err(_) => {}
        Ok(Ok(0)) => panic!("server closed the connection"),
        Ok(read) => panic!("unexpected bytes: {read:?} {byte:?}"),
    }
}

/// Asserts the server closes the stream (EOF).
pub async fn expect_eof(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    let n = tokio::time::timeout(READ_DEADLINE, stream.read(&mut byte))
        .await
        .expect("read deadline exceeded")
        .expect("read from server");
    assert_eq!(n, 0, "expected EOF, got byte {byte:?}");
}
