//! Per-connection lifecycle.
//!
//! Each admitted connection runs one task: frame bytes into commands,
//! dispatch them strictly in order, and enforce the inactivity timeout.
//! The timeout is measured against the last *byte received*, not the
//! last complete command — a client slowly typing a long line is alive —
//! so the socket is wrapped in an activity-tracking stream that stamps a
//! shared meter on every successful read.
//!
//! Teardown runs on every exit path (client close, I/O error, idle
//! timeout, shutdown): the admission seat is released by its RAII guard
//! in the accept loop, and any in-flight transfer collapses when the
//! byte bridge is dropped.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::dispatch::{ConnectionState, Dispatcher, Outcome, Reply};
use crate::framer::CommandCodec;
use crate::transfer;

/// A connection that stays byte-silent this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Records when the last byte arrived, cheap enough to stamp per read.
#[derive(Debug)]
pub struct ActivityMeter {
    base: Instant,
    last_ms: AtomicU64,
}

impl ActivityMeter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last received byte.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let elapsed = self.base.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

impl Default for ActivityMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper stamping an [`ActivityMeter`] on every received byte.
#[derive(Debug)]
pub struct Tracked<S> {
    inner: S,
    meter: Arc<ActivityMeter>,
}

impl<S> Tracked<S> {
    pub fn new(inner: S, meter: Arc<ActivityMeter>) -> Self {
        Self { inner, meter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                self.meter.touch();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Drives one admitted connection until it ends.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    let meter = Arc::new(ActivityMeter::new());
    let tracked = Tracked::new(stream, Arc::clone(&meter));
    let instant = dispatcher.catalog().instant_keys().clone();
    let mut framed = Framed::new(tracked, CommandCodec::new(instant));
    let mut conn = ConnectionState::new(peer);

    info!(%peer, "client connected");

    loop {
        let idle_left = IDLE_TIMEOUT.saturating_sub(meter.idle_for());
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(%peer, "closing connection for shutdown");
                break;
            }

            () = tokio::time::sleep(idle_left) => {
                if meter.idle_for() >= IDLE_TIMEOUT {
                    info!(%peer, "closing connection after {}s of silence", IDLE_TIMEOUT.as_secs());
                    break;
                }
            }

            frame = framed.next() => match frame {
                None => {
                    debug!(%peer, "client closed the connection");
                    break;
                }
                Some(Err(err)) => {
                    warn!(%peer, %err, "read failed, dropping connection");
                    break;
                }
                Some(Ok(line)) => {
                    let outcome = dispatcher.dispatch(&mut conn, &line);
                    if let Err(err) = execute(&mut framed, &dispatcher, outcome, &mut shutdown).await {
                        warn!(%peer, %err, "write failed, dropping connection");
                        break;
                    }
                }
            }
        }
    }

    let mut inner = framed.into_inner();
    let _ = inner.shutdown().await;
    info!(%peer, "client disconnected");
}

/// Carries one dispatched outcome to completion, including a transfer
/// hand-off and its follow-up reply.
async fn execute(
    framed: &mut Framed<Tracked<TcpStream>, CommandCodec>,
    dispatcher: &Dispatcher,
    outcome: Outcome,
    shutdown: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    match outcome {
        Outcome::Silent => Ok(()),
        Outcome::Reply(reply) => write_reply(framed, reply).await,
        Outcome::Transfer(plan) => {
            let body = transfer::run(framed, &plan, dispatcher.vfs(), shutdown).await;
            let reply = dispatcher.transfer_reply(&plan, &body);
            write_reply(framed, reply).await
        }
    }
}

async fn write_reply(
    framed: &mut Framed<Tracked<TcpStream>, CommandCodec>,
    reply: Reply,
) -> std::io::Result<()> {
    tokio::time::sleep(reply.delay).await;
    if !reply.bytes.is_empty() {
        let stream = framed.get_mut();
        stream.write_all(&reply.bytes).await?;
        stream.flush().await?;
    }
    crate::dispatch::trace_send(&reply.log_body, reply.debug_only);
    Ok(())
}
