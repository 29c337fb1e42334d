//! XMODEM transfer orchestration.
//!
//! The engine in `gantry-core` is blocking by contract, but connections
//! live on the cooperative scheduler. This module is the seam between
//! the two worlds: the engine runs on a `spawn_blocking` worker behind a
//! [`BridgePort`] (a pair of channels), while the owning connection task
//! pumps bytes between those channels and the socket.
//!
//! Ownership of the socket effectively transfers to the engine for the
//! duration: the connection task does nothing but pump until the worker
//! finishes. Other connections keep running — only this one stalls,
//! exactly like the real machine's console during a transfer. When the
//! worker finishes, any bytes it read ahead but never consumed are
//! handed back to the framer, so a command pipelined right behind the
//! final acknowledgement is not lost.
//!
//! # Cancellation
//!
//! Dropping either channel end makes the engine's next port operation
//! fail immediately, so a closed socket or a server shutdown tears a
//! transfer down within one protocol timeout rather than one handshake
//! budget.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use gantry_core::vfs::VirtualFs;
use gantry_core::xmodem::{ReceiveOutcome, TransferHeader, TransferPort, Xmodem, XmodemError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc as tokio_mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::dispatch::{TransferDirection, TransferPlan};
use crate::framer::CommandCodec;

/// Outbound chunks queued between the engine and the pump.
const OUTBOUND_DEPTH: usize = 8;

/// Blocking port over the channel bridge; lives on the worker thread.
pub(crate) struct BridgePort {
    inbound: mpsc::Receiver<Vec<u8>>,
    stash: VecDeque<u8>,
    outbound: tokio_mpsc::Sender<Vec<u8>>,
}

impl BridgePort {
    /// Bytes read from the socket that the engine never consumed. They
    /// belong to the command stream that resumes after the transfer.
    fn unconsumed(mut self) -> Vec<u8> {
        let mut leftover: Vec<u8> = self.stash.drain(..).collect();
        while let Ok(chunk) = self.inbound.try_recv() {
            leftover.extend(chunk);
        }
        leftover
    }
}

impl TransferPort for BridgePort {
    fn recv_exact(&mut self, len: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while self.stash.len() < len {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.inbound.recv_timeout(remaining) {
                Ok(chunk) => self.stash.extend(chunk),
                Err(_) => return None,
            }
        }
        Some(self.stash.drain(..len).collect())
    }

    fn send(&mut self, data: &[u8], _timeout: Duration) -> bool {
        self.outbound.blocking_send(data.to_vec()).is_ok()
    }
}

/// Executes a transfer plan on this connection and returns the reply
/// body: empty on success, `error:<message>` otherwise.
pub async fn run<S>(
    framed: &mut Framed<S, CommandCodec>,
    plan: &TransferPlan,
    vfs: &VirtualFs,
    shutdown: &mut watch::Receiver<bool>,
) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match plan.direction {
        TransferDirection::Download => {
            let (data, digest) = match vfs.download_fetch(&plan.cwd, &plan.path) {
                Ok(fetched) => fetched,
                Err(err) => return format!("error:{err}"),
            };
            let header = TransferHeader::new(plan.path.clone(), digest, data.len() as u64);
            let sent = drive_engine(framed, shutdown, move |port| {
                Xmodem::new(port).send(&data, &header)
            })
            .await;
            match sent {
                Ok(()) => String::new(),
                Err(err) => {
                    warn!(path = %plan.path, %err, "download failed");
                    "error:transfer failed".to_string()
                }
            }
        }
        TransferDirection::Upload => {
            let existing = vfs.file_md5(&plan.cwd, &plan.path);
            let received = drive_engine(framed, shutdown, move |port| {
                Xmodem::new(port).receive(existing.as_deref())
            })
            .await;
            match received {
                Ok(ReceiveOutcome::Complete {
                    data,
                    header,
                    md5_match: true,
                }) => {
                    debug!(filename = %header.filename, bytes = data.len(), "upload verified");
                    match vfs.upload_accept(&plan.cwd, &plan.path, data) {
                        Ok(installed) => {
                            debug!(path = %installed, "upload installed");
                            String::new()
                        }
                        Err(err) => format!("error:{err}"),
                    }
                }
                Ok(ReceiveOutcome::Complete {
                    md5_match: false, ..
                }) => {
                    warn!(path = %plan.path, "upload discarded, digest mismatch");
                    "error:md5 mismatch".to_string()
                }
                // Identical file already on disk; the short-circuited
                // transfer counts as success.
                Ok(ReceiveOutcome::AlreadyPresent) => String::new(),
                Err(err) => {
                    warn!(path = %plan.path, %err, "upload failed");
                    "error:transfer failed".to_string()
                }
            }
        }
    }
}

/// Runs `job` on a blocking worker while pumping bytes between the
/// socket and the worker's port.
async fn drive_engine<S, T, F>(
    framed: &mut Framed<S, CommandCodec>,
    shutdown: &mut watch::Receiver<bool>,
    job: F,
) -> Result<T, XmodemError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Send + 'static,
    F: FnOnce(&mut BridgePort) -> Result<T, XmodemError> + Send + 'static,
{
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>();
    let (out_tx, mut out_rx) = tokio_mpsc::channel::<Vec<u8>>(OUTBOUND_DEPTH);

    // Bytes the framer read ahead of the transfer belong to the engine.
    let preread = framed.read_buffer_mut().split();
    if !preread.is_empty() {
        let _ = in_tx.send(preread.to_vec());
    }

    let mut port = BridgePort {
        inbound: in_rx,
        stash: VecDeque::new(),
        outbound: out_tx,
    };
    let mut worker = tokio::task::spawn_blocking(move || {
        let result = job(&mut port);
        (result, port)
    });

    let mut buf = vec![0u8; 16 * 1024];
    let mut in_tx = Some(in_tx);
    let mut inbound_open = true;
    let mut outbound_open = true;
    let mut closing = false;

    loop {
        tokio::select! {
            joined = &mut worker => {
                // Flush whatever the engine queued right before finishing.
                while let Ok(chunk) = out_rx.try_recv() {
                    if framed.get_mut().write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = framed.get_mut().flush().await;

                return match joined {
                    Ok((result, port)) => {
                        let leftover = port.unconsumed();
                        if !leftover.is_empty() {
                            framed.read_buffer_mut().extend_from_slice(&leftover);
                        }
                        result
                    }
                    Err(err) => {
                        error!(%err, "transfer worker died");
                        Err(XmodemError::RetriesExhausted)
                    }
                };
            }

            chunk = out_rx.recv(), if outbound_open => match chunk {
                Some(chunk) => {
                    let stream = framed.get_mut();
                    if stream.write_all(&chunk).await.is_err() || stream.flush().await.is_err() {
                        // Socket gone: unblock the engine on both sides.
                        in_tx = None;
                        inbound_open = false;
                        out_rx.close();
                    }
                }
                None => outbound_open = false,
            },

            read = framed.get_mut().read(&mut buf), if inbound_open => match read {
                Ok(0) | Err(_) => {
                    inbound_open = false;
                    in_tx = None;
                }
                Ok(n) => {
                    if let Some(tx) = &in_tx {
                        let _ = tx.send(buf[..n].to_vec());
                    }
                }
            },

            _ = shutdown.changed(), if !closing => {
                debug!("shutdown during transfer, detaching the byte bridge");
                closing = true;
                in_tx = None;
                inbound_open = false;
                out_rx.close();
            }
        }
    }
}
