//! Byte-stream command framer.
//!
//! Splits a connection's inbound bytes into command strings. Two framing
//! rules coexist on this wire:
//!
//! - ordinary commands end with LF (CR is ignored wherever it appears);
//! - *instant* commands (`?`, `$I`) dispatch the moment the accumulated
//!   input equals the command token, no terminator required, because the
//!   real machine answers them that way.
//!
//! The instant match is an equality test against the trimmed accumulator,
//! never a prefix test: a client that has typed `$` so far gets nothing
//! until the next byte decides between `$I` and a longer command.
//!
//! Commands are emitted strictly in arrival order. A line that exceeds
//! [`MAX_COMMAND_LEN`] is a protocol violation and fails the decoder,
//! which closes the connection.

use std::collections::BTreeSet;
use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Longest accepted command line. Validated before the accumulator grows,
/// so a hostile peer cannot balloon per-connection memory.
pub const MAX_COMMAND_LEN: usize = 512;

/// Decoder turning raw bytes into command strings.
#[derive(Debug)]
pub struct CommandCodec {
    instant: BTreeSet<String>,
    acc: Vec<u8>,
}

impl CommandCodec {
    /// Creates a codec that dispatches `instant` tokens without a
    /// terminator.
    #[must_use]
    pub fn new(instant: BTreeSet<String>) -> Self {
        Self {
            instant,
            acc: Vec::new(),
        }
    }
}

impl Decoder for CommandCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        while src.has_remaining() {
            let byte = src.get_u8();
            match byte {
                b'\r' => {}
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.acc).trim().to_string();
                    self.acc.clear();
                    return Ok(Some(line));
                }
                _ => {
                    if self.acc.len() >= MAX_COMMAND_LEN {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "command line too long",
                        ));
                    }
                    self.acc.push(byte);
                    if let Ok(text) = std::str::from_utf8(&self.acc) {
                        let trimmed = text.trim_end();
                        if self.instant.contains(trimmed) {
                            let command = trimmed.to_string();
                            self.acc.clear();
                            return Ok(Some(command));
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}
