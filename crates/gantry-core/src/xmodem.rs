//! XMODEM-8K transfer engine.
//!
//! Binary file transfer over an already-open connection's byte stream,
//! matching the reference controller: 8192-byte `STX` blocks (with the
//! classic 128-byte `SOH` frame still understood), CRC-16/XMODEM or
//! additive-checksum integrity, and an MD5 digest carried in the metadata
//! block so the whole payload can be verified end to end.
//!
//! # Wire format
//!
//! ```text
//! +------+-----+---------+--------------------------------+----------+
//! | MARK | seq | 255-seq | len-prefix | data | 0x1A pad   | check    |
//! +------+-----+---------+--------------------------------+----------+
//!   SOH/STX                 1 or 2 B     padded to 128/8192  1 or 2 B
//! ```
//!
//! The length prefix (1 byte under `SOH`, 2 bytes big-endian under `STX`)
//! records the unpadded byte count, which is how a short final block
//! round-trips exactly. The checksum covers prefix + padded payload.
//!
//! Block 0 carries no file data: its payload is a textual header,
//! `<filename>;md5=<hex>[;length=<n>]`, optionally followed by more
//! `key=value` options. Unsupported options — compression (`lz`) included
//! — are declined by ignoring them; the transfer proceeds raw. Data
//! blocks follow as sequence 1, 2, … with an 8-bit wrapping counter.
//!
//! # Blocking contract
//!
//! The engine is deliberately synchronous: on the real machine a transfer
//! stalls the console until it finishes. All I/O goes through
//! [`TransferPort`], so the caller decides what the byte stream is — the
//! daemon bridges a socket through channels onto a worker thread, tests
//! use an in-memory pair.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Start of a 128-byte block.
pub const SOH: u8 = 0x01;
/// Start of an 8192-byte block.
pub const STX: u8 = 0x02;
/// End of transmission.
pub const EOT: u8 = 0x04;
/// Positive acknowledge.
pub const ACK: u8 = 0x06;
/// Negative acknowledge; also the checksum-mode handshake probe.
pub const NAK: u8 = 0x15;
/// Cancel. Two in a row abort the transfer.
pub const CAN: u8 = 0x18;
/// CRC-mode handshake probe.
pub const CRC_REQUEST: u8 = b'C';
/// Fill byte for the tail of a short block.
pub const PAD: u8 = 0x1A;

/// Handshake polls before giving up on a silent peer.
pub const HANDSHAKE_ATTEMPTS: u32 = 16;
/// Pause between handshake polls.
pub const HANDSHAKE_POLL: Duration = Duration::from_secs(1);
/// Per-block retransmissions before the transfer is abandoned.
pub const BLOCK_RETRIES: u32 = 10;
/// How long either side waits for the next protocol byte mid-transfer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// Poll used while purging a corrupted line back to silence.
const PURGE_POLL: Duration = Duration::from_millis(200);

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Byte stream the engine runs over.
///
/// Both calls are blocking with a deadline; `None`/`false` mean timeout or
/// a closed peer — the engine treats the two identically and retries
/// within its budgets.
pub trait TransferPort {
    /// Reads exactly `len` bytes within `timeout`.
    fn recv_exact(&mut self, len: usize, timeout: Duration) -> Option<Vec<u8>>;

    /// Writes the whole buffer within `timeout`.
    fn send(&mut self, data: &[u8], timeout: Duration) -> bool;
}

impl<P: TransferPort + ?Sized> TransferPort for &mut P {
    fn recv_exact(&mut self, len: usize, timeout: Duration) -> Option<Vec<u8>> {
        (**self).recv_exact(len, timeout)
    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> bool {
        (**self).send(data, timeout)
    }
}

/// Transfer failure modes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmodemError {
    /// The peer never opened (or answered) the handshake.
    #[error("peer handshake timed out")]
    HandshakeTimeout,

    /// The peer sent two consecutive `CAN` bytes.
    #[error("transfer canceled by peer")]
    Canceled,

    /// A block could not be delivered within the retry budget.
    #[error("retry budget exhausted")]
    RetriesExhausted,

    /// The final `EOT` was never acknowledged.
    #[error("end of transmission was never acknowledged")]
    EotUnacknowledged,

    /// Block 0 was missing, oversized, or unparseable.
    #[error("metadata block missing or malformed")]
    BadMetadata,
}

/// Block size negotiated from the packet marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// 128-byte `SOH` blocks with a 1-byte length prefix.
    Standard,
    /// 8192-byte `STX` blocks with a 2-byte length prefix.
    Block8k,
}

impl BlockMode {
    const fn marker(self) -> u8 {
        match self {
            Self::Standard => SOH,
            Self::Block8k => STX,
        }
    }

    const fn payload_len(self) -> usize {
        match self {
            Self::Standard => 128,
            Self::Block8k => 8192,
        }
    }

    const fn prefix_len(self) -> usize {
        match self {
            Self::Standard => 1,
            Self::Block8k => 2,
        }
    }

    const fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            SOH => Some(Self::Standard),
            STX => Some(Self::Block8k),
            _ => None,
        }
    }
}

/// Integrity mode settled during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// CRC-16/XMODEM, two bytes big-endian.
    Crc16,
    /// Additive 8-bit sum, one byte.
    Additive,
}

impl ChecksumMode {
    const fn trailer_len(self) -> usize {
        match self {
            Self::Crc16 => 2,
            Self::Additive => 1,
        }
    }

    fn trailer(self, payload: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc16 => CRC16.checksum(payload).to_be_bytes().to_vec(),
            Self::Additive => vec![additive_sum(payload)],
        }
    }
}

fn additive_sum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Parsed contents of the metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    /// File name as announced by the sender.
    pub filename: String,
    /// Lowercase hex MD5 of the payload that follows.
    pub md5: String,
    /// Announced payload length, when present.
    pub length: Option<u64>,
}

impl TransferHeader {
    #[must_use]
    pub fn new(filename: impl Into<String>, md5: impl Into<String>, length: u64) -> Self {
        Self {
            filename: filename.into(),
            md5: md5.into(),
            length: Some(length),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut header = format!("{};md5={}", self.filename, self.md5);
        if let Some(length) = self.length {
            header.push_str(&format!(";length={length}"));
        }
        header.into_bytes()
    }

    /// Parses the header text of block 0. Unknown options are ignored; a
    /// requested `lz` compression option is thereby declined and the
    /// transfer stays raw.
    fn parse(data: &[u8]) -> Result<Self, XmodemError> {
        let text = std::str::from_utf8(data).map_err(|_| XmodemError::BadMetadata)?;
        let mut fields = text.split(';');
        let filename = fields.next().unwrap_or_default().trim();
        if filename.is_empty() {
            return Err(XmodemError::BadMetadata);
        }

        let mut md5 = String::new();
        let mut length = None;
        for field in fields {
            match field.split_once('=') {
                Some(("md5", value)) => md5 = value.trim().to_ascii_lowercase(),
                Some(("length", value)) => length = value.trim().parse().ok(),
                Some(("lz", value)) => {
                    debug!(option = %value, "peer proposed lz compression, declining");
                }
                _ => {}
            }
        }
        Ok(Self {
            filename: filename.to_string(),
            md5,
            length,
        })
    }
}

/// Result of a successful receive call.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// The full payload arrived. `md5_match` compares the computed digest
    /// of `data` against the block-0 claim; installers must only accept
    /// the file when it is `true`.
    Complete {
        data: Vec<u8>,
        header: TransferHeader,
        md5_match: bool,
    },

    /// The sender announced a file we already hold byte-identically; the
    /// transfer was short-circuited with a cancel sequence.
    AlreadyPresent,
}

/// XMODEM protocol driver bound to one [`TransferPort`].
#[derive(Debug)]
pub struct Xmodem<P> {
    port: P,
    mode: BlockMode,
}

impl<P: TransferPort> Xmodem<P> {
    #[must_use]
    pub fn new(port: P) -> Self {
        Self {
            port,
            mode: BlockMode::Block8k,
        }
    }

    /// Sends `data` preceded by a metadata block describing it.
    ///
    /// Waits silently for the receiver's mode probe, then streams block 0
    /// and the payload, finishing with `EOT`.
    ///
    /// # Errors
    ///
    /// [`XmodemError::HandshakeTimeout`] when no probe arrives,
    /// [`XmodemError::Canceled`] on a peer cancel,
    /// [`XmodemError::RetriesExhausted`] / [`XmodemError::EotUnacknowledged`]
    /// when the retry budgets run out.
    pub fn send(&mut self, data: &[u8], header: &TransferHeader) -> Result<(), XmodemError> {
        let checksum = self.await_receiver()?;
        debug!(mode = ?self.mode, checksum = ?checksum, len = data.len(), "sender handshake complete");

        let meta = header.encode();
        if meta.len() > self.mode.payload_len() {
            return Err(XmodemError::BadMetadata);
        }
        self.deliver_block(0, &meta, checksum)?;

        let mut seq: u8 = 1;
        for chunk in data.chunks(self.mode.payload_len()) {
            self.deliver_block(seq, chunk, checksum)?;
            seq = seq.wrapping_add(1);
        }

        for _ in 0..=BLOCK_RETRIES {
            self.port.send(&[EOT], REPLY_TIMEOUT);
            match self.recv1(REPLY_TIMEOUT) {
                Some(ACK) => {
                    debug!("transfer complete, EOT acknowledged");
                    return Ok(());
                }
                other => debug!(reply = ?other, "EOT not acknowledged, retrying"),
            }
        }
        self.abort();
        Err(XmodemError::EotUnacknowledged)
    }

    /// Receives a payload, driving the handshake from this side.
    ///
    /// When `existing_md5` matches the digest announced in block 0 the
    /// transfer is canceled early and [`ReceiveOutcome::AlreadyPresent`]
    /// is returned — the bytes are already on this side.
    ///
    /// # Errors
    ///
    /// [`XmodemError::HandshakeTimeout`] when no block ever arrives,
    /// [`XmodemError::Canceled`] on a peer cancel,
    /// [`XmodemError::RetriesExhausted`] when the line stays corrupt,
    /// [`XmodemError::BadMetadata`] when block 0 never parsed.
    pub fn receive(&mut self, existing_md5: Option<&str>) -> Result<ReceiveOutcome, XmodemError> {
        let (mut marker, checksum) = self.solicit_sender()?;
        debug!(checksum = ?checksum, "receiver handshake complete");

        let mut expected: u8 = 0;
        let mut header: Option<TransferHeader> = None;
        let mut data: Vec<u8> = Vec::new();
        let mut retries_left = BLOCK_RETRIES;
        let mut cancel_pending = false;

        loop {
            match marker {
                EOT => {
                    self.port.send(&[ACK], REPLY_TIMEOUT);
                    let header = header.ok_or(XmodemError::BadMetadata)?;
                    let digest = format!("{:x}", md5::compute(&data));
                    let md5_match = digest.eq_ignore_ascii_case(&header.md5);
                    debug!(bytes = data.len(), md5_match, "receive complete");
                    return Ok(ReceiveOutcome::Complete {
                        data,
                        header,
                        md5_match,
                    });
                }
                CAN => {
                    if cancel_pending {
                        warn!("transfer canceled by sender");
                        return Err(XmodemError::Canceled);
                    }
                    cancel_pending = true;
                    marker = self.next_marker()?;
                    continue;
                }
                byte => {
                    let Some(block_mode) = BlockMode::from_marker(byte) else {
                        warn!(byte, "unexpected byte where a block marker was due");
                        retries_left = self.reject_block(retries_left)?;
                        marker = self.next_marker()?;
                        continue;
                    };
                    cancel_pending = false;

                    match self.read_block(block_mode, checksum) {
                        Some((seq, chunk)) if seq == expected => {
                            if expected == 0 && header.is_none() {
                                let parsed = TransferHeader::parse(&chunk)?;
                                debug!(filename = %parsed.filename, md5 = %parsed.md5, "metadata block received");
                                if let Some(existing) = existing_md5 {
                                    if !parsed.md5.is_empty()
                                        && existing.eq_ignore_ascii_case(&parsed.md5)
                                    {
                                        debug!("identical file already present, canceling transfer");
                                        self.port.send(&[CAN, CAN, CAN], REPLY_TIMEOUT);
                                        self.purge();
                                        return Ok(ReceiveOutcome::AlreadyPresent);
                                    }
                                }
                                header = Some(parsed);
                            } else {
                                data.extend_from_slice(&chunk);
                            }
                            self.port.send(&[ACK], REPLY_TIMEOUT);
                            expected = expected.wrapping_add(1);
                            retries_left = BLOCK_RETRIES;
                        }
                        Some((seq, _)) if seq == expected.wrapping_sub(1) => {
                            // The sender missed our ACK and retransmitted;
                            // acknowledge again and drop the copy.
                            debug!(seq, "duplicate block, acknowledging again");
                            self.port.send(&[ACK], REPLY_TIMEOUT);
                        }
                        Some((seq, _)) => {
                            warn!(seq, expected, "sequence mismatch");
                            retries_left = self.reject_block(retries_left)?;
                        }
                        None => {
                            retries_left = self.reject_block(retries_left)?;
                        }
                    }
                    marker = self.next_marker()?;
                }
            }
        }
    }

    /// Sender half of the handshake: wait for the receiver's probe.
    fn await_receiver(&mut self) -> Result<ChecksumMode, XmodemError> {
        let mut cancel_pending = false;
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            match self.recv1(HANDSHAKE_POLL) {
                Some(CRC_REQUEST) => return Ok(ChecksumMode::Crc16),
                Some(NAK) => return Ok(ChecksumMode::Additive),
                Some(CAN) if cancel_pending => return Err(XmodemError::Canceled),
                Some(CAN) => cancel_pending = true,
                Some(byte) => debug!(attempt, byte, "unexpected handshake byte"),
                None => debug!(attempt, "no handshake byte yet"),
            }
        }
        self.abort();
        Err(XmodemError::HandshakeTimeout)
    }

    /// Receiver half of the handshake: probe with `C`, falling back to
    /// `NAK` (checksum mode) for the second half of the budget.
    fn solicit_sender(&mut self) -> Result<(u8, ChecksumMode), XmodemError> {
        let mut cancel_pending = false;
        let mut checksum = ChecksumMode::Crc16;
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            let probe = if attempt < HANDSHAKE_ATTEMPTS / 2 {
                CRC_REQUEST
            } else {
                checksum = ChecksumMode::Additive;
                NAK
            };
            self.port.send(&[probe], REPLY_TIMEOUT);

            match self.recv1(HANDSHAKE_POLL) {
                Some(byte @ (SOH | STX)) => return Ok((byte, checksum)),
                Some(CAN) if cancel_pending => return Err(XmodemError::Canceled),
                Some(CAN) => cancel_pending = true,
                Some(byte) => debug!(attempt, byte, "unexpected handshake byte"),
                None => {}
            }
        }
        self.abort();
        Err(XmodemError::HandshakeTimeout)
    }

    /// Sends one block and waits for its acknowledgement, retransmitting
    /// on `NAK` or silence within the retry budget.
    fn deliver_block(
        &mut self,
        seq: u8,
        chunk: &[u8],
        checksum: ChecksumMode,
    ) -> Result<(), XmodemError> {
        let packet = build_packet(self.mode, checksum, seq, chunk);
        let mut cancel_pending = false;
        for attempt in 0..=BLOCK_RETRIES {
            self.port.send(&packet, REPLY_TIMEOUT);
            match self.recv1(REPLY_TIMEOUT) {
                Some(ACK) => return Ok(()),
                Some(NAK) => debug!(seq, attempt, "block rejected, retransmitting"),
                Some(CAN) if cancel_pending => return Err(XmodemError::Canceled),
                Some(CAN) => cancel_pending = true,
                other => debug!(seq, attempt, reply = ?other, "no acknowledgement"),
            }
        }
        self.abort();
        Err(XmodemError::RetriesExhausted)
    }

    /// Reads the remainder of a block (after its marker) and validates
    /// sequence complement and checksum. `None` means the block was
    /// corrupt or truncated.
    fn read_block(&mut self, mode: BlockMode, checksum: ChecksumMode) -> Option<(u8, Vec<u8>)> {
        let seq = self.recv1(REPLY_TIMEOUT)?;
        let complement = self.recv1(REPLY_TIMEOUT)?;
        if complement != 0xFF - seq {
            warn!(seq, complement, "sequence complement mismatch");
            return None;
        }

        let body_len = mode.prefix_len() + mode.payload_len() + checksum.trailer_len();
        let body = self.port.recv_exact(body_len, REPLY_TIMEOUT)?;
        let (payload, trailer) = body.split_at(body_len - checksum.trailer_len());
        if checksum.trailer(payload) != trailer {
            warn!(seq, "checksum mismatch");
            return None;
        }

        let data_len = match mode {
            BlockMode::Standard => payload[0] as usize,
            BlockMode::Block8k => u16::from_be_bytes([payload[0], payload[1]]) as usize,
        };
        if data_len > mode.payload_len() {
            warn!(seq, data_len, "length prefix exceeds block capacity");
            return None;
        }
        Some((seq, payload[mode.prefix_len()..mode.prefix_len() + data_len].to_vec()))
    }

    /// Purge the line and request a retransmit, burning one retry.
    fn reject_block(&mut self, retries_left: u32) -> Result<u32, XmodemError> {
        self.purge();
        if retries_left == 0 {
            self.abort();
            return Err(XmodemError::RetriesExhausted);
        }
        self.port.send(&[NAK], REPLY_TIMEOUT);
        Ok(retries_left - 1)
    }

    /// Waits for the next block marker, tolerating short gaps between
    /// blocks.
    fn next_marker(&mut self) -> Result<u8, XmodemError> {
        for _ in 0..=BLOCK_RETRIES {
            if let Some(byte) = self.recv1(REPLY_TIMEOUT) {
                return Ok(byte);
            }
        }
        self.abort();
        Err(XmodemError::RetriesExhausted)
    }

    /// Drains the line until it goes quiet.
    fn purge(&mut self) {
        while self.recv1(PURGE_POLL).is_some() {}
    }

    /// Sends the two-byte cancel sequence.
    fn abort(&mut self) {
        self.port.send(&[CAN, CAN], REPLY_TIMEOUT);
    }

    fn recv1(&mut self, timeout: Duration) -> Option<u8> {
        self.port.recv_exact(1, timeout).map(|bytes| bytes[0])
    }
}

/// Assembles one wire packet: marker, sequence pair, length-prefixed and
/// padded payload, checksum trailer.
fn build_packet(mode: BlockMode, checksum: ChecksumMode, seq: u8, chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(mode.prefix_len() + mode.payload_len());
    match mode {
        BlockMode::Standard => payload.push(chunk.len() as u8),
        BlockMode::Block8k => payload.extend_from_slice(&(chunk.len() as u16).to_be_bytes()),
    }
    payload.extend_from_slice(chunk);
    payload.resize(mode.prefix_len() + mode.payload_len(), PAD);

    let trailer = checksum.trailer(&payload);
    let mut packet = Vec::with_capacity(3 + payload.len() + trailer.len());
    packet.push(mode.marker());
    packet.push(seq);
    packet.push(0xFF - seq);
    packet.extend_from_slice(&payload);
    packet.extend_from_slice(&trailer);
    packet
}
