//! Line protocol spoken between the listener and its workers.
//!
//! ```text
//! kind|peer|payload\n
//! ```
//!
//! Listener → worker ([`Event`]): `connect`, `receive`, `close`.
//! Worker → listener ([`Command`]): `send`, `close`.
//!
//! `payload` is escaped so any byte sequence survives framing: `\` is
//! written as `\\` and LF as `\n`. Only the first two `|` separate fields,
//! so payloads may contain `|`. Peer addresses may not contain `|`, LF or CR.

use anyhow::{anyhow, bail, Result};

use crate::constants::MAX_LINE_LEN;

const DELIMITER: u8 = b'|';
const TERMINATOR: u8 = b'\n';
const ESCAPE: u8 = b'\\';

/// Wire names for every frame kind.
pub mod kind {
    /// Peer accepted (listener → worker).
    pub const CONNECT: &str = "connect";
    /// Peer data (listener → worker).
    pub const RECEIVE: &str = "receive";
    /// Peer gone (listener → worker) or close request (worker → listener).
    pub const CLOSE: &str = "close";
    /// Outbound write request (worker → listener).
    pub const SEND: &str = "send";
}

/// Connection lifecycle event forwarded from the listener to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A TCP peer was accepted.
    Connect {
        /// Remote `ip:port` of the peer.
        peer: String,
    },
    /// Bytes arrived from a TCP peer.
    Receive {
        /// Remote `ip:port` of the peer.
        peer: String,
        /// Raw bytes as read from the socket.
        payload: Vec<u8>,
    },
    /// The TCP peer disconnected.
    Close {
        /// Remote `ip:port` of the peer.
        peer: String,
    },
}

impl Event {
    /// Peer address this event concerns.
    pub fn peer(&self) -> &str {
        match self {
            Event::Connect { peer } | Event::Receive { peer, .. } | Event::Close { peer } => peer,
        }
    }

    /// Encode as one newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Event::Connect { peer } => encode_line(kind::CONNECT, peer, &[]),
            Event::Receive { peer, payload } => encode_line(kind::RECEIVE, peer, payload),
            Event::Close { peer } => encode_line(kind::CLOSE, peer, &[]),
        }
    }

    /// Decode one line (with or without its terminator).
    pub fn decode(line: &[u8]) -> Result<Self> {
        let (kind, peer, payload) = split_line(line)?;
        match kind.as_str() {
            kind::CONNECT => Ok(Event::Connect { peer }),
            kind::RECEIVE => Ok(Event::Receive { peer, payload }),
            kind::CLOSE => Ok(Event::Close { peer }),
            other => bail!("event {other:?} not supported"),
        }
    }
}

/// Command sent from a worker back to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write `payload` to the named peer.
    Send {
        /// Remote `ip:port` of the peer.
        peer: String,
        /// Bytes to write.
        payload: Vec<u8>,
    },
    /// Close the named peer's connection.
    Close {
        /// Remote `ip:port` of the peer.
        peer: String,
    },
}

impl Command {
    /// Peer address this command targets.
    pub fn peer(&self) -> &str {
        match self {
            Command::Send { peer, .. } | Command::Close { peer } => peer,
        }
    }

    /// Encode as one newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Command::Send { peer, payload } => encode_line(kind::SEND, peer, payload),
            Command::Close { peer } => encode_line(kind::CLOSE, peer, &[]),
        }
    }

    /// Decode one line (with or without its terminator).
    pub fn decode(line: &[u8]) -> Result<Self> {
        let (kind, peer, payload) = split_line(line)?;
        match kind.as_str() {
            kind::SEND => Ok(Command::Send { peer, payload }),
            kind::CLOSE => Ok(Command::Close { peer }),
            other => bail!("command {other:?} not supported"),
        }
    }
}

/// Check that `peer` can be carried in the peer field.
pub fn validate_peer(peer: &str) -> Result<()> {
    if peer.bytes().any(|b| matches!(b, DELIMITER | TERMINATOR | b'\r')) {
        bail!("peer address {peer:?} contains a reserved byte");
    }
    Ok(())
}

fn encode_line(kind: &str, peer: &str, payload: &[u8]) -> Result<Vec<u8>> {
    validate_peer(peer)?;
    let mut line = Vec::with_capacity(kind.len() + peer.len() + payload.len() + 3);
    line.extend_from_slice(kind.as_bytes());
    line.push(DELIMITER);
    line.extend_from_slice(peer.as_bytes());
    line.push(DELIMITER);
    escape_into(payload, &mut line);
    line.push(TERMINATOR);
    Ok(line)
}

fn split_line(line: &[u8]) -> Result<(String, String, Vec<u8>)> {
    let line = line.strip_suffix(&[TERMINATOR]).unwrap_or(line);
    let mut fields = line.splitn(3, |b| *b == DELIMITER);
    let kind = fields.next().unwrap_or_default();
    let peer = fields
        .next()
        .ok_or_else(|| anyhow!("malformed line: missing peer field"))?;
    let payload = fields.next().map(unescape).unwrap_or_default();

    let kind = std::str::from_utf8(kind)
        .map_err(|e| anyhow!("event kind is not UTF-8: {e}"))?
        .to_owned();
    let peer = std::str::from_utf8(peer)
        .map_err(|e| anyhow!("peer address is not UTF-8: {e}"))?
        .to_owned();
    Ok((kind, peer, payload))
}

fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &b in payload {
        match b {
            ESCAPE => out.extend_from_slice(b"\\\\"),
            TERMINATOR => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
}

fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(b) = bytes.next() {
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(ESCAPE) => out.push(ESCAPE),
            Some(b'n') => out.push(TERMINATOR),
            // Unknown escape: keep it verbatim.
            Some(other) => out.extend_from_slice(&[ESCAPE, other]),
            None => out.push(ESCAPE),
        }
    }
    out
}

/// Incremental line splitter that handles partial reads.
///
/// Feed bytes via [`LineDecoder::feed`] and get back every complete line
/// (terminator stripped). Incomplete data is buffered for the next call.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes and extract all complete lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered partial line exceeds
    /// [`MAX_LINE_LEN`]. The buffer is cleared so the caller may resync.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();

        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == TERMINATOR) {
            let end = start + offset;
            lines.push(self.buf[start..end].to_vec());
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_LINE_LEN {
            let len = self.buf.len();
            self.buf.clear();
            bail!("line too long: {len} bytes without terminator (max {MAX_LINE_LEN})");
        }
        Ok(lines)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
