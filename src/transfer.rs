//! The per-connection protocol state machine (§4.4): a command line,
//! `size_bytes` of payload in the direction the command names, and a
//! trailing MD5 checksum line.
//!
//! Mirrors the teacher's `BufferedTransfer`/`Serving` shape -- a single
//! struct implementing an explicit poll-to-`WouldBlock` state machine --
//! but framed around the TGEN wire protocol instead of a raw byte pump.

use std::time::Instant;

use action::TransferKind;
use error::TgenError;
use peer::Peer;
use transport::{Progress, Transport, TransportState};

const PROTOCOL_VERSION: u32 = 1;
/// Cycling payload pattern period. 251 is prime and does not divide any
/// common power-of-two buffer size, so the pattern does not alias with
/// chunk boundaries (§4.4).
const PATTERN_PERIOD: u64 = 251;
const CHUNK_SIZE: usize = 16 * 1024;
/// Guards against an unbounded read if a peer never sends a newline.
const MAX_LINE_LEN: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    New,
    Open,
    Command,
    Payload,
    Checksum,
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Checkpoints {
    pub created: Option<Instant>,
    pub connected: Option<Instant>,
    pub command_sent: Option<Instant>,
    pub command_received: Option<Instant>,
    pub first_payload: Option<Instant>,
    pub complete: Option<Instant>,
}

/// A single client- or server-side transfer in progress.
pub struct Transfer {
    id: u64,
    role: Role,
    kind: Option<TransferKind>,
    size_bytes: u64,
    bytes_transferred: u64,
    state: TransferState,
    transport: Transport,
    peer: Peer,
    checkpoints: Checkpoints,
    reason: Option<String>,

    line_out: Vec<u8>,
    line_out_sent: usize,
    /// Set once the client's command line has been fully written and we
    /// are now waiting on the server's acknowledgement.
    awaiting_ack: bool,
    line_in: Vec<u8>,

    md5: md5::Context,
    payload_pos: u64,
}

impl Transfer {
    /// Initiates a client-side Get or Put against `peer`.
    pub fn new_client(
        id: u64,
        kind: TransferKind,
        size_bytes: u64,
        peer: Peer,
        proxy: Option<Peer>,
        now: Instant,
    ) -> Result<Transfer, TgenError> {
        let transport = Transport::connect(peer, proxy)?;
        Ok(Transfer {
            id,
            role: Role::Client,
            kind: Some(kind),
            size_bytes,
            bytes_transferred: 0,
            state: TransferState::New,
            transport,
            peer,
            checkpoints: Checkpoints {
                created: Some(now),
                ..Default::default()
            },
            reason: None,
            line_out: Vec::new(),
            line_out_sent: 0,
            awaiting_ack: false,
            line_in: Vec::new(),
            md5: md5::Context::new(),
            payload_pos: 0,
        })
    }

    /// Wraps a freshly-accepted inbound connection. The command's
    /// direction and size are not known until the peer's command line
    /// arrives.
    pub fn new_server(id: u64, transport: Transport, peer: Peer, now: Instant) -> Transfer {
        Transfer {
            id,
            role: Role::Server,
            kind: None,
            size_bytes: 0,
            bytes_transferred: 0,
            state: TransferState::Open,
            transport,
            peer,
            checkpoints: Checkpoints {
                created: Some(now),
                connected: Some(now),
                ..Default::default()
            },
            reason: None,
            line_out: Vec::new(),
            line_out_sent: 0,
            awaiting_ack: false,
            line_in: Vec::new(),
            md5: md5::Context::new(),
            payload_pos: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, TransferState::Success | TransferState::Error)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn kind(&self) -> Option<TransferKind> {
        self.kind
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// True when this side writes the payload bytes (the other side
    /// reads them).
    fn is_sender(&self) -> bool {
        match (self.role, self.kind) {
            (Role::Client, Some(TransferKind::Put)) => true,
            (Role::Server, Some(TransferKind::Get)) => true,
            _ => false,
        }
    }

    fn fail(&mut self, reason: String) {
        self.state = TransferState::Error;
        self.reason = Some(reason);
        self.transport.close();
    }

    pub fn on_writable(&mut self, now: Instant) -> Result<(), TgenError> {
        loop {
            match self.state {
                TransferState::New | TransferState::Open => {
                    if let Err(e) = self.transport.on_writable() {
                        self.fail(e.to_string());
                        return Err(e);
                    }
                    self.maybe_enter_command(now);
                    if self.state == TransferState::New || self.state == TransferState::Open {
                        return Ok(());
                    }
                }
                TransferState::Command => {
                    // Nothing queued: either waiting on the peer (client
                    // awaiting an ack, server awaiting the command line)
                    // or already flushed. Either way there is nothing
                    // more to write until readable-side code queues a
                    // response, so stop looping here.
                    if self.line_out.is_empty() {
                        return Ok(());
                    }
                    if !self.flush_line()? {
                        return Ok(());
                    }
                    if self.role == Role::Client && !self.awaiting_ack {
                        self.checkpoints.command_sent = Some(now);
                        self.awaiting_ack = true;
                        self.line_in.clear();
                        return Ok(());
                    } else if self.role == Role::Server {
                        // We just finished writing OK or ERR. A rejection
                        // is only committed to `Error` now, after the
                        // ERR line has actually been flushed.
                        match self.reason.take() {
                            Some(reason) => {
                                self.fail(reason);
                                return Ok(());
                            }
                            None => self.enter_payload(now),
                        }
                    }
                }
                TransferState::Payload => {
                    if self.is_sender() {
                        if !self.write_payload_chunk()? {
                            return Ok(());
                        }
                        if self.bytes_transferred >= self.size_bytes {
                            self.enter_checksum(now);
                        }
                    } else {
                        return Ok(());
                    }
                }
                TransferState::Checksum => {
                    if self.is_sender() {
                        if !self.flush_line()? {
                            return Ok(());
                        }
                        self.checkpoints.complete = Some(now);
                        self.state = TransferState::Success;
                        return Ok(());
                    }
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn on_readable(&mut self, now: Instant) -> Result<(), TgenError> {
        loop {
            match self.state {
                TransferState::New | TransferState::Open => {
                    if let Err(e) = self.transport.on_readable() {
                        self.fail(e.to_string());
                        return Err(e);
                    }
                    self.maybe_enter_command(now);
                    if self.state == TransferState::New || self.state == TransferState::Open {
                        return Ok(());
                    }
                }
                TransferState::Command => {
                    if self.role == Role::Client && self.awaiting_ack {
                        match self.read_line()? {
                            None => return Ok(()),
                            Some(line) => {
                                self.checkpoints.command_received = Some(now);
                                self.handle_ack_line(&line, now);
                            }
                        }
                    } else if self.role == Role::Server && self.line_out.is_empty() {
                        // Guarded on an empty `line_out`: once a command
                        // line has been parsed we queue an OK/ERR reply
                        // and must not read another line before it ships.
                        match self.read_line()? {
                            None => return Ok(()),
                            Some(line) => {
                                self.checkpoints.command_received = Some(now);
                                self.handle_command_line(&line, now);
                            }
                        }
                    } else {
                        return Ok(());
                    }
                }
                TransferState::Payload => {
                    if !self.is_sender() {
                        if !self.read_payload_chunk(now)? {
                            return Ok(());
                        }
                        if self.bytes_transferred >= self.size_bytes {
                            self.enter_checksum(now);
                        }
                    } else {
                        return Ok(());
                    }
                }
                TransferState::Checksum => {
                    if !self.is_sender() {
                        match self.read_line()? {
                            None => return Ok(()),
                            Some(line) => self.verify_checksum(&line, now),
                        }
                    } else {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn maybe_enter_command(&mut self, now: Instant) {
        if !self.transport.is_ready() {
            if self.transport.state() == TransportState::Closed {
                self.fail("transport closed before becoming ready".into());
            }
            return;
        }
        self.checkpoints.connected = Some(now);
        self.state = TransferState::Command;
        if self.role == Role::Client {
            let kind = self.kind.expect("client transfer always carries a kind");
            self.line_out = format_command(self.id, kind, self.size_bytes).into_bytes();
            self.line_out_sent = 0;
        }
    }

    fn handle_command_line(&mut self, line: &str, now: Instant) {
        match parse_command(line) {
            Ok((_version, id, kind, size)) => {
                self.kind = Some(kind);
                self.size_bytes = size;
                self.line_out = format!("TGEN OK {}\n", id).into_bytes();
                self.line_out_sent = 0;
                let _ = now;
            }
            Err(reason) => {
                self.line_out = format!("TGEN ERR 0 {}\n", reason).into_bytes();
                self.line_out_sent = 0;
                // Stays in Command until the ERR line is actually
                // flushed; on_writable commits the Error transition
                // once it has been sent in full.
                self.reason = Some(reason);
            }
        }
    }

    fn handle_ack_line(&mut self, line: &str, now: Instant) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 && parts[0] == "TGEN" && parts[1] == "OK" {
            self.enter_payload(now);
        } else {
            let reason = if parts.len() >= 3 && parts[1] == "ERR" {
                parts[3..].join(" ")
            } else {
                format!("malformed acknowledgement '{}'", line)
            };
            self.fail(reason);
        }
    }

    fn enter_payload(&mut self, now: Instant) {
        self.state = TransferState::Payload;
        if self.size_bytes == 0 {
            self.enter_checksum(now);
        }
    }

    fn enter_checksum(&mut self, now: Instant) {
        self.state = TransferState::Checksum;
        if self.checkpoints.first_payload.is_none() {
            self.checkpoints.first_payload = Some(now);
        }
        if self.is_sender() {
            let digest = std::mem::replace(&mut self.md5, md5::Context::new()).compute();
            self.line_out = format!("MD5 {:x}\n", digest).into_bytes();
            self.line_out_sent = 0;
        }
        // `line_in` is left alone here: a coalesced read during Command
        // or Payload may already hold the start of the MD5 line, and
        // `read_line` picks up wherever `line_in` left off.
    }

    fn verify_checksum(&mut self, line: &str, now: Instant) {
        let expected = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["MD5", hex] => hex.to_string(),
            _ => {
                self.fail(format!("malformed checksum line '{}'", line));
                return;
            }
        };
        let digest = std::mem::replace(&mut self.md5, md5::Context::new()).compute();
        let actual = format!("{:x}", digest);
        if actual == expected {
            self.checkpoints.complete = Some(now);
            self.state = TransferState::Success;
        } else {
            self.fail(format!(
                "checksum mismatch: expected {}, computed {}",
                expected, actual
            ));
        }
    }

    /// Writes as much of `line_out` as the socket accepts. `Ok(true)`
    /// once fully flushed.
    fn flush_line(&mut self) -> Result<bool, TgenError> {
        while self.line_out_sent < self.line_out.len() {
            match self.transport.write(&self.line_out[self.line_out_sent..]) {
                Progress::Bytes(n) => self.line_out_sent += n,
                Progress::WouldBlock => return Ok(false),
                Progress::Eof => {
                    let msg = "connection closed while writing a protocol line".to_string();
                    self.fail(msg.clone());
                    return Err(TgenError::Protocol(msg));
                }
                Progress::Error(e) => {
                    self.fail(e.to_string());
                    return Err(TgenError::Io(e));
                }
            }
        }
        self.line_out.clear();
        self.line_out_sent = 0;
        Ok(true)
    }

    /// Accumulates bytes into `line_in` until a `\n` is seen, returning
    /// the completed line (without the terminator) once found.
    fn read_line(&mut self) -> Result<Option<String>, TgenError> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(pos) = self.line_in.iter().position(|&b| b == b'\n') {
                let line = self.line_in[..pos].to_vec();
                self.line_in.drain(..=pos);
                let line = String::from_utf8(line)
                    .map_err(|_| TgenError::Protocol("non-utf8 protocol line".into()))?;
                return Ok(Some(line));
            }
            if self.line_in.len() > MAX_LINE_LEN {
                let msg = "protocol line exceeded maximum length".to_string();
                self.fail(msg.clone());
                return Err(TgenError::Protocol(msg));
            }
            match self.transport.read(&mut chunk) {
                Progress::Bytes(n) => self.line_in.extend_from_slice(&chunk[..n]),
                Progress::WouldBlock => return Ok(None),
                Progress::Eof => {
                    let msg = "connection closed mid-line".to_string();
                    self.fail(msg.clone());
                    return Err(TgenError::Protocol(msg));
                }
                Progress::Error(e) => {
                    self.fail(e.to_string());
                    return Err(TgenError::Io(e));
                }
            }
        }
    }

    /// Writes one chunk of deterministic payload. `Ok(true)` when the
    /// whole payload has been written (may take several calls).
    fn write_payload_chunk(&mut self) -> Result<bool, TgenError> {
        let remaining = self.size_bytes - self.bytes_transferred;
        let len = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; len];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = ((self.payload_pos + i as u64) % PATTERN_PERIOD) as u8;
        }
        match self.transport.write(&buf) {
            Progress::Bytes(n) => {
                self.md5.consume(&buf[..n]);
                self.bytes_transferred += n as u64;
                self.payload_pos += n as u64;
                trace!("transfer {} wrote {} payload bytes ({}/{})", self.id, n, self.bytes_transferred, self.size_bytes);
                Ok(self.bytes_transferred >= self.size_bytes)
            }
            Progress::WouldBlock => Ok(false),
            Progress::Eof => {
                let msg = "connection closed mid-payload".to_string();
                self.fail(msg.clone());
                Err(TgenError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, msg)))
            }
            Progress::Error(e) => {
                self.fail(e.to_string());
                Err(TgenError::Io(e))
            }
        }
    }

    /// Reads one chunk of payload. `Ok(true)` when the whole payload
    /// has arrived.
    fn read_payload_chunk(&mut self, now: Instant) -> Result<bool, TgenError> {
        // A prior `read_line` (the command or ack line) may have pulled
        // a coalesced read off the socket that ran past the line's `\n`
        // into the payload itself; those bytes are sitting in `line_in`
        // and must be counted before anything new is read from the
        // socket, or they are silently dropped from both the byte count
        // and the running MD5.
        if !self.line_in.is_empty() {
            let remaining = (self.size_bytes - self.bytes_transferred) as usize;
            let take = self.line_in.len().min(remaining);
            let buffered: Vec<u8> = self.line_in.drain(..take).collect();
            self.md5.consume(&buffered);
            self.bytes_transferred += take as u64;
            if self.checkpoints.first_payload.is_none() {
                self.checkpoints.first_payload = Some(now);
            }
            trace!(
                "transfer {} absorbed {} buffered payload bytes ({}/{})",
                self.id, take, self.bytes_transferred, self.size_bytes
            );
            if self.bytes_transferred >= self.size_bytes {
                return Ok(true);
            }
        }

        // Cap the read at what the payload still owes: reading past
        // `size_bytes` would swallow the trailing `MD5 <hex>\n` line
        // into the payload digest and strand it past a `WouldBlock` the
        // Checksum state's `read_line` would never see satisfied.
        let remaining = self.size_bytes - self.bytes_transferred;
        let len = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; len];
        match self.transport.read(&mut buf) {
            Progress::Bytes(n) => {
                self.md5.consume(&buf[..n]);
                self.bytes_transferred += n as u64;
                if self.checkpoints.first_payload.is_none() {
                    self.checkpoints.first_payload = Some(now);
                }
                trace!("transfer {} read {} payload bytes ({}/{})", self.id, n, self.bytes_transferred, self.size_bytes);
                Ok(self.bytes_transferred >= self.size_bytes)
            }
            Progress::WouldBlock => Ok(false),
            Progress::Eof => {
                let msg = "connection closed mid-payload".to_string();
                self.fail(msg.clone());
                Err(TgenError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, msg)))
            }
            Progress::Error(e) => {
                self.fail(e.to_string());
                Err(TgenError::Io(e))
            }
        }
    }
}

fn format_command(id: u64, kind: TransferKind, size: u64) -> String {
    format!("TGEN {} {} {} {}\n", PROTOCOL_VERSION, id, kind.as_str(), size)
}

/// Parses a `TGEN <version> <id> <GET|PUT> <size>` command line.
fn parse_command(line: &str) -> Result<(u32, u64, TransferKind, u64), String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 5 || parts[0] != "TGEN" {
        return Err(format!("malformed command line '{}'", line));
    }
    let version: u32 = parts[1].parse().map_err(|_| "invalid version".to_string())?;
    let id: u64 = parts[2].parse().map_err(|_| "invalid id".to_string())?;
    let kind = match parts[3] {
        "GET" => TransferKind::Get,
        "PUT" => TransferKind::Put,
        other => return Err(format!("unknown transfer kind '{}'", other)),
    };
    let size: u64 = parts[4].parse().map_err(|_| "invalid size".to_string())?;
    Ok((version, id, kind, size))
}
