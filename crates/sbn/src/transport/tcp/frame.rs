// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental SBN message reader for stream sockets.
//!
//! TCP has no message boundaries, so each connection keeps a small state
//! machine that survives across polls:
//!
//! ```text
//!        header complete              body complete
//! WaitHeader ──────────────► WaitBody ──────────────► (packet) ─┐
//!     ▲                                                         │
//!     └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A partial read never restarts from zero. `read() == 0` (EOF) in either
//! state is reported as an error so the caller tears the connection down.

use crate::codec::{Header, Packet, HEADER_SIZE};
use std::io::{self, Read};

#[derive(Debug, Clone, Copy)]
enum ReadState {
    WaitHeader { bytes_read: usize },
    WaitBody { header: Header, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::WaitHeader { bytes_read: 0 }
    }
}

#[derive(Debug, Default)]
pub struct FrameReader {
    state: ReadState,
    header: [u8; HEADER_SIZE],
    body: Vec<u8>,
    frames_decoded: u64,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// True while part of a message has been consumed.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::WaitHeader { bytes_read } => bytes_read > 0,
            ReadState::WaitBody { .. } => true,
        }
    }

    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.body.clear();
    }

    /// Read as far as the socket allows.
    ///
    /// - `Ok(Some(packet))`: a complete message.
    /// - `Ok(None)`: the socket has no more data right now.
    /// - `Err(_)`: EOF, socket error, or an oversize header.
    pub fn poll<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Packet>> {
        loop {
            match self.state {
                ReadState::WaitHeader { bytes_read } => {
                    let n = match read_some(reader, &mut self.header[bytes_read..])? {
                        Some(n) => n,
                        None => return Ok(None),
                    };
                    let total = bytes_read + n;
                    if total < HEADER_SIZE {
                        self.state = ReadState::WaitHeader { bytes_read: total };
                        continue;
                    }
                    let header = Header::decode(&self.header).map_err(|e| {
                        self.reset();
                        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    if header.msg_size == 0 {
                        return Ok(Some(self.finish(header)));
                    }
                    self.body.clear();
                    self.body.resize(header.msg_size as usize, 0);
                    self.state = ReadState::WaitBody {
                        header,
                        bytes_read: 0,
                    };
                }
                ReadState::WaitBody { header, bytes_read } => {
                    let n = match read_some(reader, &mut self.body[bytes_read..])? {
                        Some(n) => n,
                        None => return Ok(None),
                    };
                    let total = bytes_read + n;
                    if total < header.msg_size as usize {
                        self.state = ReadState::WaitBody {
                            header,
                            bytes_read: total,
                        };
                        continue;
                    }
                    return Ok(Some(self.finish(header)));
                }
            }
        }
    }

    fn finish(&mut self, header: Header) -> Packet {
        self.frames_decoded += 1;
        self.state = ReadState::default();
        Packet::new(
            header.msg_type,
            header.processor_id,
            std::mem::take(&mut self.body),
        )
    }
}

/// One `read` call. `Ok(None)` when the socket would block.
fn read_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match reader.read(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ))
            }
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }
    }
}
