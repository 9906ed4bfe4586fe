// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SBN wire format.
//!
//! Every message on every transport starts with the same fixed header,
//! followed by an opaque payload:
//!
//! ```text
//! +-------------+-------------+-------------------+------------------+
//! | MsgSz (2B)  | MsgType(1B) | ProcessorID (4B)  | Payload (MsgSz)  |
//! +-------------+-------------+-------------------+------------------+
//! ```
//!
//! All integers are big-endian (network byte order), regardless of host.
//!
//! Payload layouts for the core message types:
//!
//! - `Protocol`: one byte, the sender's protocol version.
//! - `Subscribe` / `Unsubscribe`: `count: u16` followed by `count` entries of
//!   `mid: u32, priority: u8, reliability: u8`.
//! - `App`: `mid: u32` followed by the opaque bus payload.

use crate::types::{Mid, MsgType, ProcessorId, Qos, Subscription};
use thiserror::Error;

/// Size of the fixed SBN header.
pub const HEADER_SIZE: usize = 7;

/// Largest payload the local bus accepts; MsgSz may never exceed it.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;

/// Largest packed message (header + payload).
pub const MAX_PACKED_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

const SUB_ENTRY_SIZE: usize = 6;
const SUB_COUNT_SIZE: usize = 2;
/// Topic id prefix of an app message payload.
pub const APP_MID_SIZE: usize = 4;

/// Largest bus payload that still fits an app message.
pub const MAX_APP_DATA_SIZE: usize = MAX_PAYLOAD_SIZE - APP_MID_SIZE;

/// Most subscriptions that fit one subscribe/unsubscribe message.
pub const MAX_SUBS_PER_MSG: usize = (MAX_PAYLOAD_SIZE - SUB_COUNT_SIZE) / SUB_ENTRY_SIZE;

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_size: u16,
    pub msg_type: MsgType,
    pub processor_id: ProcessorId,
}

impl Header {
    /// Parse and bounds-check a header.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let msg_size = u16::from_be_bytes([bytes[0], bytes[1]]);
        if msg_size as usize > MAX_PAYLOAD_SIZE {
            return Err(CodecError::TooLarge {
                size: msg_size as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            msg_size,
            msg_type: MsgType::from(bytes[2]),
            processor_id: ProcessorId(u32::from_be_bytes([
                bytes[3], bytes[4], bytes[5], bytes[6],
            ])),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.msg_size.to_be_bytes());
        out[2] = self.msg_type.as_u8();
        out[3..7].copy_from_slice(&self.processor_id.0.to_be_bytes());
        out
    }
}

/// An unpacked SBN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: MsgType,
    pub processor_id: ProcessorId,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(msg_type: MsgType, processor_id: ProcessorId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            processor_id,
            payload,
        }
    }

    /// MsgSz as it appears on the wire.
    pub fn msg_size(&self) -> usize {
        self.payload.len()
    }
}

/// Pack a message into a freshly allocated buffer.
pub fn pack(
    msg_type: MsgType,
    processor_id: ProcessorId,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    pack_into(msg_type, processor_id, payload, &mut buf)?;
    Ok(buf)
}

/// Pack a message, appending to `buf`.
pub fn pack_into(
    msg_type: MsgType,
    processor_id: ProcessorId,
    payload: &[u8],
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let header = Header {
        msg_size: payload.len() as u16,
        msg_type,
        processor_id,
    };
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Unpack one message from `bytes`.
///
/// Never reads past `bytes.len()`; trailing bytes beyond MsgSz are ignored.
pub fn unpack(bytes: &[u8]) -> Result<Packet, CodecError> {
    let header = Header::decode(bytes)?;
    let end = HEADER_SIZE + header.msg_size as usize;
    if bytes.len() < end {
        return Err(CodecError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }
    Ok(Packet {
        msg_type: header.msg_type,
        processor_id: header.processor_id,
        payload: bytes[HEADER_SIZE..end].to_vec(),
    })
}

// ============================================================================
// Payload helpers
// ============================================================================

pub fn encode_protocol(version: u8) -> [u8; 1] {
    [version]
}

pub fn decode_protocol(payload: &[u8]) -> Result<u8, CodecError> {
    payload.first().copied().ok_or(CodecError::Malformed {
        kind: "protocol",
        reason: "empty payload".into(),
    })
}

/// Encode a subscription list. Callers chunk lists longer than
/// [`MAX_SUBS_PER_MSG`].
pub fn encode_subscriptions(subs: &[Subscription]) -> Result<Vec<u8>, CodecError> {
    if subs.len() > MAX_SUBS_PER_MSG {
        return Err(CodecError::TooLarge {
            size: SUB_COUNT_SIZE + subs.len() * SUB_ENTRY_SIZE,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut out = Vec::with_capacity(SUB_COUNT_SIZE + subs.len() * SUB_ENTRY_SIZE);
    out.extend_from_slice(&(subs.len() as u16).to_be_bytes());
    for sub in subs {
        out.extend_from_slice(&sub.mid.0.to_be_bytes());
        out.push(sub.qos.priority);
        out.push(sub.qos.reliability);
    }
    Ok(out)
}

pub fn decode_subscriptions(payload: &[u8]) -> Result<Vec<Subscription>, CodecError> {
    if payload.len() < SUB_COUNT_SIZE {
        return Err(CodecError::Malformed {
            kind: "subscription",
            reason: "missing count".into(),
        });
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let body = &payload[SUB_COUNT_SIZE..];
    if body.len() < count * SUB_ENTRY_SIZE {
        return Err(CodecError::Malformed {
            kind: "subscription",
            reason: format!(
                "count {} needs {} bytes, have {}",
                count,
                count * SUB_ENTRY_SIZE,
                body.len()
            ),
        });
    }
    Ok(body
        .chunks_exact(SUB_ENTRY_SIZE)
        .take(count)
        .map(|entry| Subscription {
            mid: Mid(u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]])),
            qos: Qos {
                priority: entry[4],
                reliability: entry[5],
            },
        })
        .collect())
}

pub fn encode_app(mid: Mid, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(APP_MID_SIZE + data.len());
    out.extend_from_slice(&mid.0.to_be_bytes());
    out.extend_from_slice(data);
    out
}

pub fn decode_app(payload: &[u8]) -> Result<(Mid, &[u8]), CodecError> {
    if payload.len() < APP_MID_SIZE {
        return Err(CodecError::Malformed {
            kind: "app",
            reason: format!("{} bytes, need at least {}", payload.len(), APP_MID_SIZE),
        });
    }
    let mid = Mid(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]));
    Ok((mid, &payload[APP_MID_SIZE..]))
}
