// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identifier types shared by every layer of the bridge.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version carried in the handshake message.
pub const SBN_PROTOCOL_VERSION: u8 = 6;

/// Node identity on the wire (sender field of every header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessorId(pub u32);

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spacecraft identifier; together with [`ProcessorId`] it names a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpacecraftId(pub u32);

impl fmt::Display for SpacecraftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local bus topic identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mid(pub u32);

impl Mid {
    /// Reserved value meaning "no topic"; remap entries use it to drop traffic.
    pub const INVALID: Mid = Mid(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for Mid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Quality-of-service tag attached to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Qos {
    pub priority: u8,
    pub reliability: u8,
}

/// A topic plus the QoS it was requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub mid: Mid,
    pub qos: Qos,
}

impl Subscription {
    pub fn new(mid: Mid, qos: Qos) -> Self {
        Self { mid, qos }
    }
}

/// Identity of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub processor_id: ProcessorId,
    pub spacecraft_id: SpacecraftId,
}

impl NodeIdentity {
    pub fn new(processor_id: u32, spacecraft_id: u32) -> Self {
        Self {
            processor_id: ProcessorId(processor_id),
            spacecraft_id: SpacecraftId(spacecraft_id),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.spacecraft_id, self.processor_id)
    }
}

/// Whether a send/receive path runs on its own thread or inside the
/// dispatcher tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFlags {
    #[serde(default)]
    pub send: bool,
    #[serde(default)]
    pub recv: bool,
}

impl TaskFlags {
    pub const COOPERATIVE: TaskFlags = TaskFlags {
        send: false,
        recv: false,
    };

    pub fn dedicated_send() -> Self {
        Self {
            send: true,
            recv: false,
        }
    }

    pub fn dedicated_recv() -> Self {
        Self {
            send: false,
            recv: true,
        }
    }
}

/// Message type byte of the SBN header.
///
/// Values `0x00..=0x04` are owned by the core protocol. Anything else is
/// private to the transport that emitted it (heartbeats, announces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    NoMsg,
    Subscribe,
    Unsubscribe,
    App,
    Protocol,
    Transport(u8),
}

impl MsgType {
    pub fn as_u8(self) -> u8 {
        match self {
            MsgType::NoMsg => 0x00,
            MsgType::Subscribe => 0x01,
            MsgType::Unsubscribe => 0x02,
            MsgType::App => 0x03,
            MsgType::Protocol => 0x04,
            MsgType::Transport(code) => code,
        }
    }
}

impl From<u8> for MsgType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => MsgType::NoMsg,
            0x01 => MsgType::Subscribe,
            0x02 => MsgType::Unsubscribe,
            0x03 => MsgType::App,
            0x04 => MsgType::Protocol,
            other => MsgType::Transport(other),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgType::NoMsg => write!(f, "none"),
            MsgType::Subscribe => write!(f, "sub"),
            MsgType::Unsubscribe => write!(f, "unsub"),
            MsgType::App => write!(f, "app"),
            MsgType::Protocol => write!(f, "proto"),
            MsgType::Transport(code) => write!(f, "transport(0x{:02X})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_byte_mapping() {
        for byte in 0u8..=255 {
            assert_eq!(MsgType::from(byte).as_u8(), byte);
        }
        assert_eq!(MsgType::from(0x03), MsgType::App);
        assert_eq!(MsgType::from(0xA0), MsgType::Transport(0xA0));
    }

    #[test]
    fn test_mid_validity() {
        assert!(!Mid::INVALID.is_valid());
        assert!(Mid(0x1801).is_valid());
        assert_eq!(Mid(0x1801).to_string(), "0x1801");
    }
}
