// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime commands and housekeeping telemetry.

use crate::net::PeerSnapshot;
use crate::types::{NodeIdentity, ProcessorId};
use crossbeam::channel::Sender;
use std::time::Duration;

/// Commands accepted by a running dispatcher.
///
/// Every variant except [`Command::Wakeup`] and [`Command::ResetCounters`]
/// counts towards the command counters in [`HousekeepingSnapshot`].
#[derive(Debug)]
pub enum Command {
    /// Wake token: end the current wait and run a tick.
    Wakeup,
    Noop,
    /// Zero the command counters and every peer's counters.
    ResetCounters,
    /// Force a peer through disconnect so its transport reconnects.
    ResetPeer {
        net: usize,
        processor_id: ProcessorId,
    },
    PeerStatus {
        reply: Sender<Vec<PeerSnapshot>>,
    },
    Housekeeping {
        reply: Sender<HousekeepingSnapshot>,
    },
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Wakeup => "wakeup",
            Command::Noop => "noop",
            Command::ResetCounters => "reset-counters",
            Command::ResetPeer { .. } => "reset-peer",
            Command::PeerStatus { .. } => "peer-status",
            Command::Housekeeping { .. } => "housekeeping",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Bridge-wide housekeeping view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HousekeepingSnapshot {
    pub identity: NodeIdentity,
    pub command_count: u64,
    pub command_err_count: u64,
    pub net_count: usize,
    pub local_sub_count: usize,
    pub uptime: Duration,
    pub peers: Vec<PeerSnapshot>,
}

impl HousekeepingSnapshot {
    pub fn connected_peers(&self) -> usize {
        self.peers.iter().filter(|p| p.connected).count()
    }
}
