// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport modules.
//!
//! A transport drives one [`Network`]: it owns the sockets, decides when a
//! peer is reachable, and moves packed SBN messages on and off the wire.
//! Each network gets its own transport instance, so per-network and
//! per-peer socket state lives inside the implementation.
//!
//! # Receive multiplexing
//!
//! A transport receives either per peer ([`RecvMode::PerPeer`], one socket
//! per peer) or per network ([`RecvMode::PerNet`], one socket or poll set
//! for all peers). It implements the matching `recv_from_*` method only;
//! the other keeps its default, which reports [`TransportError::Unsupported`].
//!
//! # Return codes
//!
//! - `Ok(Some(packet))`: a message for the dispatcher.
//! - `Ok(None)`: nothing available now. Not an error.
//! - `Err(_)`: the call failed; the caller counts it and, for
//!   [`TransportError::ConnectionLost`], runs the disconnect path.
//!
//! Transports report reachability changes through [`PeerLink`], and must
//! not hold their own locks while calling it: the connect path sends the
//! handshake back through [`Transport::send`].

pub mod tcp;
pub mod udp;

#[cfg(test)]
pub(crate) mod mock;

pub use tcp::{TcpSettings, TcpTransport};
pub use udp::{UdpSettings, UdpTransport};

use crate::codec::Packet;
use crate::error::TransportError;
use crate::net::{Network, Peer};
use crate::types::MsgType;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// How a transport multiplexes receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    PerPeer,
    PerNet,
}

/// Connection events a transport raises towards the bridge.
pub trait PeerLink: Send + Sync {
    /// The remote end of `peer` is reachable.
    fn connected(&self, peer: &Peer);

    /// The remote end of `peer` went away.
    fn disconnected(&self, peer: &Peer);
}

/// A protocol driver bound to one network.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn recv_mode(&self) -> RecvMode;

    /// Called once, before any network is loaded.
    fn init(&self, _version: u32) -> Result<(), TransportError> {
        Ok(())
    }

    /// Parse the network's own address.
    fn load_net(&self, net: &Network, address: &str) -> Result<(), TransportError>;

    /// Parse a peer address and allocate per-peer state.
    fn load_peer(&self, peer: &Peer, address: &str) -> Result<(), TransportError>;

    /// Open the network's sockets.
    fn init_net(&self, net: &Network) -> Result<(), TransportError>;

    fn init_peer(&self, _peer: &Peer) -> Result<(), TransportError> {
        Ok(())
    }

    /// Periodic housekeeping: connects, heartbeats, timeouts.
    fn poll_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError>;

    /// Send one packed message. Returns the number of bytes written, 0 if
    /// the peer has no usable connection yet.
    fn send(&self, peer: &Peer, msg_type: MsgType, payload: &[u8]) -> Result<usize, TransportError>;

    /// Receive from one peer. `wait` of `None` never blocks.
    fn recv_from_peer(
        &self,
        _net: &Network,
        _peer: &Peer,
        _wait: Option<Duration>,
        _link: &dyn PeerLink,
    ) -> Result<Option<Packet>, TransportError> {
        Err(TransportError::Unsupported("recv_from_peer"))
    }

    /// Receive from any peer of the network. `wait` of `None` never blocks.
    fn recv_from_net(
        &self,
        _net: &Network,
        _wait: Option<Duration>,
        _link: &dyn PeerLink,
    ) -> Result<Option<Packet>, TransportError> {
        Err(TransportError::Unsupported("recv_from_net"))
    }

    /// Drop the peer's current connection so it is re-established from
    /// scratch.
    fn reset_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        if peer.is_connected() {
            link.disconnected(peer);
        }
        Ok(())
    }

    /// Release peer state; connected peers are told goodbye if the
    /// protocol has a way to.
    fn unload_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError>;

    /// Close the network's sockets.
    fn unload_net(&self, net: &Network) -> Result<(), TransportError>;
}

/// Resolve a `host:port` string.
pub fn resolve_address(address: &str) -> Result<SocketAddr, TransportError> {
    address
        .to_socket_addrs()
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))
}
