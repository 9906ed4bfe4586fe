// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport.
//!
//! One socket per network, one packed SBN message per datagram. There is
//! no reassembly: a datagram that does not unpack is dropped.
//!
//! Peers are connected implicitly:
//!
//! - while disconnected, the node with the smaller ProcessorID sends an
//!   announce every `announce_secs`;
//! - any datagram from a configured peer that is not connected yet
//!   connects it;
//! - a connected peer idle for `heartbeat_secs` gets a heartbeat;
//! - a connected peer silent for longer than `timeout_secs` is dropped
//!   (0 disables this);
//! - on unload, connected peers are sent a best-effort disconnect.

use super::{resolve_address, PeerLink, RecvMode, Transport};
use crate::codec::{self, Packet, MAX_PACKED_SIZE};
use crate::error::TransportError;
use crate::net::{Network, Peer};
use crate::types::{MsgType, ProcessorId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const UDP_HEARTBEAT_MSG: MsgType = MsgType::Transport(0xA0);
pub const UDP_ANNOUNCE_MSG: MsgType = MsgType::Transport(0xA1);
pub const UDP_DISCONNECT_MSG: MsgType = MsgType::Transport(0xA2);

/// Read timeout of a socket serviced by a dedicated receive thread.
const DEDICATED_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Undeliverable datagrams skipped per receive call.
const MAX_DISCARDS_PER_CALL: usize = 64;

/// UDP transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpSettings {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Silence before a connected peer is dropped (0 disables the check).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_announce_secs")]
    pub announce_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_announce_secs() -> u64 {
    5
}

impl Default for UdpSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            timeout_secs: default_timeout_secs(),
            announce_secs: default_announce_secs(),
        }
    }
}

struct PeerSlot {
    addr: SocketAddr,
    last_announce: Option<Instant>,
}

#[derive(Default)]
struct NetState {
    bind: Option<SocketAddr>,
    socket: Option<Arc<UdpSocket>>,
    peers: HashMap<ProcessorId, PeerSlot>,
}

pub struct UdpTransport {
    settings: UdpSettings,
    state: Mutex<NetState>,
}

impl UdpTransport {
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(NetState::default()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.state.lock().socket.clone().ok_or(TransportError::NotLoaded)
    }

    fn send_to(&self, peer: &Peer, msg_type: MsgType, payload: &[u8]) -> Result<usize, TransportError> {
        let pid = peer.processor_id();
        let addr = self
            .state
            .lock()
            .peers
            .get(&pid)
            .map(|s| s.addr)
            .ok_or(TransportError::UnknownPeer(pid))?;
        let bytes = codec::pack(msg_type, peer.local().processor_id, payload)?;
        Ok(self.socket()?.send_to(&bytes, addr)?)
    }

    fn announce_due(&self, peer: &Peer, now: Instant) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.peers.get_mut(&peer.processor_id()) else {
            return false;
        };
        let due = slot.last_announce.map_or(true, |t| {
            now.duration_since(t) >= Duration::from_secs(self.settings.announce_secs)
        });
        if due {
            slot.last_announce = Some(now);
        }
        due
    }
}

fn open_socket(addr: SocketAddr, dedicated: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    let socket: UdpSocket = socket.into();
    if dedicated {
        socket.set_nonblocking(false)?;
        socket.set_read_timeout(Some(DEDICATED_RECV_TIMEOUT))?;
    } else {
        socket.set_nonblocking(true)?;
    }
    Ok(socket)
}

impl Transport for UdpTransport {
    fn name(&self) -> &str {
        "udp"
    }

    fn recv_mode(&self) -> RecvMode {
        RecvMode::PerNet
    }

    fn load_net(&self, _net: &Network, address: &str) -> Result<(), TransportError> {
        let addr = resolve_address(address)?;
        self.state.lock().bind = Some(addr);
        Ok(())
    }

    fn load_peer(&self, peer: &Peer, address: &str) -> Result<(), TransportError> {
        let addr = resolve_address(address)?;
        self.state.lock().peers.insert(
            peer.processor_id(),
            PeerSlot {
                addr,
                last_announce: None,
            },
        );
        Ok(())
    }

    fn init_net(&self, net: &Network) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let bind = state.bind.ok_or(TransportError::NotLoaded)?;
        let socket = open_socket(bind, net.task_flags().recv)?;
        info!("udp network {} bound to {}", net.index(), bind);
        state.socket = Some(Arc::new(socket));
        Ok(())
    }

    fn poll_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        let now = Instant::now();
        if peer.is_connected() {
            let timeout = self.settings.timeout_secs;
            if timeout > 0 && now.duration_since(peer.last_recv()) > Duration::from_secs(timeout) {
                info!("udp peer {} timed out", peer.processor_id());
                link.disconnected(peer);
                return Ok(());
            }
            let heartbeat = self.settings.heartbeat_secs;
            if heartbeat > 0 && now.duration_since(peer.last_send()) >= Duration::from_secs(heartbeat) {
                self.send_to(peer, UDP_HEARTBEAT_MSG, &[])?;
                peer.set_last_send(now);
            }
        } else if peer.local().processor_id < peer.processor_id() && self.announce_due(peer, now) {
            debug!("announcing to udp peer {}", peer.processor_id());
            self.send_to(peer, UDP_ANNOUNCE_MSG, &[])?;
        }
        Ok(())
    }

    fn send(&self, peer: &Peer, msg_type: MsgType, payload: &[u8]) -> Result<usize, TransportError> {
        self.send_to(peer, msg_type, payload)
    }

    fn recv_from_net(
        &self,
        net: &Network,
        _wait: Option<Duration>,
        link: &dyn PeerLink,
    ) -> Result<Option<Packet>, TransportError> {
        let socket = self.socket()?;
        let mut buf = [0u8; MAX_PACKED_SIZE];
        for _ in 0..MAX_DISCARDS_PER_CALL {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                // ICMP port unreachable from an earlier send; the peer is
                // simply not up yet.
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionRefused
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            let packet = match codec::unpack(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("malformed datagram from {}: {}", from, e);
                    continue;
                }
            };
            let Some(peer) = net.peer(packet.processor_id) else {
                error!(
                    "datagram from unknown processor id {} ({})",
                    packet.processor_id, from
                );
                continue;
            };
            if packet.msg_type == UDP_DISCONNECT_MSG {
                if peer.is_connected() {
                    info!("udp peer {} said goodbye", peer.processor_id());
                    link.disconnected(peer);
                }
                continue;
            }
            if !peer.is_connected() {
                info!("udp peer {} is up ({})", peer.processor_id(), from);
                link.connected(peer);
            }
            return Ok(Some(packet));
        }
        Ok(None)
    }

    fn unload_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        if peer.is_connected() {
            if let Err(e) = self.send_to(peer, UDP_DISCONNECT_MSG, &[]) {
                debug!("disconnect to udp peer {} not sent: {}", peer.processor_id(), e);
            }
            link.disconnected(peer);
        }
        self.state.lock().peers.remove(&peer.processor_id());
        Ok(())
    }

    fn unload_net(&self, net: &Network) -> Result<(), TransportError> {
        self.state.lock().socket = None;
        debug!("udp network {} unloaded", net.index());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;
    use crate::net::PeerSpec;
    use crate::transport::mock::RecordingLink;
    use crate::types::{NodeIdentity, SpacecraftId, TaskFlags};

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .and_then(|s| s.local_addr())
            .map(|a| a.port())
            .expect("free port")
    }

    fn node(local: u32, port: u16, peer: u32, peer_port: u16, settings: UdpSettings) -> (Network, Arc<Peer>) {
        let mut net = Network::new(
            0,
            NodeIdentity::new(local, 1),
            format!("127.0.0.1:{}", port),
            Box::new(UdpTransport::new(settings)),
            FilterChain::default(),
            TaskFlags::default(),
        );
        let peer = net
            .add_peer(PeerSpec {
                processor_id: ProcessorId(peer),
                spacecraft_id: SpacecraftId(1),
                address: format!("127.0.0.1:{}", peer_port),
                task_flags: TaskFlags::default(),
                filters: FilterChain::default(),
            })
            .expect("peer");
        net.transport().load_net(&net, net.address()).expect("load net");
        net.transport().load_peer(&peer, peer.address()).expect("load peer");
        net.transport().init_net(&net).expect("init net");
        (net, peer)
    }

    fn recv_within(net: &Network, link: &RecordingLink, wait: Duration) -> Option<Packet> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(packet) = net.transport().recv_from_net(net, None, link).expect("recv") {
                return Some(packet);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn quiet() -> UdpSettings {
        UdpSettings {
            heartbeat_secs: 0,
            timeout_secs: 0,
            announce_secs: 1,
        }
    }

    #[test]
    fn test_timeout_disconnects_on_poll() {
        let settings = UdpSettings {
            timeout_secs: 2,
            ..quiet()
        };
        let (net, peer) = node(1, free_port(), 2, free_port(), settings);
        let link = RecordingLink::default();
        link.connected(&peer);

        net.transport().poll_peer(&peer, &link).expect("poll");
        assert!(peer.is_connected());

        let past = Instant::now()
            .checked_sub(Duration::from_secs(3))
            .expect("clock");
        peer.set_last_recv(past);
        net.transport().poll_peer(&peer, &link).expect("poll");
        assert!(!peer.is_connected());
    }

    #[test]
    fn test_zero_timeout_never_disconnects() {
        let (net, peer) = node(1, free_port(), 2, free_port(), quiet());
        let link = RecordingLink::default();
        link.connected(&peer);
        let past = Instant::now()
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or_else(Instant::now);
        peer.set_last_recv(past);
        net.transport().poll_peer(&peer, &link).expect("poll");
        assert!(peer.is_connected());
    }

    #[test]
    fn test_smaller_id_announces() {
        let port_a = free_port();
        let port_b = free_port();
        let (net_a, peer_b) = node(5, port_a, 9, port_b, quiet());
        let (net_b, peer_a) = node(9, port_b, 5, port_a, quiet());
        let link_a = RecordingLink::default();
        let link_b = RecordingLink::default();

        // The larger id stays silent while disconnected.
        net_b.transport().poll_peer(&peer_a, &link_b).expect("poll");
        assert!(recv_within(&net_a, &link_a, Duration::from_millis(200)).is_none());

        net_a.transport().poll_peer(&peer_b, &link_a).expect("poll");
        let packet = recv_within(&net_b, &link_b, Duration::from_secs(2)).expect("announce");
        assert_eq!(packet.msg_type, UDP_ANNOUNCE_MSG);
        assert!(peer_a.is_connected());

        // A second poll inside the interval does not announce again.
        net_a.transport().poll_peer(&peer_b, &link_a).expect("poll");
        assert!(recv_within(&net_b, &link_b, Duration::from_millis(200)).is_none());
    }

    #[test]
    fn test_disconnect_datagram_on_unload() {
        let port_a = free_port();
        let port_b = free_port();
        let (net_a, peer_b) = node(5, port_a, 9, port_b, quiet());
        let (net_b, peer_a) = node(9, port_b, 5, port_a, quiet());
        let link_a = RecordingLink::default();
        let link_b = RecordingLink::default();
        link_a.connected(&peer_b);
        link_b.connected(&peer_a);

        net_a.transport().unload_peer(&peer_b, &link_a).expect("unload");
        assert!(!peer_b.is_connected());

        assert!(recv_within(&net_b, &link_b, Duration::from_millis(500)).is_none());
        assert!(!peer_a.is_connected());
    }

    #[test]
    fn test_unknown_sender_ignored() {
        let port_a = free_port();
        let (net_a, peer) = node(5, port_a, 9, free_port(), quiet());
        let link = RecordingLink::default();

        let stray = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
        let bytes = codec::pack(UDP_ANNOUNCE_MSG, ProcessorId(44), &[]).expect("pack");
        stray.send_to(&bytes, ("127.0.0.1", port_a)).expect("send");
        stray.send_to(&[1, 2], ("127.0.0.1", port_a)).expect("send");

        assert!(recv_within(&net_a, &link, Duration::from_millis(200)).is_none());
        assert!(!peer.is_connected());
        assert!(link.events().is_empty());
    }
}
