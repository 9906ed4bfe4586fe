// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test doubles: a scripted transport and a recording [`PeerLink`].

use super::{PeerLink, RecvMode, Transport};
use crate::codec::{self, Packet};
use crate::error::TransportError;
use crate::net::{Network, Peer};
use crate::types::{MsgType, ProcessorId};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub peer: ProcessorId,
    pub msg_type: MsgType,
    pub payload: Vec<u8>,
}

/// Shared record of everything a [`MockTransport`] sent.
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<Sent>>>);

impl SentLog {
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn count(&self, msg_type: MsgType) -> usize {
        self.0.lock().iter().filter(|s| s.msg_type == msg_type).count()
    }

    pub fn all(&self) -> Vec<Sent> {
        self.0.lock().clone()
    }
}

/// Holds one send inside [`Transport::send`] until opened.
pub struct SendGate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl SendGate {
    /// Block until the held send has started.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(5))
            .expect("held send never started");
    }

    pub fn open(self) {
        let _ = self.release.send(());
    }
}

struct Hold {
    msg_type: MsgType,
    entered: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
struct Inner {
    sent: SentLog,
    inbound: Mutex<VecDeque<Packet>>,
    fail_sends: AtomicBool,
    polls: AtomicUsize,
    hold: Mutex<Option<Hold>>,
}

/// Transport that records sends and replays injected packets.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
    per_peer: bool,
}

impl MockTransport {
    pub fn sent(&self) -> SentLog {
        self.inner.sent.clone()
    }

    pub fn per_peer(mut self) -> Self {
        self.per_peer = true;
        self
    }

    pub fn inject(&self, packet: Packet) {
        self.inner.inbound.lock().push_back(packet);
    }

    /// Make every send fail as a lost connection.
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Hold the next send of `msg_type` until the gate opens.
    pub fn hold_next(&self, msg_type: MsgType) -> SendGate {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        *self.inner.hold.lock() = Some(Hold {
            msg_type,
            entered: entered_tx,
            release: release_rx,
        });
        SendGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn polls(&self) -> usize {
        self.inner.polls.load(Ordering::SeqCst)
    }

    fn next_packet(&self, wait: Option<Duration>) -> Option<Packet> {
        let packet = self.inner.inbound.lock().pop_front();
        if packet.is_none() {
            if let Some(wait) = wait {
                std::thread::sleep(wait.min(Duration::from_millis(10)));
            }
        }
        packet
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn recv_mode(&self) -> RecvMode {
        if self.per_peer {
            RecvMode::PerPeer
        } else {
            RecvMode::PerNet
        }
    }

    fn load_net(&self, _net: &Network, _address: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn load_peer(&self, _peer: &Peer, address: &str) -> Result<(), TransportError> {
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(String::new()));
        }
        Ok(())
    }

    fn init_net(&self, _net: &Network) -> Result<(), TransportError> {
        Ok(())
    }

    fn poll_peer(&self, _peer: &Peer, _link: &dyn PeerLink) -> Result<(), TransportError> {
        self.inner.polls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, peer: &Peer, msg_type: MsgType, payload: &[u8]) -> Result<usize, TransportError> {
        let hold = {
            let mut hold = self.inner.hold.lock();
            if hold.as_ref().map_or(false, |h| h.msg_type == msg_type) {
                hold.take()
            } else {
                None
            }
        };
        if let Some(hold) = hold {
            let _ = hold.entered.send(());
            let _ = hold.release.recv();
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost(peer.processor_id()));
        }
        // Same size limit as the real transports.
        let bytes = codec::pack(msg_type, peer.local().processor_id, payload)?;
        self.inner.sent.0.lock().push(Sent {
            peer: peer.processor_id(),
            msg_type,
            payload: payload.to_vec(),
        });
        Ok(bytes.len())
    }

    fn recv_from_peer(
        &self,
        _net: &Network,
        peer: &Peer,
        wait: Option<Duration>,
        _link: &dyn PeerLink,
    ) -> Result<Option<Packet>, TransportError> {
        if !self.per_peer {
            return Err(TransportError::Unsupported("recv_from_peer"));
        }
        let mut inbound = self.inner.inbound.lock();
        if let Some(pos) = inbound.iter().position(|p| p.processor_id == peer.processor_id()) {
            return Ok(inbound.remove(pos));
        }
        drop(inbound);
        if let Some(wait) = wait {
            std::thread::sleep(wait.min(Duration::from_millis(10)));
        }
        Ok(None)
    }

    fn recv_from_net(
        &self,
        _net: &Network,
        wait: Option<Duration>,
        _link: &dyn PeerLink,
    ) -> Result<Option<Packet>, TransportError> {
        if self.per_peer {
            return Err(TransportError::Unsupported("recv_from_net"));
        }
        Ok(self.next_packet(wait))
    }

    fn unload_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        if peer.is_connected() {
            link.disconnected(peer);
        }
        Ok(())
    }

    fn unload_net(&self, _net: &Network) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Link that flips the connected flag and records each event.
#[derive(Default)]
pub struct RecordingLink {
    events: Mutex<Vec<(ProcessorId, bool)>>,
}

impl RecordingLink {
    pub fn events(&self) -> Vec<(ProcessorId, bool)> {
        self.events.lock().clone()
    }
}

impl PeerLink for RecordingLink {
    fn connected(&self, peer: &Peer) {
        {
            let mut state = peer.state();
            state.connected = true;
            state.last_recv = std::time::Instant::now();
        }
        self.events.lock().push((peer.processor_id(), true));
    }

    fn disconnected(&self, peer: &Peer) {
        peer.state().connected = false;
        self.events.lock().push((peer.processor_id(), false));
    }
}
