// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network and peer model.
//!
//! A [`Network`] is one configured transport with its peers. Networks and
//! peers are created once at load time and live until shutdown; only the
//! mutable [`PeerState`] changes while the bridge runs.

use crate::bus::BusQueue;
use crate::error::SbnError;
use crate::filter::{FilterChain, FilterCtx};
use crate::subscription::RemoteSubs;
use crate::transport::Transport;
use crate::types::{NodeIdentity, ProcessorId, SpacecraftId, Subscription, TaskFlags};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A transport-bound group of peers.
pub struct Network {
    index: usize,
    local: NodeIdentity,
    address: String,
    transport: Box<dyn Transport>,
    filters: FilterChain,
    task_flags: TaskFlags,
    peers: Vec<Arc<Peer>>,
    send_lock: Mutex<()>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("index", &self.index)
            .field("transport", &self.transport.name())
            .field("address", &self.address)
            .field("filters", &self.filters)
            .field("task_flags", &self.task_flags)
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// Everything needed to create a [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub processor_id: ProcessorId,
    pub spacecraft_id: SpacecraftId,
    pub address: String,
    pub task_flags: TaskFlags,
    pub filters: FilterChain,
}

impl Network {
    pub fn new(
        index: usize,
        local: NodeIdentity,
        address: impl Into<String>,
        transport: Box<dyn Transport>,
        filters: FilterChain,
        task_flags: TaskFlags,
    ) -> Self {
        Self {
            index,
            local,
            address: address.into(),
            transport,
            filters,
            task_flags,
            peers: Vec::new(),
            send_lock: Mutex::new(()),
        }
    }

    /// Add a peer. ProcessorIDs are unique within a network.
    pub fn add_peer(&mut self, spec: PeerSpec) -> Result<Arc<Peer>, SbnError> {
        if self.peer(spec.processor_id).is_some() {
            return Err(SbnError::Config(crate::config::ConfigError::Invalid(format!(
                "network {} already has peer {}",
                self.index, spec.processor_id
            ))));
        }
        let peer = Arc::new(Peer::new(self.index, self.local, &self.filters, spec));
        self.peers.push(peer.clone());
        Ok(peer)
    }

    /// Drop peers that failed to load.
    pub(crate) fn retain_peers<F: FnMut(&Peer) -> bool>(&mut self, mut keep: F) {
        self.peers.retain(|p| keep(p));
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn local(&self) -> NodeIdentity {
        self.local
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn task_flags(&self) -> TaskFlags {
        self.task_flags
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn peer(&self, processor_id: ProcessorId) -> Option<&Arc<Peer>> {
        self.peers.iter().find(|p| p.processor_id == processor_id)
    }

    /// True when some sender on this network runs on its own thread, so
    /// writes must be serialized.
    pub fn has_dedicated_sender(&self) -> bool {
        self.task_flags.send || self.peers.iter().any(|p| p.task_flags.send)
    }

    /// Serializes socket writes between dedicated and cooperative senders.
    pub(crate) fn send_lock(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock()
    }
}

/// Mutable per-peer state, guarded by the peer's lock.
#[derive(Debug)]
pub struct PeerState {
    pub connected: bool,
    pub queue: Option<BusQueue>,
    pub last_send: Instant,
    pub last_recv: Instant,
    pub subs: RemoteSubs,
}

#[derive(Debug, Default)]
pub struct PeerCounters {
    pub send_count: AtomicU64,
    pub recv_count: AtomicU64,
    pub send_err_count: AtomicU64,
    pub recv_err_count: AtomicU64,
}

impl PeerCounters {
    pub fn reset(&self) {
        self.send_count.store(0, Ordering::Relaxed);
        self.recv_count.store(0, Ordering::Relaxed);
        self.send_err_count.store(0, Ordering::Relaxed);
        self.recv_err_count.store(0, Ordering::Relaxed);
    }

    pub fn reset_errors(&self) {
        self.send_err_count.store(0, Ordering::Relaxed);
        self.recv_err_count.store(0, Ordering::Relaxed);
    }
}

/// One remote node reachable over a network.
pub struct Peer {
    processor_id: ProcessorId,
    spacecraft_id: SpacecraftId,
    net: usize,
    local: NodeIdentity,
    address: String,
    task_flags: TaskFlags,
    filters: FilterChain,
    state: Mutex<PeerState>,
    counters: PeerCounters,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("processor_id", &self.processor_id)
            .field("spacecraft_id", &self.spacecraft_id)
            .field("net", &self.net)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Peer {
    fn new(net: usize, local: NodeIdentity, net_filters: &FilterChain, spec: PeerSpec) -> Self {
        let now = Instant::now();
        Self {
            processor_id: spec.processor_id,
            spacecraft_id: spec.spacecraft_id,
            net,
            local,
            address: spec.address,
            task_flags: spec.task_flags,
            filters: net_filters.then(&spec.filters),
            state: Mutex::new(PeerState {
                connected: false,
                queue: None,
                last_send: now,
                last_recv: now,
                subs: RemoteSubs::default(),
            }),
            counters: PeerCounters::default(),
        }
    }

    pub fn processor_id(&self) -> ProcessorId {
        self.processor_id
    }

    pub fn spacecraft_id(&self) -> SpacecraftId {
        self.spacecraft_id
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            processor_id: self.processor_id,
            spacecraft_id: self.spacecraft_id,
        }
    }

    /// Index of the owning network.
    pub fn net(&self) -> usize {
        self.net
    }

    /// Identity of this node, as stamped on outgoing headers.
    pub fn local(&self) -> NodeIdentity {
        self.local
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn task_flags(&self) -> TaskFlags {
        self.task_flags
    }

    /// Network chain followed by the peer's own filters.
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn filter_ctx(&self) -> FilterCtx {
        FilterCtx {
            local: self.local,
            peer: self.identity(),
        }
    }

    pub fn counters(&self) -> &PeerCounters {
        &self.counters
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Outbound bus queue, present while connected.
    pub fn queue(&self) -> Option<BusQueue> {
        self.state.lock().queue.clone()
    }

    pub fn last_send(&self) -> Instant {
        self.state.lock().last_send
    }

    pub fn last_recv(&self) -> Instant {
        self.state.lock().last_recv
    }

    pub fn set_last_recv(&self, at: Instant) {
        self.state.lock().last_recv = at;
    }

    pub fn set_last_send(&self, at: Instant) {
        self.state.lock().last_send = at;
    }

    pub fn remote_subs(&self) -> Vec<Subscription> {
        self.state.lock().subs.iter().copied().collect()
    }

    pub fn remote_sub_count(&self) -> usize {
        self.state.lock().subs.len()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.lock();
        PeerSnapshot {
            net: self.net,
            processor_id: self.processor_id,
            spacecraft_id: self.spacecraft_id,
            connected: state.connected,
            send_count: self.counters.send_count.load(Ordering::Relaxed),
            recv_count: self.counters.recv_count.load(Ordering::Relaxed),
            send_err_count: self.counters.send_err_count.load(Ordering::Relaxed),
            recv_err_count: self.counters.recv_err_count.load(Ordering::Relaxed),
            sub_count: state.subs.len(),
            since_send: state.last_send.elapsed(),
            since_recv: state.last_recv.elapsed(),
        }
    }
}

/// Point-in-time view of a peer, for housekeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub net: usize,
    pub processor_id: ProcessorId,
    pub spacecraft_id: SpacecraftId,
    pub connected: bool,
    pub send_count: u64,
    pub recv_count: u64,
    pub send_err_count: u64,
    pub recv_err_count: u64,
    pub sub_count: usize,
    pub since_send: Duration,
    pub since_recv: Duration,
}
