// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge context.
//!
//! [`Bridge`] owns the networks, the local subscription table and the
//! bridge-wide counters. It is built once from configuration and then
//! shared (`Arc<Bridge>`) between the dispatcher and any dedicated send or
//! receive threads. Its behaviour is split over several modules:
//!
//! - `connection`: peer connect/disconnect transitions;
//! - `subscription`: local and remote subscription relay;
//! - `dispatcher`: message send/receive, commands and threads.

use crate::bus::LocalBus;
use crate::command::HousekeepingSnapshot;
use crate::config::{BridgeConfig, DispatcherConfig, NetworkConfig};
use crate::error::{Result, SbnError};
use crate::net::{Network, Peer, PeerSnapshot, PeerSpec};
use crate::registry::ModuleRegistry;
use crate::subscription::LocalSubs;
use crate::transport::PeerLink;
use crate::types::{
    NodeIdentity, ProcessorId, SpacecraftId, Subscription, SBN_PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub struct Bridge {
    identity: NodeIdentity,
    pub(crate) settings: DispatcherConfig,
    pub(crate) bus: Arc<dyn LocalBus>,
    nets: Vec<Network>,
    pub(crate) local_subs: Mutex<LocalSubs>,
    pub(crate) command_count: AtomicU64,
    pub(crate) command_err_count: AtomicU64,
    running: AtomicBool,
    unloaded: AtomicBool,
    started: Instant,
}

impl Bridge {
    /// Assemble a bridge from already loaded networks.
    pub fn new(
        identity: NodeIdentity,
        settings: DispatcherConfig,
        bus: Arc<dyn LocalBus>,
        nets: Vec<Network>,
    ) -> Self {
        Self {
            identity,
            settings,
            bus,
            nets,
            local_subs: Mutex::new(LocalSubs::default()),
            command_count: AtomicU64::new(0),
            command_err_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Load every configured network and peer.
    ///
    /// A network or peer that fails to load is logged and left out; the
    /// bridge comes up with whatever remains. Fails only when the
    /// configuration is invalid or no network could be brought up.
    pub fn load(
        config: &BridgeConfig,
        mut registry: ModuleRegistry,
        bus: Arc<dyn LocalBus>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config.node.identity();
        let version = u32::from(SBN_PROTOCOL_VERSION);
        registry.init_filters(version);

        let mut nets = Vec::with_capacity(config.networks.len());
        for (index, net_config) in config.networks.iter().enumerate() {
            match load_net(index, identity, net_config, &registry, version) {
                Ok(net) => {
                    info!(
                        "network {} up: {} on {} with {} peer(s)",
                        index,
                        net_config.transport,
                        net_config.address,
                        net.peers().len()
                    );
                    nets.push(net);
                }
                Err(e) => error!("network {} ({}) not loaded: {}", index, net_config.transport, e),
            }
        }
        if nets.is_empty() {
            return Err(SbnError::NoNetworks);
        }
        Ok(Self::new(identity, config.dispatcher.clone(), bus, nets))
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn settings(&self) -> &DispatcherConfig {
        &self.settings
    }

    pub fn nets(&self) -> &[Network] {
        &self.nets
    }

    /// Network by configured index. Indexes of networks that failed to
    /// load are absent.
    pub fn network(&self, index: usize) -> Option<&Network> {
        self.nets.iter().find(|n| n.index() == index)
    }

    pub fn find_peer(&self, net: usize, processor_id: ProcessorId) -> Option<Arc<Peer>> {
        self.network(net)?.peer(processor_id).cloned()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.nets.iter().flat_map(|n| n.peers().iter())
    }

    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peers().filter(|p| p.is_connected()).cloned().collect()
    }

    /// Topics local applications currently subscribe to.
    pub fn local_subscriptions(&self) -> Vec<Subscription> {
        self.local_subs.lock().to_vec()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        self.peers().map(|p| p.snapshot()).collect()
    }

    pub fn housekeeping(&self) -> HousekeepingSnapshot {
        HousekeepingSnapshot {
            identity: self.identity,
            command_count: self.command_count.load(Ordering::Relaxed),
            command_err_count: self.command_err_count.load(Ordering::Relaxed),
            net_count: self.nets.len(),
            local_sub_count: self.local_subs.lock().len(),
            uptime: self.started.elapsed(),
            peers: self.peer_snapshots(),
        }
    }

    /// Zero the command counters and every peer's counters.
    pub fn reset_counters(&self) {
        self.command_count.store(0, Ordering::Relaxed);
        self.command_err_count.store(0, Ordering::Relaxed);
        for peer in self.peers() {
            peer.counters().reset();
        }
    }

    /// Unload every peer, then every network. Runs once.
    pub(crate) fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        for net in &self.nets {
            for peer in net.peers() {
                if let Err(e) = net.transport().unload_peer(peer, self) {
                    warn!("unload of peer {} failed: {}", peer.processor_id(), e);
                }
                if peer.is_connected() {
                    self.disconnected(peer);
                }
            }
            if let Err(e) = net.transport().unload_net(net) {
                warn!("unload of network {} failed: {}", net.index(), e);
            }
        }
        info!("bridge {} unloaded", self.identity);
    }
}

fn load_net(
    index: usize,
    identity: NodeIdentity,
    config: &NetworkConfig,
    registry: &ModuleRegistry,
    version: u32,
) -> Result<Network> {
    let transport = registry.create_transport(&config.transport)?;
    transport.init(version)?;
    let filters = registry.chain(&config.filters)?;
    let mut net = Network::new(
        index,
        identity,
        config.address.clone(),
        transport,
        filters,
        config.task_flags,
    );
    net.transport().load_net(&net, &config.address)?;

    let mut failed = Vec::new();
    for peer_config in &config.peers {
        let pid = ProcessorId(peer_config.processor_id);
        let filters = match registry.chain(&peer_config.filters) {
            Ok(filters) => filters,
            Err(e) => {
                error!("peer {} on network {} not loaded: {}", pid, index, e);
                continue;
            }
        };
        let peer = match net.add_peer(PeerSpec {
            processor_id: pid,
            spacecraft_id: SpacecraftId(peer_config.spacecraft_id),
            address: peer_config.address.clone(),
            task_flags: peer_config.task_flags,
            filters,
        }) {
            Ok(peer) => peer,
            Err(e) => {
                error!("peer {} on network {} not loaded: {}", pid, index, e);
                continue;
            }
        };
        if let Err(e) = net.transport().load_peer(&peer, &peer_config.address) {
            error!("peer {} on network {} not loaded: {}", pid, index, e);
            failed.push(pid);
        }
    }
    net.retain_peers(|p| !failed.contains(&p.processor_id()));

    net.transport().init_net(&net)?;
    let mut failed = Vec::new();
    for peer in net.peers() {
        if let Err(e) = net.transport().init_peer(peer) {
            error!("peer {} on network {} not initialized: {}", peer.processor_id(), index, e);
            failed.push(peer.processor_id());
        }
    }
    net.retain_peers(|p| !failed.contains(&p.processor_id()));
    Ok(net)
}

impl PeerLink for Bridge {
    fn connected(&self, peer: &Peer) {
        if let Err(e) = self.peer_connected(peer) {
            warn!("connect of peer {} rejected: {}", peer.processor_id(), e);
        }
    }

    fn disconnected(&self, peer: &Peer) {
        if let Err(e) = self.peer_disconnected(peer) {
            warn!("disconnect of peer {} rejected: {}", peer.processor_id(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::{FilterConfig, FilterKind, PeerConfig};
    use crate::filter::{FilterChain, ListMode};
    use crate::transport::mock::{MockTransport, SentLog};
    use crate::types::{Mid, TaskFlags};

    pub(crate) fn test_settings() -> DispatcherConfig {
        DispatcherConfig {
            main_loop_delay_ms: 10,
            max_subs_per_peer: 8,
            peer_queue_depth: 16,
            ..Default::default()
        }
    }

    /// Bridge on one mock network, node 1 on spacecraft 42.
    pub(crate) fn mock_bridge(peers: &[u32], mock: MockTransport) -> (Arc<Bridge>, MemoryBus) {
        mock_bridge_with(peers, mock, test_settings())
    }

    pub(crate) fn mock_bridge_with(
        peers: &[u32],
        mock: MockTransport,
        settings: DispatcherConfig,
    ) -> (Arc<Bridge>, MemoryBus) {
        let identity = NodeIdentity::new(1, 42);
        let mut net = Network::new(
            0,
            identity,
            "mock:0",
            Box::new(mock),
            FilterChain::default(),
            TaskFlags::default(),
        );
        for pid in peers {
            net.add_peer(PeerSpec {
                processor_id: ProcessorId(*pid),
                spacecraft_id: SpacecraftId(42),
                address: format!("mock:{}", pid),
                task_flags: TaskFlags::default(),
                filters: FilterChain::default(),
            })
            .expect("peer");
        }
        let bus = MemoryBus::new();
        let bridge = Bridge::new(
            identity,
            settings,
            Arc::new(bus.client("sbn")),
            vec![net],
        );
        (Arc::new(bridge), bus)
    }

    pub(crate) fn bridge_with_mock(peers: &[u32]) -> (Arc<Bridge>, MemoryBus, SentLog) {
        let mock = MockTransport::default();
        let sent = mock.sent();
        let (bridge, bus) = mock_bridge(peers, mock);
        (bridge, bus, sent)
    }

    pub(crate) fn connect(bridge: &Bridge, peer: &Peer) {
        bridge.peer_connected(peer).expect("connect");
    }

    fn registry_with_mock(config: &BridgeConfig) -> ModuleRegistry {
        let mut registry = ModuleRegistry::with_builtins(config);
        registry.register_transport("mock", || Box::new(MockTransport::default()));
        registry
    }

    #[test]
    fn test_load_skips_broken_networks_and_peers() {
        let mut config = BridgeConfig::new(1, 42);
        config.filters.push(FilterConfig {
            name: "deny".into(),
            kind: FilterKind::MidList {
                mode: ListMode::Deny,
                mids: vec![Mid(0x0800)],
            },
        });
        config = config
            .network(NetworkConfig::new("serial", "/dev/ttyS0").peer(PeerConfig::new(2, 42, "x")))
            .network(
                NetworkConfig::new("mock", "mock:1")
                    .filter("deny")
                    .peer(PeerConfig::new(2, 42, "mock:2"))
                    .peer({
                        let mut peer = PeerConfig::new(3, 42, "mock:3");
                        peer.filters.push("missing".into());
                        peer
                    }),
            )
            .network(
                NetworkConfig::new("udp", "127.0.0.1:0").peer(PeerConfig::new(4, 42, "nowhere")),
            );

        let bus = MemoryBus::new();
        let bridge = Bridge::load(&config, registry_with_mock(&config), Arc::new(bus.client("sbn")))
            .expect("load");

        assert!(bridge.network(0).is_none());
        let mock_net = bridge.network(1).expect("mock net");
        assert_eq!(mock_net.peers().len(), 1);
        assert_eq!(mock_net.filters().names(), vec!["deny"]);
        assert_eq!(
            bridge.find_peer(1, ProcessorId(2)).expect("peer").filters().names(),
            vec!["deny"]
        );
        assert!(bridge.find_peer(1, ProcessorId(3)).is_none());
        assert!(bridge.network(2).expect("udp net").peers().is_empty());
        bridge.unload();
    }

    #[test]
    fn test_load_without_networks_fails() {
        let config = BridgeConfig::new(1, 42)
            .network(NetworkConfig::new("serial", "/dev/ttyS0").peer(PeerConfig::new(2, 42, "x")));
        let bus = MemoryBus::new();
        let result = Bridge::load(&config, registry_with_mock(&config), Arc::new(bus.client("sbn")));
        assert!(matches!(result, Err(SbnError::NoNetworks)));
    }

    #[test]
    fn test_housekeeping_and_reset() {
        let (bridge, _bus, _sent) = bridge_with_mock(&[2, 3]);
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        connect(&bridge, &peer);
        bridge.command_count.fetch_add(2, Ordering::Relaxed);

        let hk = bridge.housekeeping();
        assert_eq!(hk.identity, NodeIdentity::new(1, 42));
        assert_eq!(hk.net_count, 1);
        assert_eq!(hk.peers.len(), 2);
        assert_eq!(hk.connected_peers(), 1);
        assert_eq!(hk.command_count, 2);
        assert!(hk.peers[0].send_count > 0);

        bridge.reset_counters();
        let hk = bridge.housekeeping();
        assert_eq!(hk.command_count, 0);
        assert_eq!(hk.peers[0].send_count, 0);
    }

    #[test]
    fn test_unload_disconnects_everything_once() {
        let (bridge, _bus, _sent) = bridge_with_mock(&[2, 3]);
        for peer in bridge.peers().cloned().collect::<Vec<_>>() {
            connect(&bridge, &peer);
        }
        assert_eq!(bridge.connected_peers().len(), 2);
        bridge.unload();
        assert!(bridge.connected_peers().is_empty());
        assert!(bridge.peers().all(|p| p.queue().is_none()));
        bridge.unload();
    }
}
