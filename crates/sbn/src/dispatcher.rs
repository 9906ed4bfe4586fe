// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatcher: the bridge main loop.
//!
//! One tick, in order:
//!
//! 1. wait (bounded by `main_loop_delay`) for a wake token or command and
//!    apply every pending command;
//! 2. receive from every network without a dedicated receive thread, up to
//!    `max_recv_per_tick` messages per network;
//! 3. relay local subscription changes to connected peers;
//! 4. forward queued bus messages to peers without a dedicated send thread,
//!    one message per peer per pass, for at most `max_msg_per_wakeup`
//!    passes;
//! 5. poll every peer not serviced by a receive thread (heartbeats,
//!    reconnects, timeouts).
//!
//! Networks and peers flagged in `task_flags` get their own threads
//! instead; those block on the transport or the peer queue and observe the
//! bridge's running flag.

use crate::bridge::Bridge;
use crate::bus::{BusMessage, SubscriptionEvent};
use crate::codec::{self, Packet};
use crate::command::{Command, HousekeepingSnapshot};
use crate::error::{Result, SbnError, TransportError};
use crate::filter::Verdict;
use crate::net::{Network, Peer, PeerSnapshot};
use crate::transport::{PeerLink, RecvMode};
use crate::types::{MsgType, ProcessorId, SBN_PROTOCOL_VERSION};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ============================================================================
// Message paths
// ============================================================================

impl Bridge {
    /// Send one SBN message to `peer` and keep its counters.
    ///
    /// A lost connection runs the disconnect path before the error is
    /// returned.
    pub(crate) fn send_net_msg(
        &self,
        peer: &Peer,
        msg_type: MsgType,
        payload: &[u8],
    ) -> std::result::Result<usize, TransportError> {
        let net = self
            .network(peer.net())
            .ok_or(TransportError::UnknownPeer(peer.processor_id()))?;
        let result = {
            let _serialized = net.has_dedicated_sender().then(|| net.send_lock());
            net.transport().send(peer, msg_type, payload)
        };
        peer.set_last_send(Instant::now());
        match &result {
            Ok(_) => {
                peer.counters().send_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                peer.counters().send_err_count.fetch_add(1, Ordering::Relaxed);
                if matches!(e, TransportError::ConnectionLost(_)) && peer.is_connected() {
                    self.disconnected(peer);
                }
            }
        }
        result
    }

    /// Filter and send one bus message to `peer`.
    pub(crate) fn send_app_msg(&self, peer: &Peer, mut msg: BusMessage) {
        match peer.filters().apply_send(&mut msg, &peer.filter_ctx()) {
            Ok(Verdict::Forward) => {}
            Ok(Verdict::Suppress) => return,
            Err(e) => {
                warn!("send filter dropped {} for peer {}: {}", msg.mid, peer.processor_id(), e);
                return;
            }
        }
        let payload = codec::encode_app(msg.mid, &msg.payload);
        if let Err(e) = self.send_net_msg(peer, MsgType::App, &payload) {
            warn!("send of {} to peer {} failed: {}", msg.mid, peer.processor_id(), e);
        }
    }

    /// Dispatch one message received on `net`.
    pub(crate) fn process_net_msg(&self, net: &Network, packet: Packet) {
        let Some(peer) = net.peer(packet.processor_id) else {
            error!(
                "message from unknown processor id {} on network {}",
                packet.processor_id,
                net.index()
            );
            return;
        };
        peer.set_last_recv(Instant::now());
        peer.counters().recv_count.fetch_add(1, Ordering::Relaxed);

        match packet.msg_type {
            MsgType::Protocol => match codec::decode_protocol(&packet.payload) {
                Ok(version) if version == SBN_PROTOCOL_VERSION => {
                    info!("peer {} uses protocol version {}", peer.processor_id(), version)
                }
                Ok(version) => error!(
                    "peer {} protocol version mismatch: theirs {}, ours {}",
                    peer.processor_id(),
                    version,
                    SBN_PROTOCOL_VERSION
                ),
                Err(e) => {
                    peer.counters().recv_err_count.fetch_add(1, Ordering::Relaxed);
                    error!("bad protocol message from peer {}: {}", peer.processor_id(), e);
                }
            },
            MsgType::App => self.process_app_msg(peer, &packet.payload),
            MsgType::Subscribe => self.process_subs_from_peer(peer, &packet.payload),
            MsgType::Unsubscribe => self.process_unsubs_from_peer(peer, &packet.payload),
            MsgType::NoMsg | MsgType::Transport(_) => {}
        }
    }

    fn process_app_msg(&self, peer: &Peer, payload: &[u8]) {
        let (mid, data) = match codec::decode_app(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                peer.counters().recv_err_count.fetch_add(1, Ordering::Relaxed);
                warn!("bad app message from peer {}: {}", peer.processor_id(), e);
                return;
            }
        };
        let mut msg = BusMessage::new(mid, data);
        match peer.filters().apply_recv(&mut msg, &peer.filter_ctx()) {
            Ok(Verdict::Forward) => {
                if let Err(e) = self.bus.publish(msg) {
                    warn!("publish from peer {} failed: {}", peer.processor_id(), e);
                }
            }
            Ok(Verdict::Suppress) => {}
            Err(e) => warn!("receive filter dropped {} from peer {}: {}", mid, peer.processor_id(), e),
        }
    }

    /// Receive from a per-network transport. Returns the number of
    /// messages dispatched.
    fn recv_from_net(&self, net: &Network, wait: Option<Duration>, limit: usize) -> usize {
        let mut received = 0;
        while received < limit {
            match net.transport().recv_from_net(net, wait, self) {
                Ok(Some(packet)) => {
                    received += 1;
                    self.process_net_msg(net, packet);
                }
                Ok(None) => break,
                Err(e) => {
                    self.recv_failed(net, None, e);
                    break;
                }
            }
        }
        received
    }

    fn recv_from_peer(
        &self,
        net: &Network,
        peer: &Peer,
        wait: Option<Duration>,
        limit: usize,
    ) -> usize {
        let mut received = 0;
        while received < limit {
            match net.transport().recv_from_peer(net, peer, wait, self) {
                Ok(Some(packet)) => {
                    received += 1;
                    self.process_net_msg(net, packet);
                }
                Ok(None) => break,
                Err(e) => {
                    self.recv_failed(net, Some(peer), e);
                    break;
                }
            }
        }
        received
    }

    fn recv_failed(&self, net: &Network, peer: Option<&Peer>, e: TransportError) {
        let peer = match (&e, peer) {
            (_, Some(peer)) => Some(peer),
            (TransportError::ConnectionLost(pid), None) => net.peer(*pid).map(|p| p.as_ref()),
            _ => None,
        };
        match peer {
            Some(peer) => {
                peer.counters().recv_err_count.fetch_add(1, Ordering::Relaxed);
                warn!("receive from peer {} failed: {}", peer.processor_id(), e);
                if peer.is_connected() {
                    self.disconnected(peer);
                }
            }
            None => warn!("receive on network {} failed: {}", net.index(), e),
        }
    }

    fn poll_peer(&self, net: &Network, peer: &Peer) {
        if let Err(e) = net.transport().poll_peer(peer, self) {
            debug!("poll of peer {} failed: {}", peer.processor_id(), e);
            if matches!(e, TransportError::ConnectionLost(_)) && peer.is_connected() {
                self.disconnected(peer);
            }
        }
    }

    /// Tick step 2.
    pub(crate) fn recv_net_msgs(&self) {
        let limit = self.settings.max_recv_per_tick;
        for net in self.nets() {
            if net.task_flags().recv {
                continue;
            }
            match net.transport().recv_mode() {
                RecvMode::PerNet => {
                    self.recv_from_net(net, None, limit);
                }
                RecvMode::PerPeer => {
                    let mut budget = limit;
                    for peer in net.peers() {
                        if budget == 0 {
                            break;
                        }
                        if has_recv_thread(net, peer) {
                            continue;
                        }
                        budget -= self.recv_from_peer(net, peer, None, budget);
                    }
                }
            }
        }
    }

    /// Tick step 4.
    pub(crate) fn check_peer_queues(&self) {
        let peers: Vec<Arc<Peer>> = self
            .nets()
            .iter()
            .flat_map(|net| {
                net.peers()
                    .iter()
                    .filter(move |p| !has_send_thread(net, p))
            })
            .cloned()
            .collect();

        for _ in 0..self.settings.max_msg_per_wakeup {
            let mut forwarded = false;
            for peer in &peers {
                let Some(queue) = peer.queue() else {
                    continue;
                };
                match queue.try_recv() {
                    Ok(Some(msg)) => {
                        forwarded = true;
                        self.send_app_msg(peer, msg);
                    }
                    Ok(None) => {}
                    Err(e) => debug!("queue of peer {} unavailable: {}", peer.processor_id(), e),
                }
            }
            if !forwarded {
                break;
            }
        }
    }

    /// Tick step 5.
    pub(crate) fn poll_peers(&self) {
        for net in self.nets() {
            for peer in net.peers() {
                if !has_recv_thread(net, peer) {
                    self.poll_peer(net, peer);
                }
            }
        }
    }

    fn reset_peer(&self, net: usize, processor_id: ProcessorId) -> Result<()> {
        let unknown = SbnError::UnknownPeer { net, processor_id };
        let network = self.network(net).ok_or(unknown)?;
        let peer = network
            .peer(processor_id)
            .ok_or(SbnError::UnknownPeer { net, processor_id })?;
        network.transport().reset_peer(peer, self)?;
        info!("peer {} on network {} reset", processor_id, net);
        Ok(())
    }

    /// Apply one command and keep the command counters.
    pub(crate) fn execute(&self, command: Command) {
        let name = command.name();
        let result = match command {
            Command::Wakeup => return,
            Command::ResetCounters => {
                // Counters restart from zero, this command included.
                self.reset_counters();
                info!("counters reset");
                return;
            }
            Command::Noop => {
                info!("no-op command, sbn {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            Command::ResetPeer { net, processor_id } => self.reset_peer(net, processor_id),
            Command::PeerStatus { reply } => {
                let _ = reply.send(self.peer_snapshots());
                Ok(())
            }
            Command::Housekeeping { reply } => {
                let _ = reply.send(self.housekeeping());
                Ok(())
            }
            Command::Shutdown => {
                info!("shutdown requested");
                self.set_running(false);
                Ok(())
            }
        };
        match result {
            Ok(()) => {
                self.command_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.command_err_count.fetch_add(1, Ordering::Relaxed);
                error!("command {} failed: {}", name, e);
            }
        }
    }
}

/// The peer's receive path (and its polling) runs on a thread.
fn has_recv_thread(net: &Network, peer: &Peer) -> bool {
    net.task_flags().recv
        || (net.transport().recv_mode() == RecvMode::PerPeer && peer.task_flags().recv)
}

fn has_send_thread(net: &Network, peer: &Peer) -> bool {
    net.task_flags().send || peer.task_flags().send
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Handle to a running dispatcher.
#[derive(Clone)]
pub struct BridgeHandle {
    bridge: Arc<Bridge>,
    commands: Sender<Command>,
}

impl BridgeHandle {
    pub fn is_running(&self) -> bool {
        self.bridge.is_running()
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Queue a command for the next tick.
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SbnError::NotRunning)
    }

    /// End the dispatcher's current wait.
    pub fn wake(&self) {
        let _ = self.commands.send(Command::Wakeup);
    }

    /// Request dispatcher shutdown.
    pub fn stop(&self) {
        self.bridge.set_running(false);
        self.wake();
    }

    pub fn peer_status(&self, timeout: Duration) -> Result<Vec<PeerSnapshot>> {
        let (reply, rx) = channel::bounded(1);
        self.send(Command::PeerStatus { reply })?;
        rx.recv_timeout(timeout).map_err(|_| SbnError::NotRunning)
    }

    pub fn housekeeping(&self, timeout: Duration) -> Result<HousekeepingSnapshot> {
        let (reply, rx) = channel::bounded(1);
        self.send(Command::Housekeeping { reply })?;
        rx.recv_timeout(timeout).map_err(|_| SbnError::NotRunning)
    }
}

/// Owns the bridge main loop and its worker threads.
pub struct Dispatcher {
    bridge: Arc<Bridge>,
    commands: Receiver<Command>,
    commands_tx: Sender<Command>,
    sub_events: Receiver<SubscriptionEvent>,
    threads: Vec<JoinHandle<()>>,
    finished: bool,
}

impl Dispatcher {
    /// Wrap a loaded bridge and seed its local subscription table from
    /// the bus.
    pub fn new(bridge: Bridge) -> Self {
        let bridge = Arc::new(bridge);
        // Register for changes before reading the current set, so nothing
        // falls in between.
        let sub_events = bridge.bus.subscription_events();
        for sub in bridge.bus.subscriptions() {
            bridge.local_subscribed(sub);
        }
        let (commands_tx, commands) = channel::unbounded();
        Self {
            bridge,
            commands,
            commands_tx,
            sub_events,
            threads: Vec::new(),
            finished: false,
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            bridge: self.bridge.clone(),
            commands: self.commands_tx.clone(),
        }
    }

    /// Mark the bridge running and spawn the dedicated threads.
    pub fn start(&mut self) -> Result<()> {
        if self.bridge.is_running() {
            return Ok(());
        }
        self.bridge.set_running(true);
        let bridge = self.bridge.clone();
        for net in bridge.nets() {
            let index = net.index();
            match net.transport().recv_mode() {
                RecvMode::PerNet if net.task_flags().recv => {
                    self.spawn(format!("sbn-recv-{}", index), {
                        let bridge = bridge.clone();
                        move || net_recv_loop(bridge, index)
                    })?;
                }
                RecvMode::PerNet => {}
                RecvMode::PerPeer => {
                    for peer in net.peers().iter().filter(|p| has_recv_thread(net, p)) {
                        let peer = peer.clone();
                        self.spawn(format!("sbn-recv-{}-{}", index, peer.processor_id()), {
                            let bridge = bridge.clone();
                            move || peer_recv_loop(bridge, index, peer)
                        })?;
                    }
                }
            }
            for peer in net.peers().iter().filter(|p| has_send_thread(net, p)) {
                let peer = peer.clone();
                self.spawn(format!("sbn-send-{}-{}", index, peer.processor_id()), {
                    let bridge = bridge.clone();
                    move || peer_send_loop(bridge, peer)
                })?;
            }
        }
        info!(
            "bridge {} running: {} network(s), {} thread(s)",
            self.bridge.identity(),
            self.bridge.nets().len(),
            self.threads.len()
        );
        Ok(())
    }

    fn spawn<F>(&mut self, name: String, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(body)
            .map_err(SbnError::Spawn)?;
        self.threads.push(handle);
        Ok(())
    }

    /// Run one tick. Returns false once the bridge has been asked to stop.
    pub fn tick(&mut self) -> bool {
        match self
            .commands
            .recv_timeout(self.bridge.settings.main_loop_delay())
        {
            Ok(command) => self.bridge.execute(command),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        while let Ok(command) = self.commands.try_recv() {
            self.bridge.execute(command);
        }
        if !self.bridge.is_running() {
            return false;
        }

        self.bridge.recv_net_msgs();
        self.drain_sub_events();
        self.bridge.check_peer_queues();
        self.bridge.poll_peers();
        self.bridge.is_running()
    }

    fn drain_sub_events(&self) {
        while let Ok(event) = self.sub_events.try_recv() {
            match event {
                SubscriptionEvent::Subscribed(sub) => self.bridge.local_subscribed(sub),
                SubscriptionEvent::Unsubscribed(sub) => self.bridge.local_unsubscribed(sub.mid),
            }
        }
    }

    /// Start, tick until stopped, then shut down.
    pub fn run(mut self) -> Result<()> {
        self.start()?;
        while self.tick() {}
        self.shutdown();
        Ok(())
    }

    /// Stop every thread and unload all peers and networks.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.bridge.set_running(false);
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("sbn").to_string();
            if handle.join().is_err() {
                error!("thread {} panicked", name);
            }
        }
        self.bridge.unload();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn net_recv_loop(bridge: Arc<Bridge>, index: usize) {
    let Some(net) = bridge.network(index) else {
        return;
    };
    let delay = bridge.settings.main_loop_delay();
    let mut last_poll: Option<Instant> = None;
    debug!("receive thread for network {} started", index);
    while bridge.is_running() {
        bridge.recv_from_net(net, Some(delay), 1);
        if last_poll.map_or(true, |t| t.elapsed() >= delay) {
            for peer in net.peers() {
                bridge.poll_peer(net, peer);
            }
            last_poll = Some(Instant::now());
        }
    }
    debug!("receive thread for network {} stopped", index);
}

fn peer_recv_loop(bridge: Arc<Bridge>, index: usize, peer: Arc<Peer>) {
    let Some(net) = bridge.network(index) else {
        return;
    };
    let delay = bridge.settings.main_loop_delay();
    let mut last_poll: Option<Instant> = None;
    while bridge.is_running() {
        bridge.recv_from_peer(net, &peer, Some(delay), 1);
        if last_poll.map_or(true, |t| t.elapsed() >= delay) {
            bridge.poll_peer(net, &peer);
            last_poll = Some(Instant::now());
        }
    }
}

fn peer_send_loop(bridge: Arc<Bridge>, peer: Arc<Peer>) {
    let delay = bridge.settings.main_loop_delay();
    while bridge.is_running() {
        let Some(queue) = peer.queue() else {
            thread::sleep(delay);
            continue;
        };
        match queue.recv_timeout(delay) {
            Ok(Some(msg)) => bridge.send_app_msg(&peer, msg),
            Ok(None) => {}
            // Closed by a disconnect; wait for the next queue.
            Err(_) => {}
        }
    }
}
