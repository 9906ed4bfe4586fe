// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport.
//!
//! # Architecture
//!
//! ```text
//!                       TcpTransport (one per network)
//!  +------------------------------------------------------------------+
//!  |  mio::Poll   Token(0) listener   Token(1) waker   Token(2..) conns |
//!  |      │ accept                  +---------+---------+-------+    |
//!  |      └──────────────────────►  | conn #2 | conn #3 |  ...  |    |
//!  |                                | peer 2  |  anon   |       |    |
//!  |  peer slots                    | reader  | reader  |       |    |
//!  |   pid 2 ─ conn #2              | backlog | backlog |       |    |
//!  |   pid 3 ─ none (retry in 5s)   +---------+---------+-------+    |
//!  +------------------------------------------------------------------+
//! ```
//!
//! # Connection roles
//!
//! Exactly one side of a peer pair dials: the node with the numerically
//! larger ProcessorID connects out and retries every `reconnect_secs` while
//! disconnected; the other side only accepts. Accepted connections stay
//! anonymous until their first complete message names the sender, which
//! binds them to the configured peer and raises the connect event.
//!
//! # Readiness
//!
//! The receive path blocks in [`mio::Poll::poll`] for at most the caller's
//! wait, then handles the events under the state lock: accepts on the
//! listener, drains readable connections into a packet queue, and flushes
//! write backlogs on writable ones. `send` never waits. Whatever the socket
//! does not take right away stays in the connection's backlog and
//! `WRITABLE` interest is registered until it drains.
//!
//! # Failure handling
//!
//! EOF or a read error on a connection closes it and disconnects the bound
//! peer. A backlog that outgrows `send_buffer_limit` is treated the same
//! way. Liveness is otherwise left to the socket, unless `timeout_secs` is
//! non-zero.

mod frame;

pub use frame::FrameReader;

use super::{resolve_address, PeerLink, RecvMode, Transport};
use crate::codec::{self, Packet};
use crate::error::TransportError;
use crate::net::{Network, Peer};
use crate::types::{MsgType, ProcessorId};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Keep-alive message, sent on idle connections.
pub const TCP_HEARTBEAT_MSG: MsgType = MsgType::Transport(0xA0);

// ============================================================================
// Constants
// ============================================================================

const LISTENER_TOKEN: Token = Token(0);

/// Wakes a receiver blocked in poll when the network goes down.
const WAKER_TOKEN: Token = Token(1);

const CONNECTION_TOKEN_START: usize = 2;

const MAX_EVENTS: usize = 128;

const LISTEN_BACKLOG: i32 = 16;

/// TCP transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSettings {
    /// Idle time before a heartbeat is sent (0 disables heartbeats).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Silence before a peer is dropped (0 disables the check).
    #[serde(default)]
    pub timeout_secs: u64,

    /// Delay between outbound connection attempts.
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Accepted plus outbound connections per network.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// Unsent bytes a connection may hold before it is considered dead.
    #[serde(default = "default_send_buffer_limit")]
    pub send_buffer_limit: usize,
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_reconnect_secs() -> u64 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    100
}

fn default_max_connections() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_send_buffer_limit() -> usize {
    1024 * 1024
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            timeout_secs: 0,
            reconnect_secs: default_reconnect_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connections: default_max_connections(),
            nodelay: true,
            send_buffer_limit: default_send_buffer_limit(),
        }
    }
}

// ============================================================================
// Connection state
// ============================================================================

struct TcpConn {
    token: Token,
    stream: TcpStream,
    remote: SocketAddr,
    reader: FrameReader,
    peer: Option<ProcessorId>,
    /// Packed messages the socket has not taken yet.
    backlog: Vec<u8>,
    /// `WRITABLE` interest is registered.
    write_armed: bool,
}

impl TcpConn {
    /// Write as much of the backlog as the socket takes without blocking.
    fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == self.backlog.len() {
                break Ok(());
            }
            match self.stream.write(&self.backlog[written..]) {
                Ok(0) => break Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.backlog.drain(..written);
        result
    }

    /// Register `WRITABLE` interest while a backlog remains, drop it once
    /// the backlog is gone.
    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let want = !self.backlog.is_empty();
        if want == self.write_armed {
            return Ok(());
        }
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut self.stream, self.token, interest)?;
        self.write_armed = want;
        Ok(())
    }
}

struct PeerSlot {
    addr: SocketAddr,
    connect_out: bool,
    last_attempt: Option<Instant>,
    conn: Option<Token>,
}

struct NetState {
    bind: Option<SocketAddr>,
    registry: Option<Registry>,
    waker: Option<Waker>,
    listener: Option<TcpListener>,
    conns: HashMap<Token, TcpConn>,
    peers: HashMap<ProcessorId, PeerSlot>,
    /// Complete messages read but not yet handed out.
    pending: VecDeque<Packet>,
    next_token: usize,
}

impl NetState {
    fn new() -> Self {
        Self {
            bind: None,
            registry: None,
            waker: None,
            listener: None,
            conns: HashMap::new(),
            peers: HashMap::new(),
            pending: VecDeque::new(),
            next_token: CONNECTION_TOKEN_START,
        }
    }

    fn add_conn(
        &mut self,
        mut stream: TcpStream,
        remote: SocketAddr,
        peer: Option<ProcessorId>,
    ) -> io::Result<Token> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network not started"))?;
        let token = Token(self.next_token);
        registry.register(&mut stream, token, Interest::READABLE)?;
        self.next_token += 1;
        self.conns.insert(
            token,
            TcpConn {
                token,
                stream,
                remote,
                reader: FrameReader::new(),
                peer,
                backlog: Vec::new(),
                write_armed: false,
            },
        );
        Ok(token)
    }

    fn accept_pending(&mut self, settings: &TcpSettings) {
        let Some(listener) = &self.listener else {
            return;
        };
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, remote)) => accepted.push((stream, remote)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        for (stream, remote) in accepted {
            if self.conns.len() >= settings.max_connections {
                warn!(
                    "connection pool full ({}), refusing {}",
                    settings.max_connections, remote
                );
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
            if let Err(e) = stream.set_nodelay(settings.nodelay) {
                warn!("failed to configure connection from {}: {}", remote, e);
                continue;
            }
            match self.add_conn(stream, remote, None) {
                Ok(_) => debug!("accepted connection from {}", remote),
                Err(e) => warn!("failed to register connection from {}: {}", remote, e),
            }
        }
    }

    /// Close a connection. Returns the peer that lost its connection, if
    /// this was the peer's current one.
    fn close_conn(&mut self, token: Token) -> Option<ProcessorId> {
        let mut conn = self.conns.remove(&token)?;
        if let Some(registry) = &self.registry {
            let _ = registry.deregister(&mut conn.stream);
        }
        let _ = conn.stream.shutdown(Shutdown::Both);
        let pid = conn.peer?;
        let slot = self.peers.get_mut(&pid)?;
        if slot.conn == Some(token) {
            slot.conn = None;
            Some(pid)
        } else {
            None
        }
    }

    /// Drain a readable connection into `pending`. Readiness is
    /// edge-triggered, so this reads until the socket would block.
    fn read_conn(&mut self, token: Token, net: &Network) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        let mut closing = Vec::new();
        loop {
            let Some(conn) = self.conns.get_mut(&token) else {
                break;
            };
            let packet = match conn.reader.poll(&mut conn.stream) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    debug!("connection {} closed: {}", conn.remote, e);
                    closing.push(token);
                    break;
                }
            };
            match conn.peer {
                Some(pid) if pid == packet.processor_id => self.pending.push_back(packet),
                Some(pid) => warn!(
                    "connection of peer {} sent message as {}, dropping",
                    pid, packet.processor_id
                ),
                None => {
                    let pid = packet.processor_id;
                    let known = net.peer(pid).is_some();
                    let Some(slot) = self.peers.get_mut(&pid).filter(|_| known) else {
                        error!(
                            "unknown processor id {} from {}, closing connection",
                            pid, conn.remote
                        );
                        closing.push(token);
                        break;
                    };
                    conn.peer = Some(pid);
                    if let Some(old) = slot.conn.replace(token) {
                        closing.push(old);
                    }
                    info!("peer {} identified on connection from {}", pid, conn.remote);
                    events.push(LinkEvent::Connected(pid));
                    self.pending.push_back(packet);
                }
            }
        }
        for token in closing {
            if let Some(pid) = self.close_conn(token) {
                events.push(LinkEvent::Disconnected(pid));
            }
        }
        events
    }

    /// Flush a writable connection's backlog.
    fn write_conn(&mut self, token: Token) -> Option<ProcessorId> {
        let registry = self.registry.as_ref()?;
        let conn = self.conns.get_mut(&token)?;
        let result = conn.flush().and_then(|_| conn.update_interest(registry));
        if let Err(e) = result {
            warn!("write to {} failed: {}", conn.remote, e);
            return self.close_conn(token);
        }
        None
    }
}

enum LinkEvent {
    Connected(ProcessorId),
    Disconnected(ProcessorId),
}

/// Readiness reported by one poll, copied out so the poll lock can be
/// released before the state lock is taken.
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

struct Poller {
    poll: Poll,
    events: Events,
}

// ============================================================================
// Transport
// ============================================================================

/// Stream transport; see the module docs.
pub struct TcpTransport {
    settings: TcpSettings,
    state: Mutex<NetState>,
    /// Only the receiving thread takes this; never held with `state`.
    poller: Mutex<Option<Poller>>,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(NetState::new()),
            poller: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once the network is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Whether this node dials `peer` (rather than waiting for it).
    pub fn connects_out(&self, peer: ProcessorId) -> Option<bool> {
        self.state.lock().peers.get(&peer).map(|s| s.connect_out)
    }

    fn raise(&self, peer: &Peer, event: &LinkEvent, link: &dyn PeerLink) {
        match event {
            LinkEvent::Connected(_) => {
                if peer.is_connected() {
                    link.disconnected(peer);
                }
                link.connected(peer);
            }
            LinkEvent::Disconnected(_) => {
                if peer.is_connected() {
                    link.disconnected(peer);
                }
            }
        }
    }

    fn raise_all(&self, net: &Network, events: Vec<LinkEvent>, link: &dyn PeerLink) {
        for event in events {
            let pid = match event {
                LinkEvent::Connected(pid) | LinkEvent::Disconnected(pid) => pid,
            };
            if let Some(peer) = net.peer(pid) {
                self.raise(peer, &event, link);
            }
        }
    }

    /// Block in poll for at most `timeout`.
    fn wait_ready(&self, timeout: Duration) -> Result<Vec<Ready>, TransportError> {
        let mut guard = self.poller.lock();
        let poller = guard.as_mut().ok_or(TransportError::NotLoaded)?;
        match poller.poll.poll(&mut poller.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        Ok(poller
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            })
            .collect())
    }

    fn handle_ready(&self, net: &Network, ready: &[Ready]) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for r in ready {
            match r.token {
                LISTENER_TOKEN => st.accept_pending(&self.settings),
                WAKER_TOKEN => {}
                token => {
                    if r.readable {
                        events.extend(st.read_conn(token, net));
                    }
                    if r.writable {
                        if let Some(pid) = st.write_conn(token) {
                            events.push(LinkEvent::Disconnected(pid));
                        }
                    }
                }
            }
        }
        events
    }

    fn next_pending(&self) -> Option<Packet> {
        self.state.lock().pending.pop_front()
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Blocking connect bounded by `timeout`, handed to mio non-blocking.
fn dial(addr: SocketAddr, settings: &TcpSettings) -> io::Result<TcpStream> {
    let timeout = Duration::from_millis(settings.connect_timeout_ms);
    let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(settings.nodelay)?;
    Ok(TcpStream::from_std(stream))
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
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
        let connect_out = peer.local().processor_id > peer.processor_id();
        self.state.lock().peers.insert(
            peer.processor_id(),
            PeerSlot {
                addr,
                connect_out,
                last_attempt: None,
                conn: None,
            },
        );
        debug!(
            "tcp peer {} at {} ({})",
            peer.processor_id(),
            addr,
            if connect_out { "dial" } else { "accept" }
        );
        Ok(())
    }

    fn init_net(&self, net: &Network) -> Result<(), TransportError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        {
            let mut state = self.state.lock();
            let bind = state.bind.ok_or(TransportError::NotLoaded)?;
            if state.peers.values().all(|s| s.connect_out) {
                debug!("tcp network {} dials every peer, not listening", net.index());
            } else {
                let mut listener = TcpListener::from_std(bind_listener(bind)?);
                registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                info!("tcp network {} listening on {}", net.index(), bind);
                state.listener = Some(listener);
            }
            state.registry = Some(registry);
            state.waker = Some(waker);
        }
        *self.poller.lock() = Some(Poller {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
        });
        Ok(())
    }

    fn poll_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        let pid = peer.processor_id();
        let now = Instant::now();
        let mut events = Vec::new();
        let mut dial_to = None;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let slot = st.peers.get_mut(&pid).ok_or(TransportError::UnknownPeer(pid))?;
            let current = slot.conn;
            if current.is_none() && slot.connect_out {
                let due = slot.last_attempt.map_or(true, |t| {
                    now.duration_since(t) >= Duration::from_secs(self.settings.reconnect_secs)
                });
                if due {
                    slot.last_attempt = Some(now);
                    dial_to = Some(slot.addr);
                }
            }
            if let Some(token) = current {
                let timeout = self.settings.timeout_secs;
                if timeout > 0
                    && peer.is_connected()
                    && peer.last_recv().elapsed() > Duration::from_secs(timeout)
                {
                    info!("tcp peer {} timed out", pid);
                    if let Some(lost) = st.close_conn(token) {
                        events.push(LinkEvent::Disconnected(lost));
                    }
                }
            } else if peer.is_connected() {
                // Connection vanished underneath a connected peer.
                events.push(LinkEvent::Disconnected(pid));
            }
        }

        if let Some(addr) = dial_to {
            match dial(addr, &self.settings) {
                Ok(stream) => {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    if st.conns.len() >= self.settings.max_connections {
                        let _ = stream.shutdown(Shutdown::Both);
                        return Err(TransportError::PoolExhausted(self.settings.max_connections));
                    }
                    let token = st.add_conn(stream, addr, Some(pid))?;
                    if let Some(slot) = st.peers.get_mut(&pid) {
                        slot.conn = Some(token);
                    }
                    info!("connected to tcp peer {} at {}", pid, addr);
                    events.push(LinkEvent::Connected(pid));
                }
                Err(e) => debug!("connect to peer {} at {} failed: {}", pid, addr, e),
            }
        }

        for event in &events {
            self.raise(peer, event, link);
        }

        let heartbeat = self.settings.heartbeat_secs;
        if heartbeat > 0
            && peer.is_connected()
            && peer.last_send().elapsed() >= Duration::from_secs(heartbeat)
        {
            match self.send(peer, TCP_HEARTBEAT_MSG, &[]) {
                Ok(_) => peer.set_last_send(Instant::now()),
                Err(TransportError::ConnectionLost(_)) => {
                    self.raise(peer, &LinkEvent::Disconnected(pid), link)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn send(&self, peer: &Peer, msg_type: MsgType, payload: &[u8]) -> Result<usize, TransportError> {
        let pid = peer.processor_id();
        let bytes = codec::pack(msg_type, peer.local().processor_id, payload)?;

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let slot = st.peers.get(&pid).ok_or(TransportError::UnknownPeer(pid))?;
        let Some(token) = slot.conn else {
            return Ok(0);
        };
        let (Some(conn), Some(registry)) = (st.conns.get_mut(&token), st.registry.as_ref()) else {
            return Ok(0);
        };
        if conn.backlog.len() + bytes.len() > self.settings.send_buffer_limit {
            warn!(
                "tcp peer {} has {} bytes unsent, dropping connection",
                pid,
                conn.backlog.len()
            );
            st.close_conn(token);
            return Err(TransportError::ConnectionLost(pid));
        }
        conn.backlog.extend_from_slice(&bytes);
        match conn.flush().and_then(|_| conn.update_interest(registry)) {
            Ok(()) => Ok(bytes.len()),
            Err(e) => {
                warn!("write to tcp peer {} failed: {}", pid, e);
                st.close_conn(token);
                Err(TransportError::ConnectionLost(pid))
            }
        }
    }

    fn recv_from_net(
        &self,
        net: &Network,
        wait: Option<Duration>,
        link: &dyn PeerLink,
    ) -> Result<Option<Packet>, TransportError> {
        if let Some(packet) = self.next_pending() {
            return Ok(Some(packet));
        }
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let timeout = deadline.map_or(Duration::ZERO, |d| {
                d.saturating_duration_since(Instant::now())
            });
            let ready = self.wait_ready(timeout)?;
            let events = self.handle_ready(net, &ready);
            self.raise_all(net, events, link);
            if let Some(packet) = self.next_pending() {
                return Ok(Some(packet));
            }
            if ready.iter().any(|r| r.token == WAKER_TOKEN) {
                return Ok(None);
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {}
                _ => return Ok(None),
            }
        }
    }

    fn reset_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        let lost = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let slot = st
                .peers
                .get_mut(&peer.processor_id())
                .ok_or(TransportError::UnknownPeer(peer.processor_id()))?;
            // Dial again right away instead of waiting out the backoff.
            slot.last_attempt = None;
            let current = slot.conn;
            current.and_then(|token| st.close_conn(token))
        };
        if lost.is_some() || peer.is_connected() {
            self.raise(peer, &LinkEvent::Disconnected(peer.processor_id()), link);
        }
        Ok(())
    }

    fn unload_peer(&self, peer: &Peer, link: &dyn PeerLink) -> Result<(), TransportError> {
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if let Some(token) = st.peers.get(&peer.processor_id()).and_then(|s| s.conn) {
                st.close_conn(token);
            }
            st.peers.remove(&peer.processor_id());
        }
        if peer.is_connected() {
            link.disconnected(peer);
        }
        Ok(())
    }

    fn unload_net(&self, net: &Network) -> Result<(), TransportError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let tokens: Vec<Token> = st.conns.keys().copied().collect();
        for token in tokens {
            st.close_conn(token);
        }
        if let (Some(mut listener), Some(registry)) = (st.listener.take(), st.registry.as_ref()) {
            let _ = registry.deregister(&mut listener);
        }
        st.pending.clear();
        if let Some(waker) = &st.waker {
            let _ = waker.wake();
        }
        debug!("tcp network {} unloaded", net.index());
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
    use std::io::Write as _;
    use std::sync::Arc;
    use std::thread;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("free port")
    }

    fn node_with(
        local: u32,
        port: u16,
        peer: u32,
        peer_port: u16,
        settings: TcpSettings,
    ) -> (Network, Arc<Peer>) {
        let mut net = Network::new(
            0,
            NodeIdentity::new(local, 1),
            format!("127.0.0.1:{}", port),
            Box::new(TcpTransport::new(settings)),
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

    fn node(local: u32, port: u16, peer: u32, peer_port: u16) -> (Network, Arc<Peer>) {
        node_with(
            local,
            port,
            peer,
            peer_port,
            TcpSettings {
                heartbeat_secs: 0,
                ..Default::default()
            },
        )
    }

    fn recv_until(net: &Network, link: &RecordingLink) -> Option<Packet> {
        net.transport()
            .recv_from_net(net, Some(Duration::from_secs(2)), link)
            .expect("recv")
    }

    #[test]
    fn test_larger_id_dials() {
        let mut host = Network::new(
            0,
            NodeIdentity::new(5, 1),
            "127.0.0.1:1",
            Box::new(crate::transport::mock::MockTransport::default()),
            FilterChain::default(),
            TaskFlags::default(),
        );
        let spec = |pid: u32| PeerSpec {
            processor_id: ProcessorId(pid),
            spacecraft_id: SpacecraftId(1),
            address: "127.0.0.1:2".into(),
            task_flags: TaskFlags::default(),
            filters: FilterChain::default(),
        };
        let lower = host.add_peer(spec(3)).expect("peer");
        let higher = host.add_peer(spec(9)).expect("peer");

        let tcp = TcpTransport::new(TcpSettings::default());
        tcp.load_peer(&lower, lower.address()).expect("load");
        tcp.load_peer(&higher, higher.address()).expect("load");
        assert_eq!(tcp.connects_out(ProcessorId(3)), Some(true));
        assert_eq!(tcp.connects_out(ProcessorId(9)), Some(false));
        assert_eq!(tcp.connects_out(ProcessorId(4)), None);
    }

    #[test]
    fn test_connect_identify_and_disconnect() {
        let port_a = free_port();
        let port_b = free_port();
        let (net_a, peer_b) = node(1, port_a, 2, port_b);
        let (net_b, peer_a) = node(2, port_b, 1, port_a);
        let link_a = RecordingLink::default();
        let link_b = RecordingLink::default();

        // Node 2 dials node 1.
        net_b.transport().poll_peer(&peer_a, &link_b).expect("poll");
        assert!(peer_a.is_connected());
        assert_eq!(link_b.events(), vec![(ProcessorId(1), true)]);

        // Node 1 learns who is calling from the first message.
        let sent = net_b
            .transport()
            .send(&peer_a, MsgType::Protocol, &[6])
            .expect("send");
        assert_eq!(sent, codec::HEADER_SIZE + 1);
        let packet = recv_until(&net_a, &link_a).expect("packet");
        assert_eq!(packet.msg_type, MsgType::Protocol);
        assert_eq!(packet.processor_id, ProcessorId(2));
        assert!(peer_b.is_connected());

        // Traffic flows the other way on the same connection.
        net_a
            .transport()
            .send(&peer_b, MsgType::App, b"\x00\x00\x00\x01hi")
            .expect("send");
        let packet = recv_until(&net_b, &link_b).expect("packet");
        assert_eq!(packet.payload, b"\x00\x00\x00\x01hi");

        // Closing node 2 is seen as EOF by node 1.
        net_b.transport().unload_net(&net_b).expect("unload");
        assert!(recv_until(&net_a, &link_a).is_none());
        assert!(!peer_b.is_connected());
        assert_eq!(link_a.events(), vec![(ProcessorId(2), true), (ProcessorId(2), false)]);
    }

    #[test]
    fn test_send_without_connection_is_silent() {
        let (net, peer) = node(1, free_port(), 2, free_port());
        assert_eq!(
            net.transport().send(&peer, MsgType::App, b"data").expect("send"),
            0
        );
    }

    #[test]
    fn test_unknown_sender_is_dropped() {
        let port_a = free_port();
        let (net_a, peer_b) = node(1, port_a, 2, free_port());
        let link = RecordingLink::default();

        let mut stray = std::net::TcpStream::connect(("127.0.0.1", port_a)).expect("connect");
        let bytes = codec::pack(MsgType::Protocol, ProcessorId(77), &[6]).expect("pack");
        stray.write_all(&bytes).expect("write");

        assert!(net_a
            .transport()
            .recv_from_net(&net_a, Some(Duration::from_millis(300)), &link)
            .expect("recv")
            .is_none());
        assert!(!peer_b.is_connected());
        assert!(link.events().is_empty());
    }

    #[test]
    fn test_blocked_receiver_wakes_on_data() {
        let port_a = free_port();
        let port_b = free_port();
        let (net_a, _peer_b) = node(1, port_a, 2, port_b);
        let (net_b, peer_a) = node(2, port_b, 1, port_a);
        let link_b = RecordingLink::default();
        net_b.transport().poll_peer(&peer_a, &link_b).expect("dial");

        let receiver = thread::spawn(move || {
            let link = RecordingLink::default();
            let started = Instant::now();
            let packet = net_a
                .transport()
                .recv_from_net(&net_a, Some(Duration::from_secs(10)), &link)
                .expect("recv");
            (packet, started.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        net_b
            .transport()
            .send(&peer_a, MsgType::Protocol, &[6])
            .expect("send");

        let (packet, waited) = receiver.join().expect("receiver thread");
        assert_eq!(packet.expect("packet").processor_id, ProcessorId(2));
        assert!(waited < Duration::from_secs(5), "receiver slept through data: {:?}", waited);
    }

    #[test]
    fn test_unload_wakes_blocked_receiver() {
        let (net, _peer) = node(1, free_port(), 2, free_port());
        let net = Arc::new(net);

        let receiver = {
            let net = Arc::clone(&net);
            thread::spawn(move || {
                let link = RecordingLink::default();
                let started = Instant::now();
                let _ = net
                    .transport()
                    .recv_from_net(&net, Some(Duration::from_secs(10)), &link);
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        net.transport().unload_net(&net).expect("unload");
        let waited = receiver.join().expect("receiver thread");
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_backlog_flushes_when_reader_catches_up() {
        let port_a = free_port();
        let port_b = free_port();
        let (net_a, peer_b) = node(1, port_a, 2, port_b);
        let settings = TcpSettings {
            heartbeat_secs: 0,
            send_buffer_limit: 64 * 1024 * 1024,
            ..Default::default()
        };
        let (net_b, peer_a) = node_with(2, port_b, 1, port_a, settings);
        let link_a = RecordingLink::default();
        let link_b = RecordingLink::default();
        net_b.transport().poll_peer(&peer_a, &link_b).expect("dial");

        // Far more than the socket buffers hold, written while nobody reads.
        const COUNT: usize = 256;
        let payload = vec![0x5A; 16 * 1024];
        let started = Instant::now();
        for _ in 0..COUNT {
            net_b
                .transport()
                .send(&peer_a, MsgType::App, &payload)
                .expect("send");
        }
        assert!(started.elapsed() < Duration::from_secs(2), "send blocked");

        let mut received = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while received < COUNT && Instant::now() < deadline {
            // The sender flushes on writable events from its own receive path.
            net_b
                .transport()
                .recv_from_net(&net_b, None, &link_b)
                .expect("sender poll");
            while let Some(packet) = net_a
                .transport()
                .recv_from_net(&net_a, Some(Duration::from_millis(5)), &link_a)
                .expect("recv")
            {
                assert_eq!(packet.payload.len(), payload.len());
                received += 1;
            }
        }
        assert_eq!(received, COUNT);
        assert!(peer_b.is_connected());
    }

    #[test]
    fn test_backlog_over_limit_drops_connection() {
        let port_a = free_port();
        let port_b = free_port();
        let (_net_a, _peer_b) = node(1, port_a, 2, port_b);
        let settings = TcpSettings {
            heartbeat_secs: 0,
            send_buffer_limit: 64 * 1024,
            ..Default::default()
        };
        let (net_b, peer_a) = node_with(2, port_b, 1, port_a, settings);
        let link_b = RecordingLink::default();
        net_b.transport().poll_peer(&peer_a, &link_b).expect("dial");

        let payload = vec![0u8; 16 * 1024];
        let started = Instant::now();
        let mut outcome = None;
        for _ in 0..100_000 {
            if let Err(e) = net_b.transport().send(&peer_a, MsgType::App, &payload) {
                outcome = Some(e);
                break;
            }
        }
        assert!(matches!(outcome, Some(TransportError::ConnectionLost(pid)) if pid == ProcessorId(1)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            net_b.transport().send(&peer_a, MsgType::App, b"late").expect("send"),
            0
        );
    }
}
