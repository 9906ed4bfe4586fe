// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer connection supervisor.
//!
//! A peer is either disconnected or connected; transports decide when it
//! flips and report it through [`PeerLink`](crate::transport::PeerLink).
//! Reconnecting is indistinguishable from connecting for the first time:
//!
//! ```text
//!                  connected()
//!   Disconnected ───────────────► Connected
//!        ▲   open queue, send protocol    │
//!        │   version + local subs         │
//!        └────────────────────────────────┘
//!                 disconnected()
//!                 close queue
//! ```

use crate::bridge::Bridge;
use crate::codec;
use crate::error::{Result, SbnError, TransportError};
use crate::net::Peer;
use crate::types::{MsgType, SBN_PROTOCOL_VERSION};
use std::time::Instant;
use tracing::{info, warn};

impl Bridge {
    /// Disconnected -> Connected.
    ///
    /// The local table stays locked from the connected check until the
    /// handshake is sent. Local subscription changes relay under the same
    /// lock, so each one reaches the peer either in the snapshot or right
    /// after it.
    pub fn peer_connected(&self, peer: &Peer) -> Result<()> {
        let pid = peer.processor_id();
        let local = self.local_subs.lock();
        let queue = {
            let mut state = peer.state();
            if state.connected {
                return Err(SbnError::AlreadyConnected(pid));
            }
            let name = format!("SBN_{}_{}_Pipe", peer.net(), pid);
            let queue = self.bus.open_queue(&name, self.settings.peer_queue_depth)?;
            state.connected = true;
            state.subs.clear();
            state.last_recv = Instant::now();
            state.queue = Some(queue.clone());
            queue
        };
        peer.counters().reset_errors();

        let handshake = self
            .send_net_msg(
                peer,
                MsgType::Protocol,
                &codec::encode_protocol(SBN_PROTOCOL_VERSION),
            )
            .and_then(|_| self.send_subs_to_peer(peer, MsgType::Subscribe, &local.to_vec()));
        drop(local);
        match handshake {
            Ok(()) => {}
            Err(e @ TransportError::ConnectionLost(_)) => {
                // send_net_msg already ran the disconnect path; this only
                // covers a peer that was reset concurrently.
                let mut state = peer.state();
                if state.queue.as_ref().map_or(false, |q| q.id() == queue.id()) {
                    state.connected = false;
                    state.subs.clear();
                    state.queue = None;
                    drop(state);
                    self.bus.close_queue(&queue);
                }
                return Err(e.into());
            }
            // The subs are re-sent on the next connect anyway.
            Err(e) => warn!("handshake with peer {} incomplete: {}", pid, e),
        }

        info!("peer {} connected on network {}", pid, peer.net());
        Ok(())
    }

    /// Connected -> Disconnected.
    pub fn peer_disconnected(&self, peer: &Peer) -> Result<()> {
        let queue = {
            let mut state = peer.state();
            if !state.connected {
                return Err(SbnError::NotConnected(peer.processor_id()));
            }
            state.connected = false;
            state.subs.clear();
            state.queue.take()
        };
        if let Some(queue) = queue {
            self.bus.close_queue(&queue);
        }
        info!("peer {} disconnected on network {}", peer.processor_id(), peer.net());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bridge::tests::{bridge_with_mock, connect, mock_bridge};
    use crate::bridge::Bridge;
    use crate::bus::{BusMessage, LocalBus};
    use crate::codec;
    use crate::error::SbnError;
    use crate::transport::mock::MockTransport;
    use crate::types::{Mid, MsgType, ProcessorId, Qos, Subscription, SBN_PROTOCOL_VERSION};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sub(mid: u32) -> Subscription {
        Subscription::new(Mid(mid), Qos::default())
    }

    #[test]
    fn test_connect_sends_version_then_subs() {
        let (bridge, _bus, sent) = bridge_with_mock(&[2]);
        bridge.local_subscribed(sub(0x0801));
        bridge.local_subscribed(sub(0x0802));
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        connect(&bridge, &peer);

        let all = sent.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].msg_type, MsgType::Protocol);
        assert_eq!(
            codec::decode_protocol(&all[0].payload).expect("version"),
            SBN_PROTOCOL_VERSION
        );
        assert_eq!(all[1].msg_type, MsgType::Subscribe);
        let subs = codec::decode_subscriptions(&all[1].payload).expect("subs");
        assert_eq!(subs, vec![sub(0x0801), sub(0x0802)]);
        assert!(peer.is_connected());
        assert_eq!(peer.queue().expect("queue").name(), "SBN_0_2_Pipe");
    }

    #[test]
    fn test_reentry_is_rejected() {
        let (bridge, _bus, _sent) = bridge_with_mock(&[2]);
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        assert!(matches!(
            bridge.peer_disconnected(&peer),
            Err(SbnError::NotConnected(_))
        ));
        connect(&bridge, &peer);
        let queue = peer.queue().expect("queue");
        assert!(matches!(
            bridge.peer_connected(&peer),
            Err(SbnError::AlreadyConnected(_))
        ));
        assert_eq!(peer.queue().expect("queue").id(), queue.id());
    }

    #[test]
    fn test_reconnect_resyncs_full_local_set() {
        let (bridge, _bus, sent) = bridge_with_mock(&[2]);
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        connect(&bridge, &peer);
        bridge.local_subscribed(sub(1));
        bridge.local_subscribed(sub(2));
        let remote = codec::encode_subscriptions(&[sub(7), sub(8)]).expect("encode");
        bridge.process_subs_from_peer(&peer, &remote);
        assert_eq!(peer.remote_sub_count(), 2);

        bridge.peer_disconnected(&peer).expect("disconnect");
        assert_eq!(peer.remote_sub_count(), 0);
        assert!(peer.queue().is_none());

        // Subscription changes while down are never sent...
        bridge.local_subscribed(sub(3));
        sent.clear();

        // ...but the reconnect carries the whole table.
        connect(&bridge, &peer);
        let subs: Vec<Subscription> = sent
            .all()
            .iter()
            .filter(|s| s.msg_type == MsgType::Subscribe)
            .flat_map(|s| codec::decode_subscriptions(&s.payload).expect("subs"))
            .collect();
        assert_eq!(subs, vec![sub(1), sub(2), sub(3)]);
        assert_eq!(peer.remote_sub_count(), 0);
    }

    #[test]
    fn test_disconnect_drops_routes_to_peer() {
        let (bridge, bus, _sent) = bridge_with_mock(&[2]);
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        connect(&bridge, &peer);
        let remote = codec::encode_subscriptions(&[sub(0x0801)]).expect("encode");
        bridge.process_subs_from_peer(&peer, &remote);
        let queue = peer.queue().expect("queue");

        bridge.peer_disconnected(&peer).expect("disconnect");
        bus.client("app")
            .publish(BusMessage::new(Mid(0x0801), b"x".to_vec()))
            .expect("publish");
        assert!(queue.try_recv().is_err());
    }

    #[test]
    fn test_lost_connection_during_handshake_aborts() {
        let mock = MockTransport::default();
        let (bridge, _bus) = mock_bridge(&[2], mock.clone());
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        mock.fail_sends(true);
        assert!(bridge.peer_connected(&peer).is_err());
        assert!(!peer.is_connected());
        assert!(peer.queue().is_none());
        assert_eq!(peer.counters().send_err_count.load(std::sync::atomic::Ordering::Relaxed), 1);

        mock.fail_sends(false);
        connect(&bridge, &peer);
    }

    #[test]
    fn test_large_local_set_split_into_messages() {
        let (bridge, _bus, sent) = bridge_with_mock(&[2]);
        let count = codec::MAX_SUBS_PER_MSG + 10;
        for mid in 1..=count as u32 {
            bridge.local_subscribed(sub(mid));
        }
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");
        connect(&bridge, &peer);
        assert_eq!(sent.count(MsgType::Subscribe), 2);
        let total: usize = sent
            .all()
            .iter()
            .filter(|s| s.msg_type == MsgType::Subscribe)
            .map(|s| codec::decode_subscriptions(&s.payload).expect("subs").len())
            .sum();
        assert_eq!(total, count);
    }

    fn advertised(sent: &crate::transport::mock::SentLog, msg_type: MsgType) -> Vec<Subscription> {
        sent.all()
            .iter()
            .filter(|s| s.msg_type == msg_type)
            .flat_map(|s| codec::decode_subscriptions(&s.payload).expect("subs"))
            .collect()
    }

    #[test]
    fn test_subscription_during_handshake_reaches_peer() {
        let mock = MockTransport::default();
        let sent = mock.sent();
        let (bridge, _bus) = mock_bridge(&[2], mock.clone());
        bridge.local_subscribed(sub(1));
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");

        // Stop the connect while it sends the snapshot of the local table.
        let gate = mock.hold_next(MsgType::Subscribe);
        let connecting = {
            let bridge = Arc::clone(&bridge);
            let peer = Arc::clone(&peer);
            thread::spawn(move || bridge.peer_connected(&peer))
        };
        gate.wait_entered();

        let subscribing = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                bridge.local_subscribed(sub(2));
                bridge.local_unsubscribed(Mid(1));
            })
        };
        thread::sleep(Duration::from_millis(50));
        gate.open();
        connecting.join().expect("connect thread").expect("connect");
        subscribing.join().expect("subscribe thread");

        assert!(peer.is_connected());
        assert_eq!(advertised(&sent, MsgType::Subscribe), vec![sub(1), sub(2)]);
        assert_eq!(advertised(&sent, MsgType::Unsubscribe), vec![sub(1)]);
    }

    #[test]
    fn test_concurrent_connects_open_one_queue() {
        let mock = MockTransport::default();
        let sent = mock.sent();
        let (bridge, _bus) = mock_bridge(&[2], mock.clone());
        let peer = bridge.find_peer(0, ProcessorId(2)).expect("peer");

        let gate = mock.hold_next(MsgType::Protocol);
        let spawn_connect = |bridge: &Arc<Bridge>| {
            let bridge = Arc::clone(bridge);
            let peer = Arc::clone(&peer);
            thread::spawn(move || bridge.peer_connected(&peer))
        };
        let first = spawn_connect(&bridge);
        gate.wait_entered();
        let second = spawn_connect(&bridge);
        thread::sleep(Duration::from_millis(50));
        gate.open();

        let results = [
            first.join().expect("first connect"),
            second.join().expect("second connect"),
        ];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SbnError::AlreadyConnected(pid)) if *pid == ProcessorId(2))));
        assert_eq!(sent.count(MsgType::Protocol), 1);
        assert!(peer.is_connected());
        assert_eq!(peer.queue().expect("queue").name(), "SBN_0_2_Pipe");
    }
}
