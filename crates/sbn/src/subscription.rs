// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription tracking and relay.
//!
//! Two tables drive what crosses the bridge:
//!
//! - [`LocalSubs`]: topics local applications subscribe to, reference
//!   counted so only the first subscribe and the last unsubscribe of a
//!   topic are announced to peers;
//! - [`RemoteSubs`] (one per peer): topics the peer asked us for. Each
//!   entry routes the topic into the peer's outbound bus queue.
//!
//! A peer always receives the full local set when it connects, so lost
//! subscribe/unsubscribe messages heal on the next reconnect.

use crate::bridge::Bridge;
use crate::codec::{self, MAX_SUBS_PER_MSG};
use crate::error::TransportError;
use crate::filter::Verdict;
use crate::net::Peer;
use crate::types::{Mid, MsgType, Subscription};
use tracing::{debug, error, warn};

/// A peer's remote subscription table is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

/// Topics one peer wants from this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSubs {
    entries: Vec<Subscription>,
}

impl RemoteSubs {
    /// Add a subscription. Returns `Ok(false)` when the topic is already
    /// present.
    pub fn insert(&mut self, sub: Subscription, max: usize) -> Result<bool, TableFull> {
        if self.contains(sub.mid) {
            return Ok(false);
        }
        if self.entries.len() >= max {
            return Err(TableFull);
        }
        self.entries.push(sub);
        Ok(true)
    }

    pub fn remove(&mut self, mid: Mid) -> Option<Subscription> {
        let pos = self.entries.iter().position(|s| s.mid == mid)?;
        Some(self.entries.remove(pos))
    }

    pub fn contains(&self, mid: Mid) -> bool {
        self.entries.iter().any(|s| s.mid == mid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalSub {
    sub: Subscription,
    in_use: u32,
}

/// Topics local applications subscribe to.
#[derive(Debug, Default)]
pub struct LocalSubs {
    entries: Vec<LocalSub>,
}

impl LocalSubs {
    /// Count one more subscriber. Returns true for the first one.
    pub fn add(&mut self, sub: Subscription) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sub.mid == sub.mid) {
            entry.in_use += 1;
            return false;
        }
        self.entries.push(LocalSub { sub, in_use: 1 });
        true
    }

    /// Count one less subscriber. Returns the subscription once nobody
    /// uses it anymore.
    pub fn remove(&mut self, mid: Mid) -> Option<Subscription> {
        let pos = self.entries.iter().position(|e| e.sub.mid == mid)?;
        let entry = &mut self.entries[pos];
        entry.in_use = entry.in_use.saturating_sub(1);
        if entry.in_use > 0 {
            return None;
        }
        Some(self.entries.remove(pos).sub)
    }

    pub fn contains(&self, mid: Mid) -> bool {
        self.entries.iter().any(|e| e.sub.mid == mid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Subscription> {
        self.entries.iter().map(|e| e.sub).collect()
    }
}

// ============================================================================
// Relay
// ============================================================================

impl Bridge {
    /// A local application subscribed to a topic.
    pub(crate) fn local_subscribed(&self, sub: Subscription) {
        let mut local = self.local_subs.lock();
        if !local.add(sub) {
            return;
        }
        debug!("local subscription to {}", sub.mid);
        // Relay under the table lock; see `peer_connected`.
        for peer in self.connected_peers() {
            if let Err(e) = self.send_subs_to_peer(&peer, MsgType::Subscribe, &[sub]) {
                warn!("failed to relay subscription {} to peer {}: {}", sub.mid, peer.processor_id(), e);
            }
        }
    }

    /// A local application dropped a topic.
    pub(crate) fn local_unsubscribed(&self, mid: Mid) {
        let mut local = self.local_subs.lock();
        let Some(sub) = local.remove(mid) else {
            return;
        };
        debug!("local unsubscription from {}", mid);
        for peer in self.connected_peers() {
            if let Err(e) = self.send_subs_to_peer(&peer, MsgType::Unsubscribe, &[sub]) {
                warn!("failed to relay unsubscription {} to peer {}: {}", mid, peer.processor_id(), e);
            }
        }
    }

    /// Remap `subs` through the peer's filters and send them, split into
    /// messages that fit the payload limit.
    pub(crate) fn send_subs_to_peer(
        &self,
        peer: &Peer,
        msg_type: MsgType,
        subs: &[Subscription],
    ) -> Result<(), TransportError> {
        let ctx = peer.filter_ctx();
        let mut remapped = Vec::with_capacity(subs.len());
        for sub in subs {
            let mut mid = sub.mid;
            match peer.filters().remap_mid(&mut mid, &ctx) {
                Ok(Verdict::Forward) => remapped.push(Subscription::new(mid, sub.qos)),
                Ok(Verdict::Suppress) => {}
                Err(e) => warn!("remap of {} for peer {} failed: {}", sub.mid, peer.processor_id(), e),
            }
        }
        for chunk in remapped.chunks(MAX_SUBS_PER_MSG) {
            let payload = codec::encode_subscriptions(chunk)?;
            self.send_net_msg(peer, msg_type, &payload)?;
        }
        Ok(())
    }

    /// Apply a subscribe message from `peer`.
    pub(crate) fn process_subs_from_peer(&self, peer: &Peer, payload: &[u8]) {
        let subs = match codec::decode_subscriptions(payload) {
            Ok(subs) => subs,
            Err(e) => {
                error!("bad subscription message from peer {}: {}", peer.processor_id(), e);
                return;
            }
        };
        for sub in subs {
            let queue = {
                let mut state = peer.state();
                match state.subs.insert(sub, self.settings.max_subs_per_peer) {
                    Ok(true) => state.queue.clone(),
                    Ok(false) => continue,
                    Err(TableFull) => {
                        error!(
                            "peer {} subscription table full ({}), dropping {}",
                            peer.processor_id(),
                            self.settings.max_subs_per_peer,
                            sub.mid
                        );
                        continue;
                    }
                }
            };
            if let Some(queue) = queue {
                if let Err(e) = self.bus.subscribe_local(sub.mid, sub.qos, &queue) {
                    warn!("bus subscribe {} for peer {} failed: {}", sub.mid, peer.processor_id(), e);
                }
            }
        }
    }

    /// Apply an unsubscribe message from `peer`.
    pub(crate) fn process_unsubs_from_peer(&self, peer: &Peer, payload: &[u8]) {
        let subs = match codec::decode_subscriptions(payload) {
            Ok(subs) => subs,
            Err(e) => {
                error!("bad unsubscription message from peer {}: {}", peer.processor_id(), e);
                return;
            }
        };
        for sub in subs {
            let (removed, queue) = {
                let mut state = peer.state();
                (state.subs.remove(sub.mid), state.queue.clone())
            };
            if removed.is_none() {
                warn!("peer {} unsubscribed from {} without subscribing", peer.processor_id(), sub.mid);
                continue;
            }
            if let Some(queue) = queue {
                if let Err(e) = self.bus.unsubscribe_local(sub.mid, &queue) {
                    warn!("bus unsubscribe {} for peer {} failed: {}", sub.mid, peer.processor_id(), e);
                }
            }
        }
    }
}
