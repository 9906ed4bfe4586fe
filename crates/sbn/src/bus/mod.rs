// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local publish/subscribe bus collaborator.
//!
//! The bridge does not own the local bus. It talks to it through
//! [`LocalBus`]:
//!
//! - messages received from peers are [`LocalBus::publish`]ed locally;
//! - each connected peer gets a [`BusQueue`] that is subscribed (locally,
//!   without a subscription report) to every topic the peer asked for;
//! - local subscription changes arrive on [`LocalBus::subscription_events`]
//!   and are relayed to peers.
//!
//! [`MemoryBus`] is an in-process implementation used by the daemon and
//! the tests.

mod memory;

pub use memory::{MemoryBus, MemoryBusClient};

use crate::error::BusError;
use crate::types::{Mid, Qos, Subscription};
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// One message on the local bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub mid: Mid,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(mid: Mid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            mid,
            payload: payload.into(),
        }
    }
}

/// Opaque queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

/// Receive side of a bus queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct BusQueue {
    id: QueueId,
    name: String,
    rx: Receiver<BusMessage>,
}

impl BusQueue {
    pub(crate) fn new(id: QueueId, name: String, rx: Receiver<BusMessage>) -> Self {
        Self { id, name, rx }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking poll. `Err` means the bus closed the queue.
    pub fn try_recv(&self) -> Result<Option<BusMessage>, BusError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BusError::Closed(self.name.clone())),
        }
    }

    /// Wait up to `timeout` for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Closed(self.name.clone())),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// A change in what local applications are subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Subscribed(Subscription),
    Unsubscribed(Subscription),
}

/// Interface the bridge consumes from the local bus.
pub trait LocalBus: Send + Sync {
    /// Publish a message to every local subscriber of its topic.
    ///
    /// Payloads over [`MAX_APP_DATA_SIZE`](crate::codec::MAX_APP_DATA_SIZE) are rejected, since they could
    /// not cross the bridge. A subscriber queue that is full misses the
    /// message and the call reports [`BusError::QueueFull`]; the other
    /// subscribers still receive it.
    fn publish(&self, msg: BusMessage) -> Result<(), BusError>;

    /// Open a queue owned by this client. Messages this client publishes
    /// itself are never delivered to it.
    fn open_queue(&self, name: &str, depth: usize) -> Result<BusQueue, BusError>;

    /// Close a queue, dropping every subscription routed to it.
    fn close_queue(&self, queue: &BusQueue);

    /// Route `mid` into `queue` without generating a subscription report.
    fn subscribe_local(&self, mid: Mid, qos: Qos, queue: &BusQueue) -> Result<(), BusError>;

    fn unsubscribe_local(&self, mid: Mid, queue: &BusQueue) -> Result<(), BusError>;

    /// Every reported subscription currently held on the bus, one entry
    /// per subscriber.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Feed of reported subscription changes made after this call.
    fn subscription_events(&self) -> Receiver<SubscriptionEvent>;
}
