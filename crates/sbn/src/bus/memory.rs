// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process local bus.
//!
//! Each application talks to the bus through its own [`MemoryBusClient`],
//! which tags published messages with the client's application id so that
//! queues opened with `ignore_mine` never see their owner's traffic.

use super::{BusMessage, BusQueue, LocalBus, QueueId, SubscriptionEvent};
use crate::codec::MAX_APP_DATA_SIZE;
use crate::error::BusError;
use crate::types::{Mid, Qos, Subscription};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type AppId = u64;

struct QueueEntry {
    name: String,
    owner: AppId,
    ignore_mine: bool,
    tx: Sender<BusMessage>,
}

#[derive(Clone, Copy)]
struct Route {
    queue: QueueId,
    qos: Qos,
    reported: bool,
}

#[derive(Default)]
struct BusState {
    queues: HashMap<QueueId, QueueEntry>,
    routes: HashMap<Mid, Vec<Route>>,
    listeners: Vec<(AppId, Sender<SubscriptionEvent>)>,
}

impl BusState {
    fn notify(&mut self, origin: AppId, event: SubscriptionEvent) {
        self.listeners
            .retain(|(app, tx)| *app == origin || tx.send(event).is_ok());
    }
}

struct Shared {
    state: Mutex<BusState>,
    next_queue: AtomicU64,
    next_app: AtomicU64,
    dropped: AtomicU64,
}

/// In-process publish/subscribe bus.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                next_queue: AtomicU64::new(1),
                next_app: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Connect a new application to the bus.
    pub fn client(&self, app_name: &str) -> MemoryBusClient {
        MemoryBusClient {
            shared: self.shared.clone(),
            app: self.shared.next_app.fetch_add(1, Ordering::Relaxed),
            app_name: app_name.to_string(),
        }
    }

    /// Messages dropped because a destination queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// One application's connection to a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryBusClient {
    shared: Arc<Shared>,
    app: AppId,
    app_name: String,
}

impl MemoryBusClient {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Create a queue. With `ignore_mine`, messages published by this
    /// client are not delivered to it.
    pub fn create_queue(
        &self,
        name: &str,
        depth: usize,
        ignore_mine: bool,
    ) -> Result<BusQueue, BusError> {
        let id = QueueId(self.shared.next_queue.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = channel::bounded(depth.max(1));
        self.shared.state.lock().queues.insert(
            id,
            QueueEntry {
                name: name.to_string(),
                owner: self.app,
                ignore_mine,
                tx,
            },
        );
        Ok(BusQueue::new(id, name.to_string(), rx))
    }

    /// Application-level subscription; reported to subscription listeners.
    pub fn subscribe(&self, mid: Mid, qos: Qos, queue: &BusQueue) -> Result<(), BusError> {
        self.add_route(mid, qos, queue, true)
    }

    pub fn unsubscribe(&self, mid: Mid, queue: &BusQueue) -> Result<(), BusError> {
        self.remove_route(mid, queue)
    }

    fn add_route(
        &self,
        mid: Mid,
        qos: Qos,
        queue: &BusQueue,
        reported: bool,
    ) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(&queue.id()) {
            return Err(BusError::UnknownQueue(queue.name().to_string()));
        }
        let routes = state.routes.entry(mid).or_default();
        if routes.iter().any(|r| r.queue == queue.id()) {
            return Ok(());
        }
        routes.push(Route {
            queue: queue.id(),
            qos,
            reported,
        });
        if reported {
            state.notify(
                self.app,
                SubscriptionEvent::Subscribed(Subscription::new(mid, qos)),
            );
        }
        Ok(())
    }

    fn remove_route(&self, mid: Mid, queue: &BusQueue) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        let Some(routes) = state.routes.get_mut(&mid) else {
            return Ok(());
        };
        let Some(pos) = routes.iter().position(|r| r.queue == queue.id()) else {
            return Ok(());
        };
        let route = routes.remove(pos);
        if routes.is_empty() {
            state.routes.remove(&mid);
        }
        if route.reported {
            state.notify(
                self.app,
                SubscriptionEvent::Unsubscribed(Subscription::new(mid, route.qos)),
            );
        }
        Ok(())
    }
}

impl LocalBus for MemoryBusClient {
    fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        if msg.payload.len() > MAX_APP_DATA_SIZE {
            return Err(BusError::TooLarge {
                size: msg.payload.len(),
                max: MAX_APP_DATA_SIZE,
            });
        }
        let state = self.shared.state.lock();
        let Some(routes) = state.routes.get(&msg.mid) else {
            return Ok(());
        };
        let mut overflowed = None;
        for route in routes {
            let Some(entry) = state.queues.get(&route.queue) else {
                continue;
            };
            if entry.ignore_mine && entry.owner == self.app {
                continue;
            }
            match entry.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("queue '{}' full, dropping {}", entry.name, msg.mid);
                    overflowed.get_or_insert_with(|| entry.name.clone());
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        match overflowed {
            Some(name) => Err(BusError::QueueFull(name)),
            None => Ok(()),
        }
    }

    fn open_queue(&self, name: &str, depth: usize) -> Result<BusQueue, BusError> {
        self.create_queue(name, depth, true)
    }

    fn close_queue(&self, queue: &BusQueue) {
        let mut state = self.shared.state.lock();
        state.queues.remove(&queue.id());
        let mut removed = Vec::new();
        state.routes.retain(|mid, routes| {
            routes.retain(|r| {
                let keep = r.queue != queue.id();
                if !keep && r.reported {
                    removed.push(Subscription::new(*mid, r.qos));
                }
                keep
            });
            !routes.is_empty()
        });
        for sub in removed {
            state.notify(self.app, SubscriptionEvent::Unsubscribed(sub));
        }
    }

    fn subscribe_local(&self, mid: Mid, qos: Qos, queue: &BusQueue) -> Result<(), BusError> {
        self.add_route(mid, qos, queue, false)
    }

    fn unsubscribe_local(&self, mid: Mid, queue: &BusQueue) -> Result<(), BusError> {
        self.remove_route(mid, queue)
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        let state = self.shared.state.lock();
        let mut subs: Vec<Subscription> = state
            .routes
            .iter()
            .flat_map(|(mid, routes)| {
                routes
                    .iter()
                    .filter(|r| r.reported)
                    .map(move |r| Subscription::new(*mid, r.qos))
            })
            .collect();
        subs.sort_by_key(|s| s.mid);
        subs
    }

    fn subscription_events(&self) -> Receiver<SubscriptionEvent> {
        let (tx, rx) = channel::unbounded();
        self.shared.state.lock().listeners.push((self.app, tx));
        rx
    }
}
