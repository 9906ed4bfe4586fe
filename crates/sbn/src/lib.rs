// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Software Bus Network (SBN)
//!
//! Relays local publish/subscribe bus traffic between nodes over pluggable
//! transports, keeping subscription tables in sync across reconnects.
//!
//! # Features
//!
//! - **Transports**: TCP (stream, resumable framing) and UDP (datagram,
//!   announce/heartbeat liveness), selected per network by name
//! - **Subscription relay**: local subscriptions are advertised to every
//!   connected peer and fully re-sent on reconnect
//! - **Filters**: ordered per-network and per-peer chains (topic remap,
//!   allow/deny lists)
//! - **Scheduling**: every network and peer runs either inside the
//!   cooperative dispatcher tick or on its own threads
//!
//! # Quick Start
//!
//! ```no_run
//! use sbn::{Bridge, BridgeConfig, Dispatcher, MemoryBus, ModuleRegistry};
//! use std::sync::Arc;
//!
//! let config = BridgeConfig::from_file("sbn.toml")?;
//! let bus = MemoryBus::new();
//! let registry = ModuleRegistry::with_builtins(&config);
//! let bridge = Bridge::load(&config, registry, Arc::new(bus.client("sbn")))?;
//! Dispatcher::new(bridge).run()?;
//! # Ok::<(), sbn::SbnError>(())
//! ```
//!
//! # Wire format
//!
//! Every message carries a 7-byte big-endian header:
//!
//! ```text
//! +--------+--------+----------------+------------------+
//! | MsgSz  | MsgType|  ProcessorID   |  payload (MsgSz) |
//! | 2 B    | 1 B    |  4 B           |                  |
//! +--------+--------+----------------+------------------+
//! ```

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod net;
pub mod registry;
pub mod subscription;
pub mod transport;
pub mod types;

pub use bridge::Bridge;
pub use bus::{BusMessage, BusQueue, LocalBus, MemoryBus, MemoryBusClient, SubscriptionEvent};
pub use command::{Command, HousekeepingSnapshot};
pub use config::{BridgeConfig, ConfigError, FilterConfig, FilterKind, NetworkConfig, PeerConfig};
pub use dispatcher::{BridgeHandle, Dispatcher};
pub use error::{BusError, FilterError, Result, SbnError, TransportError};
pub use filter::{Filter, FilterChain, FilterCtx, Verdict};
pub use net::{Network, Peer, PeerSnapshot};
pub use registry::ModuleRegistry;
pub use transport::{PeerLink, RecvMode, Transport};
pub use types::{Mid, MsgType, NodeIdentity, ProcessorId, Qos, SpacecraftId, Subscription, TaskFlags};
