// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Loaded from TOML, or built programmatically:
//!
//! ```toml
//! [node]
//! processor_id = 1
//! spacecraft_id = 42
//!
//! [[filters]]
//! name = "ground-remap"
//! kind = "remap"
//! default_policy = "send"
//! entries = [{ processor_id = 2, spacecraft_id = 42, from = 0x1880, to = 0x1881 }]
//!
//! [[networks]]
//! transport = "udp"
//! address = "127.0.0.1:2234"
//!
//! [[networks.peers]]
//! processor_id = 2
//! spacecraft_id = 42
//! address = "127.0.0.1:2235"
//! filters = ["ground-remap"]
//! ```

use crate::filter::{ListMode, RemapEntry, RemapPolicy};
use crate::transport::{TcpSettings, UdpSettings};
use crate::types::{Mid, NodeIdentity, TaskFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub node: NodeConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub tcp: TcpSettings,

    #[serde(default)]
    pub udp: UdpSettings,

    /// Named filter instances, referenced by networks and peers.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeConfig {
    pub processor_id: u32,
    pub spacecraft_id: u32,
}

impl NodeConfig {
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.processor_id, self.spacecraft_id)
    }
}

/// Dispatcher loop tuning and table limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on the wait for a wake token (ms).
    #[serde(default = "default_main_loop_delay_ms")]
    pub main_loop_delay_ms: u64,

    /// Send passes over all peers per tick.
    #[serde(default = "default_max_msg_per_wakeup")]
    pub max_msg_per_wakeup: usize,

    /// Messages received per network per tick.
    #[serde(default = "default_max_recv_per_tick")]
    pub max_recv_per_tick: usize,

    #[serde(default = "default_peer_queue_depth")]
    pub peer_queue_depth: usize,

    #[serde(default = "default_max_subs_per_peer")]
    pub max_subs_per_peer: usize,

    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    #[serde(default = "default_max_nets")]
    pub max_nets: usize,
}

fn default_main_loop_delay_ms() -> u64 {
    200
}

fn default_max_msg_per_wakeup() -> usize {
    32
}

fn default_max_recv_per_tick() -> usize {
    100
}

fn default_peer_queue_depth() -> usize {
    64
}

fn default_max_subs_per_peer() -> usize {
    256
}

fn default_max_peers() -> usize {
    32
}

fn default_max_nets() -> usize {
    16
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            main_loop_delay_ms: default_main_loop_delay_ms(),
            max_msg_per_wakeup: default_max_msg_per_wakeup(),
            max_recv_per_tick: default_max_recv_per_tick(),
            peer_queue_depth: default_peer_queue_depth(),
            max_subs_per_peer: default_max_subs_per_peer(),
            max_peers: default_max_peers(),
            max_nets: default_max_nets(),
        }
    }
}

impl DispatcherConfig {
    pub fn main_loop_delay(&self) -> Duration {
        Duration::from_millis(self.main_loop_delay_ms)
    }
}

/// A named filter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,

    #[serde(flatten)]
    pub kind: FilterKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterKind {
    Remap {
        #[serde(default)]
        default_policy: RemapPolicy,
        #[serde(default)]
        entries: Vec<RemapEntry>,
    },
    MidList {
        #[serde(default)]
        mode: ListMode,
        #[serde(default)]
        mids: Vec<Mid>,
    },
}

/// One network: a transport binding plus its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Registry name of the transport module ("tcp", "udp", ...).
    pub transport: String,

    /// This node's address on the network.
    pub address: String,

    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub task_flags: TaskFlags,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub processor_id: u32,
    pub spacecraft_id: u32,
    pub address: String,

    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub task_flags: TaskFlags,
}

impl PeerConfig {
    pub fn new(processor_id: u32, spacecraft_id: u32, address: impl Into<String>) -> Self {
        Self {
            processor_id,
            spacecraft_id,
            address: address.into(),
            filters: Vec::new(),
            task_flags: TaskFlags::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new(transport: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            address: address.into(),
            filters: Vec::new(),
            task_flags: TaskFlags::default(),
            peers: Vec::new(),
        }
    }

    pub fn peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn task_flags(mut self, flags: TaskFlags) -> Self {
        self.task_flags = flags;
        self
    }

    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.push(name.into());
        self
    }
}

impl BridgeConfig {
    pub fn new(processor_id: u32, spacecraft_id: u32) -> Self {
        Self {
            node: NodeConfig {
                processor_id,
                spacecraft_id,
            },
            dispatcher: DispatcherConfig::default(),
            tcp: TcpSettings::default(),
            udp: UdpSettings::default(),
            filters: Vec::new(),
            networks: Vec::new(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn network(mut self, net: NetworkConfig) -> Self {
        self.networks.push(net);
        self
    }

    /// Two-node UDP example used by `gen-config`.
    pub fn example() -> Self {
        let mut config = Self::new(1, 42);
        config.filters.push(FilterConfig {
            name: "no-debug".into(),
            kind: FilterKind::MidList {
                mode: ListMode::Deny,
                mids: vec![Mid(0x18FF)],
            },
        });
        config
            .network(
                NetworkConfig::new("udp", "127.0.0.1:2234")
                    .peer(PeerConfig::new(2, 42, "127.0.0.1:2235"))
                    .filter("no-debug"),
            )
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::Invalid("No networks configured".into()));
        }
        if self.networks.len() > self.dispatcher.max_nets {
            return Err(ConfigError::Invalid(format!(
                "{} networks configured, limit is {}",
                self.networks.len(),
                self.dispatcher.max_nets
            )));
        }
        if self.dispatcher.peer_queue_depth == 0 {
            return Err(ConfigError::Invalid("peer_queue_depth must be > 0".into()));
        }

        let mut filter_names = HashSet::new();
        for filter in &self.filters {
            if filter.name.is_empty() {
                return Err(ConfigError::Invalid("Filter with empty name".into()));
            }
            if !filter_names.insert(filter.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate filter name '{}'",
                    filter.name
                )));
            }
        }

        let local = self.node.identity();
        let mut total_peers = 0;
        for (i, net) in self.networks.iter().enumerate() {
            if net.transport.is_empty() {
                return Err(ConfigError::Invalid(format!("Network {} has no transport", i)));
            }
            if net.address.is_empty() {
                return Err(ConfigError::Invalid(format!("Network {} has empty address", i)));
            }
            let mut ids = HashSet::new();
            for peer in &net.peers {
                if peer.address.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Network {} peer {} has empty address",
                        i, peer.processor_id
                    )));
                }
                if NodeIdentity::new(peer.processor_id, peer.spacecraft_id) == local {
                    return Err(ConfigError::Invalid(format!(
                        "Network {} lists this node ({}) as a peer",
                        i, local
                    )));
                }
                if !ids.insert(peer.processor_id) {
                    return Err(ConfigError::Invalid(format!(
                        "Network {} has duplicate peer {}",
                        i, peer.processor_id
                    )));
                }
            }
            total_peers += net.peers.len();
        }
        if total_peers > self.dispatcher.max_peers {
            return Err(ConfigError::Invalid(format!(
                "{} peers configured, limit is {}",
                total_peers, self.dispatcher.max_peers
            )));
        }

        Ok(())
    }
}
