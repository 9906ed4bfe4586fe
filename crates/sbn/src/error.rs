// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the bridge.

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::types::ProcessorId;
use std::io;
use thiserror::Error;

/// Errors raised by a transport module.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("network not loaded")]
    NotLoaded,

    #[error("{0} not supported by this transport")]
    Unsupported(&'static str),

    #[error("peer {0} not loaded on this network")]
    UnknownPeer(ProcessorId),

    #[error("connection lost to peer {0}")]
    ConnectionLost(ProcessorId),

    #[error("connection pool exhausted ({0} connections)")]
    PoolExhausted(usize),
}

/// Errors raised by a filter module.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter '{filter}' failed: {reason}")]
    Fatal { filter: String, reason: String },

    #[error("filter '{0}' initialization failed")]
    Init(String),
}

/// Errors raised by the local bus collaborator.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("queue '{0}' not found")]
    UnknownQueue(String),

    #[error("queue '{0}' is full")]
    QueueFull(String),

    #[error("queue '{0}' closed")]
    Closed(String),

    #[error("{size} byte message exceeds the {max} byte bus limit")]
    TooLarge { size: usize, max: usize },
}

/// Top-level bridge error.
#[derive(Debug, Error)]
pub enum SbnError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown transport module '{0}'")]
    UnknownTransport(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("peer {0} is already connected")]
    AlreadyConnected(ProcessorId),

    #[error("peer {0} is not connected")]
    NotConnected(ProcessorId),

    #[error("no peer {processor_id} on network {net}")]
    UnknownPeer {
        net: usize,
        processor_id: ProcessorId,
    },

    #[error("no network could be brought up")]
    NoNetworks,

    #[error("bridge is not running")]
    NotRunning,

    #[error("failed to spawn thread: {0}")]
    Spawn(io::Error),
}

pub type Result<T> = std::result::Result<T, SbnError>;
