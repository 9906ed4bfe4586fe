// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filter modules.
//!
//! A filter sees every application message relayed to or from a peer, and
//! every topic advertised to a peer. Filters run in configured order; the
//! first one that suppresses ends the chain and the message is dropped
//! silently. An error drops only that message.

mod mid_list;
mod remap;

pub use mid_list::{ListMode, MidListFilter};
pub use remap::{RemapEntry, RemapFilter, RemapPolicy};

use crate::bus::BusMessage;
use crate::error::FilterError;
use crate::types::{Mid, NodeIdentity};
use std::fmt;
use std::sync::Arc;

/// Outcome of a successful filter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue with the next filter (or send/publish if last).
    Forward,
    /// Drop the message; not an error.
    Suppress,
}

/// Identities involved in a filter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCtx {
    pub local: NodeIdentity,
    pub peer: NodeIdentity,
}

/// A named message transform.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the filter is attached to any chain.
    fn init(&self, _version: u32) -> Result<(), FilterError> {
        Ok(())
    }

    /// Applied to app messages received from `ctx.peer`.
    fn filter_recv(&self, _msg: &mut BusMessage, _ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        Ok(Verdict::Forward)
    }

    /// Applied to app messages about to be sent to `ctx.peer`.
    fn filter_send(&self, _msg: &mut BusMessage, _ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        Ok(Verdict::Forward)
    }

    /// Rewrite a local topic into the one advertised to `ctx.peer`.
    fn remap_mid(&self, _mid: &mut Mid, _ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        Ok(Verdict::Forward)
    }
}

/// Ordered filter chain of a network or peer.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// `self` followed by `other`.
    pub fn then(&self, other: &FilterChain) -> FilterChain {
        let mut filters = self.filters.clone();
        filters.extend(other.filters.iter().cloned());
        FilterChain { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn apply_recv(&self, msg: &mut BusMessage, ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        self.run(|f| f.filter_recv(msg, ctx))
    }

    pub fn apply_send(&self, msg: &mut BusMessage, ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        self.run(|f| f.filter_send(msg, ctx))
    }

    pub fn remap_mid(&self, mid: &mut Mid, ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        self.run(|f| f.remap_mid(mid, ctx))
    }

    fn run<F>(&self, mut call: F) -> Result<Verdict, FilterError>
    where
        F: FnMut(&dyn Filter) -> Result<Verdict, FilterError>,
    {
        for filter in &self.filters {
            if call(filter.as_ref())? == Verdict::Suppress {
                return Ok(Verdict::Suppress);
            }
        }
        Ok(Verdict::Forward)
    }
}
