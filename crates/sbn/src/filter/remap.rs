// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic remapping filter.
//!
//! Entries are keyed by the peer identity and the topic *as the peer
//! publishes it* (`from`). Traffic received from that peer on `from` is
//! republished locally on `to`; a `to` of zero drops it. When advertising
//! a local subscription on `to`, the reverse lookup asks the peer for
//! `from` instead.
//!
//! Topics with no entry follow the table-wide [`RemapPolicy`].

use super::{Filter, FilterCtx, Verdict};
use crate::bus::BusMessage;
use crate::error::FilterError;
use crate::types::{Mid, ProcessorId, SpacecraftId};
use serde::{Deserialize, Serialize};

/// What happens to topics that have no remap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemapPolicy {
    /// Unmapped topics pass unchanged.
    #[default]
    Send,
    /// Unmapped topics are dropped.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapEntry {
    pub processor_id: ProcessorId,
    pub spacecraft_id: SpacecraftId,
    pub from: Mid,
    pub to: Mid,
}

#[derive(Debug, Clone)]
pub struct RemapFilter {
    name: String,
    policy: RemapPolicy,
    entries: Vec<RemapEntry>,
}

impl RemapFilter {
    pub fn new(name: impl Into<String>, policy: RemapPolicy, entries: Vec<RemapEntry>) -> Self {
        let mut entries = entries;
        entries.sort_by_key(|e| (e.processor_id, e.spacecraft_id, e.from));
        entries.dedup_by_key(|e| (e.processor_id, e.spacecraft_id, e.from));
        Self {
            name: name.into(),
            policy,
            entries,
        }
    }

    fn for_peer<'a>(&'a self, ctx: &'a FilterCtx) -> impl Iterator<Item = &'a RemapEntry> + 'a {
        self.entries.iter().filter(move |e| {
            e.processor_id == ctx.peer.processor_id && e.spacecraft_id == ctx.peer.spacecraft_id
        })
    }

    fn unmapped(&self) -> Verdict {
        match self.policy {
            RemapPolicy::Send => Verdict::Forward,
            RemapPolicy::Ignore => Verdict::Suppress,
        }
    }
}

impl Filter for RemapFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_recv(&self, msg: &mut BusMessage, ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        match self.for_peer(ctx).find(|e| e.from == msg.mid) {
            Some(entry) if !entry.to.is_valid() => Ok(Verdict::Suppress),
            Some(entry) => {
                msg.mid = entry.to;
                Ok(Verdict::Forward)
            }
            None => Ok(self.unmapped()),
        }
    }

    fn remap_mid(&self, mid: &mut Mid, ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        if let Some(entry) = self.for_peer(ctx).find(|e| e.to.is_valid() && e.to == *mid) {
            *mid = entry.from;
            return Ok(Verdict::Forward);
        }
        // Traffic on a dropped topic would be discarded on arrival anyway.
        if self.for_peer(ctx).any(|e| !e.to.is_valid() && e.from == *mid) {
            return Ok(Verdict::Suppress);
        }
        Ok(self.unmapped())
    }
}
