// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allow/deny list filter.

use super::{Filter, FilterCtx, Verdict};
use crate::bus::BusMessage;
use crate::error::FilterError;
use crate::types::Mid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    /// Only listed topics cross the bridge.
    Allow,
    /// Listed topics never cross the bridge.
    #[default]
    Deny,
}

/// Drops topics by list, in both directions and from advertisements.
#[derive(Debug, Clone)]
pub struct MidListFilter {
    name: String,
    mode: ListMode,
    mids: HashSet<Mid>,
}

impl MidListFilter {
    pub fn new(name: impl Into<String>, mode: ListMode, mids: impl IntoIterator<Item = Mid>) -> Self {
        Self {
            name: name.into(),
            mode,
            mids: mids.into_iter().collect(),
        }
    }

    pub fn permits(&self, mid: Mid) -> bool {
        match self.mode {
            ListMode::Allow => self.mids.contains(&mid),
            ListMode::Deny => !self.mids.contains(&mid),
        }
    }

    fn verdict(&self, mid: Mid) -> Verdict {
        if self.permits(mid) {
            Verdict::Forward
        } else {
            Verdict::Suppress
        }
    }
}

impl Filter for MidListFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_recv(&self, msg: &mut BusMessage, _ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        Ok(self.verdict(msg.mid))
    }

    fn filter_send(&self, msg: &mut BusMessage, _ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        Ok(self.verdict(msg.mid))
    }

    fn remap_mid(&self, mid: &mut Mid, _ctx: &FilterCtx) -> Result<Verdict, FilterError> {
        Ok(self.verdict(*mid))
    }
}
