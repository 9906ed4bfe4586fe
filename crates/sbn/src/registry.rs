// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Name-to-module registry.
//!
//! Networks name their transport and networks/peers name their filters in
//! the configuration. The registry resolves those names: transports through
//! a factory (one instance per network), filters as shared instances built
//! from the `[[filters]]` table.

use crate::config::{BridgeConfig, FilterConfig, FilterKind};
use crate::error::SbnError;
use crate::filter::{Filter, FilterChain, MidListFilter, RemapFilter};
use crate::transport::{TcpTransport, Transport, UdpTransport};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

#[derive(Default)]
pub struct ModuleRegistry {
    transports: HashMap<String, TransportFactory>,
    filters: HashMap<String, Arc<dyn Filter>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("transports", &self.transport_names())
            .field("filters", &self.filter_names())
            .finish()
    }
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `tcp` and `udp` transports and every filter
    /// declared in `config`.
    pub fn with_builtins(config: &BridgeConfig) -> Self {
        let mut registry = Self::new();
        let tcp = config.tcp.clone();
        registry.register_transport("tcp", move || Box::new(TcpTransport::new(tcp.clone())));
        let udp = config.udp.clone();
        registry.register_transport("udp", move || Box::new(UdpTransport::new(udp.clone())));
        for filter in &config.filters {
            registry.register_filter(build_filter(filter));
        }
        registry
    }

    pub fn register_transport<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    {
        self.transports.insert(name.into(), Box::new(factory));
    }

    /// Register a filter under its own name, replacing any previous one.
    pub fn register_filter(&mut self, filter: Arc<dyn Filter>) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    /// Fresh transport instance for one network.
    pub fn create_transport(&self, name: &str) -> Result<Box<dyn Transport>, SbnError> {
        let factory = self
            .transports
            .get(name)
            .ok_or_else(|| SbnError::UnknownTransport(name.to_string()))?;
        Ok(factory())
    }

    /// Resolve filter names, in order.
    pub fn chain(&self, names: &[String]) -> Result<FilterChain, SbnError> {
        let mut chain = FilterChain::default();
        for name in names {
            let filter = self
                .filters
                .get(name)
                .ok_or_else(|| SbnError::UnknownFilter(name.clone()))?;
            chain.push(filter.clone());
        }
        Ok(chain)
    }

    /// Initialize every filter. Filters that fail are unregistered, so
    /// chains naming them fail to resolve.
    pub fn init_filters(&mut self, version: u32) {
        self.filters.retain(|name, filter| match filter.init(version) {
            Ok(()) => {
                debug!("filter '{}' initialized", name);
                true
            }
            Err(e) => {
                error!("filter '{}' disabled: {}", name, e);
                false
            }
        });
    }

    pub fn transport_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.transports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn filter_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.filters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Instantiate one configured filter.
pub fn build_filter(config: &FilterConfig) -> Arc<dyn Filter> {
    match &config.kind {
        FilterKind::Remap {
            default_policy,
            entries,
        } => Arc::new(RemapFilter::new(
            config.name.clone(),
            *default_policy,
            entries.clone(),
        )),
        FilterKind::MidList { mode, mids } => Arc::new(MidListFilter::new(
            config.name.clone(),
            *mode,
            mids.iter().copied(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::filter::ListMode;
    use crate::types::Mid;

    struct FailsInit;

    impl Filter for FailsInit {
        fn name(&self) -> &str {
            "fails"
        }

        fn init(&self, _version: u32) -> Result<(), FilterError> {
            Err(FilterError::Init("fails".into()))
        }
    }

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::new(1, 42);
        config.filters.push(FilterConfig {
            name: "deny".into(),
            kind: FilterKind::MidList {
                mode: ListMode::Deny,
                mids: vec![Mid(0x0800)],
            },
        });
        config
    }

    #[test]
    fn test_builtins() {
        let registry = ModuleRegistry::with_builtins(&config());
        assert_eq!(registry.transport_names(), vec!["tcp", "udp"]);
        assert_eq!(registry.filter_names(), vec!["deny"]);
        assert_eq!(registry.create_transport("udp").expect("udp").name(), "udp");
        assert!(matches!(
            registry.create_transport("serial"),
            Err(SbnError::UnknownTransport(_))
        ));
    }

    #[test]
    fn test_chain_resolution() {
        let registry = ModuleRegistry::with_builtins(&config());
        let chain = registry.chain(&["deny".to_string()]).expect("chain");
        assert_eq!(chain.names(), vec!["deny"]);
        assert!(matches!(
            registry.chain(&["deny".to_string(), "missing".to_string()]),
            Err(SbnError::UnknownFilter(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_failed_init_unregisters() {
        let mut registry = ModuleRegistry::with_builtins(&config());
        registry.register_filter(Arc::new(FailsInit));
        registry.init_filters(6);
        assert_eq!(registry.filter_names(), vec!["deny"]);
        assert!(registry.chain(&["fails".to_string()]).is_err());
    }

    #[test]
    fn test_each_network_gets_own_transport() {
        let registry = ModuleRegistry::with_builtins(&config());
        let a = registry.create_transport("tcp").expect("tcp");
        let b = registry.create_transport("tcp").expect("tcp");
        assert!(!std::ptr::eq(
            a.as_ref() as *const dyn Transport as *const u8,
            b.as_ref() as *const dyn Transport as *const u8
        ));
    }
}
