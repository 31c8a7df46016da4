//! # Bridge Builder
//!
//! Fluent construction of a `Bridge` from a worker pool, a catalog of
//! declared signatures and a `BridgeConfig`.

use std::sync::Arc;
use std::time::Duration;

use refwire::MIN_PROTOCOL_VERSION;
use refwire::PROTOCOL_VERSION;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::dispatch::Catalog;
use crate::error::Error;
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::router::AffinityPolicy;

pub struct BridgeBuilder {
    pool: Arc<dyn WorkerPool>,
    catalog: Catalog,
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self { pool, catalog: Catalog::new(), config: BridgeConfig::default() }
    }

    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Adjusts the configuration in place.
    pub fn config(mut self, f: impl FnOnce(&mut BridgeConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn default_policy(mut self, policy: AffinityPolicy) -> Self {
        self.config.default_policy = policy;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn variadic_ceiling(mut self, ceiling: usize) -> Self {
        self.config.variadic_ceiling = ceiling;
        self
    }

    pub fn crash_retries(mut self, retries: u32) -> Self {
        self.config.crash_retries = retries;
        self
    }

    pub fn worker_independent_refs(mut self, enabled: bool) -> Self {
        self.config.worker_independent_refs = enabled;
        self
    }

    /// Validates the configuration and builds the bridge.
    ///
    /// # Errors
    /// - `NoWorkers` if the pool reports no workers.
    /// - `ProtocolVersionUnsupported` if the configured version is out of range.
    pub fn build(self) -> Result<Bridge> {
        let version = self.config.protocol_version;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(Error::ProtocolVersionUnsupported {
                found: version as u64,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            });
        }
        Bridge::from_parts(self.pool, self.catalog, self.config)
    }
}
