//! Bridge-wide settings.

use std::time::Duration;

use refwire::PROTOCOL_VERSION;

use crate::router::AffinityPolicy;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Used when neither the call site nor the session picks a policy.
    pub default_policy: AffinityPolicy,
    /// Deadline applied to calls that do not set their own.
    pub call_timeout: Duration,
    /// Positional ceiling for callables without a declared signature.
    pub variadic_ceiling: usize,
    /// How many times an idempotent call is retried after a worker crash.
    pub crash_retries: u32,
    /// Treat refs as reachable from every worker (shared object store).
    pub worker_independent_refs: bool,
    /// Bound on the number of distinct derived error kinds.
    pub max_derived_kinds: usize,
    /// Protocol version written into every envelope.
    pub protocol_version: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_policy: AffinityPolicy::StrictQueue,
            call_timeout: Duration::from_secs(30),
            variadic_ceiling: 8,
            crash_retries: 1,
            worker_independent_refs: false,
            max_derived_kinds: 1024,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}
