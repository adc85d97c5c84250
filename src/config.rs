//! Platform configuration
//!
//! Capacities are compile-time constants so the bounded tables can live in
//! fixed-size storage. Timing policy is runtime configuration carried by
//! [`CfwConfig`].

use crate::types::CpuId;

// ============================================================================
// Capacities
// ============================================================================

/// Number of CPUs on the platform
pub const NUM_CPU: usize = 2;

/// CPU that owns the port id space and the authoritative service registry
pub const MASTER_CPU: CpuId = CpuId(0);

/// Maximum number of ports platform-wide (port ids are `1..=MAX_PORTS`)
pub const MAX_PORTS: usize = 64;

/// Maximum number of services registered at the same time
pub const MAX_SERVICES: usize = 32;

/// Maximum number of pending service-availability listeners
pub const MAX_LISTENERS: usize = 16;

/// Default number of pending items a queue accepts
pub const QUEUE_DEFAULT_LIMIT: usize = 256;

// ============================================================================
// Runtime configuration
// ============================================================================

/// Default time a single service gets to acknowledge a shutdown request
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Default time a core waits for its peer's readiness flag during boot
pub const DEFAULT_BOOT_TIMEOUT_MS: u64 = 5_000;

/// Runtime tunables of the component framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfwConfig {
    /// Per-service shutdown acknowledgement timeout, `None` waits forever
    pub shutdown_timeout_ms: Option<u64>,
    /// Bound on the boot-time peer handshake
    pub boot_timeout_ms: u64,
    /// Pending item limit of queues created by the platform
    pub queue_limit: usize,
}

impl CfwConfig {
    /// Configuration with the default policy
    pub const fn new() -> Self {
        Self {
            shutdown_timeout_ms: Some(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            boot_timeout_ms: DEFAULT_BOOT_TIMEOUT_MS,
            queue_limit: QUEUE_DEFAULT_LIMIT,
        }
    }

    /// Set the per-service shutdown timeout
    pub const fn with_shutdown_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.shutdown_timeout_ms = timeout_ms;
        self
    }

    /// Set the boot handshake bound
    pub const fn with_boot_timeout(mut self, timeout_ms: u64) -> Self {
        self.boot_timeout_ms = timeout_ms;
        self
    }

    /// Set the queue limit
    pub const fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }
}

impl Default for CfwConfig {
    fn default() -> Self {
        Self::new()
    }
}
