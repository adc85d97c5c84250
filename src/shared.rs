//! State shared by every core
//!
//! Limited to the port table, readiness flags and the well-known service
//! manager port. Flags only ever move forward (false to true); each one has
//! a single writer.

use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use log::warn;

use crate::clock::Clock;
use crate::config::NUM_CPU;
use crate::error::BootError;
use crate::port::PortTable;
use crate::types::{CpuId, PortId};

/// Shared-memory block of the platform
pub struct SharedData {
    /// Platform-wide port table
    pub ports: PortTable,
    ready: [AtomicBool; NUM_CPU],
    cfw_ready: AtomicBool,
    service_mgr_port: AtomicU16,
}

impl SharedData {
    pub const fn new() -> Self {
        const NOT_READY: AtomicBool = AtomicBool::new(false);
        Self {
            ports: PortTable::new(),
            ready: [NOT_READY; NUM_CPU],
            cfw_ready: AtomicBool::new(false),
            service_mgr_port: AtomicU16::new(0),
        }
    }

    /// Publish that `cpu` finished its bring-up
    pub fn mark_ready(&self, cpu: CpuId) {
        if let Some(flag) = self.ready.get(cpu.index()) {
            flag.store(true, Ordering::Release);
        }
    }

    /// Whether `cpu` finished its bring-up
    pub fn is_ready(&self, cpu: CpuId) -> bool {
        self.ready
            .get(cpu.index())
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// Publish the service manager port; the framework is usable afterwards
    pub fn publish_service_manager(&self, port: PortId) {
        self.service_mgr_port.store(port.0, Ordering::Release);
        self.cfw_ready.store(true, Ordering::Release);
    }

    /// Whether the master service manager is up
    pub fn cfw_ready(&self) -> bool {
        self.cfw_ready.load(Ordering::Acquire)
    }

    /// Port of the master service manager (`PortId::NONE` before boot)
    pub fn service_manager_port(&self) -> PortId {
        PortId(self.service_mgr_port.load(Ordering::Acquire))
    }

    /// Wait, bounded, until `cpu` is ready
    pub fn wait_ready(
        &self,
        cpu: CpuId,
        clock: &dyn Clock,
        timeout_ms: u64,
    ) -> Result<(), BootError> {
        self.wait_for(cpu, clock, timeout_ms, || self.is_ready(cpu))
    }

    /// Wait, bounded, until the master's service manager is published
    pub fn wait_cfw_ready(
        &self,
        master: CpuId,
        clock: &dyn Clock,
        timeout_ms: u64,
    ) -> Result<(), BootError> {
        self.wait_for(master, clock, timeout_ms, || self.cfw_ready())
    }

    fn wait_for(
        &self,
        peer: CpuId,
        clock: &dyn Clock,
        timeout_ms: u64,
        ready: impl Fn() -> bool,
    ) -> Result<(), BootError> {
        let start = clock.now_ms();
        loop {
            if ready() {
                return Ok(());
            }
            let waited = clock.now_ms().saturating_sub(start);
            if waited >= timeout_ms {
                warn!("{} not ready after {} ms", peer, waited);
                return Err(BootError::PeerTimeout {
                    peer,
                    waited_ms: waited,
                });
            }
            clock.relax();
        }
    }
}

impl Default for SharedData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn wait_returns_once_flag_is_set() {
        let shared = SharedData::new();
        let clock = ManualClock::with_idle_step(1);
        shared.mark_ready(CpuId(1));
        assert_eq!(shared.wait_ready(CpuId(1), &clock, 5), Ok(()));
    }

    #[test]
    fn wait_fails_after_bound() {
        let shared = SharedData::new();
        let clock = ManualClock::with_idle_step(1);
        assert_eq!(
            shared.wait_ready(CpuId(1), &clock, 5),
            Err(BootError::PeerTimeout {
                peer: CpuId(1),
                waited_ms: 5
            })
        );
    }

    #[test]
    fn service_manager_publication_sets_cfw_ready() {
        let shared = SharedData::new();
        assert!(!shared.cfw_ready());
        assert_eq!(shared.service_manager_port(), PortId::NONE);
        shared.publish_service_manager(PortId(4));
        assert!(shared.cfw_ready());
        assert_eq!(shared.service_manager_port(), PortId(4));
    }
}
