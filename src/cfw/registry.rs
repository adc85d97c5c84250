//! Authoritative service registry of the master
//!
//! Fixed-capacity tables reachable from the synchronous IPC handler, so
//! every operation is O(capacity) at most and never allocates.

use heapless::Vec;
use log::warn;

use super::service::ServiceState;
use crate::config::{MAX_LISTENERS, MAX_SERVICES, NUM_CPU};
use crate::error::RegisterError;
use crate::types::{CpuId, PortId, ServiceId};

/// A registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: ServiceId,
    pub port: PortId,
    /// Core hosting the service
    pub cpu: CpuId,
    pub state: ServiceState,
}

/// A client waiting for a service to register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub port: PortId,
    pub service_id: ServiceId,
    pub priv_token: u32,
}

/// Registry tables
///
/// `services` doubles as the available-services list: entries stay in
/// registration order and shutdown walks it from the end.
pub struct Registry {
    services: Vec<ServiceEntry, MAX_SERVICES>,
    proxies: [Option<PortId>; NUM_CPU],
    listeners: Vec<Listener, MAX_LISTENERS>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            services: Vec::new(),
            proxies: [None; NUM_CPU],
            listeners: Vec::new(),
        }
    }

    /// Add a service; a duplicate id leaves the first registration intact
    pub fn register(
        &mut self,
        id: ServiceId,
        port: PortId,
        cpu: CpuId,
    ) -> Result<(), RegisterError> {
        if self.services.iter().any(|s| s.id == id) {
            warn!("{} already registered", id);
            return Err(RegisterError::Duplicate(id));
        }
        let entry = ServiceEntry {
            id,
            port,
            cpu,
            state: ServiceState::Registered,
        };
        if self.services.push(entry).is_err() {
            panic!("service registry full ({} entries)", MAX_SERVICES);
        }
        Ok(())
    }

    /// Remove a service; with `owner` set only that core's service goes
    pub fn deregister(
        &mut self,
        id: ServiceId,
        owner: Option<CpuId>,
    ) -> Result<ServiceEntry, RegisterError> {
        let pos = self
            .services
            .iter()
            .position(|s| s.id == id && owner.map_or(true, |cpu| s.cpu == cpu))
            .ok_or(RegisterError::NotRegistered(id))?;
        Ok(self.services.remove(pos))
    }

    pub fn lookup(&self, id: ServiceId) -> Option<ServiceEntry> {
        self.services.iter().find(|s| s.id == id).copied()
    }

    pub fn set_state(&mut self, id: ServiceId, state: ServiceState) {
        if let Some(s) = self.services.iter_mut().find(|s| s.id == id) {
            s.state = state;
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Registered services, oldest first
    pub fn services(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.iter()
    }

    /// Ids in shutdown order (most recently registered first)
    pub fn shutdown_order(&self) -> Vec<ServiceId, MAX_SERVICES> {
        self.services.iter().rev().map(|s| s.id).collect()
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    pub fn set_proxy(&mut self, cpu: CpuId, port: PortId) -> bool {
        match self.proxies.get_mut(cpu.index()) {
            Some(slot) => {
                *slot = Some(port);
                true
            }
            None => false,
        }
    }

    pub fn proxy(&self, cpu: CpuId) -> Option<PortId> {
        self.proxies.get(cpu.index()).copied().flatten()
    }

    // ========================================================================
    // Availability listeners
    // ========================================================================

    /// Queue a listener; a full table hands it back
    pub fn add_listener(&mut self, listener: Listener) -> Result<(), Listener> {
        self.listeners.push(listener)
    }

    /// Remove and return every listener waiting for `id`
    pub fn take_listeners(&mut self, id: ServiceId) -> Vec<Listener, MAX_LISTENERS> {
        let taken: Vec<Listener, MAX_LISTENERS> = self
            .listeners
            .iter()
            .filter(|l| l.service_id == id)
            .copied()
            .collect();
        self.listeners.retain(|l| l.service_id != id);
        taken
    }

    pub fn pending_listeners(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut reg = Registry::new();
        reg.register(ServiceId(10), PortId(3), CpuId(0)).unwrap();
        assert_eq!(
            reg.register(ServiceId(10), PortId(4), CpuId(1)),
            Err(RegisterError::Duplicate(ServiceId(10)))
        );
        let entry = reg.lookup(ServiceId(10)).unwrap();
        assert_eq!(entry.port, PortId(3));
        assert_eq!(entry.cpu, CpuId(0));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    #[should_panic(expected = "service registry full")]
    fn full_registry_is_fatal() {
        let mut reg = Registry::new();
        for id in 0..=MAX_SERVICES as u16 {
            reg.register(ServiceId(id), PortId(1), CpuId(0)).unwrap();
        }
    }

    #[test]
    fn shutdown_walks_newest_first() {
        let mut reg = Registry::new();
        for id in [10, 11, 12] {
            reg.register(ServiceId(id), PortId(id), CpuId(0)).unwrap();
        }
        reg.deregister(ServiceId(11), None).unwrap();
        assert_eq!(reg.shutdown_order(), [ServiceId(12), ServiceId(10)]);
    }

    #[test]
    fn deregister_checks_owner() {
        let mut reg = Registry::new();
        reg.register(ServiceId(10), PortId(3), CpuId(1)).unwrap();
        assert_eq!(
            reg.deregister(ServiceId(10), Some(CpuId(0))),
            Err(RegisterError::NotRegistered(ServiceId(10)))
        );
        assert!(reg.deregister(ServiceId(10), Some(CpuId(1))).is_ok());
        assert!(reg.is_empty());
    }

    #[test]
    fn listeners_are_consumed_once() {
        let mut reg = Registry::new();
        let l = |svc, token| Listener {
            port: PortId(2),
            service_id: ServiceId(svc),
            priv_token: token,
        };
        reg.add_listener(l(10, 1)).unwrap();
        reg.add_listener(l(11, 2)).unwrap();
        reg.add_listener(l(10, 3)).unwrap();
        let fired = reg.take_listeners(ServiceId(10));
        assert_eq!(fired.iter().map(|l| l.priv_token).collect::<alloc::vec::Vec<_>>(), [1, 3]);
        assert!(reg.take_listeners(ServiceId(10)).is_empty());
        assert_eq!(reg.pending_listeners(), 1);
    }

    #[test]
    fn listener_table_overflow_hands_back() {
        let mut reg = Registry::new();
        for token in 0..MAX_LISTENERS as u32 {
            reg.add_listener(Listener {
                port: PortId(1),
                service_id: ServiceId(1),
                priv_token: token,
            })
            .unwrap();
        }
        let extra = Listener {
            port: PortId(1),
            service_id: ServiceId(2),
            priv_token: 99,
        };
        assert_eq!(reg.add_listener(extra), Err(extra));
    }

    #[test]
    fn proxies_are_per_cpu() {
        let mut reg = Registry::new();
        assert!(reg.set_proxy(CpuId(1), PortId(8)));
        assert!(!reg.set_proxy(CpuId(9), PortId(8)));
        assert_eq!(reg.proxy(CpuId(1)), Some(PortId(8)));
        assert_eq!(reg.proxy(CpuId(0)), None);
    }
}
