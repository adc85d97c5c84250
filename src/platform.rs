//! Simulated multi-core platform
//!
//! Wires `NUM_CPU` cores living in one address space: a shared port table,
//! loopback links between every pair of cores, one queue and execution loop
//! per core, the service manager on the master and a proxy on every slave.
//! The boot sequence follows the firmware one:
//!
//! 1. master creates the service manager and publishes its port,
//! 2. each slave waits (bounded) for the framework, registers its proxy and
//!    raises its ready flag,
//! 3. master waits (bounded) for every slave.
//!
//! Tests drive the loops by hand with [`Platform::settle`]; the `std` demo
//! runs each loop on its own thread.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::info;

use crate::cfw::{Client, ServiceBroker, ServiceManager, ServiceProxy};
use crate::clock::{Clock, ManualClock};
use crate::config::{CfwConfig, MASTER_CPU, NUM_CPU};
use crate::cpu::{Cpu, CpuStatsSnapshot};
use crate::error::{BootError, PortError};
use crate::ipc::{LoopbackLink, LoopbackSync, SyncRequestHandler};
use crate::port::MessageHandler;
use crate::queue::Queue;
use crate::shared::SharedData;
use crate::types::{CpuId, PortId};
use crate::xloop::Xloop;

/// Everything code running on one core needs
#[derive(Clone)]
pub struct CoreContext {
    cpu: Arc<Cpu>,
    xloop: Xloop,
    broker: Arc<dyn ServiceBroker>,
}

impl CoreContext {
    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    pub fn id(&self) -> CpuId {
        self.cpu.id()
    }

    pub fn xloop(&self) -> &Xloop {
        &self.xloop
    }

    /// Service registration entry point of this core (manager or proxy)
    pub fn broker(&self) -> &Arc<dyn ServiceBroker> {
        &self.broker
    }

    /// Allocate a port dispatched by this core's loop
    pub fn alloc_port(&self) -> Result<PortId, PortError> {
        self.cpu.try_port_alloc(self.xloop.queue().clone())
    }

    /// Create a client running on this core's loop
    pub fn client(&self, handler: Arc<dyn MessageHandler>) -> Result<Arc<Client>, PortError> {
        Client::new(&self.xloop, handler)
    }
}

/// Builder of a [`Platform`]
pub struct PlatformBuilder {
    config: CfwConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl PlatformBuilder {
    pub fn new() -> Self {
        Self {
            config: CfwConfig::default(),
            clock: None,
        }
    }

    pub fn config(mut self, config: CfwConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source shared by every loop; defaults to a [`ManualClock`]
    /// advancing one ms per idle poll
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Boot every core
    pub fn build(self) -> Result<Platform, BootError> {
        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(ManualClock::with_idle_step(1)));
        let shared = Arc::new(SharedData::new());

        let cpus: Vec<Arc<Cpu>> = (0..NUM_CPU)
            .map(|i| Cpu::new(CpuId(i as u8), shared.clone()))
            .collect();
        for a in &cpus {
            for b in cpus.iter().filter(|b| b.id() != a.id()) {
                a.set_link(b.id(), Arc::new(LoopbackLink::new(b.id(), Arc::downgrade(b))));
            }
        }
        let loops: Vec<Xloop> = cpus
            .iter()
            .map(|cpu| {
                let queue = Arc::new(Queue::with_limit(config.queue_limit));
                Xloop::new(cpu.clone(), queue, clock.clone())
            })
            .collect();

        // master
        let master = &loops[MASTER_CPU.index()];
        let manager = ServiceManager::new(master.clone(), config)?;
        shared.mark_ready(MASTER_CPU);
        let handler: Arc<dyn SyncRequestHandler> = manager.clone();

        // slaves
        let mut cores = Vec::with_capacity(NUM_CPU);
        let mut proxies = Vec::new();
        for (cpu, xloop) in cpus.iter().zip(&loops) {
            let broker: Arc<dyn ServiceBroker> = if cpu.is_master() {
                manager.clone()
            } else {
                cpu.set_master_ipc(Arc::new(LoopbackSync::new(
                    MASTER_CPU,
                    Arc::downgrade(&handler),
                )));
                shared.wait_cfw_ready(MASTER_CPU, clock.as_ref(), config.boot_timeout_ms)?;
                let proxy = ServiceProxy::new(xloop)?;
                proxy.register_with_master()?;
                shared.mark_ready(cpu.id());
                proxies.push(proxy.clone());
                proxy
            };
            cores.push(CoreContext {
                cpu: cpu.clone(),
                xloop: xloop.clone(),
                broker,
            });
        }

        for cpu in cpus.iter().filter(|c| !c.is_master()) {
            shared.wait_ready(cpu.id(), clock.as_ref(), config.boot_timeout_ms)?;
        }
        info!("platform up: {} cores, manager on {}", NUM_CPU, manager.port());

        Ok(Platform {
            shared,
            clock,
            cores,
            manager,
            proxies,
        })
    }
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A booted platform
pub struct Platform {
    shared: Arc<SharedData>,
    clock: Arc<dyn Clock>,
    cores: Vec<CoreContext>,
    manager: Arc<ServiceManager>,
    proxies: Vec<Arc<ServiceProxy>>,
}

impl Platform {
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::new()
    }

    /// Context of core `cpu`
    pub fn core(&self, cpu: CpuId) -> Option<&CoreContext> {
        self.cores.get(cpu.index())
    }

    pub fn master(&self) -> &CoreContext {
        &self.cores[MASTER_CPU.index()]
    }

    pub fn cores(&self) -> &[CoreContext] {
        &self.cores
    }

    pub fn manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    /// Proxy of slave `cpu`
    pub fn proxy(&self, cpu: CpuId) -> Option<&Arc<ServiceProxy>> {
        self.proxies.iter().find(|p| p.host().cpu().id() == cpu)
    }

    pub fn shared(&self) -> &Arc<SharedData> {
        &self.shared
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run every loop round-robin until none has anything ready; returns the
    /// number of dispatched items
    pub fn settle(&self) -> usize {
        let mut total = 0;
        loop {
            let round: usize = self.cores.iter().map(|c| c.xloop.run_until_idle()).sum();
            if round == 0 {
                return total;
            }
            total += round;
        }
    }

    /// Routing counters of every core, indexed by cpu id
    pub fn stats(&self) -> Vec<CpuStatsSnapshot> {
        self.cores.iter().map(|c| c.cpu.stats()).collect()
    }

    /// Run every loop on its own thread until `stop` is raised
    #[cfg(feature = "std")]
    pub fn spawn_loops(
        &self,
        stop: Arc<core::sync::atomic::AtomicBool>,
    ) -> Vec<std::thread::JoinHandle<()>> {
        use core::sync::atomic::Ordering;

        self.cores
            .iter()
            .map(|core| {
                let xloop = core.xloop.clone();
                let stop = stop.clone();
                std::thread::Builder::new()
                    .name(alloc::format!("cpu{}", core.id().0))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            xloop.run_once(Some(10));
                        }
                    })
                    .unwrap_or_else(|e| panic!("cannot spawn core thread: {}", e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_wires_manager_and_proxies() {
        let platform = Platform::builder().build().unwrap();
        let shared = platform.shared();
        assert!(shared.cfw_ready());
        for cpu in 0..NUM_CPU {
            assert!(shared.is_ready(CpuId(cpu as u8)));
        }
        assert_eq!(shared.service_manager_port(), platform.manager().port());
        for core in platform.cores().iter().filter(|c| !c.cpu().is_master()) {
            let proxy = platform.proxy(core.id()).unwrap();
            assert_eq!(platform.manager().proxy(core.id()), Some(proxy.port()));
            assert_eq!(core.cpu().port_cpu(proxy.port()), Some(core.id()));
        }
        assert_eq!(platform.settle(), 0);
    }

    #[test]
    fn slave_ports_come_from_the_master_table() {
        let platform = Platform::builder().build().unwrap();
        let slave = platform.core(CpuId(1)).unwrap();
        let port = slave.alloc_port().unwrap();
        assert_eq!(platform.master().cpu().port_cpu(port), Some(CpuId(1)));
    }
}
