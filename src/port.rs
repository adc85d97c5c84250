//! Port table - the platform-wide endpoint namespace
//!
//! Ports are the core addressing abstraction. A port id names a message
//! endpoint and the CPU owning it. The table is shared by every core; only
//! the master allocates entries, every core binds the queue and handler of
//! the ports it owns.

use alloc::sync::Arc;
use heapless::Vec;

use crate::config::MAX_PORTS;
use crate::error::PortError;
use crate::irq::IrqMutex;
use crate::message::Message;
use crate::queue::Queue;
use crate::types::{CpuId, PortId};

/// Receiver of the messages dispatched on a port
///
/// The handler takes ownership of the message; it either forwards it or
/// releases it through [`crate::cpu::Cpu::free_message`].
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: Message);
}

impl<F: Fn(Message) + Send + Sync> MessageHandler for F {
    fn handle_message(&self, msg: Message) {
        self(msg)
    }
}

/// One port table slot
struct PortEntry {
    cpu: CpuId,
    queue: Option<Arc<Queue>>,
    handler: Option<Arc<dyn MessageHandler>>,
}

/// Snapshot of where a port delivers
#[derive(Clone)]
pub struct PortRoute {
    pub cpu: CpuId,
    pub queue: Option<Arc<Queue>>,
    pub handler: Option<Arc<dyn MessageHandler>>,
}

/// Bounded table of all ports; port `n` lives in slot `n - 1`
pub struct PortTable {
    entries: IrqMutex<Vec<PortEntry, MAX_PORTS>>,
}

impl PortTable {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            entries: IrqMutex::new(Vec::new()),
        }
    }

    /// Allocate the next free port for `cpu` (master side)
    pub fn allocate(&self, cpu: CpuId) -> Result<PortId, PortError> {
        let mut entries = self.entries.lock();
        let id = PortId((entries.len() + 1) as u16);
        entries
            .push(PortEntry {
                cpu,
                queue: None,
                handler: None,
            })
            .map_err(|_| PortError::Exhausted)?;
        Ok(id)
    }

    /// Number of allocated ports
    pub fn allocated(&self) -> usize {
        self.entries.lock().len()
    }

    fn with_entry<R>(
        &self,
        port: PortId,
        f: impl FnOnce(&mut PortEntry) -> R,
    ) -> Result<R, PortError> {
        let mut entries = self.entries.lock();
        let idx = (port.0 as usize)
            .checked_sub(1)
            .ok_or(PortError::UnknownPort(port))?;
        entries
            .get_mut(idx)
            .map(f)
            .ok_or(PortError::UnknownPort(port))
    }

    /// Owning CPU of a port
    pub fn cpu_of(&self, port: PortId) -> Option<CpuId> {
        self.with_entry(port, |e| e.cpu).ok()
    }

    /// Attach the queue messages for this port are posted to
    pub fn bind_queue(&self, port: PortId, queue: Arc<Queue>) -> Result<(), PortError> {
        self.with_entry(port, |e| e.queue = Some(queue))
    }

    /// Install the handler; the last writer wins
    pub fn set_handler(
        &self,
        port: PortId,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), PortError> {
        self.with_entry(port, |e| e.handler = Some(handler))
    }

    /// Delivery information of a port
    pub fn route(&self, port: PortId) -> Result<PortRoute, PortError> {
        self.with_entry(port, |e| PortRoute {
            cpu: e.cpu,
            queue: e.queue.clone(),
            handler: e.handler.clone(),
        })
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}
