//! Service proxy of a slave core
//!
//! The master forwards requests for services living on a slave to that
//! slave's proxy port. The proxy hands them to its local host, which answers
//! the client directly. Registrations go to the master registry through the
//! synchronous IPC mailbox.

use alloc::sync::Arc;

use log::{info, warn};

use super::host::ServiceHost;
use super::service::Service;
use super::ServiceBroker;
use crate::cpu::Cpu;
use crate::error::{IpcError, PortError, RegisterError};
use crate::ipc::IpcRequestCode;
use crate::message::Message;
use crate::port::MessageHandler;
use crate::types::{PortId, ServiceId};
use crate::xloop::Xloop;

/// Slave-side half of the service manager
pub struct ServiceProxy {
    cpu: Arc<Cpu>,
    port: PortId,
    host: Arc<ServiceHost>,
}

impl ServiceProxy {
    /// Allocate the proxy port (through the master) on `xloop`
    pub fn new(xloop: &Xloop) -> Result<Arc<Self>, PortError> {
        let cpu = xloop.cpu().clone();
        let port = cpu.try_port_alloc(xloop.queue().clone())?;
        let proxy = Arc::new(Self {
            host: ServiceHost::new(cpu.clone()),
            cpu: cpu.clone(),
            port,
        });
        cpu.port_set_handler(port, proxy.clone())?;
        Ok(proxy)
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Announce the proxy port to the master
    pub fn register_with_master(&self) -> Result<(), IpcError> {
        self.cpu
            .sync_request(IpcRequestCode::RegisterProxy, self.port.0 as u32, 0)?;
        info!("{}: proxy registered on {}", self.cpu.id(), self.port);
        Ok(())
    }
}

impl MessageHandler for ServiceProxy {
    fn handle_message(&self, msg: Message) {
        self.host.handle_request(msg);
    }
}

impl ServiceBroker for ServiceProxy {
    fn register_service(
        &self,
        service_id: ServiceId,
        port: PortId,
        service: Arc<dyn Service>,
    ) -> Result<(), RegisterError> {
        self.host.add(service_id, port, service)?;
        let sent = self.cpu.sync_request(
            IpcRequestCode::RegisterService,
            service_id.0 as u32,
            port.0 as u32,
        );
        if let Err(e) = sent {
            // master refused, undo the local half
            let _ = self.host.remove(service_id);
            warn!("{}: master refused {}: {}", self.cpu.id(), service_id, e);
            return Err(match e {
                IpcError::Rejected(_) => RegisterError::Duplicate(service_id),
                other => RegisterError::Ipc(other),
            });
        }
        info!("{}: {} registered on {}", self.cpu.id(), service_id, port);
        Ok(())
    }

    fn unregister_service(&self, service_id: ServiceId) -> Result<(), RegisterError> {
        self.host.remove(service_id)?;
        self.cpu
            .sync_request(IpcRequestCode::DeregisterService, service_id.0 as u32, 0)?;
        Ok(())
    }

    fn send_event(&self, service_id: ServiceId, msg: Message) {
        self.host.send_event(service_id, msg);
    }

    fn host(&self) -> &Arc<ServiceHost> {
        &self.host
    }
}
