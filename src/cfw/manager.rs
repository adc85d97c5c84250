//! Service manager of the master core
//!
//! Owns the authoritative registry and the well-known manager port. Client
//! requests arrive on that port and are routed by service id: services on
//! the master go to the local [`ServiceHost`], services on a slave are
//! forwarded to that slave's proxy port. Slaves reach the registry through
//! the synchronous IPC handler, which only performs bounded table updates.
//!
//! Shutdown walks the registered services newest first and waits for each
//! one to acknowledge before asking the next. A per-service timeout keeps a
//! silent service from stalling the sequence.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use spin::Mutex;

use super::host::ServiceHost;
use super::msg_id;
use super::proto::{
    FixedPayload, OpenServiceRsp, Payload, StatusRsp, SvcAvailEvt, SvcAvailReq, SvcShutdownReq,
    SvcShutdownRsp,
};
use super::registry::{Listener, Registry, ServiceEntry};
use super::service::{Service, ServiceState};
use super::{ServiceBroker, Status};
use crate::config::CfwConfig;
use crate::cpu::Cpu;
use crate::error::{PortError, RegisterError, WireError};
use crate::ipc::{IpcRequest, IpcRequestCode, SyncRequestHandler};
use crate::irq::IrqMutex;
use crate::message::{Message, MsgType};
use crate::port::MessageHandler;
use crate::types::{CpuId, PortId, ServiceId};
use crate::wire::WireReader;
use crate::xloop::{JobHandle, Xloop};

/// Called once when a shutdown sequence ends
pub type ShutdownCallback = Box<dyn FnOnce(Status) + Send>;

struct ShutdownRun {
    /// SHUTDOWN_REQ being served, answered at the end
    request: Option<Message>,
    remaining: VecDeque<ServiceId>,
    current: Option<(ServiceId, Option<JobHandle>)>,
    timed_out: usize,
}

enum Availability {
    Available,
    Queued,
    Overflow,
}

/// Master-side service manager
pub struct ServiceManager {
    me: Weak<ServiceManager>,
    cpu: Arc<Cpu>,
    xloop: Xloop,
    port: PortId,
    config: CfwConfig,
    host: Arc<ServiceHost>,
    registry: IrqMutex<Registry>,
    shutdown: Mutex<Option<ShutdownRun>>,
    on_shutdown: Mutex<Option<ShutdownCallback>>,
}

impl ServiceManager {
    /// Create the manager on the master loop and publish its port
    pub fn new(xloop: Xloop, config: CfwConfig) -> Result<Arc<Self>, PortError> {
        let cpu = xloop.cpu().clone();
        let port = cpu.try_port_alloc(xloop.queue().clone())?;
        let host = ServiceHost::new(cpu.clone());
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cpu: cpu.clone(),
            xloop,
            port,
            config,
            host,
            registry: IrqMutex::new(Registry::new()),
            shutdown: Mutex::new(None),
            on_shutdown: Mutex::new(None),
        });
        cpu.port_set_handler(port, manager.clone())?;
        cpu.shared().publish_service_manager(port);
        info!("{}: service manager on {}", cpu.id(), port);
        Ok(manager)
    }

    /// Well-known manager port
    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn lookup(&self, service_id: ServiceId) -> Option<ServiceEntry> {
        self.registry.lock().lookup(service_id)
    }

    /// Number of registered services platform-wide
    pub fn service_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Proxy port registered by `cpu`
    pub fn proxy(&self, cpu: CpuId) -> Option<PortId> {
        self.registry.lock().proxy(cpu)
    }

    pub fn pending_listeners(&self) -> usize {
        self.registry.lock().pending_listeners()
    }

    /// Install the callback run when a shutdown sequence ends
    pub fn on_shutdown_complete(&self, callback: ShutdownCallback) {
        *self.on_shutdown.lock() = Some(callback);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    // ========================================================================
    // Availability
    // ========================================================================

    /// Tell the listeners waiting for `service_id`; runs as a job on the
    /// master loop
    fn notify_registered(&self, service_id: ServiceId) {
        let me = self.me.clone();
        self.xloop.post_func(move || {
            if let Some(manager) = me.upgrade() {
                manager.fire_listeners(service_id);
            }
        });
    }

    fn fire_listeners(&self, service_id: ServiceId) {
        let listeners = self.registry.lock().take_listeners(service_id);
        for l in &listeners {
            self.send_available(l.port, l.priv_token, service_id);
        }
        if !listeners.is_empty() {
            debug!("{} available, {} listeners told", service_id, listeners.len());
        }
    }

    fn send_available(&self, port: PortId, priv_token: u32, service_id: ServiceId) {
        let evt = SvcAvailEvt { service_id }
            .to_message()
            .typed(MsgType::Evt)
            .to_port(port)
            .from_port(self.port)
            .priv_token(priv_token);
        let _ = self.cpu.send_message(evt);
    }

    fn handle_svc_avail(&self, msg: Message) {
        let req = match SvcAvailReq::from_message(&msg) {
            Ok(req) => req,
            Err(e) => {
                warn!("malformed availability request: {}", e);
                self.reject(msg, ServiceId(0), Status::Error);
                return;
            }
        };
        let outcome = {
            let mut reg = self.registry.lock();
            if reg.lookup(req.service_id).is_some() {
                Availability::Available
            } else {
                let listener = Listener {
                    port: msg.src(),
                    service_id: req.service_id,
                    priv_token: msg.priv_token,
                };
                match reg.add_listener(listener) {
                    Ok(()) => Availability::Queued,
                    Err(_) => Availability::Overflow,
                }
            }
        };
        let status = match outcome {
            Availability::Overflow => {
                warn!("listener table full, {} request refused", req.service_id);
                Status::Overflow
            }
            _ => Status::Ok,
        };
        let rsp = StatusRsp::new(status).respond(&msg, msg_id::REGISTER_SVC_AVAIL_EVT_RSP);
        let _ = self.cpu.send_message(rsp);
        if let Availability::Available = outcome {
            self.send_available(msg.src(), msg.priv_token, req.service_id);
        }
        self.cpu.free_message(msg);
    }

    // ========================================================================
    // Routing
    // ========================================================================

    fn leading_service_id(msg: &Message) -> Result<ServiceId, WireError> {
        WireReader::new(msg.body()).u16().map(ServiceId)
    }

    /// Answer `msg` with an error status and release it
    fn reject(&self, msg: Message, service_id: ServiceId, status: Status) {
        let rsp = match msg.id() {
            msg_id::OPEN_SERVICE_REQ => {
                OpenServiceRsp::failed(service_id, status).respond_to(&msg)
            }
            id => StatusRsp::new(status).respond(&msg, msg_id::response_of(id)),
        };
        let _ = self.cpu.send_message(rsp);
        self.cpu.free_message(msg);
    }

    /// Deliver a connection request to the host of its service
    fn route(&self, msg: Message) {
        let service_id = match Self::leading_service_id(&msg) {
            Ok(id) => id,
            Err(e) => {
                warn!("malformed request {:#x}: {}", msg.id(), e);
                self.reject(msg, ServiceId(0), Status::Error);
                return;
            }
        };
        let entry = self.registry.lock().lookup(service_id);
        let Some(entry) = entry else {
            debug!("request {:#x} for unknown {}", msg.id(), service_id);
            self.reject(msg, service_id, Status::UnknownService);
            return;
        };
        if entry.cpu == self.cpu.id() {
            self.host.handle_request(msg);
            return;
        }
        match self.proxy(entry.cpu) {
            Some(proxy) => {
                debug!("forward {:#x} for {} to {}", msg.id(), service_id, entry.cpu);
                let _ = self.cpu.send_message(msg.to_port(proxy));
            }
            None => {
                error!("no proxy on {} for {}", entry.cpu, service_id);
                self.reject(msg, service_id, Status::UnknownService);
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Start the shutdown sequence; a running sequence hands the request
    /// back
    pub fn begin_shutdown(&self, request: Option<Message>) -> Result<(), Option<Message>> {
        {
            let mut sd = self.shutdown.lock();
            if sd.is_some() {
                return Err(request);
            }
            let order = self.registry.lock().shutdown_order();
            info!("shutdown of {} services", order.len());
            *sd = Some(ShutdownRun {
                request,
                remaining: order.into_iter().collect(),
                current: None,
                timed_out: 0,
            });
        }
        self.shutdown_next();
        Ok(())
    }

    fn handle_shutdown_req(&self, msg: Message) {
        if let Err(Some(msg)) = self.begin_shutdown(Some(msg)) {
            warn!("shutdown already running");
            self.reject(msg, ServiceId(0), Status::Busy);
        }
    }

    fn shutdown_next(&self) {
        loop {
            let next = match self.shutdown.lock().as_mut() {
                Some(run) => {
                    run.current = None;
                    run.remaining.pop_front()
                }
                None => return,
            };
            let Some(service_id) = next else {
                self.finish_shutdown();
                return;
            };
            let entry = {
                let mut reg = self.registry.lock();
                reg.set_state(service_id, ServiceState::ShuttingDown);
                reg.lookup(service_id)
            };
            let Some(entry) = entry else {
                continue;
            };
            let target = if entry.cpu == self.cpu.id() {
                Some(self.port)
            } else {
                self.proxy(entry.cpu)
            };
            let Some(target) = target else {
                error!("no proxy on {}, dropping {}", entry.cpu, service_id);
                let _ = self.registry.lock().deregister(service_id, None);
                continue;
            };

            let timer = self.config.shutdown_timeout_ms.map(|timeout| {
                let me = self.me.clone();
                self.xloop.post_func_delayed(
                    move || {
                        if let Some(manager) = me.upgrade() {
                            manager.shutdown_timed_out(service_id);
                        }
                    },
                    timeout,
                )
            });
            if let Some(run) = self.shutdown.lock().as_mut() {
                run.current = Some((service_id, timer));
            }

            debug!("asking {} to shut down", service_id);
            let req = SvcShutdownReq { service_id }
                .to_message()
                .to_port(target)
                .from_port(self.port);
            if entry.cpu == self.cpu.id() {
                self.host.handle_request(req);
            } else {
                let _ = self.cpu.send_message(req);
            }
            return;
        }
    }

    fn handle_svc_shutdown_rsp(&self, msg: Message) {
        let rsp = SvcShutdownRsp::from_message(&msg);
        self.cpu.free_message(msg);
        let rsp = match rsp {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!("malformed shutdown response: {}", e);
                return;
            }
        };
        {
            // a busy host is still working on an earlier request
            let mut reg = self.registry.lock();
            let state = reg.lookup(rsp.service_id).map(|e| e.state);
            if state == Some(ServiceState::ShuttingDown) && rsp.status != Status::Busy {
                let _ = reg.deregister(rsp.service_id, None);
            }
        }

        let expected = match self.shutdown.lock().as_mut() {
            Some(run) => match run.current.take() {
                Some((id, timer)) if id == rsp.service_id => {
                    if let Some(timer) = timer {
                        timer.cancel();
                    }
                    // still stuck in a shutdown that timed out earlier
                    if rsp.status == Status::Busy {
                        run.timed_out += 1;
                    }
                    true
                }
                other => {
                    run.current = other;
                    false
                }
            },
            None => false,
        };
        if expected {
            debug!("{} shut down ({})", rsp.service_id, rsp.status);
            self.shutdown_next();
        } else {
            warn!("unexpected shutdown response from {}", rsp.service_id);
        }
    }

    fn shutdown_timed_out(&self, service_id: ServiceId) {
        let hit = match self.shutdown.lock().as_mut() {
            Some(run) if run.current.as_ref().is_some_and(|(id, _)| *id == service_id) => {
                run.current = None;
                run.timed_out += 1;
                true
            }
            _ => false,
        };
        if hit {
            warn!(
                "{} did not acknowledge shutdown within {:?} ms",
                service_id, self.config.shutdown_timeout_ms
            );
            self.shutdown_next();
        }
    }

    fn finish_shutdown(&self) {
        let Some(run) = self.shutdown.lock().take() else {
            return;
        };
        let status = if run.timed_out == 0 {
            Status::Ok
        } else {
            Status::Timeout
        };
        info!("shutdown complete ({}, {} timed out)", status, run.timed_out);
        if let Some(req) = run.request {
            let rsp = StatusRsp::new(status).respond(&req, msg_id::SHUTDOWN_RSP);
            let _ = self.cpu.send_message(rsp);
            self.cpu.free_message(req);
        }
        let callback = self.on_shutdown.lock().take();
        if let Some(callback) = callback {
            callback(status);
        }
    }
}

impl MessageHandler for ServiceManager {
    fn handle_message(&self, msg: Message) {
        match msg.id() {
            msg_id::OPEN_SERVICE_REQ | msg_id::CLOSE_SERVICE_REQ | msg_id::REGISTER_EVT_REQ => {
                self.route(msg)
            }
            msg_id::REGISTER_SVC_AVAIL_EVT_REQ => self.handle_svc_avail(msg),
            msg_id::SHUTDOWN_REQ => self.handle_shutdown_req(msg),
            msg_id::SVC_SHUTDOWN_RSP => self.handle_svc_shutdown_rsp(msg),
            other => {
                warn!("manager: unexpected message {:#x} from {}", other, msg.src());
                self.cpu.free_message(msg);
            }
        }
    }
}

impl SyncRequestHandler for ServiceManager {
    fn handle_sync_request(&self, req: IpcRequest) -> i32 {
        match req.code {
            IpcRequestCode::AllocPort => match self.cpu.shared().ports.allocate(req.sender) {
                Ok(port) => port.0 as i32,
                Err(e) => {
                    error!("port allocation for {} failed: {}", req.sender, e);
                    -1
                }
            },
            IpcRequestCode::RegisterService => {
                let service_id = ServiceId(req.param1 as u16);
                let port = PortId(req.param2 as u16);
                match self.registry.lock().register(service_id, port, req.sender) {
                    Ok(()) => {
                        info!("{} registered by {} on {}", service_id, req.sender, port);
                        self.notify_registered(service_id);
                        0
                    }
                    Err(_) => -1,
                }
            }
            IpcRequestCode::DeregisterService => {
                let service_id = ServiceId(req.param1 as u16);
                match self
                    .registry
                    .lock()
                    .deregister(service_id, Some(req.sender))
                {
                    Ok(_) => 0,
                    Err(_) => -1,
                }
            }
            IpcRequestCode::RegisterProxy => {
                let port = PortId(req.param1 as u16);
                if self.registry.lock().set_proxy(req.sender, port) {
                    info!("proxy of {} on {}", req.sender, port);
                    0
                } else {
                    -1
                }
            }
        }
    }
}

impl ServiceBroker for ServiceManager {
    fn register_service(
        &self,
        service_id: ServiceId,
        port: PortId,
        service: Arc<dyn Service>,
    ) -> Result<(), RegisterError> {
        self.registry
            .lock()
            .register(service_id, port, self.cpu.id())?;
        if let Err(e) = self.host.add(service_id, port, service) {
            let _ = self.registry.lock().deregister(service_id, None);
            return Err(e);
        }
        info!("{} registered on {}", service_id, port);
        self.notify_registered(service_id);
        Ok(())
    }

    fn unregister_service(&self, service_id: ServiceId) -> Result<(), RegisterError> {
        self.registry
            .lock()
            .deregister(service_id, Some(self.cpu.id()))?;
        self.host.remove(service_id)
    }

    fn send_event(&self, service_id: ServiceId, msg: Message) {
        self.host.send_event(service_id, msg);
    }

    fn host(&self) -> &Arc<ServiceHost> {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfw::service::{ShutdownReply, ShutdownToken};
    use crate::clock::ManualClock;
    use crate::queue::{Queue, QueueItem};
    use crate::shared::SharedData;
    use alloc::vec::Vec;

    struct Fixture {
        manager: Arc<ServiceManager>,
        xloop: Xloop,
        clock: Arc<ManualClock>,
        client_q: Arc<Queue>,
        client: PortId,
    }

    fn fixture(config: CfwConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let cpu = Cpu::new(CpuId(0), Arc::new(SharedData::new()));
        let xloop = Xloop::new(cpu.clone(), Arc::new(Queue::new()), clock.clone());
        let manager = ServiceManager::new(xloop.clone(), config).unwrap();
        let client_q = Arc::new(Queue::new());
        let client = cpu.port_alloc(client_q.clone());
        Fixture {
            manager,
            xloop,
            clock,
            client_q,
            client,
        }
    }

    fn drain(q: &Queue) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(item) = q.pop() {
            if let QueueItem::Message(m) = item {
                out.push(m);
            }
        }
        out
    }

    struct Quiet;
    impl Service for Quiet {}

    struct Silent;
    impl Service for Silent {
        fn shutdown_request(&self, token: ShutdownToken) -> ShutdownReply {
            core::mem::forget(token);
            ShutdownReply::Pending
        }
    }

    fn service_port(f: &Fixture) -> PortId {
        f.xloop.cpu().port_alloc(Arc::new(Queue::new()))
    }

    #[test]
    fn manager_port_is_published() {
        let f = fixture(CfwConfig::default());
        let shared = f.xloop.cpu().shared();
        assert!(shared.cfw_ready());
        assert_eq!(shared.service_manager_port(), f.manager.port());
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_first() {
        let f = fixture(CfwConfig::default());
        let p1 = service_port(&f);
        let p2 = service_port(&f);
        f.manager.register_service(ServiceId(10), p1, Arc::new(Quiet)).unwrap();
        assert_eq!(
            f.manager.register_service(ServiceId(10), p2, Arc::new(Quiet)),
            Err(RegisterError::Duplicate(ServiceId(10)))
        );
        assert_eq!(f.manager.lookup(ServiceId(10)).map(|e| e.port), Some(p1));
        assert_eq!(f.manager.service_count(), 1);
    }

    #[test]
    fn sync_requests_update_tables() {
        let f = fixture(CfwConfig::default());
        let m = &f.manager;
        let port = m.handle_sync_request(IpcRequest::new(IpcRequestCode::AllocPort, CpuId(1), 0, 0));
        assert!(port > 0);
        let port = PortId(port as u16);
        assert_eq!(f.xloop.cpu().port_cpu(port), Some(CpuId(1)));

        let proxy = IpcRequest::new(IpcRequestCode::RegisterProxy, CpuId(1), port.0 as u32, 0);
        assert_eq!(m.handle_sync_request(proxy), 0);
        assert_eq!(m.proxy(CpuId(1)), Some(port));

        let reg = IpcRequest::new(IpcRequestCode::RegisterService, CpuId(1), 11, port.0 as u32);
        assert_eq!(m.handle_sync_request(reg), 0);
        assert_eq!(m.handle_sync_request(reg), -1);
        assert_eq!(m.lookup(ServiceId(11)).map(|e| e.cpu), Some(CpuId(1)));

        let wrong_owner = IpcRequest::new(IpcRequestCode::DeregisterService, CpuId(0), 11, 0);
        assert_eq!(m.handle_sync_request(wrong_owner), -1);
        let dereg = IpcRequest::new(IpcRequestCode::DeregisterService, CpuId(1), 11, 0);
        assert_eq!(m.handle_sync_request(dereg), 0);
        assert!(m.lookup(ServiceId(11)).is_none());
    }

    #[test]
    fn listener_fires_once_after_registration() {
        let f = fixture(CfwConfig::default());
        let req = SvcAvailReq {
            service_id: ServiceId(10),
        }
        .to_message()
        .to_port(f.manager.port())
        .from_port(f.client)
        .priv_token(42);
        f.xloop.cpu().send_message(req).unwrap();
        f.xloop.run_until_idle();
        let msgs = drain(&f.client_q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id(), msg_id::REGISTER_SVC_AVAIL_EVT_RSP);
        assert_eq!(f.manager.pending_listeners(), 1);

        let p = service_port(&f);
        f.manager.register_service(ServiceId(10), p, Arc::new(Quiet)).unwrap();
        // notification is asynchronous
        assert!(f.client_q.is_empty());
        f.xloop.run_until_idle();
        let msgs = drain(&f.client_q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id(), msg_id::SVC_AVAIL_EVT);
        assert_eq!(msgs[0].priv_token, 42);
        assert_eq!(f.manager.pending_listeners(), 0);

        f.manager.unregister_service(ServiceId(10)).unwrap();
        f.manager.register_service(ServiceId(10), p, Arc::new(Quiet)).unwrap();
        f.xloop.run_until_idle();
        assert!(f.client_q.is_empty());
    }

    #[test]
    fn listener_on_registered_service_fires_immediately() {
        let f = fixture(CfwConfig::default());
        let p = service_port(&f);
        f.manager.register_service(ServiceId(10), p, Arc::new(Quiet)).unwrap();
        f.xloop.run_until_idle();
        let req = SvcAvailReq {
            service_id: ServiceId(10),
        }
        .to_message()
        .to_port(f.manager.port())
        .from_port(f.client);
        f.xloop.cpu().send_message(req).unwrap();
        f.xloop.run_until_idle();
        let ids: Vec<_> = drain(&f.client_q).iter().map(Message::id).collect();
        assert_eq!(ids, [msg_id::REGISTER_SVC_AVAIL_EVT_RSP, msg_id::SVC_AVAIL_EVT]);
        assert_eq!(f.manager.pending_listeners(), 0);
    }

    #[test]
    fn open_of_unknown_service_gets_error_response() {
        let f = fixture(CfwConfig::default());
        let req = crate::cfw::proto::OpenServiceReq {
            service_id: ServiceId(77),
            client_handle: 0,
        }
        .to_message()
        .to_port(f.manager.port())
        .from_port(f.client);
        f.xloop.cpu().send_message(req).unwrap();
        f.xloop.run_until_idle();
        let msgs = drain(&f.client_q);
        let rsp = OpenServiceRsp::from_message(&msgs[0]).unwrap();
        assert_eq!(rsp.status, Status::UnknownService);
    }

    #[test]
    fn shutdown_visits_services_newest_first_and_completes_once() {
        let f = fixture(CfwConfig::default());
        for id in [10, 11, 12] {
            let p = service_port(&f);
            f.manager.register_service(ServiceId(id), p, Arc::new(Quiet)).unwrap();
        }
        let done = Arc::new(Mutex::new(Vec::new()));
        let d = done.clone();
        f.manager
            .on_shutdown_complete(Box::new(move |status| d.lock().push(status)));
        let req = Message::alloc(msg_id::SHUTDOWN_REQ, 0)
            .to_port(f.manager.port())
            .from_port(f.client)
            .priv_token(9);
        f.xloop.cpu().send_message(req).unwrap();
        f.xloop.run_until_idle();

        assert_eq!(*done.lock(), [Status::Ok]);
        assert_eq!(f.manager.service_count(), 0);
        assert!(!f.manager.is_shutting_down());
        let msgs = drain(&f.client_q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id(), msg_id::SHUTDOWN_RSP);
        assert_eq!(msgs[0].priv_token, 9);
    }

    #[test]
    fn silent_service_times_out_and_sequence_continues() {
        let f = fixture(CfwConfig::default().with_shutdown_timeout(Some(50)));
        let p = service_port(&f);
        f.manager.register_service(ServiceId(10), p, Arc::new(Quiet)).unwrap();
        let p = service_port(&f);
        f.manager.register_service(ServiceId(11), p, Arc::new(Silent)).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let d = done.clone();
        f.manager
            .on_shutdown_complete(Box::new(move |status| d.lock().push(status)));

        f.manager.begin_shutdown(None).unwrap();
        f.xloop.run_until_idle();
        assert!(f.manager.is_shutting_down());
        assert!(done.lock().is_empty());

        // a second request while running is refused
        assert!(f.manager.begin_shutdown(None).is_err());

        f.clock.set(50);
        f.xloop.run_until_idle();
        f.xloop.run_until_idle();
        assert_eq!(*done.lock(), [Status::Timeout]);
        assert!(f.manager.lookup(ServiceId(10)).is_none());
    }

    #[test]
    fn stray_shutdown_response_keeps_registered_service() {
        let f = fixture(CfwConfig::default());
        let p = service_port(&f);
        f.manager.register_service(ServiceId(10), p, Arc::new(Quiet)).unwrap();
        for status in [Status::Ok, Status::UnknownService] {
            let rsp = SvcShutdownRsp {
                service_id: ServiceId(10),
                status,
            }
            .to_message()
            .typed(MsgType::Rsp)
            .to_port(f.manager.port())
            .from_port(p);
            f.xloop.cpu().send_message(rsp).unwrap();
            f.xloop.run_until_idle();
        }
        let entry = f.manager.lookup(ServiceId(10)).unwrap();
        assert_eq!(entry.state, ServiceState::Registered);
        assert_eq!(f.manager.service_count(), 1);
    }

    #[test]
    fn timed_out_service_answers_busy_on_second_shutdown() {
        let f = fixture(CfwConfig::default().with_shutdown_timeout(Some(50)));
        let p = service_port(&f);
        f.manager.register_service(ServiceId(11), p, Arc::new(Silent)).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let d = done.clone();
        f.manager
            .on_shutdown_complete(Box::new(move |status| d.lock().push(status)));

        f.manager.begin_shutdown(None).unwrap();
        f.xloop.run_until_idle();
        f.clock.set(50);
        f.xloop.run_until_idle();
        assert_eq!(*done.lock(), [Status::Timeout]);

        // no clock movement: the busy reply ends the second run
        let d = done.clone();
        f.manager
            .on_shutdown_complete(Box::new(move |status| d.lock().push(status)));
        f.manager.begin_shutdown(None).unwrap();
        f.xloop.run_until_idle();
        assert_eq!(*done.lock(), [Status::Timeout, Status::Timeout]);
        assert!(!f.manager.is_shutting_down());
        let entry = f.manager.lookup(ServiceId(11)).unwrap();
        assert_eq!(entry.state, ServiceState::ShuttingDown);
    }
}
