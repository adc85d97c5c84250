//! Per-core service host
//!
//! Keeps the services living on one core, their client connections and the
//! event subscription lists. The master's service manager and every slave
//! proxy own one host and hand it the requests that target local services.
//!
//! Service callbacks are always invoked after the host lock is released, so
//! a callback may call back into the host.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info, warn};
use spin::Mutex;

use super::msg_id;
use super::proto::{
    CloseServiceReq, FixedPayload, OpenServiceReq, OpenServiceRsp, Payload, RegisterEvtReq,
    StatusRsp, SvcShutdownReq, SvcShutdownRsp,
};
use super::service::{ConnInfo, ConnPriv, Service, ServiceState, ShutdownReply, ShutdownToken};
use super::Status;
use crate::cpu::Cpu;
use crate::error::RegisterError;
use crate::message::{Message, MsgType};
use crate::types::{ConnId, MsgId, PortId, ServiceId};

struct HostedService {
    port: PortId,
    service: Arc<dyn Service>,
    state: ServiceState,
    deferred: VecDeque<Message>,
}

struct Connection {
    info: ConnInfo,
    priv_data: Option<ConnPriv>,
}

#[derive(Default)]
struct HostState {
    services: BTreeMap<ServiceId, HostedService>,
    connections: BTreeMap<ConnId, Connection>,
    /// Subscribers per (service, event id), in subscription order
    events: BTreeMap<(ServiceId, MsgId), Vec<ConnId>>,
}

impl HostState {
    /// Remove a connection and every subscription it holds
    fn detach(&mut self, conn: ConnId) -> Option<Connection> {
        let removed = self.connections.remove(&conn)?;
        self.events.retain(|_, subs| {
            subs.retain(|c| *c != conn);
            !subs.is_empty()
        });
        Some(removed)
    }
}

/// Services, connections and subscriptions of one core
pub struct ServiceHost {
    cpu: Arc<Cpu>,
    me: Weak<ServiceHost>,
    state: Mutex<HostState>,
    next_conn: AtomicU32,
}

impl ServiceHost {
    pub fn new(cpu: Arc<Cpu>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            cpu,
            me: me.clone(),
            state: Mutex::new(HostState::default()),
            next_conn: AtomicU32::new(1),
        })
    }

    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Host a service reachable on `port`
    pub fn add(
        &self,
        service_id: ServiceId,
        port: PortId,
        service: Arc<dyn Service>,
    ) -> Result<(), RegisterError> {
        let mut st = self.state.lock();
        if st.services.contains_key(&service_id) {
            warn!("{}: {} already hosted", self.cpu.id(), service_id);
            return Err(RegisterError::Duplicate(service_id));
        }
        st.services.insert(
            service_id,
            HostedService {
                port,
                service,
                state: ServiceState::Registered,
                deferred: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Stop hosting a service; its connections are closed and its deferred
    /// messages released
    pub fn remove(&self, service_id: ServiceId) -> Result<(), RegisterError> {
        let (hosted, closed) = {
            let mut st = self.state.lock();
            let hosted = st
                .services
                .remove(&service_id)
                .ok_or(RegisterError::NotRegistered(service_id))?;
            let conns: Vec<ConnId> = st
                .connections
                .values()
                .filter(|c| c.info.service_id == service_id)
                .map(|c| c.info.id)
                .collect();
            let closed: Vec<Connection> = conns.into_iter().filter_map(|c| st.detach(c)).collect();
            (hosted, closed)
        };
        for conn in closed {
            hosted
                .service
                .client_disconnected(&conn.info, conn.priv_data);
        }
        for msg in hosted.deferred {
            self.cpu.free_message(msg);
        }
        info!("{}: {} removed", self.cpu.id(), service_id);
        Ok(())
    }

    pub fn contains(&self, service_id: ServiceId) -> bool {
        self.state.lock().services.contains_key(&service_id)
    }

    pub fn service_port(&self, service_id: ServiceId) -> Option<PortId> {
        self.state.lock().services.get(&service_id).map(|s| s.port)
    }

    pub fn state_of(&self, service_id: ServiceId) -> ServiceState {
        self.state
            .lock()
            .services
            .get(&service_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Ids of the hosted services
    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.state.lock().services.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Connection details of a server handle
    pub fn connection(&self, conn: ConnId) -> Option<ConnInfo> {
        self.state.lock().connections.get(&conn).map(|c| c.info)
    }

    /// Run `f` on a connection and its private data. The host lock is held
    /// while `f` runs.
    pub fn with_connection<R>(
        &self,
        conn: ConnId,
        f: impl FnOnce(&ConnInfo, Option<&mut (dyn Any + Send)>) -> R,
    ) -> Option<R> {
        let mut st = self.state.lock();
        let c = st.connections.get_mut(&conn)?;
        Some(f(&c.info, c.priv_data.as_deref_mut()))
    }

    /// Number of connections subscribed to `event` of `service_id`
    pub fn subscribers(&self, service_id: ServiceId, event: MsgId) -> usize {
        self.state
            .lock()
            .events
            .get(&(service_id, event))
            .map_or(0, Vec::len)
    }

    // ========================================================================
    // Deferred messages
    // ========================================================================

    /// Park a message until [`Self::resume_deferred`]; an unknown service
    /// hands it back
    pub fn defer(&self, service_id: ServiceId, msg: Message) -> Result<(), Message> {
        match self.state.lock().services.get_mut(&service_id) {
            Some(s) => {
                s.deferred.push_back(msg);
                Ok(())
            }
            None => Err(msg),
        }
    }

    /// Re-post every parked message of a service in arrival order
    pub fn resume_deferred(&self, service_id: ServiceId) -> usize {
        let parked = match self.state.lock().services.get_mut(&service_id) {
            Some(s) => core::mem::take(&mut s.deferred),
            None => return 0,
        };
        let count = parked.len();
        for msg in parked {
            let _ = self.cpu.send_message(msg);
        }
        count
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn reply(&self, rsp: Message) {
        let _ = self.cpu.send_message(rsp);
    }

    /// Handle a framework request targeting a hosted service
    pub fn handle_request(&self, msg: Message) {
        match msg.id() {
            msg_id::OPEN_SERVICE_REQ => self.handle_open(msg),
            msg_id::CLOSE_SERVICE_REQ => self.handle_close(msg),
            msg_id::REGISTER_EVT_REQ => self.handle_register_events(msg),
            msg_id::SVC_SHUTDOWN_REQ => self.handle_svc_shutdown(msg),
            other => {
                warn!("{}: unexpected request {:#x}", self.cpu.id(), other);
                self.cpu.free_message(msg);
            }
        }
    }

    fn handle_open(&self, msg: Message) {
        let req = match OpenServiceReq::from_message(&msg) {
            Ok(req) => req,
            Err(e) => {
                warn!("{}: malformed open request: {}", self.cpu.id(), e);
                self.reply(OpenServiceRsp::failed(ServiceId(0), Status::Error).respond_to(&msg));
                self.cpu.free_message(msg);
                return;
            }
        };

        let target = self
            .state
            .lock()
            .services
            .get(&req.service_id)
            .map(|s| (s.port, s.state, s.service.clone()));
        let (port, service) = match target {
            Some((port, ServiceState::Registered, service)) => (port, service),
            Some(_) => {
                self.reply(OpenServiceRsp::failed(req.service_id, Status::Busy).respond_to(&msg));
                self.cpu.free_message(msg);
                return;
            }
            None => {
                self.reply(
                    OpenServiceRsp::failed(req.service_id, Status::UnknownService)
                        .respond_to(&msg),
                );
                self.cpu.free_message(msg);
                return;
            }
        };

        let info = ConnInfo {
            id: ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed)),
            service_id: req.service_id,
            client_port: msg.src(),
            client_handle: req.client_handle,
        };
        self.state.lock().connections.insert(
            info.id,
            Connection {
                info,
                priv_data: None,
            },
        );
        if let Some(data) = service.client_connected(&info) {
            if let Some(conn) = self.state.lock().connections.get_mut(&info.id) {
                conn.priv_data = Some(data);
            }
        }
        debug!(
            "{}: {} opened {} from {}",
            self.cpu.id(),
            info.id.0,
            req.service_id,
            info.client_port
        );

        let rsp = OpenServiceRsp {
            status: Status::Ok,
            service_id: req.service_id,
            port,
            cpu: self.cpu.id(),
            server_handle: info.id,
        };
        self.reply(rsp.respond_to(&msg));
        self.cpu.free_message(msg);
    }

    fn handle_close(&self, msg: Message) {
        let status = match CloseServiceReq::from_message(&msg) {
            Ok(req) => self.close_connection(req.service_id, ConnId(msg.conn)),
            Err(e) => {
                warn!("{}: malformed close request: {}", self.cpu.id(), e);
                Status::Error
            }
        };
        self.reply(StatusRsp::new(status).respond(&msg, msg_id::CLOSE_SERVICE_RSP));
        self.cpu.free_message(msg);
    }

    fn close_connection(&self, service_id: ServiceId, conn: ConnId) -> Status {
        let closed = {
            let mut st = self.state.lock();
            let owned = st
                .connections
                .get(&conn)
                .is_some_and(|c| c.info.service_id == service_id);
            let service = st.services.get(&service_id).map(|s| s.service.clone());
            match (owned, service) {
                (true, Some(service)) => st.detach(conn).map(|c| (c, service)),
                _ => None,
            }
        };
        match closed {
            Some((conn, service)) => {
                service.client_disconnected(&conn.info, conn.priv_data);
                debug!("{}: closed {} on {}", self.cpu.id(), conn.info.id.0, service_id);
                Status::Ok
            }
            None => {
                warn!("{}: close of unknown connection {}", self.cpu.id(), conn.0);
                Status::NotConnected
            }
        }
    }

    fn handle_register_events(&self, msg: Message) {
        let status = match RegisterEvtReq::from_message(&msg) {
            Ok(req) => self.register_events(ConnId(msg.conn), &req),
            Err(e) => {
                warn!("{}: malformed event registration: {}", self.cpu.id(), e);
                Status::Error
            }
        };
        self.reply(StatusRsp::new(status).respond(&msg, msg_id::REGISTER_EVT_RSP));
        self.cpu.free_message(msg);
    }

    fn register_events(&self, conn: ConnId, req: &RegisterEvtReq) -> Status {
        let target = {
            let mut st = self.state.lock();
            let info = match st.connections.get(&conn) {
                Some(c) if c.info.service_id == req.service_id => c.info,
                _ => return Status::NotConnected,
            };
            let Some(service) = st.services.get(&req.service_id).map(|s| s.service.clone())
            else {
                return Status::UnknownService;
            };
            for ev in &req.events {
                let subs = st.events.entry((req.service_id, *ev)).or_default();
                if subs.contains(&conn) {
                    debug!("{}: {:#x} already registered by {}", self.cpu.id(), ev, conn.0);
                } else {
                    subs.push(conn);
                }
            }
            (info, service)
        };
        let (info, service) = target;
        service.registered_events_changed(&info, &req.events);
        Status::Ok
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Send a copy of `msg` to every connection subscribed to its id on
    /// `service_id`, then release the original. Returns the number of copies.
    pub fn send_event(&self, service_id: ServiceId, msg: Message) -> usize {
        let (src, targets) = {
            let st = self.state.lock();
            let src = st
                .services
                .get(&service_id)
                .map_or(msg.src(), |s| s.port);
            let targets: Vec<ConnInfo> = st
                .events
                .get(&(service_id, msg.id()))
                .map(|subs| {
                    subs.iter()
                        .filter_map(|c| st.connections.get(c).map(|c| c.info))
                        .collect()
                })
                .unwrap_or_default();
            (src, targets)
        };
        for info in &targets {
            let copy = msg
                .clone()
                .typed(MsgType::Evt)
                .to_port(info.client_port)
                .from_port(src)
                .conn(info.client_handle);
            let _ = self.cpu.send_message(copy);
        }
        self.cpu.free_message(msg);
        targets.len()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    fn handle_svc_shutdown(&self, msg: Message) {
        let reply_src = msg.dst();
        let req = SvcShutdownReq::from_message(&msg);
        self.cpu.free_message(msg);
        match req {
            Ok(req) => self.begin_shutdown(req.service_id, reply_src),
            Err(e) => warn!("{}: malformed shutdown request: {}", self.cpu.id(), e),
        }
    }

    fn begin_shutdown(&self, service_id: ServiceId, reply_src: PortId) {
        let service = {
            let mut st = self.state.lock();
            match st.services.get_mut(&service_id) {
                Some(s) if s.state == ServiceState::Registered => {
                    s.state = ServiceState::ShuttingDown;
                    Ok(s.service.clone())
                }
                Some(_) => Err(Status::Busy),
                None => Err(Status::UnknownService),
            }
        };
        let service = match service {
            Ok(service) => service,
            Err(status) => {
                warn!("{}: cannot shut down {}: {}", self.cpu.id(), service_id, status);
                self.send_shutdown_rsp(service_id, status, reply_src);
                return;
            }
        };
        info!("{}: shutting down {}", self.cpu.id(), service_id);
        match service.shutdown_request(ShutdownToken::new(service_id, self.me.clone())) {
            ShutdownReply::Done => self.complete_shutdown(service_id),
            ShutdownReply::Pending => debug!("{}: {} shutdown pending", self.cpu.id(), service_id),
        }
    }

    /// Finish the shutdown of a service: it is removed and the manager told
    pub fn complete_shutdown(&self, service_id: ServiceId) {
        let port = match self.state.lock().services.get(&service_id) {
            Some(s) if s.state == ServiceState::ShuttingDown => s.port,
            _ => {
                warn!("{}: spurious shutdown completion for {}", self.cpu.id(), service_id);
                return;
            }
        };
        let _ = self.remove(service_id);
        self.send_shutdown_rsp(service_id, Status::Ok, port);
    }

    fn send_shutdown_rsp(&self, service_id: ServiceId, status: Status, src: PortId) {
        let manager = self.cpu.shared().service_manager_port();
        let rsp = SvcShutdownRsp { service_id, status }
            .to_message()
            .typed(MsgType::Rsp)
            .to_port(manager)
            .from_port(src);
        self.reply(rsp);
    }
}
