//! Client side of the framework
//!
//! A [`Client`] owns a port on the loop it runs on. Framework requests go to
//! the service manager; responses and events come back to the client port
//! and are matched by the caller through the `priv` token and `conn` field.
//!
//! Tokens with the top bit set are reserved for [`Client::open_service_helper`].

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};
use spin::Mutex;

use super::msg_id;
use super::proto::{
    CloseServiceReq, FixedPayload, OpenServiceReq, OpenServiceRsp, Payload, RegisterEvtReq,
    StatusRsp, SvcAvailReq,
};
use super::Status;
use crate::cpu::Cpu;
use crate::error::PortError;
use crate::message::{Message, MsgType};
use crate::port::MessageHandler;
use crate::types::{ConnId, CpuId, MsgId, PortId, ServiceId};
use crate::xloop::Xloop;

const HELPER_TOKEN: u32 = 1 << 31;

/// An open connection to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConnection {
    pub service_id: ServiceId,
    /// Port of the service, for service-specific requests
    pub port: PortId,
    pub cpu: CpuId,
    pub server_handle: ConnId,
}

impl ServiceConnection {
    /// Extract the connection from an `OPEN_SERVICE_RSP`
    pub fn from_open_rsp(msg: &Message) -> Result<Self, Status> {
        let rsp = OpenServiceRsp::from_message(msg).map_err(|_| Status::Error)?;
        if !rsp.status.is_ok() {
            return Err(rsp.status);
        }
        Ok(Self {
            service_id: rsp.service_id,
            port: rsp.port,
            cpu: rsp.cpu,
            server_handle: rsp.server_handle,
        })
    }
}

/// Result callback of [`Client::open_service_helper`]
pub type OpenCallback = Box<dyn FnOnce(Result<ServiceConnection, Status>) + Send>;

enum Stage {
    WaitAvail,
    WaitOpen,
    WaitEvents(ServiceConnection),
}

enum Step {
    AvailAck,
    Available,
    Opened,
    Subscribed(ServiceConnection),
    Unexpected,
}

struct Helper {
    service_id: ServiceId,
    client_handle: u32,
    events: Vec<MsgId>,
    stage: Stage,
    callback: OpenCallback,
}

/// Requesting endpoint
pub struct Client {
    cpu: Arc<Cpu>,
    port: PortId,
    handler: Arc<dyn MessageHandler>,
    helpers: Mutex<BTreeMap<u32, Helper>>,
    next_helper: AtomicU32,
}

impl Client {
    /// Create a client on `xloop`; messages not consumed by a helper go to
    /// `handler`
    pub fn new(xloop: &Xloop, handler: Arc<dyn MessageHandler>) -> Result<Arc<Self>, PortError> {
        let cpu = xloop.cpu().clone();
        let port = cpu.try_port_alloc(xloop.queue().clone())?;
        let client = Arc::new(Self {
            cpu: cpu.clone(),
            port,
            handler,
            helpers: Mutex::new(BTreeMap::new()),
            next_helper: AtomicU32::new(1),
        });
        cpu.port_set_handler(port, client.clone())?;
        Ok(client)
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    fn to_manager(&self, msg: Message) -> Result<(), PortError> {
        let manager = self.cpu.shared().service_manager_port();
        self.cpu
            .send_message(msg.to_port(manager).from_port(self.port))
    }

    /// Ask for a connection; the answer is an `OPEN_SERVICE_RSP`
    pub fn open_service(
        &self,
        service_id: ServiceId,
        client_handle: u32,
        priv_token: u32,
    ) -> Result<(), PortError> {
        let req = OpenServiceReq {
            service_id,
            client_handle,
        };
        self.to_manager(req.to_message().priv_token(priv_token))
    }

    /// Close a connection; the answer is a `CLOSE_SERVICE_RSP`
    pub fn close_service(&self, conn: &ServiceConnection, priv_token: u32) -> Result<(), PortError> {
        let req = CloseServiceReq {
            service_id: conn.service_id,
        };
        self.to_manager(
            req.to_message()
                .conn(conn.server_handle.0)
                .priv_token(priv_token),
        )
    }

    /// Subscribe to events of a connected service
    pub fn register_events(
        &self,
        conn: &ServiceConnection,
        events: &[MsgId],
        priv_token: u32,
    ) -> Result<(), PortError> {
        let req = RegisterEvtReq {
            service_id: conn.service_id,
            events: events.to_vec(),
        };
        self.to_manager(
            req.try_to_message()?
                .conn(conn.server_handle.0)
                .priv_token(priv_token),
        )
    }

    /// Ask for an `SVC_AVAIL_EVT` once `service_id` is registered
    pub fn register_svc_available(
        &self,
        service_id: ServiceId,
        priv_token: u32,
    ) -> Result<(), PortError> {
        self.to_manager(SvcAvailReq { service_id }.to_message().priv_token(priv_token))
    }

    /// Ask the manager to shut the platform services down
    pub fn request_shutdown(&self, priv_token: u32) -> Result<(), PortError> {
        self.to_manager(Message::alloc(msg_id::SHUTDOWN_REQ, 0).priv_token(priv_token))
    }

    /// Send a service-specific request over a connection
    pub fn send_request(&self, conn: &ServiceConnection, msg: Message) -> Result<(), PortError> {
        self.cpu.send_message(
            msg.typed(MsgType::Req)
                .to_port(conn.port)
                .from_port(self.port)
                .conn(conn.server_handle.0),
        )
    }

    /// Wait for `service_id` to be available, open it, subscribe to
    /// `events` (if any) and report the outcome once through `callback`
    pub fn open_service_helper(
        &self,
        service_id: ServiceId,
        events: &[MsgId],
        client_handle: u32,
        callback: OpenCallback,
    ) -> Result<(), PortError> {
        RegisterEvtReq::check_count(events.len())?;
        let token = HELPER_TOKEN | (self.next_helper.fetch_add(1, Ordering::Relaxed) & !HELPER_TOKEN);
        self.helpers.lock().insert(
            token,
            Helper {
                service_id,
                client_handle,
                events: events.to_vec(),
                stage: Stage::WaitAvail,
                callback,
            },
        );
        let sent = self.register_svc_available(service_id, token);
        if sent.is_err() {
            self.helpers.lock().remove(&token);
        }
        sent
    }

    /// Helpers still waiting for an answer
    pub fn pending_helpers(&self) -> usize {
        self.helpers.lock().len()
    }

    fn park(&self, token: u32, helper: Helper) {
        self.helpers.lock().insert(token, helper);
    }

    fn status_of(msg: &Message) -> Status {
        StatusRsp::from_message(msg).map_or(Status::Error, |s| s.status)
    }

    fn advance(&self, token: u32, mut helper: Helper, msg: Message) {
        let step = match (&helper.stage, msg.id()) {
            (Stage::WaitAvail, msg_id::REGISTER_SVC_AVAIL_EVT_RSP) => Step::AvailAck,
            (Stage::WaitAvail, msg_id::SVC_AVAIL_EVT) => Step::Available,
            (Stage::WaitOpen, msg_id::OPEN_SERVICE_RSP) => Step::Opened,
            (Stage::WaitEvents(conn), msg_id::REGISTER_EVT_RSP) => Step::Subscribed(*conn),
            _ => Step::Unexpected,
        };
        match step {
            Step::AvailAck => {
                let status = Self::status_of(&msg);
                self.cpu.free_message(msg);
                if status.is_ok() {
                    self.park(token, helper);
                } else {
                    (helper.callback)(Err(status));
                }
            }
            Step::Available => {
                self.cpu.free_message(msg);
                let req = OpenServiceReq {
                    service_id: helper.service_id,
                    client_handle: helper.client_handle,
                };
                helper.stage = Stage::WaitOpen;
                self.park(token, helper);
                self.send_step(token, req.to_message());
            }
            Step::Opened => {
                let conn = ServiceConnection::from_open_rsp(&msg);
                self.cpu.free_message(msg);
                match conn {
                    Ok(conn) if !helper.events.is_empty() => {
                        let req = RegisterEvtReq {
                            service_id: conn.service_id,
                            events: core::mem::take(&mut helper.events),
                        };
                        match req.try_to_message() {
                            Ok(msg) => {
                                helper.stage = Stage::WaitEvents(conn);
                                self.park(token, helper);
                                self.send_step(token, msg.conn(conn.server_handle.0));
                            }
                            Err(e) => {
                                warn!("helper {:#x}: cannot subscribe: {}", token, e);
                                (helper.callback)(Err(Status::Overflow));
                            }
                        }
                    }
                    result => (helper.callback)(result),
                }
            }
            Step::Subscribed(conn) => {
                let status = Self::status_of(&msg);
                self.cpu.free_message(msg);
                if status.is_ok() {
                    (helper.callback)(Ok(conn));
                } else {
                    (helper.callback)(Err(status));
                }
            }
            Step::Unexpected => {
                debug!("helper {:#x}: ignoring {:#x}", token, msg.id());
                self.park(token, helper);
                self.cpu.free_message(msg);
            }
        }
    }

    fn send_step(&self, token: u32, msg: Message) {
        if let Err(e) = self.to_manager(msg.priv_token(token)) {
            warn!("helper {:#x}: request failed: {}", token, e);
            let helper = self.helpers.lock().remove(&token);
            if let Some(helper) = helper {
                (helper.callback)(Err(Status::Error));
            }
        }
    }
}

impl MessageHandler for Client {
    fn handle_message(&self, msg: Message) {
        if msg.priv_token & HELPER_TOKEN != 0 {
            let helper = self.helpers.lock().remove(&msg.priv_token);
            if let Some(helper) = helper {
                self.advance(msg.priv_token, helper, msg);
                return;
            }
        }
        self.handler.handle_message(msg);
    }
}
