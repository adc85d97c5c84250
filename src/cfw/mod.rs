//! Component framework
//!
//! Services register with the service manager on the master core and clients
//! reach them through it:
//! - [`manager::ServiceManager`] (master) owns the authoritative registry, the
//!   availability listeners and the shutdown sequence,
//! - [`proxy::ServiceProxy`] (each slave) hosts the services living on that
//!   core and receives the requests the master forwards to them,
//! - [`host::ServiceHost`] is the per-core connection and event bookkeeping
//!   both of them share,
//! - [`client::Client`] is the requesting side.

pub mod client;
pub mod host;
pub mod manager;
pub mod proto;
pub mod proxy;
pub mod registry;
pub mod service;

pub use client::{Client, ServiceConnection};
pub use host::ServiceHost;
pub use manager::ServiceManager;
pub use proxy::ServiceProxy;
pub use service::{ConnInfo, Service, ServiceState, ShutdownReply, ShutdownToken};

use alloc::sync::Arc;
use core::fmt;

use crate::error::{RegisterError, WireError};
use crate::message::Message;
use crate::types::{MsgId, PortId, ServiceId};

// ============================================================================
// Message ids
// ============================================================================

/// Framework message ids. Responses are `request + 0x40`, framework events
/// live at `0xFF80` and up.
pub mod msg_id {
    use crate::types::MsgId;

    pub const CFW_REQ_BASE: MsgId = 0xFF00;
    pub const CFW_RSP_BASE: MsgId = 0xFF40;
    pub const CFW_EVT_BASE: MsgId = 0xFF80;

    pub const OPEN_SERVICE_REQ: MsgId = CFW_REQ_BASE + 0x01;
    pub const CLOSE_SERVICE_REQ: MsgId = CFW_REQ_BASE + 0x02;
    pub const REGISTER_EVT_REQ: MsgId = CFW_REQ_BASE + 0x03;
    pub const REGISTER_SVC_AVAIL_EVT_REQ: MsgId = CFW_REQ_BASE + 0x04;
    pub const SHUTDOWN_REQ: MsgId = CFW_REQ_BASE + 0x05;
    pub const SVC_SHUTDOWN_REQ: MsgId = CFW_REQ_BASE + 0x06;

    pub const OPEN_SERVICE_RSP: MsgId = CFW_RSP_BASE + 0x01;
    pub const CLOSE_SERVICE_RSP: MsgId = CFW_RSP_BASE + 0x02;
    pub const REGISTER_EVT_RSP: MsgId = CFW_RSP_BASE + 0x03;
    pub const REGISTER_SVC_AVAIL_EVT_RSP: MsgId = CFW_RSP_BASE + 0x04;
    pub const SHUTDOWN_RSP: MsgId = CFW_RSP_BASE + 0x05;
    pub const SVC_SHUTDOWN_RSP: MsgId = CFW_RSP_BASE + 0x06;

    pub const SVC_AVAIL_EVT: MsgId = CFW_EVT_BASE + 0x01;

    /// Response id of a framework request
    pub const fn response_of(req: MsgId) -> MsgId {
        req + (CFW_RSP_BASE - CFW_REQ_BASE)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Status carried by framework responses
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok = 0,
    Error = -1,
    UnknownService = -2,
    Timeout = -3,
    Overflow = -4,
    Busy = -5,
    NotConnected = -6,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn from_i32(code: i32) -> Result<Self, WireError> {
        Ok(match code {
            0 => Status::Ok,
            -1 => Status::Error,
            -2 => Status::UnknownService,
            -3 => Status::Timeout,
            -4 => Status::Overflow,
            -5 => Status::Busy,
            -6 => Status::NotConnected,
            other => return Err(WireError::InvalidStatus(other)),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::UnknownService => "unknown service",
            Status::Timeout => "timeout",
            Status::Overflow => "overflow",
            Status::Busy => "busy",
            Status::NotConnected => "not connected",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Registration surface of the service manager and the slave proxies
///
/// Service code registers through the broker of the core it runs on without
/// caring whether that core is the master.
pub trait ServiceBroker: Send + Sync {
    /// Register `service`, reachable on `port`
    fn register_service(
        &self,
        service_id: ServiceId,
        port: PortId,
        service: Arc<dyn Service>,
    ) -> Result<(), RegisterError>;

    /// Remove a service, closing its connections
    fn unregister_service(&self, service_id: ServiceId) -> Result<(), RegisterError>;

    /// Send `msg` to every client subscribed to its id on `service_id`
    fn send_event(&self, service_id: ServiceId, msg: Message);

    /// Host of the services living on this core
    fn host(&self) -> &Arc<ServiceHost>;
}

/// Whether `id` belongs to the framework range
pub fn is_cfw_message(id: MsgId) -> bool {
    id >= msg_id::CFW_REQ_BASE
}
