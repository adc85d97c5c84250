//! Service callbacks and lifecycle types

use alloc::boxed::Box;
use alloc::sync::Weak;
use core::any::Any;

use super::host::ServiceHost;
use crate::types::{ConnId, MsgId, PortId, ServiceId};

/// Per-connection data owned by the service
pub type ConnPriv = Box<dyn Any + Send>;

/// Lifecycle of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Unregistered,
    Registered,
    ShuttingDown,
}

/// What the framework knows about one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    /// Server-side handle
    pub id: ConnId,
    pub service_id: ServiceId,
    /// Port events and responses go to
    pub client_port: PortId,
    /// Client-side handle put in `conn` of events
    pub client_handle: u32,
}

/// Answer of a service to a shutdown request
#[derive(Debug)]
pub enum ShutdownReply {
    /// Shutdown finished synchronously
    Done,
    /// The service completes the token once it is done
    Pending,
}

/// Completion token of a pending service shutdown
#[derive(Debug)]
pub struct ShutdownToken {
    service_id: ServiceId,
    host: Weak<ServiceHost>,
}

impl ShutdownToken {
    pub(crate) fn new(service_id: ServiceId, host: Weak<ServiceHost>) -> Self {
        Self { service_id, host }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Report the shutdown as finished
    pub fn complete(self) {
        if let Some(host) = self.host.upgrade() {
            host.complete_shutdown(self.service_id);
        }
    }
}

/// Callbacks of a service
///
/// Every method has a default so a service implements only what it needs.
/// Callbacks run on the loop of the core hosting the service, never with a
/// framework lock held.
pub trait Service: Send + Sync {
    /// A client opened a connection; the returned value is kept with the
    /// connection and handed back on disconnect
    fn client_connected(&self, _conn: &ConnInfo) -> Option<ConnPriv> {
        None
    }

    /// A connection was closed
    fn client_disconnected(&self, _conn: &ConnInfo, _priv_data: Option<ConnPriv>) {}

    /// A connection subscribed to `events`
    fn registered_events_changed(&self, _conn: &ConnInfo, _events: &[MsgId]) {}

    /// The platform is shutting down
    fn shutdown_request(&self, _token: ShutdownToken) -> ShutdownReply {
        ShutdownReply::Done
    }
}
