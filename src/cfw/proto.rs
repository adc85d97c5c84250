//! Framework message bodies
//!
//! Every body is a fixed little-endian layout following the message prefix.

use alloc::vec::Vec;

use super::msg_id;
use super::Status;
use crate::error::WireError;
use crate::message::{Message, MAX_BODY, PREFIX_SIZE};
use crate::types::{ConnId, CpuId, MsgId, PortId, ServiceId};
use crate::wire::{WireReader, WireWriter};

/// A typed message body with a fixed id
pub trait Payload: Sized {
    const ID: MsgId;

    fn encode(&self, w: &mut WireWriter<'_>);

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;

    /// Allocate a message carrying this body; a body that does not fit the
    /// length field is refused
    fn try_to_message(&self) -> Result<Message, WireError> {
        let mut body = Vec::new();
        self.encode(&mut WireWriter::new(&mut body));
        let mut msg = Message::alloc(Self::ID, 0);
        msg.set_body(body)?;
        Ok(msg)
    }

    /// Parse the body of `msg`
    fn from_message(msg: &Message) -> Result<Self, WireError> {
        Self::decode(&mut WireReader::new(msg.body()))
    }
}

/// A payload whose layout is a handful of fixed fields, so it always fits
pub trait FixedPayload: Payload {
    fn to_message(&self) -> Message {
        Message::with_body(Self::ID, &self.encoded())
    }

    /// Build the response to `req` carrying this body
    fn respond_to(&self, req: &Message) -> Message {
        Message::response_to(req, Self::ID, &self.encoded())
    }

    fn encoded(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode(&mut WireWriter::new(&mut body));
        body
    }
}

fn status(r: &mut WireReader<'_>) -> Result<Status, WireError> {
    Status::from_i32(r.i32()?)
}

/// Open a connection to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenServiceReq {
    pub service_id: ServiceId,
    /// Value the server puts in `conn` of the events it sends this client
    pub client_handle: u32,
}

impl FixedPayload for OpenServiceReq {}

impl Payload for OpenServiceReq {
    const ID: MsgId = msg_id::OPEN_SERVICE_REQ;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0).u32(self.client_handle);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_id: ServiceId(r.u16()?),
            client_handle: r.u32()?,
        })
    }
}

/// Result of an open request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenServiceRsp {
    pub status: Status,
    pub service_id: ServiceId,
    /// Port of the service
    pub port: PortId,
    /// Core hosting the service
    pub cpu: CpuId,
    /// Server-side connection handle, to be put in `conn` of later requests
    pub server_handle: ConnId,
}

impl OpenServiceRsp {
    pub fn failed(service_id: ServiceId, status: Status) -> Self {
        Self {
            status,
            service_id,
            port: PortId::NONE,
            cpu: CpuId::default(),
            server_handle: ConnId::NONE,
        }
    }
}

impl FixedPayload for OpenServiceRsp {}

impl Payload for OpenServiceRsp {
    const ID: MsgId = msg_id::OPEN_SERVICE_RSP;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.i32(self.status as i32)
            .u16(self.service_id.0)
            .u16(self.port.0)
            .u8(self.cpu.0)
            .u32(self.server_handle.0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            status: status(r)?,
            service_id: ServiceId(r.u16()?),
            port: PortId(r.u16()?),
            cpu: CpuId(r.u8()?),
            server_handle: ConnId(r.u32()?),
        })
    }
}

/// Close the connection named by the message's `conn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseServiceReq {
    pub service_id: ServiceId,
}

impl FixedPayload for CloseServiceReq {}

impl Payload for CloseServiceReq {
    const ID: MsgId = msg_id::CLOSE_SERVICE_REQ;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_id: ServiceId(r.u16()?),
        })
    }
}

/// Subscribe the connection named by `conn` to event ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEvtReq {
    pub service_id: ServiceId,
    pub events: Vec<MsgId>,
}

impl RegisterEvtReq {
    /// Most event ids one request can carry
    pub const MAX_EVENTS: usize = (MAX_BODY - 4) / 2;

    /// Refuse an event list one request cannot carry
    pub fn check_count(count: usize) -> Result<(), WireError> {
        if count > Self::MAX_EVENTS {
            return Err(WireError::TooLong(PREFIX_SIZE + 4 + 2 * count));
        }
        Ok(())
    }
}

impl Payload for RegisterEvtReq {
    const ID: MsgId = msg_id::REGISTER_EVT_REQ;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0).u16(self.events.len() as u16);
        for ev in &self.events {
            w.u16(*ev);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let service_id = ServiceId(r.u16()?);
        let count = r.u16()? as usize;
        let mut events = Vec::with_capacity(count.min(r.remaining() / 2));
        for _ in 0..count {
            events.push(r.u16()?);
        }
        Ok(Self { service_id, events })
    }
}

/// Ask to be told when a service registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcAvailReq {
    pub service_id: ServiceId,
}

impl FixedPayload for SvcAvailReq {}

impl Payload for SvcAvailReq {
    const ID: MsgId = msg_id::REGISTER_SVC_AVAIL_EVT_REQ;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_id: ServiceId(r.u16()?),
        })
    }
}

/// A service became available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcAvailEvt {
    pub service_id: ServiceId,
}

impl FixedPayload for SvcAvailEvt {}

impl Payload for SvcAvailEvt {
    const ID: MsgId = msg_id::SVC_AVAIL_EVT;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_id: ServiceId(r.u16()?),
        })
    }
}

/// Status-only response; the id is chosen by the responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRsp {
    pub status: Status,
}

impl StatusRsp {
    pub fn new(status: Status) -> Self {
        Self { status }
    }

    /// Response with id `id` to `req`
    pub fn respond(&self, req: &Message, id: MsgId) -> Message {
        Message::response_to(req, id, &(self.status as i32).to_le_bytes())
    }

    pub fn from_message(msg: &Message) -> Result<Self, WireError> {
        let mut r = WireReader::new(msg.body());
        Ok(Self { status: status(&mut r)? })
    }
}

/// Shutdown request from the manager to a service host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcShutdownReq {
    pub service_id: ServiceId,
}

impl FixedPayload for SvcShutdownReq {}

impl Payload for SvcShutdownReq {
    const ID: MsgId = msg_id::SVC_SHUTDOWN_REQ;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_id: ServiceId(r.u16()?),
        })
    }
}

/// A service finished shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcShutdownRsp {
    pub service_id: ServiceId,
    pub status: Status,
}

impl FixedPayload for SvcShutdownRsp {}

impl Payload for SvcShutdownRsp {
    const ID: MsgId = msg_id::SVC_SHUTDOWN_RSP;

    fn encode(&self, w: &mut WireWriter<'_>) {
        w.u16(self.service_id.0).i32(self.status as i32);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            service_id: ServiceId(r.u16()?),
            status: status(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn open_response_layout() {
        let rsp = OpenServiceRsp {
            status: Status::Ok,
            service_id: ServiceId(10),
            port: PortId(5),
            cpu: CpuId(1),
            server_handle: ConnId(3),
        };
        let msg = rsp.to_message();
        assert_eq!(msg.id(), msg_id::OPEN_SERVICE_RSP);
        assert_eq!(msg.body().len(), 4 + 2 + 2 + 1 + 4);
        assert_eq!(OpenServiceRsp::from_message(&msg), Ok(rsp));
    }

    #[test]
    fn event_list_survives_encoding() {
        let req = RegisterEvtReq {
            service_id: ServiceId(10),
            events: vec![0x100, 0x101],
        };
        let msg = req.try_to_message().unwrap();
        assert_eq!(RegisterEvtReq::from_message(&msg), Ok(req));
    }

    #[test]
    fn oversized_event_list_is_refused() {
        let fits = RegisterEvtReq {
            service_id: ServiceId(10),
            events: vec![0x100; RegisterEvtReq::MAX_EVENTS],
        };
        assert_eq!(fits.try_to_message().unwrap().body().len(), MAX_BODY - 1);

        let req = RegisterEvtReq {
            service_id: ServiceId(10),
            events: vec![0x100; RegisterEvtReq::MAX_EVENTS + 1],
        };
        let err = RegisterEvtReq::check_count(req.events.len()).unwrap_err();
        assert_eq!(req.try_to_message().unwrap_err(), err);
    }

    #[test]
    fn truncated_event_list_is_an_error() {
        let mut msg = Message::alloc(msg_id::REGISTER_EVT_REQ, 0);
        msg.set_body(vec![10, 0, 3, 0, 1, 1]).unwrap();
        assert!(matches!(
            RegisterEvtReq::from_message(&msg),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn status_response_echoes_request() {
        let req = Message::alloc(msg_id::CLOSE_SERVICE_REQ, 0)
            .to_port(PortId(1))
            .from_port(PortId(2))
            .priv_token(77);
        let rsp = StatusRsp::new(Status::NotConnected).respond(&req, msg_id::CLOSE_SERVICE_RSP);
        assert_eq!(rsp.dst(), PortId(2));
        assert_eq!(rsp.priv_token, 77);
        assert_eq!(
            StatusRsp::from_message(&rsp).map(|s| s.status),
            Ok(Status::NotConnected)
        );
    }
}
