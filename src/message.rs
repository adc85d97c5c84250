//! Framework message implementation
//!
//! Messages are the data transferred through ports. Every message carries a
//! fixed header that is bit-exact across cores, followed by the framework
//! prefix (connection handle and correlation token) and a free-form body.
//!
//! Wire layout (little endian):
//!
//! ```text
//! +-------+----+-----+-----+-----+------+------+------...
//! | flags | id | dst | src | len | conn | priv | body
//! |  u16  |u16 | u16 | u16 | u16 | u32  | u32  |
//! +-------+----+-----+-----+-----+------+------+------...
//!                                 <----------- len ----------->
//! ```

use alloc::vec::Vec;

use crate::error::{AllocError, WireError};
use crate::types::{MsgId, PortId};
use crate::wire::{WireReader, WireWriter};

/// Size of the fixed header
pub const HEADER_SIZE: usize = 10;

/// Size of the framework prefix (`conn` + `priv`) counted in `len`
pub const PREFIX_SIZE: usize = 8;

/// Largest body a message can carry
pub const MAX_BODY: usize = u16::MAX as usize - PREFIX_SIZE;

// ============================================================================
// Flags
// ============================================================================

/// Delivery class of a message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgClass {
    /// Regular delivery, wakes the receiver
    #[default]
    Normal = 0,
    /// Queued without raising a wake request
    NoWake = 1,
    /// Replaces a pending message with the same id, no wake request
    NoWakeReplace = 2,
    /// Replaces a pending message with the same id
    Replace = 3,
}

impl MsgClass {
    fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0 => Ok(MsgClass::Normal),
            1 => Ok(MsgClass::NoWake),
            2 => Ok(MsgClass::NoWakeReplace),
            3 => Ok(MsgClass::Replace),
            other => Err(WireError::InvalidClass(other)),
        }
    }

    /// Whether queuing this message raises the receiver's wake request
    pub fn wakes(self) -> bool {
        matches!(self, MsgClass::Normal | MsgClass::Replace)
    }

    /// Whether this message supersedes a pending one with the same id
    pub fn replaces(self) -> bool {
        matches!(self, MsgClass::NoWakeReplace | MsgClass::Replace)
    }
}

/// Message type codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MsgType {
    /// Request
    #[default]
    Req = 0,
    /// Response to a request
    Rsp = 1,
    /// Event indication
    Evt = 2,
    /// Internal message
    Int = 3,
}

impl MsgType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => MsgType::Req,
            1 => MsgType::Rsp,
            2 => MsgType::Evt,
            _ => MsgType::Int,
        }
    }
}

/// Header flag word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags {
    pub priority: u8,
    pub class: MsgClass,
    pub msg_type: MsgType,
    /// Queue at the head instead of the tail
    pub queue_head: bool,
    /// Item is a job, never set on a real message
    pub is_job: bool,
}

const CLASS_SHIFT: u16 = 8;
const TYPE_SHIFT: u16 = 11;
const QUEUE_HEAD_BIT: u16 = 1 << 13;
const IS_JOB_BIT: u16 = 1 << 14;

impl MessageFlags {
    /// Pack into the 16-bit wire representation
    pub fn to_bits(self) -> u16 {
        let mut bits = self.priority as u16;
        bits |= (self.class as u16 & 0x7) << CLASS_SHIFT;
        bits |= (self.msg_type as u16 & 0x3) << TYPE_SHIFT;
        if self.queue_head {
            bits |= QUEUE_HEAD_BIT;
        }
        if self.is_job {
            bits |= IS_JOB_BIT;
        }
        bits
    }

    /// Unpack the 16-bit wire representation
    pub fn from_bits(bits: u16) -> Result<Self, WireError> {
        Ok(Self {
            priority: (bits & 0xFF) as u8,
            class: MsgClass::from_bits(((bits >> CLASS_SHIFT) & 0x7) as u8)?,
            msg_type: MsgType::from_bits(((bits >> TYPE_SHIFT) & 0x3) as u8),
            queue_head: bits & QUEUE_HEAD_BIT != 0,
            is_job: bits & IS_JOB_BIT != 0,
        })
    }
}

// ============================================================================
// Header
// ============================================================================

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub flags: MessageFlags,
    /// Message ID (namespaced by service)
    pub id: MsgId,
    /// Destination port
    pub dst_port: PortId,
    /// Source (reply) port
    pub src_port: PortId,
    /// Number of bytes following the header
    pub len: u16,
}

impl MessageHeader {
    /// Append the 10-byte wire form
    pub fn encode(&self, out: &mut Vec<u8>) {
        WireWriter::new(out)
            .u16(self.flags.to_bits())
            .u16(self.id)
            .u16(self.dst_port.0)
            .u16(self.src_port.0)
            .u16(self.len);
    }

    /// Parse the 10-byte wire form
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            flags: MessageFlags::from_bits(r.u16()?)?,
            id: r.u16()?,
            dst_port: PortId(r.u16()?),
            src_port: PortId(r.u16()?),
            len: r.u16()?,
        })
    }
}

// ============================================================================
// Message
// ============================================================================

/// Complete framework message
///
/// A `Message` is owned by exactly one party. Handing it to a port or a
/// queue moves it, and releasing it consumes it, so a second release of the
/// same buffer cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message header; `len` is kept in sync with the body
    pub header: MessageHeader,
    /// Connection handle the message refers to (`0` when none)
    pub conn: u32,
    /// Opaque correlation token echoed in responses
    pub priv_token: u32,
    body: Vec<u8>,
}

impl Message {
    /// Allocate a message with a zeroed body of `body_len` bytes
    pub fn try_alloc(id: MsgId, body_len: usize) -> Result<Self, AllocError> {
        if body_len > MAX_BODY {
            return Err(AllocError { size: body_len });
        }
        let mut body = Vec::new();
        body.try_reserve_exact(body_len)
            .map_err(|_| AllocError { size: body_len })?;
        body.resize(body_len, 0);
        Ok(Self {
            header: MessageHeader {
                id,
                len: (PREFIX_SIZE + body_len) as u16,
                ..MessageHeader::default()
            },
            conn: 0,
            priv_token: 0,
            body,
        })
    }

    /// Allocate a message; a request is never silently dropped, so running
    /// out of memory here is fatal
    pub fn alloc(id: MsgId, body_len: usize) -> Self {
        match Self::try_alloc(id, body_len) {
            Ok(msg) => msg,
            Err(e) => panic!("{}", e),
        }
    }

    /// Allocate a message carrying a copy of `body`
    pub fn with_body(id: MsgId, body: &[u8]) -> Self {
        let mut msg = Self::alloc(id, body.len());
        msg.body.copy_from_slice(body);
        msg
    }

    /// Message ID
    pub fn id(&self) -> MsgId {
        self.header.id
    }

    /// Destination port
    pub fn dst(&self) -> PortId {
        self.header.dst_port
    }

    /// Source port
    pub fn src(&self) -> PortId {
        self.header.src_port
    }

    /// Message type
    pub fn msg_type(&self) -> MsgType {
        self.header.flags.msg_type
    }

    /// Body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body; a body the length field cannot describe is refused
    /// and the message left untouched
    pub fn set_body(&mut self, body: Vec<u8>) -> Result<(), WireError> {
        if body.len() > MAX_BODY {
            return Err(WireError::TooLong(PREFIX_SIZE + body.len()));
        }
        self.header.len = (PREFIX_SIZE + body.len()) as u16;
        self.body = body;
        Ok(())
    }

    /// Length of everything after the header
    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn to_port(mut self, dst: PortId) -> Self {
        self.header.dst_port = dst;
        self
    }

    pub fn from_port(mut self, src: PortId) -> Self {
        self.header.src_port = src;
        self
    }

    pub fn typed(mut self, msg_type: MsgType) -> Self {
        self.header.flags.msg_type = msg_type;
        self
    }

    pub fn class(mut self, class: MsgClass) -> Self {
        self.header.flags.class = class;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.header.flags.priority = priority;
        self
    }

    pub fn conn(mut self, conn: u32) -> Self {
        self.conn = conn;
        self
    }

    pub fn priv_token(mut self, token: u32) -> Self {
        self.priv_token = token;
        self
    }

    /// Ask the receiving queue to put this message in front
    pub fn at_head(mut self) -> Self {
        self.header.flags.queue_head = true;
        self
    }

    /// Build the response to `req`: addressed to the requester, from the
    /// port that received the request, echoing `conn` and `priv`
    pub fn response_to(req: &Message, id: MsgId, body: &[u8]) -> Self {
        Self::with_body(id, body)
            .typed(MsgType::Rsp)
            .to_port(req.src())
            .from_port(req.dst())
            .conn(req.conn)
            .priv_token(req.priv_token)
    }

    /// Serialize to the wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.len());
        let mut header = self.header;
        header.len = (PREFIX_SIZE + self.body.len()) as u16;
        header.encode(&mut out);
        WireWriter::new(&mut out)
            .u32(self.conn)
            .u32(self.priv_token)
            .bytes(&self.body);
        out
    }

    /// Parse the wire format
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = WireReader::new(data);
        let header = MessageHeader::decode(&mut r)?;
        if header.flags.is_job {
            return Err(WireError::JobOnWire);
        }
        let len = header.len as usize;
        if len < PREFIX_SIZE || r.remaining() < len {
            return Err(WireError::Truncated {
                need: HEADER_SIZE + len.max(PREFIX_SIZE),
                have: data.len(),
            });
        }
        let conn = r.u32()?;
        let priv_token = r.u32()?;
        let body = r.bytes(len - PREFIX_SIZE)?.to_vec();
        Ok(Self {
            header,
            conn,
            priv_token,
            body,
        })
    }
}
