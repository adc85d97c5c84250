//! Inter-core transport
//!
//! Two channels connect cores:
//! - an asynchronous link carrying messages (and free requests for messages
//!   whose memory belongs to the peer),
//! - a synchronous request/response mailbox from each slave to the master,
//!   served by the master in interrupt context.
//!
//! The loopback implementations below connect cores living in the same
//! address space. They push every message through the wire encoding so the
//! receiving side sees exactly what a hardware mailbox would deliver.

use alloc::sync::Weak;

use log::trace;

use crate::cpu::Cpu;
use crate::error::{IpcError, WireError};
use crate::message::Message;
use crate::types::CpuId;

// ============================================================================
// Synchronous requests
// ============================================================================

/// Synchronous request codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcRequestCode {
    /// Allocate a port owned by the sender
    AllocPort = 0x10,
    /// Register a service hosted by the sender
    RegisterService = 0x11,
    /// Remove a service hosted by the sender
    DeregisterService = 0x12,
    /// Register the sender's proxy port
    RegisterProxy = 0x14,
}

impl IpcRequestCode {
    pub fn from_u8(code: u8) -> Result<Self, IpcError> {
        match code {
            0x10 => Ok(Self::AllocPort),
            0x11 => Ok(Self::RegisterService),
            0x12 => Ok(Self::DeregisterService),
            0x14 => Ok(Self::RegisterProxy),
            other => Err(IpcError::Unsupported(other)),
        }
    }
}

/// Fixed-width synchronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcRequest {
    pub code: IpcRequestCode,
    pub sender: CpuId,
    pub param1: u32,
    pub param2: u32,
}

/// Mailbox words of a request
pub type IpcWords = [u32; 3];

impl IpcRequest {
    pub fn new(code: IpcRequestCode, sender: CpuId, param1: u32, param2: u32) -> Self {
        Self {
            code,
            sender,
            param1,
            param2,
        }
    }

    /// Pack into mailbox words: `code | sender << 8`, `param1`, `param2`
    pub fn to_words(&self) -> IpcWords {
        [
            self.code as u32 | (self.sender.0 as u32) << 8,
            self.param1,
            self.param2,
        ]
    }

    /// Unpack mailbox words
    pub fn from_words(words: IpcWords) -> Result<Self, IpcError> {
        Ok(Self {
            code: IpcRequestCode::from_u8((words[0] & 0xFF) as u8)?,
            sender: CpuId(((words[0] >> 8) & 0xFF) as u8),
            param1: words[1],
            param2: words[2],
        })
    }
}

/// Master side of the synchronous mailbox; runs in interrupt context and
/// must not block. Negative results are error codes.
pub trait SyncRequestHandler: Send + Sync {
    fn handle_sync_request(&self, req: IpcRequest) -> i32;
}

/// Slave side of the synchronous mailbox
pub trait SyncIpc: Send + Sync {
    /// Send a request and block for the master's answer
    fn request(&self, req: IpcRequest) -> Result<u32, IpcError>;
}

/// Synchronous mailbox into a master living in the same address space
pub struct LoopbackSync {
    master: CpuId,
    handler: Weak<dyn SyncRequestHandler>,
}

impl LoopbackSync {
    pub fn new(master: CpuId, handler: Weak<dyn SyncRequestHandler>) -> Self {
        Self { master, handler }
    }
}

impl SyncIpc for LoopbackSync {
    fn request(&self, req: IpcRequest) -> Result<u32, IpcError> {
        let handler = self
            .handler
            .upgrade()
            .ok_or(IpcError::PeerUnreachable(self.master))?;
        let decoded = IpcRequest::from_words(req.to_words())?;
        trace!("sync request {:?} from {}", decoded.code, decoded.sender);
        let rc = handler.handle_sync_request(decoded);
        if rc < 0 {
            Err(IpcError::Rejected(rc))
        } else {
            Ok(rc as u32)
        }
    }
}

// ============================================================================
// Message links
// ============================================================================

/// Asynchronous message transport towards one peer core
pub trait CpuLink: Send + Sync {
    /// Deliver a message to a port owned by the peer
    fn send_message(&self, msg: Message) -> Result<(), IpcError>;

    /// Ask the peer to release a message it allocated
    fn free_message(&self, msg: Message) -> Result<(), IpcError>;
}

/// Link to a core living in the same address space
pub struct LoopbackLink {
    peer_id: CpuId,
    peer: Weak<Cpu>,
}

impl LoopbackLink {
    pub fn new(peer_id: CpuId, peer: Weak<Cpu>) -> Self {
        Self { peer_id, peer }
    }

    fn transfer(&self, msg: &Message) -> Result<Message, WireError> {
        Message::decode(&msg.encode())
    }
}

impl CpuLink for LoopbackLink {
    fn send_message(&self, msg: Message) -> Result<(), IpcError> {
        let peer = self
            .peer
            .upgrade()
            .ok_or(IpcError::PeerUnreachable(self.peer_id))?;
        let delivered = self.transfer(&msg)?;
        peer.receive_from_link(delivered);
        Ok(())
    }

    fn free_message(&self, msg: Message) -> Result<(), IpcError> {
        let peer = self
            .peer
            .upgrade()
            .ok_or(IpcError::PeerUnreachable(self.peer_id))?;
        peer.release_remote(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    struct Echo;

    impl SyncRequestHandler for Echo {
        fn handle_sync_request(&self, req: IpcRequest) -> i32 {
            match req.code {
                IpcRequestCode::AllocPort => req.sender.0 as i32 + 40,
                _ => -1,
            }
        }
    }

    #[test]
    fn request_words_roundtrip() {
        let req = IpcRequest::new(IpcRequestCode::RegisterService, CpuId(1), 10, 12);
        let words = req.to_words();
        assert_eq!(words[0], 0x111);
        assert_eq!(IpcRequest::from_words(words), Ok(req));
    }

    #[test]
    fn unknown_code_is_unsupported() {
        assert_eq!(
            IpcRequest::from_words([0x13, 0, 0]),
            Err(IpcError::Unsupported(0x13))
        );
    }

    #[test]
    fn loopback_sync_maps_negative_results() {
        let handler: Arc<dyn SyncRequestHandler> = Arc::new(Echo);
        let ipc = LoopbackSync::new(CpuId(0), Arc::downgrade(&handler));
        let ok = ipc.request(IpcRequest::new(IpcRequestCode::AllocPort, CpuId(1), 0, 0));
        assert_eq!(ok, Ok(41));
        let err = ipc.request(IpcRequest::new(IpcRequestCode::RegisterProxy, CpuId(1), 0, 0));
        assert_eq!(err, Err(IpcError::Rejected(-1)));
        drop(handler);
        let gone = ipc.request(IpcRequest::new(IpcRequestCode::AllocPort, CpuId(1), 0, 0));
        assert_eq!(gone, Err(IpcError::PeerUnreachable(CpuId(0))));
    }
}
