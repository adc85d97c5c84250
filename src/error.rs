//! Error types for the framework layers

use thiserror::Error;

use crate::types::{CpuId, PortId, ServiceId};

/// Message allocation failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message allocation of {size} bytes failed")]
pub struct AllocError {
    pub size: usize,
}

/// Wire decoding errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid message class {0}")]
    InvalidClass(u8),

    #[error("job items never travel on the wire")]
    JobOnWire,

    #[error("payload of {0} bytes exceeds the 16-bit length field")]
    TooLong(usize),

    #[error("unknown status code {0}")]
    InvalidStatus(i32),
}

/// Port layer errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("{0} is not allocated")]
    UnknownPort(PortId),

    #[error("{0} has neither queue nor handler")]
    Unbound(PortId),

    #[error("no link towards {0}")]
    NoLink(CpuId),

    #[error("port table exhausted")]
    Exhausted,

    #[error("queue of {0} is full")]
    QueueFull(PortId),

    #[error("ipc failure: {0}")]
    Ipc(#[from] IpcError),

    #[error("cannot build message: {0}")]
    Wire(#[from] WireError),
}

/// Cross-core IPC errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    #[error("peer {0} is not reachable")]
    PeerUnreachable(CpuId),

    #[error("request code {0:#x} is not supported")]
    Unsupported(u8),

    #[error("peer rejected the request with {0}")]
    Rejected(i32),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Service registration errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{0} is already registered")]
    Duplicate(ServiceId),

    #[error("{0} is not registered")]
    NotRegistered(ServiceId),

    #[error("master registration failed: {0}")]
    Ipc(#[from] IpcError),
}

/// Boot handshake errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    #[error("{peer} did not become ready within {waited_ms} ms")]
    PeerTimeout { peer: CpuId, waited_ms: u64 },

    #[error("proxy registration failed: {0}")]
    Proxy(#[from] IpcError),

    #[error("framework port setup failed: {0}")]
    Port(#[from] PortError),
}

/// Driver contract errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("device not ready")]
    NotReady,

    #[error("device busy")]
    Busy,

    #[error("hardware error")]
    Hardware,

    #[error("operation not supported")]
    NotSupported,

    #[error("{0}")]
    Generic(&'static str),
}
