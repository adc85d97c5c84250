//! Common types used across the framework
//!
//! This module defines shared identifiers to avoid circular dependencies.

use core::fmt;

/// Port identifier; `0` is never allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortId(pub u16);

impl PortId {
    /// The invalid port
    pub const NONE: Self = Self(0);

    /// Check if this is a real port
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// CPU identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u8);

impl CpuId {
    /// Index into per-CPU tables
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Service identifier, allocated outside the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ServiceId(pub u16);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc#{}", self.0)
    }
}

/// Message identifier
pub type MsgId = u16;

/// Server-side connection handle, unique for the lifetime of its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnId(pub u32);

impl ConnId {
    /// No connection
    pub const NONE: Self = Self(0);
}
