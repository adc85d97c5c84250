//! CFW - Component Framework core
//!
//! Messaging and service infrastructure of a multi-core embedded platform:
//! ports and messages routed across cores, cooperative execution loops with
//! delayed jobs, and a service manager on the master core that brokers
//! connections, events and an orderly shutdown.
//!
//! The crate is `no_std` + `alloc`. The `std` feature adds the host clock,
//! a stderr log sink and threaded loops for the simulated platform.

#![no_std]
// Handler-style APIs hand messages back on failure
#![allow(clippy::result_large_err)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Low-level plumbing
pub mod clock;
pub mod irq;
pub mod wire;

// Messaging
pub mod message;
pub mod port;
pub mod queue;

// Cores and transport
pub mod cpu;
pub mod ipc;
pub mod shared;
pub mod xloop;

// Component framework
pub mod cfw;

// Platform services
pub mod driver;
pub mod logger;
pub mod platform;

pub use config::CfwConfig;
pub use error::{AllocError, BootError, DriverError, IpcError, PortError, RegisterError, WireError};
pub use message::{Message, MsgClass, MsgType};
pub use platform::{CoreContext, Platform, PlatformBuilder};
pub use types::{ConnId, CpuId, MsgId, PortId, ServiceId};
pub use xloop::{JobHandle, Xloop};

/// Framework version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Framework name
pub const NAME: &str = "CFW";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "CFW");
        assert!(!VERSION.is_empty());
    }
}
