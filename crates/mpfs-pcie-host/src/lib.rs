//! Host-side core of the Microchip PolarFire SoC PCIe root port.
//!
//! The bridge exposes two pieces of hardware:
//!
//! - the address translation tables, programmed from a [`BridgeConfig`] by [`atr`];
//! - a single upstream interrupt line that multiplexes 28 event sources, four legacy INTx
//!   lines and up to 32 MSI vectors.
//!
//! [`Bridge`] owns the register blocks and is the entry point for both.

pub mod atr;
pub mod bridge;
pub mod error;
pub mod irq;
pub mod msi;
pub mod mux;
pub mod registry;
pub mod regs;

pub use bridge::{Bridge, BridgeConfig, ConfigWindow, OutboundRange, PassThrough};
pub use error::{BridgeError, ConfigError, Result};
pub use msi::MsiMessage;
pub use registry::{EventDescriptor, EventIndex, EventRegistry};
