//! 32-bit register block access.
//!
//! Drivers in this workspace talk to hardware through [`RegisterBlock`], which keeps them
//! independent of whether the registers are real MMIO ([`MmioWindow`]) or a simulated
//! [`RegisterFile`] used by tests.

mod block;
mod file;
mod window;

pub use block::{OffsetBlock, RegisterBlock};
pub use file::RegisterFile;
pub use window::MmioWindow;
