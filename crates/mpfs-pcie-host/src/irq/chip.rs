use std::sync::Arc;

use mpfs_mmio::RegisterBlock;

use super::Hardware;
use crate::msi::MsiMessage;
use crate::registry::{EventIndex, EventRegistry, RegisterRef};
use crate::regs::bridge;

/// Register-level operations on one controller's lines.
///
/// Mask registers are shared between lines, so callers hold `hw.lock` across every call;
/// the chips never take it themselves.
pub trait IrqChip {
    /// Clears the latched status of `line`. A no-op when nothing is latched.
    fn ack<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32);
    fn mask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32);
    fn unmask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32);

    /// Message a device writes to raise `line`. Wired controllers have none.
    fn compose_msi_msg(&self, _line: u32) -> Option<MsiMessage> {
        None
    }
}

/// Lines of the unified event space.
#[derive(Debug)]
pub struct EventChip {
    registry: Arc<EventRegistry>,
}

impl EventChip {
    pub fn new(registry: impl Into<Arc<EventRegistry>>) -> Self {
        Self {
            registry: registry.into(),
        }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    fn set_gate<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32, enable: bool) {
        let desc = self.registry.describe(EventIndex(line as u8));
        let gate = desc.gate_bits();
        if gate == 0 {
            return;
        }
        let status = desc.status.register();
        // Never write back status bits read from a register that is also W1C status.
        let keep = if desc.mask_register == status {
            !desc.status.status_bits()
        } else {
            u32::MAX
        };

        let current = hw.regs.read(desc.mask_register) & keep;
        let next = if enable == desc.active_high {
            current | gate
        } else {
            current & !gate
        };
        hw.regs.write(desc.mask_register, next);
    }
}

impl IrqChip for EventChip {
    fn ack<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        let desc = self.registry.describe(EventIndex(line as u8));
        if desc.bit_mask == 0 {
            return;
        }
        let status = desc.status.register();
        if desc.ack_companion == 0 {
            hw.regs.write(status, desc.bit_mask);
        } else {
            let companion = hw.regs.read(status) & desc.ack_companion;
            hw.regs.write(status, desc.bit_mask | companion);
        }
    }

    fn mask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        self.set_gate(hw, line, false);
    }

    fn unmask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        self.set_gate(hw, line, true);
    }
}

/// The four legacy INTx lines, gated in `IMASK_LOCAL[27:24]`.
#[derive(Debug, Default)]
pub struct IntxChip;

impl IntxChip {
    fn bit(line: u32) -> u32 {
        debug_assert!(line < bridge::NUM_INTX);
        1 << (line + bridge::INTX_SHIFT)
    }
}

impl IrqChip for IntxChip {
    fn ack<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        hw.regs
            .write(RegisterRef::bridge(bridge::ISTATUS_LOCAL), Self::bit(line));
    }

    fn mask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        let reg = RegisterRef::bridge(bridge::IMASK_LOCAL);
        hw.regs.write(reg, hw.regs.read(reg) & !Self::bit(line));
    }

    fn unmask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        let reg = RegisterRef::bridge(bridge::IMASK_LOCAL);
        hw.regs.write(reg, hw.regs.read(reg) | Self::bit(line));
    }
}

/// MSI vectors decoded from `ISTATUS_MSI`.
///
/// The bridge has no per-vector mask register. Masking a vector only changes its line
/// state in the MSI domain: the message stays latched in `ISTATUS_MSI` and is delivered by
/// the first demultiplex after the vector is unmasked.
#[derive(Debug)]
pub struct MsiChip {
    address: u64,
    num_vectors: u32,
}

impl MsiChip {
    pub fn new(address: u64, num_vectors: u32) -> Self {
        Self {
            address,
            num_vectors,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn num_vectors(&self) -> u32 {
        self.num_vectors
    }
}

impl IrqChip for MsiChip {
    fn ack<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        hw.regs
            .write(RegisterRef::bridge(bridge::ISTATUS_MSI), 1 << line);
    }

    fn mask<R: RegisterBlock>(&self, _hw: &Hardware<R>, _line: u32) {}

    fn unmask<R: RegisterBlock>(&self, _hw: &Hardware<R>, _line: u32) {}

    fn compose_msi_msg(&self, line: u32) -> Option<MsiMessage> {
        debug_assert!(line < self.num_vectors);
        Some(MsiMessage {
            address: self.address,
            data: line,
        })
    }
}
