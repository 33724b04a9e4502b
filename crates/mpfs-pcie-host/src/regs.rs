//! Bit-exact register layout of the PolarFire SoC PCIe root port.
//!
//! Offsets in [`bridge`] and [`atr`] are relative to the bridge block, offsets in [`ctrl`] to
//! the controller block. Both blocks sit inside one APB aperture on parts that only describe
//! a single register range; see [`legacy`].

use bitflags::bitflags;
use mpfs_mmio::{OffsetBlock, RegisterBlock};

use crate::registry::{Block, RegisterRef};

pub mod legacy {
    pub const BRIDGE_OFFSET: usize = 0x4000;
    pub const CTRL_OFFSET: usize = 0x6000;
}

pub mod bridge {
    pub const PCIE_PCI_IRQ_DW0: usize = 0xa8;
    pub const MSIX_CAP: u32 = 1 << 31;
    pub const NUM_MSI_MSGS_MASK: u32 = 0x7 << NUM_MSI_MSGS_SHIFT;
    pub const NUM_MSI_MSGS_SHIFT: u32 = 4;

    pub const IMASK_LOCAL: usize = 0x180;
    pub const ISTATUS_LOCAL: usize = 0x184;
    pub const IMASK_HOST: usize = 0x188;
    pub const ISTATUS_HOST: usize = 0x18c;
    pub const IMSI_ADDR: usize = 0x190;
    pub const ISTATUS_MSI: usize = 0x194;

    pub const INTX_SHIFT: u32 = 24;
    pub const NUM_INTX: u32 = 4;
    pub const MAX_MSI_VECTORS: u32 = 32;
}

/// Address translation table slots.
pub mod atr {
    pub const INBOUND_BASE: usize = 0x600;
    pub const OUTBOUND_BASE: usize = 0x800;
    pub const WINDOW_STRIDE: usize = 0x20;

    pub const SRCADDR_PARAM: usize = 0x00;
    pub const SRC_ADDR: usize = 0x04;
    pub const TRSL_ADDR_LSB: usize = 0x08;
    pub const TRSL_ADDR_UDW: usize = 0x0c;
    pub const TRSL_PARAM: usize = 0x10;

    pub const IMPL_ENABLE: u32 = 1;
    pub const SIZE_SHIFT: u32 = 1;
    pub const SIZE_MASK: u32 = 0x3f << SIZE_SHIFT;
    pub const ADDR_MASK: u32 = 0xffff_f000;

    pub const MAX_WINDOWS: usize = 8;
    pub const MIN_SIZE: u64 = 0x1000;

    /// Coarse inbound alignment used by the reference firmware (bits 63:31).
    pub const ATT_MASK: u64 = !((1u64 << 31) - 1);

    pub const fn slot(base: usize, index: usize) -> usize {
        base + index * WINDOW_STRIDE
    }
}

pub mod ctrl {
    pub const SEC_ERROR_EVENT_CNT: usize = 0x20;
    pub const DED_ERROR_EVENT_CNT: usize = 0x24;
    pub const SEC_ERROR_INT: usize = 0x28;
    pub const SEC_ERROR_INT_MASK: usize = 0x2c;
    pub const DED_ERROR_INT: usize = 0x30;
    pub const DED_ERROR_INT_MASK: usize = 0x34;
    pub const ECC_CONTROL: usize = 0x38;
    pub const PCIE_EVENT_INT: usize = 0x14c;

    /// ECC bypass for the TX, RX, PCIE2AXI and AXI2PCIE buffer RAMs.
    pub const ECC_BYPASS_ALL: u32 = 0xf << 24;

    /// All four buffer fields of the SEC/DED interrupt registers.
    pub const ERROR_INT_ALL: u32 = 0xffff;
    pub const ERROR_INT_TX_RAM: u32 = 0xf;
    pub const ERROR_INT_RX_RAM: u32 = 0xf << 4;
    pub const ERROR_INT_PCIE2AXI_RAM: u32 = 0xf << 8;
    pub const ERROR_INT_AXI2PCIE_RAM: u32 = 0xf << 12;

    pub const PCIE_EVENT_L2_EXIT: u32 = 1 << 0;
    pub const PCIE_EVENT_HOTRST_EXIT: u32 = 1 << 1;
    pub const PCIE_EVENT_DLUP_EXIT: u32 = 1 << 2;
    pub const PCIE_EVENT_ALL: u32 = 0x7;
    /// Per-event enable/mask field of `PCIE_EVENT_INT`, bits 18:16.
    pub const PCIE_EVENT_ENB_SHIFT: u32 = 16;
    pub const PCIE_EVENT_ENB_MASK: u32 = 0x7 << PCIE_EVENT_ENB_SHIFT;
}

/// Root port MSI capability, reached through the ECAM window.
pub mod msi_cap {
    /// Dword holding the capability header and, in its upper half, the message control word.
    pub const CAP_OFFSET: usize = 0xe0;
    pub const ADDRESS_LO: usize = CAP_OFFSET + 0x4;
    pub const ADDRESS_HI: usize = CAP_OFFSET + 0x8;

    const FLAGS_SHIFT: u32 = 16;
    pub const FLAGS_ENABLE: u32 = 0x1 << FLAGS_SHIFT;
    pub const FLAGS_QMASK: u32 = 0x7 << (FLAGS_SHIFT + 1);
    pub const FLAGS_QSIZE: u32 = 0x7 << (FLAGS_SHIFT + 4);
}

bitflags! {
    /// Sources multiplexed into `ISTATUS_LOCAL` / gated by `IMASK_LOCAL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocalInterrupt: u32 {
        const DMA_ERROR_ENGINE_0 = 1 << 8;
        const DMA_ERROR_ENGINE_1 = 1 << 9;
        const A_ATR_EVT_POST_ERR = 1 << 16;
        const A_ATR_EVT_FETCH_ERR = 1 << 17;
        const A_ATR_EVT_DISCARD_ERR = 1 << 18;
        const P_ATR_EVT_POST_ERR = 1 << 20;
        const P_ATR_EVT_FETCH_ERR = 1 << 21;
        const P_ATR_EVT_DISCARD_ERR = 1 << 22;
        const INTA = 1 << 24;
        const INTB = 1 << 25;
        const INTC = 1 << 26;
        const INTD = 1 << 27;
        const INTX = Self::INTA.bits() | Self::INTB.bits() | Self::INTC.bits() | Self::INTD.bits();
        const MSI = 1 << 28;
        const PM_MSI_INT_AER_EVT = 1 << 29;
        const PM_MSI_INT_EVENTS = 1 << 30;
        const PM_MSI_INT_SYS_ERR = 1 << 31;
    }
}

/// The bridge and controller register blocks of one root port.
#[derive(Debug)]
pub struct BridgeRegisters<R> {
    bridge: OffsetBlock<R>,
    ctrl: OffsetBlock<R>,
}

impl<R: RegisterBlock> BridgeRegisters<R> {
    pub fn split(bridge: R, ctrl: R) -> Self {
        Self {
            bridge: OffsetBlock::new(bridge, 0),
            ctrl: OffsetBlock::new(ctrl, 0),
        }
    }

    pub fn legacy(apb: R) -> Self
    where
        R: Clone,
    {
        Self {
            bridge: OffsetBlock::new(apb.clone(), legacy::BRIDGE_OFFSET),
            ctrl: OffsetBlock::new(apb, legacy::CTRL_OFFSET),
        }
    }

    pub fn bridge(&self) -> &OffsetBlock<R> {
        &self.bridge
    }

    pub fn ctrl(&self) -> &OffsetBlock<R> {
        &self.ctrl
    }

    pub fn block(&self, block: Block) -> &OffsetBlock<R> {
        match block {
            Block::Bridge => &self.bridge,
            Block::Ctrl => &self.ctrl,
        }
    }

    pub fn read(&self, reg: RegisterRef) -> u32 {
        self.block(reg.block).read32(reg.offset)
    }

    pub fn write(&self, reg: RegisterRef, value: u32) {
        self.block(reg.block).write32(reg.offset, value)
    }

    /// Masks every source and clears every latched status bit.
    ///
    /// ECC checking is bypassed so the buffer RAMs cannot raise SEC/DED errors while the
    /// bridge is being reconfigured.
    pub fn quiesce(&self) {
        self.ctrl.write32(ctrl::ECC_CONTROL, ctrl::ECC_BYPASS_ALL);

        self.ctrl.write32(ctrl::SEC_ERROR_INT_MASK, ctrl::ERROR_INT_ALL);
        self.ctrl.write32(ctrl::SEC_ERROR_INT, ctrl::ERROR_INT_ALL);
        self.ctrl.write32(ctrl::SEC_ERROR_EVENT_CNT, 0);

        self.ctrl.write32(ctrl::DED_ERROR_INT_MASK, ctrl::ERROR_INT_ALL);
        self.ctrl.write32(ctrl::DED_ERROR_INT, ctrl::ERROR_INT_ALL);
        self.ctrl.write32(ctrl::DED_ERROR_EVENT_CNT, 0);

        self.bridge.write32(bridge::IMASK_LOCAL, 0);
        self.bridge.write32(bridge::ISTATUS_LOCAL, u32::MAX);
        self.bridge.write32(bridge::ISTATUS_MSI, u32::MAX);

        self.ctrl.write32(
            ctrl::PCIE_EVENT_INT,
            ctrl::PCIE_EVENT_ALL | ctrl::PCIE_EVENT_ENB_MASK,
        );

        self.bridge.write32(bridge::IMASK_HOST, 0);
        self.bridge.write32(bridge::ISTATUS_HOST, u32::MAX);

        tracing::debug!("bridge interrupts quiesced");
    }
}
