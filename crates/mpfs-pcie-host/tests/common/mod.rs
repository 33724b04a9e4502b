#![allow(dead_code)]

use std::sync::Arc;

use mpfs_mmio::RegisterFile;
use mpfs_pcie_host::atr::InboundRange;
use mpfs_pcie_host::regs::{bridge, ctrl, BridgeRegisters};
use mpfs_pcie_host::{Bridge, BridgeConfig, ConfigWindow, OutboundRange};

pub const MSI_DOORBELL: u64 = 0x0190_0000;

/// Routes `tracing` output through the test harness so it shows up for failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Simulated register blocks of one root port.
pub struct Rig {
    pub bridge: Arc<RegisterFile>,
    pub ctrl: Arc<RegisterFile>,
    pub ecam: RegisterFile,
}

impl Rig {
    /// Hardware advertising `1 << msi_order` MSI vectors.
    pub fn new(msi_order: u32) -> Self {
        let bridge_regs = RegisterFile::new()
            .with_w1c(bridge::ISTATUS_LOCAL, u32::MAX)
            .with_w1c(bridge::ISTATUS_MSI, u32::MAX)
            .with_w1c(bridge::ISTATUS_HOST, u32::MAX);
        bridge_regs.set(
            bridge::PCIE_PCI_IRQ_DW0,
            bridge::MSIX_CAP | (msi_order << bridge::NUM_MSI_MSGS_SHIFT),
        );
        bridge_regs.set(bridge::IMSI_ADDR, MSI_DOORBELL as u32);

        let ctrl_regs = RegisterFile::new()
            .with_w1c(ctrl::SEC_ERROR_INT, ctrl::ERROR_INT_ALL)
            .with_w1c(ctrl::DED_ERROR_INT, ctrl::ERROR_INT_ALL)
            .with_w1c(ctrl::PCIE_EVENT_INT, ctrl::PCIE_EVENT_ALL);

        Self {
            bridge: Arc::new(bridge_regs),
            ctrl: Arc::new(ctrl_regs),
            ecam: RegisterFile::new(),
        }
    }

    pub fn registers(&self) -> BridgeRegisters<Arc<RegisterFile>> {
        BridgeRegisters::split(self.bridge.clone(), self.ctrl.clone())
    }

    pub fn bring_up(&self, config: BridgeConfig) -> Bridge<Arc<RegisterFile>> {
        Bridge::new(config, self.registers(), &self.ecam).unwrap()
    }
}

/// Fabric interface at 0x30_0000_0000 seen by the bridge at AXI address 0, one 256 MiB
/// memory window, and 1 GiB of DDR reachable by DMA.
pub fn icicle_config() -> BridgeConfig {
    BridgeConfig {
        config_window: ConfigWindow {
            bus_addr: 0x30_0000_0000,
            size: 0x1000_0000,
        },
        outbound: vec![OutboundRange {
            bus_addr: 0x30_1000_0000,
            pci_addr: 0x1000_0000,
            size: 0x1000_0000,
        }],
        parent_ranges: vec![0x20_0000_0000, 0x30_0000_0000],
        inbound: vec![InboundRange::identity(0x8000_0000, 0x4000_0000)],
        ..BridgeConfig::default()
    }
}
