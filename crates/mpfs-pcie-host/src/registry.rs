//! Static description of every hardware event the bridge can report.
//!
//! The bridge scatters its interrupt sources over four status registers that disagree on
//! polarity: `SEC_ERROR_INT_MASK`, `DED_ERROR_INT_MASK` and the enable field of
//! `PCIE_EVENT_INT` mask a source when a bit is set, while `IMASK_LOCAL` enables it. An
//! [`EventRegistry`] flattens all of them into one dense index space.

use std::fmt;

use crate::error::{ConfigError, Result};
use crate::regs::{bridge, ctrl, LocalInterrupt};

/// Largest event table a single poll snapshot can carry.
pub const MAX_EVENTS: usize = 64;

/// Dense index into an [`EventRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventIndex(pub u8);

impl EventIndex {
    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for EventIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which register block a register lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Block {
    Bridge,
    Ctrl,
}

/// A register identified by its block and byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRef {
    pub block: Block,
    pub offset: usize,
}

impl RegisterRef {
    pub const fn bridge(offset: usize) -> Self {
        Self {
            block: Block::Bridge,
            offset,
        }
    }

    pub const fn ctrl(offset: usize) -> Self {
        Self {
            block: Block::Ctrl,
            offset,
        }
    }
}

/// The four registers an upstream interrupt is decoded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusRegister {
    PcieEvent,
    SecError,
    DedError,
    Local,
}

impl StatusRegister {
    pub const ALL: [StatusRegister; 4] = [
        StatusRegister::PcieEvent,
        StatusRegister::SecError,
        StatusRegister::DedError,
        StatusRegister::Local,
    ];

    pub const fn register(self) -> RegisterRef {
        match self {
            StatusRegister::PcieEvent => RegisterRef::ctrl(ctrl::PCIE_EVENT_INT),
            StatusRegister::SecError => RegisterRef::ctrl(ctrl::SEC_ERROR_INT),
            StatusRegister::DedError => RegisterRef::ctrl(ctrl::DED_ERROR_INT),
            StatusRegister::Local => RegisterRef::bridge(bridge::ISTATUS_LOCAL),
        }
    }

    /// Bits of the register that carry status rather than configuration.
    pub const fn status_bits(self) -> u32 {
        match self {
            StatusRegister::PcieEvent => ctrl::PCIE_EVENT_ALL,
            StatusRegister::SecError | StatusRegister::DedError => ctrl::ERROR_INT_ALL,
            StatusRegister::Local => u32::MAX,
        }
    }

    const fn slot(self) -> usize {
        match self {
            StatusRegister::PcieEvent => 0,
            StatusRegister::SecError => 1,
            StatusRegister::DedError => 2,
            StatusRegister::Local => 3,
        }
    }
}

/// One hardware event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Symbolic name used by the runtime API.
    pub name: &'static str,
    pub status: StatusRegister,
    pub mask_register: RegisterRef,
    /// Status bits for this event. An event with no bits is described but never reported.
    pub bit_mask: u32,
    /// Setting the gating bit enables delivery when true, disables it when false.
    pub active_high: bool,
    /// The gating bits are `bit_mask` moved into the `PCIE_EVENT_INT` enable field.
    pub needs_shift: bool,
    /// Bits of the status register that are read back and rewritten alongside the W1C
    /// status bit on ack. The register doubles as a mask register for these bits and a
    /// plain write of only the status bit would clobber them.
    pub ack_companion: u32,
    pub cause: Option<&'static str>,
}

impl EventDescriptor {
    /// Bits in `mask_register` that gate this event.
    pub const fn gate_bits(&self) -> u32 {
        if self.needs_shift {
            (self.bit_mask << ctrl::PCIE_EVENT_ENB_SHIFT) & ctrl::PCIE_EVENT_ENB_MASK
        } else {
            self.bit_mask
        }
    }

    /// Value of the gating bits that lets the event through.
    pub const fn enabled_value(&self) -> u32 {
        if self.active_high {
            self.gate_bits()
        } else {
            0
        }
    }
}

/// Immutable lookup table over a declarative event list.
#[derive(Debug)]
pub struct EventRegistry {
    events: &'static [EventDescriptor],
    by_status: [Vec<(u32, EventIndex)>; 4],
}

impl EventRegistry {
    pub fn new(events: &'static [EventDescriptor]) -> Result<Self> {
        if events.len() > MAX_EVENTS {
            return Err(ConfigError::TooManyEvents(events.len()).into());
        }

        Ok(Self {
            events,
            by_status: reverse_map(events),
        })
    }

    /// Registry for the PolarFire SoC root port.
    pub fn mpfs() -> Self {
        Self {
            events: MPFS_EVENTS,
            by_status: reverse_map(MPFS_EVENTS),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Looks up an event. Panics if `index` is outside the registered range.
    pub fn describe(&self, index: EventIndex) -> &EventDescriptor {
        assert!(
            index.as_usize() < self.events.len(),
            "event index {index} out of range (have {})",
            self.events.len()
        );
        &self.events[index.as_usize()]
    }

    pub fn find(&self, name: &str) -> Option<EventIndex> {
        self.events
            .iter()
            .position(|desc| desc.name == name)
            .map(|idx| EventIndex(idx as u8))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventIndex, &EventDescriptor)> + '_ {
        self.events
            .iter()
            .enumerate()
            .map(|(idx, desc)| (EventIndex(idx as u8), desc))
    }

    /// `(bits, event)` pairs reported through `status`.
    pub fn events_in(&self, status: StatusRegister) -> &[(u32, EventIndex)] {
        &self.by_status[status.slot()]
    }
}

// Callers guarantee `events.len() <= MAX_EVENTS`.
fn reverse_map(events: &[EventDescriptor]) -> [Vec<(u32, EventIndex)>; 4] {
    let mut by_status: [Vec<(u32, EventIndex)>; 4] = Default::default();
    for (idx, desc) in events.iter().enumerate() {
        if desc.bit_mask != 0 {
            by_status[desc.status.slot()].push((desc.bit_mask, EventIndex(idx as u8)));
        }
    }
    by_status
}

/// Pass-through event that fans out to the four legacy INTx lines.
pub const MPFS_INTX_EVENT: EventIndex = EventIndex(23);
/// Pass-through event that fans out to the MSI vectors.
pub const MPFS_MSI_EVENT: EventIndex = EventIndex(24);

const fn pcie_event(name: &'static str, bit: u32, cause: &'static str) -> EventDescriptor {
    EventDescriptor {
        name,
        status: StatusRegister::PcieEvent,
        mask_register: RegisterRef::ctrl(ctrl::PCIE_EVENT_INT),
        bit_mask: bit,
        active_high: false,
        needs_shift: true,
        ack_companion: ctrl::PCIE_EVENT_ENB_MASK,
        cause: Some(cause),
    }
}

const fn sec_error(name: &'static str, bits: u32, cause: &'static str) -> EventDescriptor {
    EventDescriptor {
        name,
        status: StatusRegister::SecError,
        mask_register: RegisterRef::ctrl(ctrl::SEC_ERROR_INT_MASK),
        bit_mask: bits,
        active_high: false,
        needs_shift: false,
        ack_companion: 0,
        cause: Some(cause),
    }
}

const fn ded_error(name: &'static str, bits: u32, cause: &'static str) -> EventDescriptor {
    EventDescriptor {
        name,
        status: StatusRegister::DedError,
        mask_register: RegisterRef::ctrl(ctrl::DED_ERROR_INT_MASK),
        bit_mask: bits,
        active_high: false,
        needs_shift: false,
        ack_companion: 0,
        cause: Some(cause),
    }
}

const fn local(
    name: &'static str,
    bits: LocalInterrupt,
    cause: Option<&'static str>,
) -> EventDescriptor {
    EventDescriptor {
        name,
        status: StatusRegister::Local,
        mask_register: RegisterRef::bridge(bridge::IMASK_LOCAL),
        bit_mask: bits.bits(),
        active_high: true,
        needs_shift: false,
        ack_companion: 0,
        cause,
    }
}

/// Event table of the PolarFire SoC root port, in hardware index order.
pub static MPFS_EVENTS: &[EventDescriptor] = &[
    pcie_event("l2_exit", ctrl::PCIE_EVENT_L2_EXIT, "L2 exit event"),
    pcie_event("hotrst_exit", ctrl::PCIE_EVENT_HOTRST_EXIT, "Hot reset exit event"),
    pcie_event("dlup_exit", ctrl::PCIE_EVENT_DLUP_EXIT, "DLUP exit event"),
    sec_error("sec_tx_ram", ctrl::ERROR_INT_TX_RAM, "sec error in tx buffer"),
    sec_error("sec_rx_ram", ctrl::ERROR_INT_RX_RAM, "sec error in rx buffer"),
    sec_error("sec_pcie2axi_ram", ctrl::ERROR_INT_PCIE2AXI_RAM, "sec error in pcie2axi buffer"),
    sec_error("sec_axi2pcie_ram", ctrl::ERROR_INT_AXI2PCIE_RAM, "sec error in axi2pcie buffer"),
    ded_error("ded_tx_ram", ctrl::ERROR_INT_TX_RAM, "ded error in tx buffer"),
    ded_error("ded_rx_ram", ctrl::ERROR_INT_RX_RAM, "ded error in rx buffer"),
    ded_error("ded_pcie2axi_ram", ctrl::ERROR_INT_PCIE2AXI_RAM, "ded error in pcie2axi buffer"),
    ded_error("ded_axi2pcie_ram", ctrl::ERROR_INT_AXI2PCIE_RAM, "ded error in axi2pcie buffer"),
    local("dma_end_engine_0", LocalInterrupt::empty(), None),
    local("dma_end_engine_1", LocalInterrupt::empty(), None),
    local("dma_error_engine_0", LocalInterrupt::DMA_ERROR_ENGINE_0, Some("dma engine 0 error")),
    local("dma_error_engine_1", LocalInterrupt::DMA_ERROR_ENGINE_1, Some("dma engine 1 error")),
    local(
        "a_atr_evt_post_err",
        LocalInterrupt::A_ATR_EVT_POST_ERR,
        Some("axi write request error"),
    ),
    local(
        "a_atr_evt_fetch_err",
        LocalInterrupt::A_ATR_EVT_FETCH_ERR,
        Some("axi read request error"),
    ),
    local("a_atr_evt_discard_err", LocalInterrupt::A_ATR_EVT_DISCARD_ERR, Some("axi read timeout")),
    local("a_atr_evt_doorbell", LocalInterrupt::empty(), None),
    local(
        "p_atr_evt_post_err",
        LocalInterrupt::P_ATR_EVT_POST_ERR,
        Some("pcie write request error"),
    ),
    local(
        "p_atr_evt_fetch_err",
        LocalInterrupt::P_ATR_EVT_FETCH_ERR,
        Some("pcie read request error"),
    ),
    local(
        "p_atr_evt_discard_err",
        LocalInterrupt::P_ATR_EVT_DISCARD_ERR,
        Some("pcie read timeout"),
    ),
    local("p_atr_evt_doorbell", LocalInterrupt::empty(), None),
    local("intx", LocalInterrupt::INTX, None),
    local("msi", LocalInterrupt::MSI, None),
    local("pm_msi_int_aer_evt", LocalInterrupt::PM_MSI_INT_AER_EVT, Some("aer event")),
    local("pm_msi_int_events", LocalInterrupt::PM_MSI_INT_EVENTS, Some("pm/ltr/hotplug event")),
    local("pm_msi_int_sys_err", LocalInterrupt::PM_MSI_INT_SYS_ERR, Some("system error")),
];
