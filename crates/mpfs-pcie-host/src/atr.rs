//! Address translation table (ATR) programming.
//!
//! Each direction has [`atr::MAX_WINDOWS`] slots of five registers. A slot translates a
//! naturally aligned, power-of-two sized source range to a target address and endpoint.

use mpfs_mmio::RegisterBlock;
use tracing::debug;

use crate::error::{BridgeError, ConfigError, Result};
use crate::regs::atr;

/// Destination selector written to `TRSL_PARAM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TranslationId {
    PcieTxRx = 0,
    PcieConfig = 1,
    Axi4LiteMaster = 2,
    Axi4Master0 = 4,
    Axi4Master1 = 5,
    Axi4Master2 = 6,
    Axi4Master3 = 7,
    Axi4Stream0 = 8,
    Axi4Stream1 = 9,
    Axi4Stream2 = 10,
    Axi4Stream3 = 11,
    InternalBridgeRegisters = 12,
}

impl TranslationId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::PcieTxRx,
            1 => Self::PcieConfig,
            2 => Self::Axi4LiteMaster,
            4 => Self::Axi4Master0,
            5 => Self::Axi4Master1,
            6 => Self::Axi4Master2,
            7 => Self::Axi4Master3,
            8 => Self::Axi4Stream0,
            9 => Self::Axi4Stream1,
            10 => Self::Axi4Stream2,
            11 => Self::Axi4Stream3,
            12 => Self::InternalBridgeRegisters,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Local bus to PCIe.
    Outbound,
    /// PCIe to local bus.
    Inbound,
}

impl Direction {
    fn table_base(self) -> usize {
        match self {
            Direction::Outbound => atr::OUTBOUND_BASE,
            Direction::Inbound => atr::INBOUND_BASE,
        }
    }
}

/// One programmed ATR slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationWindow {
    /// Bus-side base.
    pub local: u64,
    /// PCIe-side base.
    pub remote: u64,
    pub size: u64,
    pub direction: Direction,
    pub translation_id: TranslationId,
}

impl TranslationWindow {
    /// Base of the range the hardware matches incoming transactions against.
    pub fn source(&self) -> u64 {
        match self.direction {
            Direction::Outbound => self.local,
            Direction::Inbound => self.remote,
        }
    }

    pub fn target(&self) -> u64 {
        match self.direction {
            Direction::Outbound => self.remote,
            Direction::Inbound => self.local,
        }
    }

    pub fn source_end(&self) -> u64 {
        self.source() + self.size
    }
}

/// `log2(size) - 1`, as stored in `SRCADDR_PARAM[6:1]`.
pub const fn encode_size(size: u64) -> u32 {
    size.trailing_zeros() - 1
}

pub const fn decode_size(encoded: u32) -> u64 {
    1u64 << (encoded + 1)
}

pub fn is_valid_size(size: u64) -> bool {
    size.is_power_of_two() && size >= atr::MIN_SIZE
}

/// Checks a window's size and the alignment of both of its bases.
pub fn validate(local: u64, remote: u64, size: u64) -> std::result::Result<(), ConfigError> {
    if !is_valid_size(size) {
        return Err(ConfigError::BadWindowSize { addr: local, size });
    }
    for addr in [local, remote] {
        if addr & (size - 1) != 0 {
            return Err(ConfigError::MisalignedWindow { addr, size });
        }
    }
    Ok(())
}

fn write_slot<R: RegisterBlock>(regs: &R, window: &TranslationWindow, index: usize) {
    debug_assert!(index < atr::MAX_WINDOWS, "ATR slot {index} out of range");
    debug_assert!(
        validate(window.local, window.remote, window.size).is_ok(),
        "bad ATR window {window:x?}"
    );

    let slot = atr::slot(window.direction.table_base(), index);
    let source = window.source();
    let target = window.target();
    let param = (source as u32 & atr::ADDR_MASK)
        | ((encode_size(window.size) << atr::SIZE_SHIFT) & atr::SIZE_MASK)
        | atr::IMPL_ENABLE;

    regs.write32(slot + atr::SRCADDR_PARAM, param);
    regs.write32(slot + atr::SRC_ADDR, (source >> 32) as u32);
    regs.write32(slot + atr::TRSL_ADDR_LSB, target as u32);
    regs.write32(slot + atr::TRSL_ADDR_UDW, (target >> 32) as u32);
    regs.write32(slot + atr::TRSL_PARAM, window.translation_id as u32);

    debug!(
        direction = ?window.direction,
        window = index,
        source = format_args!("{source:#x}"),
        target = format_args!("{target:#x}"),
        size = format_args!("{:#x}", window.size),
        "programmed ATR window"
    );
}

/// Maps `size` bytes of bus space at `local` to PCIe space at `remote`.
///
/// The caller guarantees a power-of-two `size` of at least 4 KiB and size-aligned bases.
pub fn program_outbound<R: RegisterBlock>(
    regs: &R,
    index: usize,
    local: u64,
    remote: u64,
    size: u64,
    translation_id: TranslationId,
) {
    let window = TranslationWindow {
        local,
        remote,
        size,
        direction: Direction::Outbound,
        translation_id,
    };
    write_slot(regs, &window, index);
}

/// Maps `size` bytes of PCIe space at `remote` to bus memory at `local`.
pub fn program_inbound<R: RegisterBlock>(
    regs: &R,
    index: usize,
    local: u64,
    remote: u64,
    size: u64,
) {
    let window = TranslationWindow {
        local,
        remote,
        size,
        direction: Direction::Inbound,
        translation_id: TranslationId::Axi4Master0,
    };
    write_slot(regs, &window, index);
}

pub fn program<R: RegisterBlock>(regs: &R, index: usize, window: &TranslationWindow) {
    write_slot(regs, window, index);
}

/// Reads a slot back. Returns `None` for slots without the implemented bit or with an
/// unknown translation id.
pub fn read_window<R: RegisterBlock>(
    regs: &R,
    direction: Direction,
    index: usize,
) -> Option<TranslationWindow> {
    let slot = atr::slot(direction.table_base(), index);
    let param = regs.read32(slot + atr::SRCADDR_PARAM);
    if param & atr::IMPL_ENABLE == 0 {
        return None;
    }

    let source = u64::from(regs.read32(slot + atr::SRC_ADDR)) << 32
        | u64::from(param & atr::ADDR_MASK);
    let target = u64::from(regs.read32(slot + atr::TRSL_ADDR_UDW)) << 32
        | u64::from(regs.read32(slot + atr::TRSL_ADDR_LSB));
    let size = decode_size((param & atr::SIZE_MASK) >> atr::SIZE_SHIFT);
    let translation_id = TranslationId::from_raw(regs.read32(slot + atr::TRSL_PARAM))?;

    let (local, remote) = match direction {
        Direction::Outbound => (source, target),
        Direction::Inbound => (target, source),
    };
    Some(TranslationWindow {
        local,
        remote,
        size,
        direction,
        translation_id,
    })
}

/// Offset between the bus addresses in outbound ranges and the addresses the bridge sees.
///
/// When the bridge sits behind an upstream translator, the largest upstream base that is
/// still below `first_outbound` is where the fabric interface begins.
pub fn parent_range_offset(parent_bases: &[u64], first_outbound: u64) -> u64 {
    parent_bases
        .iter()
        .copied()
        .filter(|&base| base > 0 && base < first_outbound)
        .max()
        .unwrap_or(0)
}

/// A bus range that devices must be able to reach by DMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InboundRange {
    /// PCIe address devices use.
    pub pci_addr: u64,
    /// Bus address the range lands on.
    pub bus_addr: u64,
    pub size: u64,
}

impl InboundRange {
    /// A range that is visible at the same address on both sides.
    pub const fn identity(bus_addr: u64, size: u64) -> Self {
        Self {
            pci_addr: bus_addr,
            bus_addr,
            size,
        }
    }
}

/// Tuning for [`merge_inbound`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeConfig {
    /// Boundary the merged start is aligned down to. Must be a power of two of at least
    /// 4 KiB; [`atr::ATT_MASK`] corresponds to 2 GiB.
    pub alignment: u64,
    /// Number of inbound slots available.
    pub max_windows: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            alignment: atr::MIN_SIZE,
            max_windows: atr::MAX_WINDOWS,
        }
    }
}

/// Covers every range in `ranges` with at most `cfg.max_windows` equal inbound windows.
///
/// The ranges are collapsed into one span from the lowest base to the highest end. The
/// window is the smallest power of two holding that span, the start is moved back to the
/// window (or merge alignment) boundary, and equal windows are laid out from there until
/// the span is covered. The result may expose bus memory between and around the requested
/// ranges; the hardware has too few slots for per-range windows.
///
/// When `upstream` is given, its entries replace the bus address of the range at the same
/// position. This is a pure computation: nothing is programmed.
pub fn merge_inbound(
    ranges: &[InboundRange],
    upstream: Option<&[u64]>,
    cfg: &MergeConfig,
) -> Result<Vec<TranslationWindow>> {
    if ranges.len() > cfg.max_windows {
        return Err(ConfigError::TooManyInboundRanges {
            count: ranges.len(),
            max: cfg.max_windows,
        }
        .into());
    }
    if let Some(upstream) = upstream {
        if upstream.len() != ranges.len() {
            return Err(ConfigError::UpstreamMismatch {
                upstream: upstream.len(),
                ranges: ranges.len(),
            }
            .into());
        }
    }
    if !cfg.alignment.is_power_of_two() || cfg.alignment < atr::MIN_SIZE {
        return Err(ConfigError::BadAlignment(cfg.alignment).into());
    }
    if ranges.is_empty() {
        return Ok(Vec::new());
    }

    let mut resolved = Vec::with_capacity(ranges.len());
    for (i, range) in ranges.iter().enumerate() {
        let bus_addr = upstream.map_or(range.bus_addr, |up| up[i]);
        if range.size == 0 || bus_addr.checked_add(range.size).is_none() {
            return Err(ConfigError::EmptyRange { addr: bus_addr }.into());
        }
        resolved.push(InboundRange {
            pci_addr: range.pci_addr,
            bus_addr,
            size: range.size,
        });
    }
    check_overlap(resolved.iter().map(|r| (r.bus_addr, r.bus_addr + r.size)))?;

    // The lowest range anchors the bus/PCIe offset for the whole span.
    let lowest = resolved
        .iter()
        .min_by_key(|r| r.bus_addr)
        .copied()
        .unwrap_or(resolved[0]);
    let end = resolved
        .iter()
        .map(|r| r.bus_addr + r.size)
        .max()
        .unwrap_or(lowest.bus_addr + lowest.size);

    let span = (end - lowest.bus_addr).max(atr::MIN_SIZE);
    let covered = span
        .checked_next_power_of_two()
        .ok_or(BridgeError::InsufficientWindows {
            required: u64::MAX,
            available: cfg.max_windows,
        })?;

    // Start from the smallest window the whole span fits in, move the start back to that
    // window's boundary and widen until the run from there reaches `end`. Once the window
    // is at least the merge alignment, two windows always suffice.
    let widest = covered.max(cfg.alignment);
    let mut window = covered;
    let (start, required) = loop {
        let start = lowest.bus_addr & !(window.max(cfg.alignment) - 1);
        let required = (end - start).div_ceil(window);
        if required <= cfg.max_windows as u64 {
            break (start, required);
        }
        if window >= widest {
            return Err(BridgeError::InsufficientWindows {
                required,
                available: cfg.max_windows,
            });
        }
        window <<= 1;
    };

    let pci_start = lowest
        .pci_addr
        .checked_sub(lowest.bus_addr - start)
        .filter(|pci| pci & (window - 1) == 0)
        .ok_or(ConfigError::MisalignedWindow {
            addr: lowest.pci_addr,
            size: window,
        })?;

    Ok((0..required)
        .map(|i| TranslationWindow {
            local: start + i * window,
            remote: pci_start + i * window,
            size: window,
            direction: Direction::Inbound,
            translation_id: TranslationId::Axi4Master0,
        })
        .collect())
}

/// Fails if any two half-open `[start, end)` ranges intersect.
pub(crate) fn check_overlap(
    ranges: impl Iterator<Item = (u64, u64)>,
) -> std::result::Result<(), ConfigError> {
    let mut sorted: Vec<(u64, u64)> = ranges.collect();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(ConfigError::OverlappingRanges {
                first: pair[0].0,
                second: pair[1].0,
            });
        }
    }
    Ok(())
}
