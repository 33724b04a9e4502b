use mpfs_mmio::RegisterBlock;
use spin::Mutex;
use tracing::{debug, warn};

use crate::error::{BridgeError, ConfigError, Result};
use crate::regs::{bridge, msi_cap};

/// Memory write a device issues to raise an MSI vector.
///
/// Every vector shares one address; the vector number travels in the data word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

impl MsiMessage {
    pub fn address_lo(&self) -> u32 {
        self.address as u32
    }

    pub fn address_hi(&self) -> u32 {
        (self.address >> 32) as u32
    }
}

/// First-fit allocator over the bridge's MSI vectors.
///
/// Its lock is held across the callbacks of [`allocate_with`](Self::allocate_with) and
/// [`free_with`](Self::free_with), so it ranks above the register lock.
#[derive(Debug)]
pub struct MsiAllocator {
    num_vectors: u32,
    used: Mutex<u32>,
}

impl MsiAllocator {
    pub fn new(num_vectors: u32) -> Result<Self> {
        if !num_vectors.is_power_of_two() || num_vectors > bridge::MAX_MSI_VECTORS {
            return Err(ConfigError::UnsupportedVectorCount(num_vectors).into());
        }
        Ok(Self {
            num_vectors,
            used: Mutex::new(0),
        })
    }

    pub fn num_vectors(&self) -> u32 {
        self.num_vectors
    }

    /// Lowest free vector.
    pub fn allocate(&self) -> Result<u32> {
        self.allocate_with(|_| Ok(()))
    }

    /// Picks the lowest free vector and runs `claim` on it with the bitmap locked. The
    /// vector is only marked used if `claim` succeeds.
    pub fn allocate_with(&self, claim: impl FnOnce(u32) -> Result<()>) -> Result<u32> {
        let mut used = self.used.lock();
        let vector = (!*used).trailing_zeros();
        if vector >= self.num_vectors {
            return Err(BridgeError::ResourceExhausted {
                capacity: self.num_vectors,
            });
        }
        claim(vector)?;
        *used |= 1 << vector;
        Ok(vector)
    }

    pub fn free(&self, vector: u32) -> Result<()> {
        self.free_with(vector, || Ok(()))
    }

    /// Runs `release` for an allocated vector with the bitmap locked, then clears it. A
    /// vector that is not allocated is rejected before `release` runs, and a failed
    /// `release` leaves it allocated.
    pub fn free_with(&self, vector: u32, release: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut used = self.used.lock();
        if vector >= self.num_vectors || *used & (1 << vector) == 0 {
            warn!(vector, "trying to free unused MSI");
            return Err(BridgeError::DoubleFree { vector });
        }
        release()?;
        *used &= !(1 << vector);
        Ok(())
    }

    /// Forgets every allocation.
    pub fn clear(&self) {
        *self.used.lock() = 0;
    }

    pub fn is_used(&self, vector: u32) -> bool {
        vector < self.num_vectors && *self.used.lock() & (1 << vector) != 0
    }

    pub fn in_use(&self) -> u32 {
        self.used.lock().count_ones()
    }
}

/// MSI resources advertised by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiCapability {
    pub num_vectors: u32,
    pub address: u64,
}

/// Reads the vector count and doorbell address, and hides MSI-X from the root port.
pub fn read_capability<R: RegisterBlock>(bridge_regs: &R) -> MsiCapability {
    let dw0 = bridge_regs.read32(bridge::PCIE_PCI_IRQ_DW0) & !bridge::MSIX_CAP;
    bridge_regs.write32(bridge::PCIE_PCI_IRQ_DW0, dw0);

    let encoded = (dw0 & bridge::NUM_MSI_MSGS_MASK) >> bridge::NUM_MSI_MSGS_SHIFT;
    let num_vectors = (1u32 << encoded).min(bridge::MAX_MSI_VECTORS);
    let address = u64::from(bridge_regs.read32(bridge::IMSI_ADDR));

    debug!(num_vectors, address = format_args!("{address:#x}"), "read MSI capability");
    MsiCapability {
        num_vectors,
        address,
    }
}

/// Enables the root port's own MSI capability and points it at the bridge doorbell.
///
/// The queue size is set to whatever the capability advertises in its multiple-message
/// field. `ecam` is the root port's configuration space.
pub fn fixup_root_port_capability<R: RegisterBlock>(ecam: &R, address: u64) {
    let header = ecam.read32(msi_cap::CAP_OFFSET) | msi_cap::FLAGS_ENABLE;
    let queue = (header & msi_cap::FLAGS_QMASK) >> msi_cap::FLAGS_QMASK.trailing_zeros();
    let header = header | (queue << msi_cap::FLAGS_QSIZE.trailing_zeros());
    ecam.write32(msi_cap::CAP_OFFSET, header);

    ecam.write32(msi_cap::ADDRESS_LO, address as u32);
    ecam.write32(msi_cap::ADDRESS_HI, (address >> 32) as u32);
}
