use std::collections::BTreeMap;

use spin::Mutex;

use crate::RegisterBlock;

/// A sparse, simulated register file.
///
/// Unwritten registers read as zero. Registers can be marked write-one-to-clear for a set of
/// bits, which is how interrupt status registers behave: writing `1` to such a bit clears it,
/// writing `0` leaves it alone. The hardware side of a test raises bits with [`Self::assert`].
///
/// Every driver-side write is appended to a log so tests can check exact write sequences.
#[derive(Debug, Default)]
pub struct RegisterFile {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    regs: BTreeMap<usize, u32>,
    w1c: BTreeMap<usize, u32>,
    writes: Vec<(usize, u32)>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `bits` of the register at `offset` as write-one-to-clear.
    pub fn with_w1c(self, offset: usize, bits: u32) -> Self {
        *self.state.lock().w1c.entry(offset).or_default() |= bits;
        self
    }

    /// Hardware-side store; bypasses W1C semantics and the write log.
    pub fn set(&self, offset: usize, value: u32) {
        self.state.lock().regs.insert(offset, value);
    }

    /// Hardware-side load; identical to [`RegisterBlock::read32`] but reads as intent.
    pub fn get(&self, offset: usize) -> u32 {
        self.state.lock().regs.get(&offset).copied().unwrap_or(0)
    }

    /// Hardware-side assertion of status bits.
    pub fn assert(&self, offset: usize, bits: u32) {
        *self.state.lock().regs.entry(offset).or_default() |= bits;
    }

    /// All driver-side writes so far, oldest first.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    /// Driver-side writes that targeted `offset`.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().writes.clear();
    }

    /// Copy of every register that has ever been stored, for whole-file comparisons.
    pub fn snapshot(&self) -> BTreeMap<usize, u32> {
        self.state.lock().regs.clone()
    }
}

impl RegisterBlock for RegisterFile {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        let w1c = state.w1c.get(&offset).copied().unwrap_or(0);
        let reg = state.regs.entry(offset).or_default();
        *reg = (value & !w1c) | (*reg & w1c & !value);
        state.writes.push((offset, value));
    }
}
