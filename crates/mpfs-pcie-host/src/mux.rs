use mpfs_mmio::RegisterBlock;
use tracing::debug;

use crate::regs::BridgeRegisters;
use crate::registry::{EventIndex, EventRegistry, StatusRegister};

/// Set of asserted events from one poll.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventSet(u64);

impl EventSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, event: EventIndex) {
        self.0 |= 1 << event.0;
    }

    pub fn contains(&self, event: EventIndex) -> bool {
        self.0 & (1 << event.0) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Asserted events in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = EventIndex> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let idx = bits.trailing_zeros();
            bits &= bits - 1;
            Some(EventIndex(idx as u8))
        })
    }
}

impl FromIterator<EventIndex> for EventSet {
    fn from_iter<I: IntoIterator<Item = EventIndex>>(iter: I) -> Self {
        let mut set = Self::empty();
        for event in iter {
            set.insert(event);
        }
        set
    }
}

/// Folds the four status registers into one [`EventSet`].
///
/// Polling never clears anything; that is left to the controllers' ack.
pub struct EventMultiplexer<'a, R> {
    regs: &'a BridgeRegisters<R>,
    registry: &'a EventRegistry,
}

impl<'a, R: RegisterBlock> EventMultiplexer<'a, R> {
    pub fn new(regs: &'a BridgeRegisters<R>, registry: &'a EventRegistry) -> Self {
        Self { regs, registry }
    }

    /// Reads each status register exactly once.
    pub fn poll(&self) -> EventSet {
        let mut set = EventSet::empty();
        for status in StatusRegister::ALL {
            let value = self.regs.read(status.register()) & status.status_bits();
            if value == 0 {
                continue;
            }
            let mut unclaimed = value;
            for &(bits, event) in self.registry.events_in(status) {
                if value & bits != 0 {
                    set.insert(event);
                    unclaimed &= !bits;
                }
            }
            if unclaimed != 0 {
                debug!(
                    register = ?status,
                    bits = format_args!("{unclaimed:#x}"),
                    "unrecognized event status bits"
                );
            }
        }
        set
    }
}
