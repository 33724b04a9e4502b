#![cfg(not(target_arch = "wasm32"))]

use mpfs_mmio::RegisterFile;
use mpfs_pcie_host::atr::{self, Direction, InboundRange, MergeConfig};
use mpfs_pcie_host::BridgeError;
use proptest::prelude::*;

const PAGE: u64 = 0x1000;

/// Disjoint identity-mapped ranges, ascending, built from `(gap, len)` page counts.
fn disjoint_ranges(base_page: u64, layout: &[(u64, u64)]) -> Vec<InboundRange> {
    let mut next = base_page * PAGE;
    layout
        .iter()
        .map(|&(gap, len)| {
            let range = InboundRange::identity(next + gap * PAGE, len * PAGE);
            next = range.bus_addr + range.size;
            range
        })
        .collect()
}

proptest! {
    #[test]
    fn merged_windows_cover_every_range(
        base_page in 0u64..(1 << 28),
        layout in prop::collection::vec((0u64..4096, 1u64..4096), 1..=8),
        max_windows in 2usize..=8,
        alignment_shift in 12u32..=31,
    ) {
        let ranges = disjoint_ranges(base_page, &layout);
        let cfg = MergeConfig {
            alignment: 1 << alignment_shift,
            max_windows: max_windows.max(ranges.len()),
        };

        let windows = match atr::merge_inbound(&ranges, None, &cfg) {
            Ok(windows) => windows,
            Err(err) => return Err(TestCaseError::fail(format!("{ranges:x?}: {err}"))),
        };

        prop_assert!(!windows.is_empty());
        prop_assert!(windows.len() <= cfg.max_windows);
        prop_assert_eq!(windows[0].source() % cfg.alignment, 0);
        for pair in windows.windows(2) {
            prop_assert_eq!(pair[0].size, pair[1].size);
            prop_assert_eq!(pair[0].source_end(), pair[1].source());
        }
        for window in &windows {
            prop_assert_eq!(window.direction, Direction::Inbound);
            prop_assert_eq!(window.local, window.remote);
            prop_assert!(atr::validate(window.local, window.remote, window.size).is_ok());
        }

        let first = windows[0].source();
        let last = windows[windows.len() - 1].source_end();
        for range in &ranges {
            prop_assert!(first <= range.bus_addr);
            prop_assert!(range.bus_addr + range.size <= last);
        }
    }

    #[test]
    fn single_slot_fails_only_when_no_window_holds_the_span(
        base_page in 0u64..(1 << 28),
        len in 1u64..4096,
    ) {
        let range = InboundRange::identity(base_page * PAGE, len * PAGE);
        let cfg = MergeConfig {
            max_windows: 1,
            ..MergeConfig::default()
        };
        let window = (len * PAGE).next_power_of_two();
        let fits = range.bus_addr / window == (range.bus_addr + range.size - 1) / window;

        match atr::merge_inbound(&[range], None, &cfg) {
            Ok(windows) => {
                prop_assert!(fits);
                prop_assert_eq!(windows.len(), 1);
                prop_assert_eq!(windows[0].size, window);
            }
            Err(BridgeError::InsufficientWindows { required, available }) => {
                prop_assert!(!fits);
                prop_assert_eq!((required, available), (2, 1));
            }
            Err(err) => return Err(TestCaseError::fail(format!("unexpected {err}"))),
        }
    }

    #[test]
    fn merged_windows_program_into_consecutive_slots(
        base_page in 0u64..(1 << 20),
        layout in prop::collection::vec((0u64..256, 1u64..256), 1..=4),
    ) {
        let ranges = disjoint_ranges(base_page, &layout);
        let Ok(windows) = atr::merge_inbound(&ranges, None, &MergeConfig::default()) else {
            return Ok(());
        };

        let regs = RegisterFile::new();
        for (index, window) in windows.iter().enumerate() {
            atr::program(&regs, index, window);
        }
        for (index, window) in windows.iter().enumerate() {
            prop_assert_eq!(atr::read_window(&regs, Direction::Inbound, index), Some(*window));
        }
        prop_assert_eq!(atr::read_window(&regs, Direction::Inbound, windows.len()), None);
    }
}
