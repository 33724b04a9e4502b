mod common;

use std::sync::{Arc, Mutex};

use common::{icicle_config, init_tracing, Rig, MSI_DOORBELL};
use mpfs_mmio::RegisterFile;
use mpfs_pcie_host::regs::{bridge, ctrl, LocalInterrupt};
use mpfs_pcie_host::{Bridge, BridgeError, MsiMessage};

type Log = Arc<Mutex<Vec<u32>>>;

fn recorder(log: &Log) -> impl Fn(u32) + Send + Sync + 'static {
    let log = log.clone();
    move |line| log.lock().unwrap().push(line)
}

fn enabled(rig: &Rig) -> Bridge<Arc<RegisterFile>> {
    init_tracing();
    let host = rig.bring_up(icicle_config());
    host.enable_interrupts().unwrap();
    host
}

#[test]
fn scattered_events_are_each_delivered_once() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    for name in ["sec_tx_ram", "ded_pcie2axi_ram", "p_atr_evt_fetch_err"] {
        host.register_event_handler(name, recorder(&log)).unwrap();
    }

    rig.ctrl.assert(ctrl::SEC_ERROR_INT, 0x1);
    rig.ctrl.assert(ctrl::DED_ERROR_INT, 0x100);
    rig.bridge
        .assert(bridge::ISTATUS_LOCAL, LocalInterrupt::P_ATR_EVT_FETCH_ERR.bits());

    assert_eq!(host.handle_upstream_irq(), 3);
    assert_eq!(*log.lock().unwrap(), vec![3, 9, 20]);

    assert_eq!(rig.ctrl.get(ctrl::SEC_ERROR_INT), 0);
    assert_eq!(rig.ctrl.get(ctrl::DED_ERROR_INT), 0);
    assert_eq!(rig.bridge.get(bridge::ISTATUS_LOCAL), 0);
    assert_eq!(host.handle_upstream_irq(), 0);
}

#[test]
fn adjacent_status_bits_are_separate_events() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    host.register_event_handler("dma_error_engine_0", recorder(&log)).unwrap();
    host.register_event_handler("dma_error_engine_1", recorder(&log)).unwrap();

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 0b11 << 8);

    assert_eq!(host.handle_upstream_irq(), 2);
    assert_eq!(*log.lock().unwrap(), vec![13, 14]);
}

#[test]
fn level_flow_restores_the_gate_after_the_handler() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let gate_during = Arc::new(Mutex::new(None));
    let (seen, regs) = (gate_during.clone(), rig.bridge.clone());
    host.register_event_handler("pm_msi_int_aer_evt", move |_| {
        *seen.lock().unwrap() = Some(regs.get(bridge::IMASK_LOCAL) & (1 << 29));
    })
    .unwrap();

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 29);
    host.handle_upstream_irq();

    assert_eq!(*gate_during.lock().unwrap(), Some(0));
    assert_ne!(rig.bridge.get(bridge::IMASK_LOCAL) & (1 << 29), 0);
}

#[test]
fn pcie_link_event_ack_keeps_other_lines_gated() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    host.mask_event("l2_exit").unwrap();
    let log = Log::default();
    host.register_event_handler("dlup_exit", recorder(&log)).unwrap();

    rig.ctrl.assert(ctrl::PCIE_EVENT_INT, ctrl::PCIE_EVENT_DLUP_EXIT);
    assert_eq!(host.handle_upstream_irq(), 1);

    // L2 exit stays masked (bit 16 set), the other two are open again.
    assert_eq!(rig.ctrl.get(ctrl::PCIE_EVENT_INT), 1 << 16);
    assert_eq!(*log.lock().unwrap(), vec![2]);
}

#[test]
fn unclaimed_events_go_to_the_cause_logger() {
    let rig = Rig::new(5);
    let host = enabled(&rig);

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 31);
    rig.ctrl.assert(ctrl::SEC_ERROR_INT, 0x10);

    assert_eq!(host.handle_upstream_irq(), 2);
    assert_eq!(host.event_count("pm_msi_int_sys_err").unwrap(), 1);
    assert_eq!(host.event_count("sec_rx_ram").unwrap(), 1);
    assert_eq!(host.event_count("sec_tx_ram").unwrap(), 0);
}

#[test]
fn unmapped_status_bits_are_skipped() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    host.register_event_handler("pm_msi_int_sys_err", recorder(&log)).unwrap();

    rig.bridge.assert(bridge::ISTATUS_LOCAL, (1 << 31) | (1 << 0) | (1 << 19));

    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(*log.lock().unwrap(), vec![27]);
}

#[test]
fn masked_event_stays_pending_until_unmasked() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    host.register_event_handler("sec_tx_ram", recorder(&log)).unwrap();
    host.mask_event("sec_tx_ram").unwrap();
    assert_eq!(rig.ctrl.get(ctrl::SEC_ERROR_INT_MASK) & 0xf, 0xf);

    rig.ctrl.assert(ctrl::SEC_ERROR_INT, 0x1);
    assert_eq!(host.handle_upstream_irq(), 0);
    assert_eq!(rig.ctrl.get(ctrl::SEC_ERROR_INT), 0x1);

    // A bridge-wide enable does not override an explicit mask.
    host.disable_interrupts().unwrap();
    host.enable_interrupts().unwrap();
    assert_eq!(host.handle_upstream_irq(), 0);

    host.unmask_event("sec_tx_ram").unwrap();
    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(*log.lock().unwrap(), vec![3]);
}

#[test]
fn disabled_bridge_delivers_nothing() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    host.disable_interrupts().unwrap();

    assert_eq!(rig.bridge.get(bridge::IMASK_LOCAL), 0);
    assert_eq!(rig.ctrl.get(ctrl::SEC_ERROR_INT_MASK), ctrl::ERROR_INT_ALL);

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 30);
    assert_eq!(host.handle_upstream_irq(), 0);
}

#[test]
fn registration_by_name_is_checked() {
    let rig = Rig::new(5);
    let host = enabled(&rig);

    assert_eq!(
        host.register_event_handler("no_such_event", |_| {}),
        Err(BridgeError::UnknownEvent("no_such_event".into()))
    );
    assert_eq!(
        host.register_event_handler("msi", |_| {}),
        Err(BridgeError::PassThroughEvent("msi"))
    );
    assert_eq!(
        host.unregister_event_handler("intx"),
        Err(BridgeError::PassThroughEvent("intx"))
    );
}

#[test]
fn unregistering_restores_the_default_handler() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    host.register_event_handler("pm_msi_int_events", recorder(&log)).unwrap();
    host.unregister_event_handler("pm_msi_int_events").unwrap();

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 30);
    assert_eq!(host.handle_upstream_irq(), 1);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn events_raised_during_dispatch_wait_for_the_next_pass() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let ctrl_regs = rig.ctrl.clone();
    host.register_event_handler("sec_tx_ram", move |_| {
        ctrl_regs.assert(ctrl::DED_ERROR_INT, 0x1);
    })
    .unwrap();

    rig.ctrl.assert(ctrl::SEC_ERROR_INT, 0x1);

    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(host.event_count("ded_tx_ram").unwrap(), 0);
    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(host.event_count("ded_tx_ram").unwrap(), 1);
}

#[test]
fn handler_may_mask_its_own_event() {
    let rig = Rig::new(5);
    let host = Arc::new(enabled(&rig));
    let inner = host.clone();
    host.register_event_handler("a_atr_evt_post_err", move |_| {
        inner.mask_event("a_atr_evt_post_err").unwrap();
    })
    .unwrap();

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 16);
    assert_eq!(host.handle_upstream_irq(), 1);

    assert_eq!(rig.bridge.get(bridge::IMASK_LOCAL) & (1 << 16), 0);
    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 16);
    assert_eq!(host.handle_upstream_irq(), 0);
}

#[test]
fn intx_lines_are_demultiplexed() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    host.request_intx(1, recorder(&log)).unwrap();
    host.request_intx(3, recorder(&log)).unwrap();

    // Only requested lines are gated open.
    assert_eq!(
        rig.bridge.get(bridge::IMASK_LOCAL) & LocalInterrupt::INTX.bits(),
        (1 << 25) | (1 << 27)
    );

    rig.bridge.assert(bridge::ISTATUS_LOCAL, (1 << 25) | (1 << 27));
    assert_eq!(host.handle_upstream_irq(), 2);
    assert_eq!(*log.lock().unwrap(), vec![1, 3]);
    assert_eq!(rig.bridge.get(bridge::ISTATUS_LOCAL), 0);
    assert_eq!(host.event_count("intx").unwrap(), 1);
}

#[test]
fn unbound_intx_line_is_skipped() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    host.request_intx(2, recorder(&log)).unwrap();

    rig.bridge.assert(bridge::ISTATUS_LOCAL, (1 << 24) | (1 << 26));
    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(*log.lock().unwrap(), vec![2]);
    assert_eq!(rig.bridge.get(bridge::ISTATUS_LOCAL), 1 << 24);
}

#[test]
fn intx_requested_while_disabled_opens_with_the_bridge() {
    init_tracing();
    let rig = Rig::new(5);
    let host = rig.bring_up(icicle_config());
    host.request_intx(0, |_| {}).unwrap();
    assert_eq!(rig.bridge.get(bridge::IMASK_LOCAL), 0);

    host.enable_interrupts().unwrap();
    assert_eq!(
        rig.bridge.get(bridge::IMASK_LOCAL) & LocalInterrupt::INTX.bits(),
        1 << 24
    );

    host.free_intx(0).unwrap();
    assert_eq!(rig.bridge.get(bridge::IMASK_LOCAL) & LocalInterrupt::INTX.bits(), 0);
    assert!(matches!(
        host.free_intx(0),
        Err(BridgeError::NotBound { kind: "intx", line: 0 })
    ));
    assert!(matches!(
        host.request_intx(4, |_| {}),
        Err(BridgeError::InvalidLine { line: 4, .. })
    ));
}

#[test]
fn intx_handler_masking_the_pass_through_line_closes_every_intx_gate() {
    let rig = Rig::new(5);
    let host = Arc::new(enabled(&rig));
    let inner = host.clone();
    host.request_intx(0, move |_| inner.mask_event("intx").unwrap()).unwrap();
    host.request_intx(2, |_| {}).unwrap();
    let intx_gates = || rig.bridge.get(bridge::IMASK_LOCAL) & LocalInterrupt::INTX.bits();
    assert_eq!(intx_gates(), (1 << 24) | (1 << 26));

    rig.bridge.assert(bridge::ISTATUS_LOCAL, 1 << 24);
    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(intx_gates(), 0);

    // Lines requested while the pass-through line is masked stay gated too.
    host.request_intx(1, |_| {}).unwrap();
    assert_eq!(intx_gates(), 0);

    host.unmask_event("intx").unwrap();
    assert_eq!(intx_gates(), 0b111 << 24);
}

#[test]
fn msi_vectors_are_demultiplexed() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    assert_eq!(host.allocate_msi(recorder(&log)).unwrap(), 0);
    assert_eq!(host.allocate_msi(recorder(&log)).unwrap(), 1);
    assert_eq!(
        host.compose_delivery_token(1).unwrap(),
        MsiMessage {
            address: MSI_DOORBELL,
            data: 1
        }
    );

    rig.bridge.assert(bridge::ISTATUS_MSI, 0b11 | (1 << 5));
    rig.bridge.assert(bridge::ISTATUS_LOCAL, LocalInterrupt::MSI.bits());

    assert_eq!(host.handle_upstream_irq(), 2);
    assert_eq!(*log.lock().unwrap(), vec![0, 1]);
    assert_eq!(rig.bridge.get(bridge::ISTATUS_MSI), 0);
    assert_eq!(rig.bridge.get(bridge::ISTATUS_LOCAL), 0);
}

#[test]
fn masked_msi_is_delivered_after_unmask() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    let log = Log::default();
    let vector = host.allocate_msi(recorder(&log)).unwrap();
    host.mask_msi(vector).unwrap();

    rig.bridge.assert(bridge::ISTATUS_MSI, 1 << vector);
    rig.bridge.assert(bridge::ISTATUS_LOCAL, LocalInterrupt::MSI.bits());
    assert_eq!(host.handle_upstream_irq(), 0);
    assert_eq!(rig.bridge.get(bridge::ISTATUS_MSI), 1 << vector);

    host.unmask_msi(vector).unwrap();
    // The summary bit re-asserts while ISTATUS_MSI is non-zero.
    rig.bridge.assert(bridge::ISTATUS_LOCAL, LocalInterrupt::MSI.bits());
    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(*log.lock().unwrap(), vec![vector]);
}

#[test]
fn msi_status_beyond_vector_count_is_ignored() {
    let rig = Rig::new(2);
    let host = enabled(&rig);
    let log = Log::default();
    for _ in 0..4 {
        host.allocate_msi(recorder(&log)).unwrap();
    }

    rig.bridge.assert(bridge::ISTATUS_MSI, (1 << 6) | (1 << 3));
    rig.bridge.assert(bridge::ISTATUS_LOCAL, LocalInterrupt::MSI.bits());

    assert_eq!(host.handle_upstream_irq(), 1);
    assert_eq!(*log.lock().unwrap(), vec![3]);
}

#[test]
fn msi_allocation_is_bounded_and_frees_are_checked() {
    let rig = Rig::new(0);
    let host = enabled(&rig);

    assert_eq!(host.num_vectors(), 1);
    assert_eq!(host.allocate_msi(|_| {}).unwrap(), 0);
    assert_eq!(
        host.allocate_msi(|_| {}),
        Err(BridgeError::ResourceExhausted { capacity: 1 })
    );

    host.free_msi(0).unwrap();
    assert_eq!(host.free_msi(0), Err(BridgeError::DoubleFree { vector: 0 }));
    assert!(host.compose_delivery_token(0).is_err());
    assert_eq!(host.allocate_msi(|_| {}).unwrap(), 0);
}

#[test]
fn shutdown_masks_everything() {
    let rig = Rig::new(5);
    let host = enabled(&rig);
    host.request_intx(0, |_| {}).unwrap();
    host.allocate_msi(|_| {}).unwrap();

    host.shutdown();

    assert!(!host.interrupts_enabled());
    assert_eq!(rig.bridge.get(bridge::IMASK_LOCAL), 0);
    assert_eq!(rig.ctrl.get(ctrl::PCIE_EVENT_INT), ctrl::PCIE_EVENT_ENB_MASK);
    rig.bridge.assert(bridge::ISTATUS_LOCAL, u32::MAX);
    assert_eq!(host.handle_upstream_irq(), 0);
    assert_eq!(host.free_msi(0), Err(BridgeError::DoubleFree { vector: 0 }));
}
