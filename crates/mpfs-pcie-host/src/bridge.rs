//! One root port: bring-up, the runtime interrupt API, and upstream dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mpfs_mmio::RegisterBlock;
use tracing::{debug, error, info, warn};

use crate::atr::{self, InboundRange, MergeConfig, TranslationId, TranslationWindow};
use crate::error::{BridgeError, ConfigError, Result};
use crate::irq::{
    Controller, ControllerNode, EventChip, Handler, Hardware, IntxChip, IrqDomain, LineState,
    MsiChip, RegisterLock,
};
use crate::msi::{self, MsiAllocator, MsiMessage};
use crate::mux::EventMultiplexer;
use crate::registry::{EventIndex, EventRegistry, MPFS_INTX_EVENT, MPFS_MSI_EVENT};
use crate::regs::{self, bridge, BridgeRegisters, LocalInterrupt};

/// A bus range exposed on the PCIe side as memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboundRange {
    pub bus_addr: u64,
    pub pci_addr: u64,
    pub size: u64,
}

/// Bus range of the ECAM configuration window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigWindow {
    pub bus_addr: u64,
    pub size: u64,
}

/// Event lines that fan out to the chained controllers instead of a terminal handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassThrough {
    pub intx: EventIndex,
    pub msi: EventIndex,
}

impl Default for PassThrough {
    fn default() -> Self {
        Self {
            intx: MPFS_INTX_EVENT,
            msi: MPFS_MSI_EVENT,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Memory windows, programmed from slot 1 in order.
    pub outbound: Vec<OutboundRange>,
    /// Configuration space, always slot 0.
    pub config_window: ConfigWindow,
    /// Bus ranges devices must reach by DMA.
    pub inbound: Vec<InboundRange>,
    /// Upstream-visible replacements for the bus addresses in `inbound`, one per range.
    pub upstream: Option<Vec<u64>>,
    /// Base addresses of the upstream translator's ranges. Used to derive the offset
    /// between bus addresses and what the bridge's AXI slave sees.
    pub parent_ranges: Vec<u64>,
    pub merge: MergeConfig,
    pub pass_through: PassThrough,
}

/// Windows derived from a [`BridgeConfig`] before any register is touched.
struct WindowPlan {
    outbound: Vec<TranslationWindow>,
    inbound: Vec<TranslationWindow>,
}

impl BridgeConfig {
    fn plan(&self) -> Result<WindowPlan> {
        let max_outbound = regs::atr::MAX_WINDOWS - 1;
        if self.outbound.len() > max_outbound {
            return Err(ConfigError::TooManyOutboundRanges {
                count: self.outbound.len(),
                max: max_outbound,
            }
            .into());
        }

        let first = self
            .outbound
            .first()
            .map_or(self.config_window.bus_addr, |range| range.bus_addr);
        let offset = atr::parent_range_offset(&self.parent_ranges, first);

        let cfg_local = self.config_window.bus_addr.wrapping_sub(offset);
        atr::validate(cfg_local, cfg_local, self.config_window.size)?;
        let mut outbound = vec![TranslationWindow {
            local: cfg_local,
            remote: cfg_local,
            size: self.config_window.size,
            direction: atr::Direction::Outbound,
            translation_id: TranslationId::PcieConfig,
        }];

        for range in &self.outbound {
            let local = range.bus_addr.wrapping_sub(offset);
            atr::validate(local, range.pci_addr, range.size)?;
            outbound.push(TranslationWindow {
                local,
                remote: range.pci_addr,
                size: range.size,
                direction: atr::Direction::Outbound,
                translation_id: TranslationId::PcieTxRx,
            });
        }
        atr::check_overlap(outbound.iter().map(|w| (w.source(), w.source_end())))?;

        let inbound = atr::merge_inbound(&self.inbound, self.upstream.as_deref(), &self.merge)?;

        Ok(WindowPlan { outbound, inbound })
    }
}

/// Logs the cause of an event nobody claimed.
fn cause_logger(registry: Arc<EventRegistry>) -> Handler {
    Arc::new(move |line: u32| {
        let desc = registry.describe(EventIndex(line as u8));
        match desc.cause {
            Some(cause) => error!(event = desc.name, "{cause}"),
            None => warn!(event = desc.name, "bad event IRQ"),
        }
    })
}

/// Handle for one PCIe root port bridge.
///
/// Every operation goes through this handle; several bridges can coexist.
pub struct Bridge<R> {
    hw: Hardware<R>,
    registry: Arc<EventRegistry>,
    events: ControllerNode,
    intx: ControllerNode,
    msi: ControllerNode,
    allocator: MsiAllocator,
    pass_through: PassThrough,
    enabled: AtomicBool,
    outbound: Vec<TranslationWindow>,
    inbound: Vec<TranslationWindow>,
}

impl<R: RegisterBlock> Bridge<R> {
    /// Brings up a PolarFire SoC root port.
    ///
    /// The configuration is validated in full before the first register write, so an
    /// error leaves the hardware untouched. On success every source is masked; call
    /// [`Self::enable_interrupts`] to start delivery.
    pub fn new<E: RegisterBlock>(
        config: BridgeConfig,
        regs: BridgeRegisters<R>,
        ecam: &E,
    ) -> Result<Self> {
        Self::with_registry(
            config,
            EventRegistry::mpfs(),
            RegisterLock::default(),
            regs,
            ecam,
        )
    }

    pub fn with_registry<E: RegisterBlock>(
        config: BridgeConfig,
        registry: EventRegistry,
        lock: RegisterLock,
        regs: BridgeRegisters<R>,
        ecam: &E,
    ) -> Result<Self> {
        for index in [config.pass_through.intx, config.pass_through.msi] {
            if index.as_usize() >= registry.len() {
                return Err(ConfigError::BadPassThrough(index.as_usize()).into());
            }
        }
        let plan = config.plan()?;

        let hw = Hardware::with_lock(regs, lock);
        hw.regs.quiesce();

        let cap = msi::read_capability(hw.regs.bridge());
        let allocator = MsiAllocator::new(cap.num_vectors)?;

        let (config_window, memory_windows) = plan.outbound.split_at(1);
        atr::program(hw.regs.bridge(), 0, &config_window[0]);
        msi::fixup_root_port_capability(ecam, cap.address);
        for (index, window) in memory_windows.iter().enumerate() {
            atr::program(hw.regs.bridge(), index + 1, window);
        }
        for (index, window) in plan.inbound.iter().enumerate() {
            atr::program(hw.regs.bridge(), index, window);
        }

        let registry = Arc::new(registry);
        let events = ControllerNode::new(
            Controller::Event(EventChip::new(registry.clone())),
            IrqDomain::new("event", registry.len() as u32),
        );
        let default_handler = cause_logger(registry.clone());
        for (index, _) in registry.iter() {
            let line = u32::from(index.0);
            if index == config.pass_through.intx || index == config.pass_through.msi {
                events.domain.bind(line, Arc::new(|_: u32| {}))?;
            } else {
                events.domain.bind(line, default_handler.clone())?;
            }
        }

        let intx = ControllerNode::new(
            Controller::Intx(IntxChip),
            IrqDomain::new("intx", bridge::NUM_INTX),
        );
        let msi = ControllerNode::new(
            Controller::Msi(MsiChip::new(cap.address, cap.num_vectors)),
            IrqDomain::new("msi", cap.num_vectors),
        );

        info!(
            outbound = plan.outbound.len(),
            inbound = plan.inbound.len(),
            msi_vectors = cap.num_vectors,
            "PCIe bridge initialized"
        );

        Ok(Self {
            hw,
            registry,
            events,
            intx,
            msi,
            allocator,
            pass_through: config.pass_through,
            enabled: AtomicBool::new(false),
            outbound: plan.outbound,
            inbound: plan.inbound,
        })
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn registers(&self) -> &BridgeRegisters<R> {
        &self.hw.regs
    }

    pub fn outbound_windows(&self) -> &[TranslationWindow] {
        &self.outbound
    }

    pub fn inbound_windows(&self) -> &[TranslationWindow] {
        &self.inbound
    }

    pub fn num_vectors(&self) -> u32 {
        self.allocator.num_vectors()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Unmasks every event line not explicitly masked with [`Self::mask_event`].
    pub fn enable_interrupts(&self) -> Result<()> {
        self.enabled.store(true, Ordering::Release);
        for line in 0..self.events.domain.len() {
            self.resume_event(line)?;
        }
        debug!("bridge interrupts enabled");
        Ok(())
    }

    pub fn disable_interrupts(&self) -> Result<()> {
        self.enabled.store(false, Ordering::Release);
        for line in self.events.domain.lines_in(LineState::Active) {
            self.set_event_active(line, false)?;
        }
        debug!("bridge interrupts disabled");
        Ok(())
    }

    fn set_event_active(&self, line: u32, active: bool) -> Result<()> {
        if !active {
            self.events.deactivate(&self.hw, line)
        } else if self.is_intx_line(line) {
            self.events.activate_gated(&self.hw, line, || false)?;
            self.reopen_intx();
            Ok(())
        } else {
            self.events.activate(&self.hw, line)
        }
    }

    /// Reactivates a masked event line unless it is held.
    fn resume_event(&self, line: u32) -> Result<()> {
        if !self.is_intx_line(line) {
            self.events.resume(&self.hw, line, || true)?;
        } else if self.events.resume(&self.hw, line, || false)? {
            self.reopen_intx();
        }
        Ok(())
    }

    /// The INTx pass-through line shares its gate bits with the four INTx lines, so
    /// opening it only unmasks the INTx lines that are themselves active.
    fn reopen_intx(&self) {
        self.intx.reopen(&self.hw, || self.intx_gate_open());
    }

    fn is_intx_line(&self, line: u32) -> bool {
        line == u32::from(self.pass_through.intx.0)
    }

    fn intx_gate_open(&self) -> bool {
        self.events
            .domain
            .state(u32::from(self.pass_through.intx.0))
            == Ok(LineState::Active)
    }

    fn terminal_event(&self, name: &str) -> Result<EventIndex> {
        let index = self.event_index(name)?;
        if self.is_pass_through(index) {
            return Err(BridgeError::PassThroughEvent(
                self.registry.describe(index).name,
            ));
        }
        Ok(index)
    }

    fn event_index(&self, name: &str) -> Result<EventIndex> {
        self.registry
            .find(name)
            .ok_or_else(|| BridgeError::UnknownEvent(name.to_owned()))
    }

    fn is_pass_through(&self, index: EventIndex) -> bool {
        index == self.pass_through.intx || index == self.pass_through.msi
    }

    /// Routes a named event to `handler` in place of the default cause logger.
    pub fn register_event_handler(
        &self,
        name: &str,
        handler: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<()> {
        let index = self.terminal_event(name)?;
        self.events
            .domain
            .replace(u32::from(index.0), Arc::new(handler))?;
        Ok(())
    }

    /// Restores the default cause logger for a named event.
    pub fn unregister_event_handler(&self, name: &str) -> Result<()> {
        let index = self.terminal_event(name)?;
        self.events
            .domain
            .replace(u32::from(index.0), cause_logger(self.registry.clone()))?;
        Ok(())
    }

    /// Masks a named event until [`Self::unmask_event`], surviving bridge-wide enables.
    pub fn mask_event(&self, name: &str) -> Result<()> {
        let line = u32::from(self.event_index(name)?.0);
        self.events.domain.set_held(line, true)?;
        self.set_event_active(line, false)
    }

    pub fn unmask_event(&self, name: &str) -> Result<()> {
        let line = u32::from(self.event_index(name)?.0);
        self.events.domain.set_held(line, false)?;
        if self.interrupts_enabled() {
            self.resume_event(line)?;
        }
        Ok(())
    }

    /// Deliveries so far on a named event line.
    pub fn event_count(&self, name: &str) -> Result<u64> {
        let line = u32::from(self.event_index(name)?.0);
        Ok(self.events.domain.delivered(line))
    }

    /// Binds a handler to legacy line INTA..INTD (`0..4`) and unmasks it. The gate bit stays
    /// closed while the INTx pass-through line is masked.
    pub fn request_intx(
        &self,
        line: u32,
        handler: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<()> {
        self.intx.domain.bind(line, Arc::new(handler))?;
        self.intx.activate_gated(&self.hw, line, || self.intx_gate_open())
    }

    pub fn free_intx(&self, line: u32) -> Result<()> {
        self.intx.deactivate(&self.hw, line)?;
        self.intx.domain.unbind(line)?;
        Ok(())
    }

    /// Allocates the lowest free MSI vector, binds `handler` to it and unmasks it.
    pub fn allocate_msi(&self, handler: impl Fn(u32) + Send + Sync + 'static) -> Result<u32> {
        self.allocator.allocate_with(|vector| {
            self.msi.domain.bind(vector, Arc::new(handler))?;
            self.msi.activate(&self.hw, vector).inspect_err(|_| {
                self.msi.domain.unbind(vector).ok();
            })
        })
    }

    /// Masks and unbinds a vector, then returns it to the allocator. The allocator stays
    /// locked throughout, so the vector cannot be handed out again halfway.
    pub fn free_msi(&self, vector: u32) -> Result<()> {
        self.allocator.free_with(vector, || {
            self.msi.deactivate(&self.hw, vector)?;
            self.msi.domain.unbind(vector)?;
            Ok(())
        })
    }

    fn allocated_vector(&self, vector: u32) -> Result<u32> {
        if self.allocator.is_used(vector) {
            Ok(vector)
        } else {
            Err(BridgeError::NotBound {
                kind: "msi",
                line: vector,
            })
        }
    }

    pub fn mask_msi(&self, vector: u32) -> Result<()> {
        self.msi.deactivate(&self.hw, self.allocated_vector(vector)?)
    }

    /// Unmasks a vector. A message that arrived while masked is delivered by the next
    /// MSI dispatch.
    pub fn unmask_msi(&self, vector: u32) -> Result<()> {
        self.msi.activate(&self.hw, self.allocated_vector(vector)?)
    }

    /// Address and data a device must write to raise `vector`.
    pub fn compose_delivery_token(&self, vector: u32) -> Result<MsiMessage> {
        let vector = self.allocated_vector(vector)?;
        self.msi
            .controller
            .compose_delivery_token(vector)
            .ok_or(BridgeError::NotBound {
                kind: "msi",
                line: vector,
            })
    }

    /// Services the upstream interrupt line. Returns the number of handlers invoked.
    ///
    /// Every event in one status snapshot is delivered before this returns. Events that
    /// assert afterwards keep the upstream line raised and are seen on the next call.
    pub fn handle_upstream_irq(&self) -> usize {
        let snapshot = EventMultiplexer::new(&self.hw.regs, &self.registry).poll();
        let mut delivered = 0;

        for event in snapshot.iter() {
            let line = u32::from(event.0);
            if event == self.pass_through.intx {
                // The INTx lines run their own level flow on the shared gate bits.
                delivered += self.chain(line, false, || self.demux_intx());
            } else if event == self.pass_through.msi {
                delivered += self.chain(line, true, || self.demux_msi());
            } else if self.events.deliver(&self.hw, line) {
                delivered += 1;
            } else {
                debug!(
                    event = self.registry.describe(event).name,
                    "event line not active, left pending"
                );
            }
        }

        delivered
    }

    /// Runs a second-level demultiplexer for an active pass-through line, optionally under
    /// the level flow of that line. The demultiplexer clears the summary status itself.
    fn chain(&self, line: u32, gate: bool, demux: impl FnOnce() -> usize) -> usize {
        if self.events.domain.claim(line).is_none() {
            debug!(line, "chained event line not active");
            return 0;
        }
        if !gate {
            return demux();
        }
        let mut delivered = 0;
        self.events.run_flow(&self.hw, line, false, || true, || delivered = demux());
        delivered
    }

    fn demux_intx(&self) -> usize {
        let status = self.hw.regs.bridge().read32(bridge::ISTATUS_LOCAL);
        let pending = (status & LocalInterrupt::INTX.bits()) >> bridge::INTX_SHIFT;
        let mut delivered = 0;

        for line in (0..bridge::NUM_INTX).filter(|line| pending & (1 << line) != 0) {
            if !self.intx.domain.is_bound(line) {
                warn!(line, "bad INTx IRQ");
            } else if self.intx.deliver_gated(&self.hw, line, || self.intx_gate_open()) {
                delivered += 1;
            } else {
                debug!(line, "INTx line masked, left pending");
            }
        }

        delivered
    }

    fn demux_msi(&self) -> usize {
        let regs = self.hw.regs.bridge();
        if regs.read32(bridge::ISTATUS_LOCAL) & LocalInterrupt::MSI.bits() == 0 {
            return 0;
        }
        regs.write32(bridge::ISTATUS_LOCAL, LocalInterrupt::MSI.bits());

        let status = regs.read32(bridge::ISTATUS_MSI);
        let num_vectors = self.allocator.num_vectors();
        let mut delivered = 0;

        for vector in (0..num_vectors).filter(|v| status & (1 << v) != 0) {
            if !self.msi.domain.is_bound(vector) {
                warn!(vector, "bad MSI IRQ");
                // Drop the stray message so it cannot re-raise the summary bit.
                self.msi.discard(&self.hw, vector);
            } else if self.msi.deliver(&self.hw, vector) {
                delivered += 1;
            } else {
                debug!(vector, "MSI vector masked, left pending");
            }
        }

        let beyond = if num_vectors >= 32 {
            0
        } else {
            status & !((1u32 << num_vectors) - 1)
        };
        if beyond != 0 {
            debug!(bits = format_args!("{beyond:#x}"), "MSI status beyond vector count");
        }

        delivered
    }

    /// Masks and unbinds every line, then quiesces the hardware.
    ///
    /// The windows stay programmed. Event lines are left without handlers; the bridge has
    /// to be re-created to deliver again.
    pub fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        for node in [&self.events, &self.intx, &self.msi] {
            node.release_all(&self.hw);
        }
        self.allocator.clear();
        self.hw.regs.quiesce();
        info!("PCIe bridge shut down");
    }
}

impl<R> std::fmt::Debug for Bridge<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("outbound", &self.outbound)
            .field("inbound", &self.inbound)
            .field("msi_vectors", &self.allocator.num_vectors())
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
