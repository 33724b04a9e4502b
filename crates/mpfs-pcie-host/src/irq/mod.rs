//! Interrupt controller hierarchy: the event controller at the top, with the INTx and MSI
//! controllers chained below two of its lines.

mod chip;
mod domain;
mod lock;

use mpfs_mmio::RegisterBlock;

pub use chip::{EventChip, IntxChip, IrqChip, MsiChip};
pub use domain::{Handler, IrqDomain, LineState};
pub use lock::{InterruptControl, NoopInterruptControl, RegisterGuard, RegisterLock};

use crate::msi::MsiMessage;
use crate::regs::BridgeRegisters;

/// Register blocks plus the lock serializing shared mask registers.
#[derive(Debug)]
pub struct Hardware<R> {
    pub regs: BridgeRegisters<R>,
    pub lock: RegisterLock,
}

impl<R: RegisterBlock> Hardware<R> {
    pub fn new(regs: BridgeRegisters<R>) -> Self {
        Self {
            regs,
            lock: RegisterLock::default(),
        }
    }

    pub fn with_lock(regs: BridgeRegisters<R>, lock: RegisterLock) -> Self {
        Self { regs, lock }
    }
}

/// How a controller's lines are acknowledged around their handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowType {
    /// Mask, ack, handle, unmask. The source stays asserted until serviced.
    Level,
    /// Ack, handle. The source latches one occurrence.
    Edge,
}

/// One of the three controllers of a bridge.
#[derive(Debug)]
pub enum Controller {
    Event(EventChip),
    Intx(IntxChip),
    Msi(MsiChip),
}

impl Controller {
    pub fn flow(&self) -> FlowType {
        match self {
            Controller::Event(_) | Controller::Intx(_) => FlowType::Level,
            Controller::Msi(_) => FlowType::Edge,
        }
    }

    pub fn ack<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        match self {
            Controller::Event(chip) => chip.ack(hw, line),
            Controller::Intx(chip) => chip.ack(hw, line),
            Controller::Msi(chip) => chip.ack(hw, line),
        }
    }

    pub fn mask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        match self {
            Controller::Event(chip) => chip.mask(hw, line),
            Controller::Intx(chip) => chip.mask(hw, line),
            Controller::Msi(chip) => chip.mask(hw, line),
        }
    }

    pub fn unmask<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        match self {
            Controller::Event(chip) => chip.unmask(hw, line),
            Controller::Intx(chip) => chip.unmask(hw, line),
            Controller::Msi(chip) => chip.unmask(hw, line),
        }
    }

    pub fn compose_delivery_token(&self, line: u32) -> Option<MsiMessage> {
        match self {
            Controller::Event(chip) => chip.compose_msi_msg(line),
            Controller::Intx(chip) => chip.compose_msi_msg(line),
            Controller::Msi(chip) => chip.compose_msi_msg(line),
        }
    }
}

/// A controller together with the lines it owns.
#[derive(Debug)]
pub struct ControllerNode {
    pub controller: Controller,
    pub domain: IrqDomain,
}

impl ControllerNode {
    pub fn new(controller: Controller, domain: IrqDomain) -> Self {
        Self { controller, domain }
    }

    /// Unmasks a bound line in hardware and marks it active.
    pub fn activate<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) -> crate::Result<()> {
        self.activate_gated(hw, line, || true)
    }

    /// Marks a bound line active, and unmasks it if `gate` allows.
    ///
    /// The state change, the `gate` check and the register write happen under the register
    /// lock, so they cannot interleave with a [`Self::deactivate`] of the same line.
    pub fn activate_gated<R: RegisterBlock>(
        &self,
        hw: &Hardware<R>,
        line: u32,
        gate: impl FnOnce() -> bool,
    ) -> crate::Result<()> {
        let _guard = hw.lock.lock();
        if self.domain.state(line)? == LineState::Disabled {
            return Err(crate::BridgeError::NotBound {
                kind: self.domain.kind(),
                line,
            });
        }
        self.domain.set_state(line, LineState::Active)?;
        if gate() {
            self.controller.unmask(hw, line);
        }
        Ok(())
    }

    /// Activates a masked line that is not held. Returns whether the line was activated.
    pub fn resume<R: RegisterBlock>(
        &self,
        hw: &Hardware<R>,
        line: u32,
        gate: impl FnOnce() -> bool,
    ) -> crate::Result<bool> {
        let _guard = hw.lock.lock();
        if self.domain.state(line)? != LineState::Masked || self.domain.is_held(line) {
            return Ok(false);
        }
        self.domain.set_state(line, LineState::Active)?;
        if gate() {
            self.controller.unmask(hw, line);
        }
        Ok(true)
    }

    /// Masks a line in hardware; it keeps its handler.
    pub fn deactivate<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) -> crate::Result<()> {
        let _guard = hw.lock.lock();
        self.controller.mask(hw, line);
        if self.domain.state(line)? == LineState::Active {
            self.domain.set_state(line, LineState::Masked)?;
        }
        Ok(())
    }

    /// Unmasks every active line if `gate` allows. Used when a parent line reopens.
    pub fn reopen<R: RegisterBlock>(&self, hw: &Hardware<R>, gate: impl FnOnce() -> bool) {
        let _guard = hw.lock.lock();
        if !gate() {
            return;
        }
        for line in self.domain.lines_in(LineState::Active) {
            self.controller.unmask(hw, line);
        }
    }

    /// Masks every bound line and drops all handlers.
    pub fn release_all<R: RegisterBlock>(&self, hw: &Hardware<R>) {
        let _guard = hw.lock.lock();
        for line in 0..self.domain.len() {
            if self.domain.is_bound(line) {
                self.controller.mask(hw, line);
            }
        }
        self.domain.unbind_all();
    }

    /// Clears a latched occurrence nobody will handle.
    pub fn discard<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) {
        let _guard = hw.lock.lock();
        self.controller.ack(hw, line);
    }

    /// Runs `handler` for `line` with this controller's flow. `ack` is skipped for lines
    /// whose source is cleared by the handler itself.
    ///
    /// A level line is unmasked afterwards only if it is still active and `gate` allows it.
    /// Both are checked under the register lock, so a mask that lands while the handler
    /// runs, from the handler or another context, is never undone.
    pub fn run_flow<R: RegisterBlock>(
        &self,
        hw: &Hardware<R>,
        line: u32,
        ack: bool,
        gate: impl FnOnce() -> bool,
        handler: impl FnOnce(),
    ) {
        match self.controller.flow() {
            FlowType::Level => {
                {
                    let _guard = hw.lock.lock();
                    self.controller.mask(hw, line);
                    if ack {
                        self.controller.ack(hw, line);
                    }
                }
                handler();
                let _guard = hw.lock.lock();
                if self.domain.state(line) == Ok(LineState::Active) && gate() {
                    self.controller.unmask(hw, line);
                }
            }
            FlowType::Edge => {
                if ack {
                    self.discard(hw, line);
                }
                handler();
            }
        }
    }

    /// Delivers `line` to its bound handler. Returns false when the line is not active.
    pub fn deliver<R: RegisterBlock>(&self, hw: &Hardware<R>, line: u32) -> bool {
        self.deliver_gated(hw, line, || true)
    }

    /// [`Self::deliver`] for a line whose gate also depends on a parent line.
    pub fn deliver_gated<R: RegisterBlock>(
        &self,
        hw: &Hardware<R>,
        line: u32,
        gate: impl FnOnce() -> bool,
    ) -> bool {
        match self.domain.claim(line) {
            Some(handler) => {
                self.run_flow(hw, line, true, gate, || handler(line));
                true
            }
            None => false,
        }
    }
}
