use std::sync::Arc;

use spin::{Mutex, MutexGuard};

/// Local interrupt masking used around register read-modify-write sequences.
///
/// On a target this saves and disables the interrupt enable of the executing hart and
/// restores it afterwards. Hosted builds use [`NoopInterruptControl`].
pub trait InterruptControl: Send + Sync {
    /// Disables local interrupts and returns the previous state.
    fn disable(&self) -> usize;
    fn restore(&self, saved: usize);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInterruptControl;

impl InterruptControl for NoopInterruptControl {
    fn disable(&self) -> usize {
        0
    }

    fn restore(&self, _saved: usize) {}
}

/// Spinning lock for registers that back several interrupt lines.
///
/// Local interrupts stay disabled while the lock is held, so it may be taken from dispatch
/// context. Hold it across a line's state check and its gate write, never across a handler
/// call.
pub struct RegisterLock {
    lock: Mutex<()>,
    irq: Arc<dyn InterruptControl>,
}

impl RegisterLock {
    pub fn new(irq: Arc<dyn InterruptControl>) -> Self {
        Self {
            lock: Mutex::new(()),
            irq,
        }
    }

    pub fn lock(&self) -> RegisterGuard<'_> {
        let saved = self.irq.disable();
        RegisterGuard {
            guard: Some(self.lock.lock()),
            irq: &*self.irq,
            saved,
        }
    }
}

impl Default for RegisterLock {
    fn default() -> Self {
        Self::new(Arc::new(NoopInterruptControl))
    }
}

impl std::fmt::Debug for RegisterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterLock")
            .field("locked", &self.lock.is_locked())
            .finish_non_exhaustive()
    }
}

pub struct RegisterGuard<'a> {
    guard: Option<MutexGuard<'a, ()>>,
    irq: &'a dyn InterruptControl,
    saved: usize,
}

impl Drop for RegisterGuard<'_> {
    fn drop(&mut self) {
        // Release the lock before interrupts can come back in.
        drop(self.guard.take());
        self.irq.restore(self.saved);
    }
}
