use std::sync::Arc;

use spin::Mutex;

use crate::error::{BridgeError, Result};

/// Callback for one logical line. Receives the line's hardware index.
pub type Handler = Arc<dyn Fn(u32) + Send + Sync>;

/// Lifecycle of a logical interrupt line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LineState {
    #[default]
    Disabled,
    /// Registered but not delivering.
    Masked,
    Active,
}

#[derive(Default)]
struct Line {
    state: LineState,
    handler: Option<Handler>,
    /// Masked by an explicit request rather than by a bridge-wide disable.
    held: bool,
    delivered: u64,
}

/// Per-line bookkeeping for one controller: state, bound handler and delivery count.
///
/// Handlers are cloned out under the lock and invoked after it is released, so a handler
/// may call back into the domain.
pub struct IrqDomain {
    kind: &'static str,
    lines: Mutex<Vec<Line>>,
}

impl IrqDomain {
    pub fn new(kind: &'static str, count: u32) -> Self {
        let lines = (0..count).map(|_| Line::default()).collect();
        Self {
            kind,
            lines: Mutex::new(lines),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn len(&self) -> u32 {
        self.lines.lock().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    fn with_line<T>(&self, line: u32, f: impl FnOnce(&mut Line) -> Result<T>) -> Result<T> {
        let mut lines = self.lines.lock();
        let count = lines.len() as u32;
        match lines.get_mut(line as usize) {
            Some(entry) => f(entry),
            None => Err(BridgeError::InvalidLine {
                kind: self.kind,
                line,
                count,
            }),
        }
    }

    /// Binds a handler to an unbound line and moves it to [`LineState::Masked`].
    pub fn bind(&self, line: u32, handler: Handler) -> Result<()> {
        let kind = self.kind;
        self.with_line(line, |entry| {
            if entry.handler.is_some() {
                return Err(BridgeError::HandlerBound { kind, line });
            }
            entry.handler = Some(handler);
            if entry.state == LineState::Disabled {
                entry.state = LineState::Masked;
            }
            Ok(())
        })
    }

    /// Swaps the handler of a bound line, returning the old one.
    pub fn replace(&self, line: u32, handler: Handler) -> Result<Handler> {
        let kind = self.kind;
        self.with_line(line, |entry| {
            entry
                .handler
                .replace(handler)
                .ok_or(BridgeError::NotBound { kind, line })
        })
    }

    /// Drops the handler and returns the line to [`LineState::Disabled`].
    pub fn unbind(&self, line: u32) -> Result<Handler> {
        let kind = self.kind;
        self.with_line(line, |entry| {
            let handler = entry.handler.take().ok_or(BridgeError::NotBound { kind, line })?;
            entry.state = LineState::Disabled;
            entry.held = false;
            Ok(handler)
        })
    }

    /// Unbinds every line. Returns how many had a handler.
    pub fn unbind_all(&self) -> usize {
        let mut lines = self.lines.lock();
        let mut unbound = 0;
        for entry in lines.iter_mut() {
            if entry.handler.take().is_some() {
                unbound += 1;
            }
            entry.state = LineState::Disabled;
            entry.held = false;
        }
        unbound
    }

    pub fn state(&self, line: u32) -> Result<LineState> {
        self.with_line(line, |entry| Ok(entry.state))
    }

    pub fn is_bound(&self, line: u32) -> bool {
        self.with_line(line, |entry| Ok(entry.handler.is_some()))
            .unwrap_or(false)
    }

    pub fn set_state(&self, line: u32, state: LineState) -> Result<()> {
        self.with_line(line, |entry| {
            entry.state = state;
            Ok(())
        })
    }

    pub fn set_held(&self, line: u32, held: bool) -> Result<()> {
        self.with_line(line, |entry| {
            entry.held = held;
            Ok(())
        })
    }

    pub fn is_held(&self, line: u32) -> bool {
        self.with_line(line, |entry| Ok(entry.held))
            .unwrap_or(false)
    }

    /// Lines currently in `state`.
    pub fn lines_in(&self, state: LineState) -> Vec<u32> {
        self.lines
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, line)| line.state == state)
            .map(|(idx, _)| idx as u32)
            .collect()
    }

    /// Handler to run for `line`, if it is active. Counts the delivery.
    pub fn claim(&self, line: u32) -> Option<Handler> {
        let mut lines = self.lines.lock();
        let entry = lines.get_mut(line as usize)?;
        if entry.state != LineState::Active {
            return None;
        }
        let handler = entry.handler.clone()?;
        entry.delivered += 1;
        Some(handler)
    }

    pub fn delivered(&self, line: u32) -> u64 {
        self.with_line(line, |entry| Ok(entry.delivered))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for IrqDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqDomain")
            .field("kind", &self.kind)
            .field("lines", &self.len())
            .finish()
    }
}
