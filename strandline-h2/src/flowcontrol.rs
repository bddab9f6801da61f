//! HTTP/2 flow control window tracking (RFC 7540 Section 6.9).

use crate::error::H2Error;
use crate::settings::MAX_WINDOW_SIZE;

/// Initial connection-level window, which SETTINGS cannot change.
pub const DEFAULT_WINDOW_SIZE: i64 = 65535;

/// Tracks a send or receive flow control window.
#[derive(Debug, Clone)]
pub struct FlowControl {
    window: i64,
}

impl FlowControl {
    pub fn new(initial: i64) -> Self {
        Self { window: initial }
    }

    /// Current window size (may be negative after a SETTINGS change).
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Take `amount` bytes out of the window. The window is unchanged when
    /// this would drive it below zero.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let new = self.window - i64::from(amount);
        if new < 0 {
            return Err(H2Error::FlowControlError);
        }
        self.window = new;
        Ok(())
    }

    /// Credit from a WINDOW_UPDATE.
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        self.adjust(i64::from(increment))
    }

    /// Shift the window after INITIAL_WINDOW_SIZE changes. `delta` is
    /// `new_initial - old_initial` and may be negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let new = self.window + delta;
        if new > i64::from(MAX_WINDOW_SIZE) {
            return Err(H2Error::FlowControlError);
        }
        self.window = new;
        Ok(())
    }

    /// If the window has fallen below half of `target`, restore it to
    /// `target` and return the WINDOW_UPDATE increment to announce.
    pub fn replenish(&mut self, target: i64) -> Option<u32> {
        if self.window >= target / 2 {
            return None;
        }
        let increment = u32::try_from(target - self.window).ok()?;
        self.increase(increment).ok()?;
        Some(increment)
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
