//! Settable machine clock backing the `time` command.
//!
//! The controller has no battery-backed RTC; a host sets the wall clock
//! with `time = <epoch>` and later queries it with `time`. The anchor is
//! stored together with a monotonic reading so queries return a plausibly
//! advancing epoch without ever re-consulting the host clock.

use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;

/// Largest accepted epoch value (the 32-bit signed timestamp ceiling the
/// reference firmware enforces).
pub const MAX_EPOCH: f64 = 2_147_483_647.0;

/// Errors surfaced by the `time` command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    /// A set request carried a non-numeric or out-of-range epoch.
    #[error("invalid time value")]
    InvalidValue,

    /// A query arrived before any set request.
    #[error("time not initialized")]
    NotInitialized,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    epoch: f64,
    set_at: Instant,
}

/// Machine wall-clock anchor. Shared server-wide; one clock per machine.
#[derive(Debug, Default)]
pub struct MachineClock {
    anchor: Mutex<Option<Anchor>>,
}

impl MachineClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchors the clock at `epoch` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidValue`] for negative, non-finite, or
    /// beyond-[`MAX_EPOCH`] values.
    pub fn set(&self, epoch: f64) -> Result<(), ClockError> {
        if !epoch.is_finite() || !(0.0..=MAX_EPOCH).contains(&epoch) {
            return Err(ClockError::InvalidValue);
        }
        let mut anchor = self.anchor.lock().expect("lock poisoned");
        *anchor = Some(Anchor {
            epoch,
            set_at: Instant::now(),
        });
        Ok(())
    }

    /// Current epoch in whole seconds: the anchor plus elapsed monotonic
    /// time.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::NotInitialized`] before the first successful
    /// [`set`](Self::set).
    pub fn now_epoch(&self) -> Result<u64, ClockError> {
        let anchor = self.anchor.lock().expect("lock poisoned");
        let anchor = anchor.ok_or(ClockError::NotInitialized)?;
        let current = anchor.epoch + anchor.set_at.elapsed().as_secs_f64();
        Ok(current as u64)
    }
}
