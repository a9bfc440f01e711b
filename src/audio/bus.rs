//! The shared output bus.
//!
//! Every instrument routes through one gain stage. The scheduler uses it to
//! fade out at the end of a window so that release tails do not click when
//! the window is cut, whatever the instrument is.

use std::sync::{Arc, Mutex};

/// A gain control with scheduled ramps, expressed in audio-clock seconds.
pub trait GainStage: Send {
    /// Drops pending ramps' effect and jumps to `value`.
    fn set_value_now(&mut self, value: f32);

    /// Ramps linearly to `value` over `ramp_seconds`, starting at `at`.
    fn ramp_to(&mut self, value: f32, ramp_seconds: f64, at: f64);

    /// Forgets every ramp starting at or after `from`, holding the value
    /// reached so far.
    fn cancel_scheduled(&mut self, from: f64);
}

/// The single gain stage of a session. Cloning shares the same stage.
#[derive(Clone)]
pub struct OutputBus {
    gain: Arc<Mutex<Box<dyn GainStage>>>,
}

impl OutputBus {
    /// Wraps the backend's output gain. The backend has already connected it
    /// to the physical output.
    pub fn new(gain: Box<dyn GainStage>) -> Self {
        Self {
            gain: Arc::new(Mutex::new(gain)),
        }
    }

    /// Cancels any scheduled ramp and restores unity gain.
    pub fn reset(&self) {
        if let Ok(mut gain) = self.gain.lock() {
            gain.cancel_scheduled(f64::NEG_INFINITY);
            gain.set_value_now(1.0);
        }
    }

    /// Schedules a fade to silence over `ramp_seconds` starting at `at`.
    pub fn fade_out_at(&self, at: f64, ramp_seconds: f64) {
        if let Ok(mut gain) = self.gain.lock() {
            gain.ramp_to(0.0, ramp_seconds, at);
        }
    }

    /// Cancels ramps scheduled from `at` on and ramps back to unity from `at`.
    pub fn restore(&self, at: f64, ramp_seconds: f64) {
        if let Ok(mut gain) = self.gain.lock() {
            gain.cancel_scheduled(at);
            gain.ramp_to(1.0, ramp_seconds, at);
        }
    }

    /// Returns true if both buses share the same gain stage.
    pub fn ptr_eq(&self, other: &OutputBus) -> bool {
        Arc::ptr_eq(&self.gain, &other.gain)
    }
}
