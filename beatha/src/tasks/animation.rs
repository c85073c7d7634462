//! Idle breathing animation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::sleep_unless;
use crate::hardware::{Hardware, Rgb};
use crate::session::Session;

/// Frame interval while breathing.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval while a workflow owns the strip.
pub const SUSPENDED_POLL: Duration = Duration::from_millis(500);

const STEP: f32 = 0.05;
const MIN_LEVEL: u32 = 2;
const MAX_LEVEL: u32 = 16;

/// Triangle ramp between 0.1 and 0.8 brightness in 0.05 steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breathing {
    level: u32,
    rising: bool,
}

impl Default for Breathing {
    fn default() -> Self {
        Self {
            level: MIN_LEVEL,
            rising: true,
        }
    }
}

impl Breathing {
    /// Current brightness.
    pub fn brightness(&self) -> f32 {
        self.level as f32 * STEP
    }

    /// Advance one step and return the new brightness.
    pub fn advance(&mut self) -> f32 {
        if self.rising && self.level >= MAX_LEVEL {
            self.rising = false;
        } else if !self.rising && self.level <= MIN_LEVEL {
            self.rising = true;
        }
        if self.rising {
            self.level += 1;
        } else {
            self.level -= 1;
        }
        self.brightness()
    }

    /// Reset to the dimmest level.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Breathe blue while the session is idle and the strip is not held.
pub fn run(session: &Session, hardware: &Hardware, shutdown: &AtomicBool) {
    let mut breathing = Breathing::default();
    while !shutdown.load(Ordering::SeqCst) {
        let interval = if session.is_idle() && !session.is_status_held() {
            hardware.fill(Rgb::BLUE.scaled(breathing.advance()));
            FRAME_INTERVAL
        } else {
            breathing.reset();
            SUSPENDED_POLL
        };
        if !sleep_unless(shutdown, interval) {
            break;
        }
    }
}
