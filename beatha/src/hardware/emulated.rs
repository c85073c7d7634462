//! In-memory peripherals.
//!
//! Nothing here touches the host. LED frames and buzzer activity are kept in
//! shared state so callers can inspect them, and buttons are pressed through
//! [`ButtonHandle`]s.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};

use super::{Hardware, HardwareConfig, InputPin, LedStrip, OutputPin, Rgb};
use crate::error::Result;

/// LED strip that remembers the last shown frame.
#[derive(Debug)]
pub struct EmulatedLedStrip {
    staged: Vec<Rgb>,
    shown: Arc<Mutex<Vec<Rgb>>>,
}

impl EmulatedLedStrip {
    /// Create a strip with `count` pixels, all off.
    pub fn new(count: usize) -> Self {
        Self {
            staged: vec![Rgb::OFF; count],
            shown: Arc::new(Mutex::new(vec![Rgb::OFF; count])),
        }
    }
}

impl LedStrip for EmulatedLedStrip {
    fn len(&self) -> usize {
        self.staged.len()
    }

    fn fill(&mut self, color: Rgb) -> Result<()> {
        self.staged.fill(color);
        Ok(())
    }

    fn set(&mut self, index: usize, color: Rgb) -> Result<()> {
        if let Some(pixel) = self.staged.get_mut(index) {
            *pixel = color;
        }
        Ok(())
    }

    fn show(&mut self) -> Result<()> {
        trace!("LED frame {:?}", self.staged);
        self.shown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_from(&self.staged);
        Ok(())
    }
}

/// Buzzer that counts rising edges.
#[derive(Debug, Default)]
pub struct EmulatedBuzzer {
    on: bool,
    beeps: Arc<AtomicUsize>,
}

impl OutputPin for EmulatedBuzzer {
    fn set_high(&mut self) -> Result<()> {
        if !self.on {
            self.beeps.fetch_add(1, Ordering::Relaxed);
        }
        self.on = true;
        Ok(())
    }

    fn set_low(&mut self) -> Result<()> {
        self.on = false;
        Ok(())
    }
}

/// Shared level of an emulated button.
#[derive(Debug, Clone, Default)]
pub struct ButtonHandle(Arc<AtomicBool>);

impl ButtonHandle {
    /// Hold the button down.
    pub fn press(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Let go of the button.
    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether the button is held.
    pub fn is_pressed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Emulated button input.
#[derive(Debug, Clone, Default)]
pub struct EmulatedButton(ButtonHandle);

impl EmulatedButton {
    /// Handle that drives this button.
    pub fn handle(&self) -> ButtonHandle {
        self.0.clone()
    }
}

impl InputPin for EmulatedButton {
    fn is_low(&self) -> Result<bool> {
        Ok(self.0.is_pressed())
    }
}

/// Inspection and control handles of an emulated [`Hardware`].
#[derive(Debug, Clone)]
pub struct EmulatedHandles {
    /// Dump button.
    pub dump_button: ButtonHandle,
    /// Pair button.
    pub pair_button: ButtonHandle,
    frame: Arc<Mutex<Vec<Rgb>>>,
    beeps: Arc<AtomicUsize>,
}

impl EmulatedHandles {
    /// Last frame shown on the strip.
    pub fn frame(&self) -> Vec<Rgb> {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of beeps played so far.
    pub fn beep_count(&self) -> usize {
        self.beeps.load(Ordering::Relaxed)
    }
}

/// Build emulated hardware and its handles.
pub fn build(config: &HardwareConfig) -> (Hardware, EmulatedHandles) {
    debug!("Using emulated hardware ({} LEDs)", config.led_count);

    let leds = EmulatedLedStrip::new(config.led_count);
    let buzzer = EmulatedBuzzer::default();
    let dump = EmulatedButton::default();
    let pair = EmulatedButton::default();

    let handles = EmulatedHandles {
        dump_button: dump.handle(),
        pair_button: pair.handle(),
        frame: Arc::clone(&leds.shown),
        beeps: Arc::clone(&buzzer.beeps),
    };
    let hardware = Hardware::new(
        Box::new(leds),
        Box::new(buzzer),
        Box::new(dump),
        Box::new(pair),
        true,
    );
    (hardware, handles)
}
