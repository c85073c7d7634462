//! LED strip, buzzer and buttons.
//!
//! The manager only sees three capability traits ([`LedStrip`],
//! [`OutputPin`], [`InputPin`]) bundled in [`Hardware`]. Which
//! implementation backs them is decided once at startup:
//!
//! - [`live`]: sysfs GPIO for buttons and buzzer, LED frames written as
//!   text commands to the strip driver.
//! - [`emulated`]: in-memory state with handles to press buttons and inspect
//!   LED frames, used on development machines and in tests.
//!
//! Feedback is best-effort. [`Hardware`] logs failed writes and carries on,
//! a broken LED never aborts a dump.

pub mod emulated;
pub mod live;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{trace, warn};

use crate::error::Result;

/// An RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Rgb {
    /// Red.
    pub r: u8,
    /// Green.
    pub g: u8,
    /// Blue.
    pub b: u8,
}

impl Rgb {
    /// All channels off.
    pub const OFF: Self = Self::new(0, 0, 0);
    /// Idle breathing color.
    pub const BLUE: Self = Self::new(0, 0, 255);
    /// Step in progress.
    pub const ORANGE: Self = Self::new(255, 100, 0);
    /// Saving.
    pub const YELLOW: Self = Self::new(255, 255, 0);
    /// Success.
    pub const GREEN: Self = Self::new(0, 255, 0);
    /// Failure.
    pub const RED: Self = Self::new(255, 0, 0);
    /// Pairing window.
    pub const PURPLE: Self = Self::new(180, 0, 255);

    /// Create a color.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Scale every channel by `factor` (clamped to 0..=1).
    #[must_use]
    pub fn scaled(self, factor: f32) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        let scale = |c: u8| (f32::from(c) * factor).round() as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Addressable RGB strip. Changes become visible on [`LedStrip::show`].
pub trait LedStrip: Send {
    /// Number of pixels.
    fn len(&self) -> usize;

    /// Whether the strip has no pixels.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stage `color` on every pixel.
    fn fill(&mut self, color: Rgb) -> Result<()>;

    /// Stage `color` on one pixel. Out-of-range indices are ignored.
    fn set(&mut self, index: usize, color: Rgb) -> Result<()>;

    /// Push the staged frame to the pixels.
    fn show(&mut self) -> Result<()>;
}

/// Digital output (buzzer).
pub trait OutputPin: Send {
    /// Drive the pin high.
    fn set_high(&mut self) -> Result<()>;

    /// Drive the pin low.
    fn set_low(&mut self) -> Result<()>;
}

/// Digital input (button, pulled up, active-low).
pub trait InputPin: Send + Sync {
    /// Whether the pin reads low.
    fn is_low(&self) -> Result<bool>;
}

/// Physical buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    /// Starts an extraction.
    Dump,
    /// Opens the Bluetooth pairing window.
    Pair,
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dump => write!(f, "dump"),
            Self::Pair => write!(f, "pair"),
        }
    }
}

/// Buzzer rhythms, as `(on, off)` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeepPattern {
    /// Device attached.
    Short,
    /// Workflow finished.
    Success,
    /// Rejected or failed.
    Error,
    /// ESC-style power-up tune: three quick chirps, pause, two long tones.
    Startup,
}

impl BeepPattern {
    /// Timing steps of the pattern.
    pub fn steps(self) -> &'static [(u64, u64)] {
        match self {
            Self::Short => &[(100, 0)],
            Self::Success => &[(100, 80), (100, 0)],
            Self::Error => &[(400, 100), (400, 0)],
            Self::Startup => &[(80, 80), (80, 80), (80, 300), (250, 100), (250, 0)],
        }
    }

    /// Total duration of the pattern.
    pub fn duration(self) -> Duration {
        let ms: u64 = self
            .steps()
            .iter()
            .map(|(on, off)| on + off)
            .sum();
        Duration::from_millis(ms)
    }
}

/// Terminal status shown on the whole strip with a matching beep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCue {
    /// A workflow is running.
    InProgress,
    /// A workflow finished.
    Success,
    /// A request was rejected or a workflow failed.
    Error,
}

impl StatusCue {
    /// Strip color.
    pub fn color(self) -> Rgb {
        match self {
            Self::InProgress => Rgb::ORANGE,
            Self::Success => Rgb::GREEN,
            Self::Error => Rgb::RED,
        }
    }

    /// Buzzer pattern, if any.
    pub fn beep(self) -> Option<BeepPattern> {
        match self {
            Self::InProgress => None,
            Self::Success => Some(BeepPattern::Success),
            Self::Error => Some(BeepPattern::Error),
        }
    }
}

/// Pin and strip settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareConfig {
    /// Number of LEDs on the strip.
    pub led_count: usize,
    /// Global brightness applied by the live strip (0..=1).
    pub led_brightness: f32,
    /// Data pin of the strip, passed to the strip driver.
    pub led_pin: u32,
    /// Command file/FIFO consumed by the strip driver.
    pub led_command_path: PathBuf,
    /// sysfs GPIO root.
    pub gpio_root: PathBuf,
    /// Dump button GPIO.
    pub button_dump_pin: u32,
    /// Pair button GPIO.
    pub button_pair_pin: u32,
    /// Buzzer GPIO.
    pub buzzer_pin: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            led_count: 4,
            led_brightness: 0.2,
            led_pin: 18,
            led_command_path: PathBuf::from("/run/beatha/leds"),
            gpio_root: PathBuf::from("/sys/class/gpio"),
            button_dump_pin: 23,
            button_pair_pin: 24,
            buzzer_pin: 25,
        }
    }
}

/// The device's feedback and input peripherals.
pub struct Hardware {
    leds: Mutex<Box<dyn LedStrip>>,
    buzzer: Mutex<Box<dyn OutputPin>>,
    dump_button: Box<dyn InputPin>,
    pair_button: Box<dyn InputPin>,
    emulated: bool,
}

impl fmt::Debug for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hardware")
            .field("emulated", &self.emulated)
            .finish_non_exhaustive()
    }
}

impl Hardware {
    /// Bundle capability implementations.
    pub fn new(
        leds: Box<dyn LedStrip>,
        buzzer: Box<dyn OutputPin>,
        dump_button: Box<dyn InputPin>,
        pair_button: Box<dyn InputPin>,
        emulated: bool,
    ) -> Self {
        Self {
            leds: Mutex::new(leds),
            buzzer: Mutex::new(buzzer),
            dump_button,
            pair_button,
            emulated,
        }
    }

    /// Whether the emulated backend is in use.
    pub fn is_emulated(&self) -> bool {
        self.emulated
    }

    #[cfg(test)]
    pub(crate) fn reported_as_live(mut self) -> Self {
        self.emulated = false;
        self
    }

    fn leds(&self) -> MutexGuard<'_, Box<dyn LedStrip>> {
        self.leds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of LEDs.
    pub fn led_count(&self) -> usize {
        self.leds().len()
    }

    /// Show one color on the whole strip.
    pub fn fill(&self, color: Rgb) {
        let mut leds = self.leds();
        if let Err(e) = leds.fill(color).and_then(|()| leds.show()) {
            warn!("LED update failed: {e}");
        }
    }

    /// Change one pixel, keeping the others.
    pub fn set_led(&self, index: usize, color: Rgb) {
        let mut leds = self.leds();
        if let Err(e) = leds.set(index, color).and_then(|()| leds.show()) {
            warn!("LED {index} update failed: {e}");
        }
    }

    /// Turn every pixel off.
    pub fn off(&self) {
        self.fill(Rgb::OFF);
    }

    /// Play a pattern, blocking for its duration.
    pub fn beep(&self, pattern: BeepPattern) {
        trace!("Beep {pattern:?}");
        let mut buzzer = self
            .buzzer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for &(on, off) in pattern.steps() {
            if let Err(e) = buzzer.set_high() {
                warn!("Buzzer failed: {e}");
                return;
            }
            thread::sleep(Duration::from_millis(on));
            if let Err(e) = buzzer.set_low() {
                warn!("Buzzer failed: {e}");
                return;
            }
            if off > 0 {
                thread::sleep(Duration::from_millis(off));
            }
        }
    }

    /// Show a status color and play its beep.
    pub fn cue(&self, cue: StatusCue) {
        self.fill(cue.color());
        if let Some(pattern) = cue.beep() {
            self.beep(pattern);
        }
    }

    /// Whether `button` is held down.
    pub fn is_pressed(&self, button: Button) -> bool {
        let pin = match button {
            Button::Dump => &self.dump_button,
            Button::Pair => &self.pair_button,
        };
        pin.is_low().unwrap_or_else(|e| {
            warn!("Reading {button} button failed: {e}");
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled() {
        assert_eq!(Rgb::BLUE.scaled(0.5), Rgb::new(0, 0, 128));
        assert_eq!(Rgb::ORANGE.scaled(0.0), Rgb::OFF);
        assert_eq!(Rgb::GREEN.scaled(3.0), Rgb::GREEN);
        assert_eq!(Rgb::PURPLE.to_string(), "b400ff");
    }

    #[test]
    fn test_startup_melody_timing() {
        assert_eq!(BeepPattern::Startup.steps().len(), 5);
        assert_eq!(BeepPattern::Startup.duration(), Duration::from_millis(1300));
    }

    #[test]
    fn test_cues_are_distinct() {
        let cues = [StatusCue::InProgress, StatusCue::Success, StatusCue::Error];
        for (i, a) in cues.iter().enumerate() {
            for b in &cues[i + 1..] {
                assert_ne!(a.color(), b.color());
                assert_ne!(a.beep(), b.beep());
            }
        }
    }

    #[test]
    fn test_hardware_drives_emulated_backend() {
        let (hw, handles) = emulated::build(&HardwareConfig::default());
        hw.fill(Rgb::RED);
        hw.set_led(2, Rgb::GREEN);
        assert_eq!(handles.frame(), vec![Rgb::RED, Rgb::RED, Rgb::GREEN, Rgb::RED]);

        hw.beep(BeepPattern::Short);
        assert_eq!(handles.beep_count(), 1);

        assert!(!hw.is_pressed(Button::Dump));
        handles.dump_button.press();
        assert!(hw.is_pressed(Button::Dump));
        assert!(!hw.is_pressed(Button::Pair));
    }
}
