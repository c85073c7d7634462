//! Peripherals of the real device.
//!
//! Buttons and buzzer are plain GPIOs driven through the sysfs interface.
//! The WS2812 strip needs precise timing that a userspace process cannot
//! provide, so frames are handed to the strip driver as text commands, one
//! line per frame:
//!
//! ```text
//! show <pin> <brightness> <rrggbb> <rrggbb> ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use super::{Hardware, HardwareConfig, InputPin, LedStrip, OutputPin, Rgb};
use crate::error::{Error, Result};

const EXPORT_SETTLE: Duration = Duration::from_millis(50);
const EXPORT_ATTEMPTS: u32 = 20;

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    /// Input.
    In,
    /// Output, initially low.
    Out,
}

/// A GPIO exported through `/sys/class/gpio`.
#[derive(Debug)]
pub struct SysfsPin {
    pin: u32,
    value: PathBuf,
}

impl SysfsPin {
    /// Export `pin` under `root` (if needed) and set its direction.
    pub fn open(root: &Path, pin: u32, direction: PinDirection) -> Result<Self> {
        let dir = root.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(root.join("export"), pin.to_string())?;
            // udev applies permissions asynchronously after export.
            let mut attempts = 0;
            while !dir.join("value").exists() {
                attempts += 1;
                if attempts > EXPORT_ATTEMPTS {
                    return Err(Error::Unsupported(format!("GPIO {pin} did not appear after export")));
                }
                thread::sleep(EXPORT_SETTLE);
            }
        }

        let direction = match direction {
            PinDirection::In => "in",
            PinDirection::Out => "low",
        };
        fs::write(dir.join("direction"), direction)?;
        debug!("GPIO {pin} configured as {direction}");

        Ok(Self {
            pin,
            value: dir.join("value"),
        })
    }

    /// GPIO number.
    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn write_level(&self, high: bool) -> Result<()> {
        fs::write(&self.value, if high { "1" } else { "0" })?;
        Ok(())
    }
}

impl InputPin for SysfsPin {
    fn is_low(&self) -> Result<bool> {
        Ok(fs::read_to_string(&self.value)?.trim() == "0")
    }
}

impl OutputPin for SysfsPin {
    fn set_high(&mut self) -> Result<()> {
        self.write_level(true)
    }

    fn set_low(&mut self) -> Result<()> {
        self.write_level(false)
    }
}

/// LED strip that forwards frames to the strip driver.
#[derive(Debug)]
pub struct CommandLedStrip<W> {
    sink: W,
    pin: u32,
    brightness: f32,
    staged: Vec<Rgb>,
}

impl<W: Write + Send> CommandLedStrip<W> {
    /// Create a strip writing to `sink`.
    pub fn new(sink: W, pin: u32, count: usize, brightness: f32) -> Self {
        Self {
            sink,
            pin,
            brightness: brightness.clamp(0.0, 1.0),
            staged: vec![Rgb::OFF; count],
        }
    }
}

impl CommandLedStrip<File> {
    /// Open the driver's command file or FIFO.
    pub fn open(path: &Path, pin: u32, count: usize, brightness: f32) -> Result<Self> {
        let sink = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::Config(format!("LED command path {}: {e}", path.display())))?;
        Ok(Self::new(sink, pin, count, brightness))
    }
}

impl<W: Write + Send> LedStrip for CommandLedStrip<W> {
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
        let mut line = format!("show {} {:.2}", self.pin, self.brightness);
        for pixel in &self.staged {
            line.push(' ');
            line.push_str(&pixel.to_string());
        }
        line.push('\n');
        self.sink.write_all(line.as_bytes())?;
        self.sink.flush()?;
        Ok(())
    }
}

/// Open the real peripherals.
pub fn build(config: &HardwareConfig) -> Result<Hardware> {
    let root = config.gpio_root.as_path();
    let dump = SysfsPin::open(root, config.button_dump_pin, PinDirection::In)?;
    let pair = SysfsPin::open(root, config.button_pair_pin, PinDirection::In)?;
    let buzzer = SysfsPin::open(root, config.buzzer_pin, PinDirection::Out)?;
    let leds = CommandLedStrip::open(
        &config.led_command_path,
        config.led_pin,
        config.led_count,
        config.led_brightness,
    )?;

    info!(
        "Live hardware: {} LEDs via {}, buttons GPIO{}/GPIO{}, buzzer GPIO{}",
        config.led_count,
        config.led_command_path.display(),
        config.button_dump_pin,
        config.button_pair_pin,
        config.buzzer_pin
    );
    Ok(Hardware::new(
        Box::new(leds),
        Box::new(buzzer),
        Box::new(dump),
        Box::new(pair),
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_gpio(root: &Path, pin: u32, level: &str) {
        let dir = root.join(format!("gpio{pin}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in").unwrap();
        fs::write(dir.join("value"), level).unwrap();
    }

    #[test]
    fn test_sysfs_input_active_low() {
        let dir = tempfile::tempdir().unwrap();
        fake_gpio(dir.path(), 23, "1\n");
        let pin = SysfsPin::open(dir.path(), 23, PinDirection::In).unwrap();
        assert!(!pin.is_low().unwrap());

        fs::write(dir.path().join("gpio23/value"), "0\n").unwrap();
        assert!(pin.is_low().unwrap());
    }

    #[test]
    fn test_sysfs_output_writes_level() {
        let dir = tempfile::tempdir().unwrap();
        fake_gpio(dir.path(), 25, "0");
        let mut pin = SysfsPin::open(dir.path(), 25, PinDirection::Out).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio25/direction")).unwrap(), "low");

        pin.set_high().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio25/value")).unwrap(), "1");
        pin.set_low().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio25/value")).unwrap(), "0");
    }

    #[test]
    fn test_missing_export_fails() {
        let dir = tempfile::tempdir().unwrap();
        // `export` exists as a plain file, so the pin directory never appears.
        assert!(SysfsPin::open(dir.path(), 5, PinDirection::In).is_err());
    }

    #[test]
    fn test_command_strip_frame() {
        let mut strip = CommandLedStrip::new(Vec::new(), 18, 3, 0.2);
        strip.fill(Rgb::BLUE).unwrap();
        strip.set(1, Rgb::RED).unwrap();
        strip.show().unwrap();
        assert_eq!(
            String::from_utf8(strip.sink.clone()).unwrap(),
            "show 18 0.20 0000ff ff0000 0000ff\n"
        );
    }
}
