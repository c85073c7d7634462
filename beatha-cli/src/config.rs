//! Configuration file support for beatha.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BEATHA_*)
//! 3. Local config file (./beatha.toml)
//! 4. Global config file (~/.config/beatha/config.toml)
//!
//! A `--config PATH` replaces 3 and 4.

use beatha::Settings;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serial settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Preferred flight-controller port (e.g., "/dev/ttyACM0").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Device-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Dump root.
    pub dump_dir: Option<PathBuf>,
    /// Use emulated peripherals.
    #[serde(default)]
    pub emulated: bool,
    /// rclone remote for cloud sync (e.g., "gdrive:BF_Dumps").
    pub cloud_remote: Option<String>,
}

/// Peripheral settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareSection {
    /// Number of LEDs.
    pub led_count: Option<usize>,
    /// Strip brightness (0.0 - 1.0).
    pub led_brightness: Option<f32>,
    /// Strip data GPIO.
    pub led_pin: Option<u32>,
    /// Strip driver command file.
    pub led_command_path: Option<PathBuf>,
    /// Dump button GPIO.
    pub button_dump_pin: Option<u32>,
    /// Pair button GPIO.
    pub button_pair_pin: Option<u32>,
    /// Buzzer GPIO.
    pub buzzer_pin: Option<u32>,
}

/// Bridge settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Run the TCP bridge.
    pub tcp_enabled: Option<bool>,
    /// TCP listen port.
    pub tcp_port: Option<u16>,
    /// TCP bridge command template.
    pub tcp_command: Option<Vec<String>>,
    /// Run the Bluetooth bridge.
    pub bt_enabled: Option<bool>,
    /// Bluetooth bridge command template.
    pub bt_command: Option<Vec<String>>,
}

/// Durations in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// `version` probe window.
    pub probe_ms: Option<u64>,
    /// Hard ceiling of the `dump all` read.
    pub dump_timeout_ms: Option<u64>,
    /// Quiet period that ends the `dump all` read.
    pub silence_ms: Option<u64>,
    /// How long the result stays on the LEDs.
    pub status_hold_ms: Option<u64>,
    /// Bluetooth pairing window.
    pub pairing_ms: Option<u64>,
    /// Cloud upload limit.
    pub upload_timeout_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial configuration.
    #[serde(default)]
    pub serial: SerialConfig,
    /// System configuration.
    #[serde(default)]
    pub system: SystemConfig,
    /// Hardware configuration.
    #[serde(default)]
    pub hardware: HardwareSection,
    /// Bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Overwrite `$dst` when `$src` is set.
macro_rules! take_some {
    ($dst:expr, $src:expr) => {
        if $src.is_some() {
            $dst = $src;
        }
    };
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("beatha.toml")) {
            debug!("Loaded local config from beatha.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "beatha").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        take_some!(self.serial.port, other.serial.port);
        take_some!(self.serial.baud, other.serial.baud);

        take_some!(self.system.dump_dir, other.system.dump_dir);
        take_some!(self.system.cloud_remote, other.system.cloud_remote);
        if other.system.emulated {
            self.system.emulated = true;
        }

        let hw = other.hardware;
        take_some!(self.hardware.led_count, hw.led_count);
        take_some!(self.hardware.led_brightness, hw.led_brightness);
        take_some!(self.hardware.led_pin, hw.led_pin);
        take_some!(self.hardware.led_command_path, hw.led_command_path);
        take_some!(self.hardware.button_dump_pin, hw.button_dump_pin);
        take_some!(self.hardware.button_pair_pin, hw.button_pair_pin);
        take_some!(self.hardware.buzzer_pin, hw.buzzer_pin);

        let bridge = other.bridge;
        take_some!(self.bridge.tcp_enabled, bridge.tcp_enabled);
        take_some!(self.bridge.tcp_port, bridge.tcp_port);
        take_some!(self.bridge.tcp_command, bridge.tcp_command);
        take_some!(self.bridge.bt_enabled, bridge.bt_enabled);
        take_some!(self.bridge.bt_command, bridge.bt_command);

        let timing = other.timing;
        take_some!(self.timing.probe_ms, timing.probe_ms);
        take_some!(self.timing.dump_timeout_ms, timing.dump_timeout_ms);
        take_some!(self.timing.silence_ms, timing.silence_ms);
        take_some!(self.timing.status_hold_ms, timing.status_hold_ms);
        take_some!(self.timing.pairing_ms, timing.pairing_ms);
        take_some!(self.timing.upload_timeout_ms, timing.upload_timeout_ms);
    }

    /// Build library settings. `emulated` selects the emulated defaults.
    pub fn to_settings(&self, emulated: bool) -> Settings {
        let mut s = if emulated || self.system.emulated {
            Settings::emulated()
        } else {
            Settings::default()
        };

        if let Some(port) = &self.serial.port {
            s.serial_port.clone_from(port);
        }
        if let Some(baud) = self.serial.baud {
            s.baud_rate = baud;
        }
        if let Some(dir) = &self.system.dump_dir {
            s.dump_dir.clone_from(dir);
        }
        s.cloud_remote.clone_from(&self.system.cloud_remote);

        let hw = &self.hardware;
        if let Some(v) = hw.led_count {
            s.hardware.led_count = v;
        }
        if let Some(v) = hw.led_brightness {
            s.hardware.led_brightness = v;
        }
        if let Some(v) = hw.led_pin {
            s.hardware.led_pin = v;
        }
        if let Some(v) = &hw.led_command_path {
            s.hardware.led_command_path.clone_from(v);
        }
        if let Some(v) = hw.button_dump_pin {
            s.hardware.button_dump_pin = v;
        }
        if let Some(v) = hw.button_pair_pin {
            s.hardware.button_pair_pin = v;
        }
        if let Some(v) = hw.buzzer_pin {
            s.hardware.buzzer_pin = v;
        }

        let bridge = &self.bridge;
        if let Some(v) = bridge.tcp_enabled {
            s.bridge.tcp_enabled = v;
        }
        if let Some(v) = bridge.tcp_port {
            s.bridge.tcp_port = v;
        }
        if let Some(v) = &bridge.tcp_command {
            s.bridge.tcp_command.clone_from(v);
        }
        if let Some(v) = bridge.bt_enabled {
            s.bridge.bt_enabled = v;
        }
        if let Some(v) = &bridge.bt_command {
            s.bridge.bt_command.clone_from(v);
        }

        let t = &self.timing;
        let ms = Duration::from_millis;
        if let Some(v) = t.probe_ms {
            s.timing.probe_timeout = ms(v);
        }
        if let Some(v) = t.dump_timeout_ms {
            s.timing.silence.timeout = ms(v);
        }
        if let Some(v) = t.silence_ms {
            s.timing.silence.silence = ms(v);
        }
        if let Some(v) = t.status_hold_ms {
            s.timing.status_hold = ms(v);
        }
        if let Some(v) = t.pairing_ms {
            s.timing.pairing_window = ms(v);
        }
        if let Some(v) = t.upload_timeout_ms {
            s.timing.upload_timeout = ms(v);
        }
        s
    }
}
