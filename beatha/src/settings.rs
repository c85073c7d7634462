//! Runtime settings of the session manager.
//!
//! Plain data with defaults matching the field device. Front-ends load
//! their own configuration format and map it onto [`Settings`].

use std::path::PathBuf;
use std::time::Duration;

use crate::hardware::HardwareConfig;
use crate::port::DEFAULT_BAUD;
use crate::protocol::firmware::{NAME_TIMEOUT, VERSION_TIMEOUT};
use crate::protocol::transport::SilencePolicy;
use crate::proxy::{default_bluetooth_command, default_tcp_command};

/// Serial device adopted when present.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";

/// Dump root on the device.
pub const DEFAULT_DUMP_DIR: &str = "/home/pi/dumps";

/// Dump root when running emulated.
pub const EMULATED_DUMP_DIR: &str = "./dumps_mock";

/// TCP bridge listen port.
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Run the TCP bridge while idle.
    pub tcp_enabled: bool,
    /// TCP listen port.
    pub tcp_port: u16,
    /// TCP bridge command template.
    pub tcp_command: Vec<String>,
    /// Run the Bluetooth bridge while idle.
    pub bt_enabled: bool,
    /// Bluetooth bridge command template.
    pub bt_command: Vec<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tcp_enabled: true,
            tcp_port: DEFAULT_TCP_PORT,
            tcp_command: default_tcp_command(),
            bt_enabled: true,
            bt_command: default_bluetooth_command(),
        }
    }
}

/// Every duration the manager waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// `version` probe window.
    pub probe_timeout: Duration,
    /// `get name` probe window.
    pub name_timeout: Duration,
    /// MAVLink heartbeat listening window.
    pub heartbeat_window: Duration,
    /// Streaming read of `dump all`.
    pub silence: SilencePolicy,
    /// Pause between extraction commands.
    pub inter_command_delay: Duration,
    /// Pause after stopping bridges, before opening the port.
    pub port_settle: Duration,
    /// How long the final status stays on the LEDs.
    pub status_hold: Duration,
    /// Pairing window.
    pub pairing_window: Duration,
    /// Per-command limit of the pairing sequence.
    pub pairing_command_timeout: Duration,
    /// Cloud upload limit.
    pub upload_timeout: Duration,
    /// SIGTERM to SIGKILL grace of bridge processes.
    pub process_grace: Duration,
    /// Serial enumeration interval of the hotplug monitor.
    pub hotplug_interval: Duration,
    /// Button poll interval.
    pub button_poll: Duration,
    /// Button debounce settle time.
    pub button_settle: Duration,
    /// Bridge supervisor poll interval.
    pub bridge_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            probe_timeout: VERSION_TIMEOUT,
            name_timeout: NAME_TIMEOUT,
            heartbeat_window: Duration::from_secs(3),
            silence: SilencePolicy::default(),
            inter_command_delay: Duration::from_millis(100),
            port_settle: Duration::from_secs(1),
            status_hold: Duration::from_secs(3),
            pairing_window: Duration::from_secs(30),
            pairing_command_timeout: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(60),
            process_grace: Duration::from_secs(5),
            hotplug_interval: Duration::from_secs(1),
            button_poll: Duration::from_millis(100),
            button_settle: Duration::from_millis(50),
            bridge_poll: Duration::from_secs(1),
        }
    }
}

const PAIRING_SEQUENCE: &[&[&str]] = &[
    &["bluetoothctl", "power", "on"],
    &["bluetoothctl", "discoverable", "on"],
    &["bluetoothctl", "pairable", "on"],
    &["bluetoothctl", "agent", "NoInputNoOutput"],
    &["bluetoothctl", "default-agent"],
];

/// `bluetoothctl` sequence that makes the device pairable without a PIN.
pub fn default_pairing_commands() -> Vec<Vec<String>> {
    PAIRING_SEQUENCE
        .iter()
        .map(|argv| argv.iter().map(ToString::to_string).collect())
        .collect()
}

/// Session manager settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Preferred serial device.
    pub serial_port: String,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Dump root.
    pub dump_dir: PathBuf,
    /// Use emulated hardware and skip hotplug.
    pub emulated: bool,
    /// rclone remote for cloud sync, e.g. `gdrive:BF_Dumps`.
    pub cloud_remote: Option<String>,
    /// Peripherals.
    pub hardware: HardwareConfig,
    /// Bridges.
    pub bridge: BridgeSettings,
    /// Pairing command sequence.
    pub pairing_commands: Vec<Vec<String>>,
    /// Timeouts and poll intervals.
    pub timing: Timing,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial_port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD,
            dump_dir: PathBuf::from(DEFAULT_DUMP_DIR),
            emulated: false,
            cloud_remote: None,
            hardware: HardwareConfig::default(),
            bridge: BridgeSettings::default(),
            pairing_commands: default_pairing_commands(),
            timing: Timing::default(),
        }
    }
}

impl Settings {
    /// Defaults for a development machine without the device hardware.
    pub fn emulated() -> Self {
        Self {
            emulated: true,
            dump_dir: PathBuf::from(EMULATED_DUMP_DIR),
            ..Self::default()
        }
    }
}
