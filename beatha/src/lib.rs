//! # beatha
//!
//! Device session manager for flight-controller configuration extraction.
//!
//! A Beatha box sits next to a quadcopter, finds the flight controller on a
//! USB serial port and, at the press of a button, pulls its complete
//! configuration through the firmware's text CLI. Between extractions the
//! serial device is bridged to TCP and Bluetooth so configurator tools can
//! reach it remotely.
//!
//! This crate provides:
//!
//! - Flight-controller port scoring and hotplug tracking
//! - Firmware identification (Betaflight, INAV, ArduPilot, CC3D/OpenPilot)
//! - Silence-bounded `dump all` extraction into timestamped artifacts
//! - MAVLink heartbeat sniffing for ArduPilot-class devices
//! - `socat` bridge supervision and Bluetooth pairing
//! - LED, buzzer and button feedback, live or emulated
//!
//! ## Features
//!
//! - `native` (default): Serial ports via the `serialport` crate
//! - `serde`: Serialization support for status and listing types
//!
//! ## Example
//!
//! ```rust,no_run
//! use beatha::{Manager, Settings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let manager = Manager::native(Settings::emulated())?;
//!         manager.start()?;
//!
//!         // Same as pressing the dump button.
//!         manager.trigger_dump()?;
//!
//!         for dump in manager.list_dumps()? {
//!             println!("{} ({} bytes)", dump.path, dump.size);
//!         }
//!         manager.shutdown();
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod comm_log;
pub mod device;
pub mod dumps;
pub mod error;
pub mod extraction;
pub mod hardware;
pub mod manager;
pub mod pairing;
pub mod port;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod settings;
pub mod tasks;

pub use comm_log::{CommLog, CommLogEntry, Direction};
pub use device::{PortCandidate, best_candidate, detect_flight_controllers};
pub use dumps::{DumpEntry, DumpKind, DumpStore, sanitize};
pub use error::{Error, Result};
pub use extraction::{ExtractionReport, UploadStatus};
pub use hardware::{Hardware, HardwareConfig, Rgb};
pub use manager::{Backends, Manager, Status};
pub use pairing::PairingReport;
pub use port::{DEFAULT_BAUD, Port, PortEnumerator, PortInfo, PortOpener, SerialConfig};
pub use process::{ChildProcess, CommandOutput, CommandRunner, Spawner};
pub use protocol::{FirmwareInfo, FirmwareKind, Identification};
pub use session::Mode;
pub use settings::{BridgeSettings, Settings, Timing};
