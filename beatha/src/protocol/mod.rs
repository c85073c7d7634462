//! Flight-controller protocol helpers.

pub mod firmware;
pub mod mavlink;
pub mod transport;

// Re-export common types
pub use firmware::{FirmwareInfo, FirmwareKind, Identification, classify};
pub use mavlink::{Heartbeat, find_heartbeat};
pub use transport::{CliTransport, Completion, ProbeResponse, SilencePolicy, SilenceRead};
