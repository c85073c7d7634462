//! Firmware classification from CLI probe responses.
//!
//! Classification is an ordered rule table. The first rule whose predicate
//! matches decides the result:
//!
//! 1. ArduPilot / ChibiOS marker, or any non-UTF-8 byte (MAVLink is binary)
//! 2. Betaflight
//! 3. INAV / Emuflight
//! 4. CC3D / OpenPilot / LibrePilot
//! 5. anything received at all: Unknown
//!
//! No bytes at all is [`Identification::NoResponse`], which callers treat as
//! an error distinct from an unrecognised device.

use std::fmt;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::transport::{CliTransport, ProbeResponse};

/// Command that prints the firmware banner.
pub const VERSION_COMMAND: &str = "version";

/// Command that prints the craft name.
pub const NAME_COMMAND: &str = "get name";

/// Default window of the version probe.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(3);

/// Default window of the board-name probe.
pub const NAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Keywords that end the version probe early.
pub const VERSION_TERMINATORS: &[&str] = &[
    "betaflight",
    "inav",
    "emuflight",
    "ardupilot",
    "chibios",
    "cc3d",
    "openpilot",
    "librepilot",
];

const ARDUPILOT_MARKERS: &[&str] = &[
    "ardupilot",
    "chibios",
    "arducopter",
    "arduplane",
    "ardurover",
    "ardusub",
];
const BETAFLIGHT_MARKERS: &[&str] = &["betaflight"];
const INAV_MARKERS: &[&str] = &["inav", "emuflight"];
const CC3D_MARKERS: &[&str] = &["cc3d", "openpilot", "librepilot"];

/// Firmware family of a classified device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FirmwareKind {
    /// Betaflight.
    Betaflight,
    /// INAV (and Emuflight, which shares its CLI).
    Inav,
    /// ArduPilot / ChibiOS (MAVLink).
    ArduPilot,
    /// CC3D running OpenPilot or LibrePilot.
    Cc3dOpenPilot,
    /// Something answered but nothing matched.
    Unknown,
}

impl FirmwareKind {
    /// Whether the device speaks the Betaflight-style text CLI.
    pub fn has_text_cli(&self) -> bool {
        matches!(self, Self::Betaflight | Self::Inav | Self::Cc3dOpenPilot)
    }
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Betaflight => write!(f, "Betaflight"),
            Self::Inav => write!(f, "INAV"),
            Self::ArduPilot => write!(f, "ArduPilot"),
            Self::Cc3dOpenPilot => write!(f, "CC3D-OpenPilot"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Last successful identification, as stored in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareInfo {
    /// Firmware family.
    pub kind: FirmwareKind,
    /// Version string such as "4.4.0".
    pub version: Option<String>,
    /// Target/board token such as "STM32F405".
    pub target: Option<String>,
    /// Raw probe response.
    pub raw: String,
}

/// Version and target parsed from a text-CLI banner line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliBanner {
    /// Version string.
    pub version: Option<String>,
    /// Target/board token.
    pub target: Option<String>,
    /// The banner line itself.
    pub line: String,
}

/// Outcome of classifying a version probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    /// Betaflight text CLI.
    Betaflight(CliBanner),
    /// INAV / Emuflight text CLI.
    Inav(CliBanner),
    /// ArduPilot-class device.
    ArduPilot {
        /// Whether the classification came from undecodable bytes.
        binary: bool,
        /// Raw probe response.
        raw: String,
    },
    /// CC3D / OpenPilot.
    Cc3dOpenPilot {
        /// Raw probe response.
        raw: String,
    },
    /// Data received but no signature matched.
    Unknown {
        /// Raw probe response.
        raw: String,
    },
    /// Nothing received within the probe window.
    NoResponse,
}

impl Identification {
    /// Firmware family, `None` for [`Identification::NoResponse`].
    pub fn kind(&self) -> Option<FirmwareKind> {
        match self {
            Self::Betaflight(_) => Some(FirmwareKind::Betaflight),
            Self::Inav(_) => Some(FirmwareKind::Inav),
            Self::ArduPilot { .. } => Some(FirmwareKind::ArduPilot),
            Self::Cc3dOpenPilot { .. } => Some(FirmwareKind::Cc3dOpenPilot),
            Self::Unknown { .. } => Some(FirmwareKind::Unknown),
            Self::NoResponse => None,
        }
    }

    /// Whether a known firmware signature matched.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown { .. } | Self::NoResponse)
    }

    /// Convert into session info, `None` for [`Identification::NoResponse`].
    pub fn to_info(&self, raw: &str) -> Option<FirmwareInfo> {
        let (version, target) = match self {
            Self::Betaflight(banner) | Self::Inav(banner) => {
                (banner.version.clone(), banner.target.clone())
            },
            Self::NoResponse => return None,
            _ => (None, None),
        };
        Some(FirmwareInfo {
            kind: self.kind()?,
            version,
            target,
            raw: raw.to_string(),
        })
    }
}

/// One classification rule.
struct Rule {
    name: &'static str,
    matches: fn(&ProbeResponse) -> bool,
    classify: fn(&ProbeResponse) -> Identification,
}

const RULES: &[Rule] = &[
    Rule {
        name: "ardupilot",
        matches: |r| r.binary || find_marker_line(r, ARDUPILOT_MARKERS).is_some(),
        classify: |r| Identification::ArduPilot {
            binary: r.binary,
            raw: r.text(),
        },
    },
    Rule {
        name: "betaflight",
        matches: |r| find_marker_line(r, BETAFLIGHT_MARKERS).is_some(),
        classify: |r| Identification::Betaflight(banner(r, BETAFLIGHT_MARKERS)),
    },
    Rule {
        name: "inav",
        matches: |r| find_marker_line(r, INAV_MARKERS).is_some(),
        classify: |r| Identification::Inav(banner(r, INAV_MARKERS)),
    },
    Rule {
        name: "cc3d",
        matches: |r| find_marker_line(r, CC3D_MARKERS).is_some(),
        classify: |r| Identification::Cc3dOpenPilot { raw: r.text() },
    },
    Rule {
        name: "unknown",
        matches: |r| r.received,
        classify: |r| Identification::Unknown { raw: r.text() },
    },
];

/// Classify a version probe response.
pub fn classify(response: &ProbeResponse) -> Identification {
    for rule in RULES {
        if (rule.matches)(response) {
            debug!("Firmware rule '{}' matched", rule.name);
            return (rule.classify)(response);
        }
    }
    Identification::NoResponse
}

/// First line containing any marker, with the marker that matched.
fn find_marker_line<'r>(
    response: &'r ProbeResponse,
    markers: &[&'static str],
) -> Option<(&'r str, &'static str)> {
    response.lines.iter().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        markers
            .iter()
            .find(|m| lower.contains(*m))
            .map(|m| (line.as_str(), *m))
    })
}

fn banner(response: &ProbeResponse, markers: &[&'static str]) -> CliBanner {
    match find_marker_line(response, markers) {
        Some((line, marker)) => CliBanner {
            version: parse_version(line),
            target: parse_target(line, marker),
            line: line.to_string(),
        },
        None => CliBanner {
            version: None,
            target: None,
            line: String::new(),
        },
    }
}

/// First whitespace-delimited token that begins with a digit.
pub fn parse_version(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|token| {
            token
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        })
        .map(|token| {
            token
                .trim_end_matches([',', ';'])
                .to_string()
        })
}

/// Token following the firmware keyword, e.g. `STM32F405` in
/// `# Betaflight / STM32F405 (S405) 4.4.0` or `MATEKF405` in
/// `# INAV/MATEKF405 7.1.0`.
pub fn parse_target(line: &str, keyword: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find(&keyword.to_ascii_lowercase())? + keyword.len();
    let rest = line
        .get(start..)?
        .trim_start_matches(|c: char| c == '/' || c.is_whitespace());
    let token = rest
        .split_whitespace()
        .next()?
        .trim_end_matches(['/', ',']);

    let plausible = !token.is_empty()
        && !token.starts_with(|c: char| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '(' | ')'));
    plausible.then(|| token.to_string())
}

const NAME_NOISE: &[&str] = &[
    "entering cli mode",
    "type 'exit'",
    "type 'help'",
    "unknown command",
    "invalid",
    "error",
    "allowed range",
    "cli",
];

fn is_name_noise(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    NAME_NOISE
        .iter()
        .any(|noise| lower.contains(noise))
}

/// Extract a craft name from a `name` probe.
///
/// Accepts `name = X`, `name: X` (also with a leading `#` and for
/// `craft_name`), or a bare line. A value of `-` means no name is set.
pub fn parse_board_name(lines: &[String]) -> Option<String> {
    let mut bare = None;

    for raw in lines {
        let line = raw.trim().trim_start_matches('#').trim();
        if line.is_empty()
            || line.eq_ignore_ascii_case(NAME_COMMAND)
            || line.eq_ignore_ascii_case("name")
        {
            continue;
        }

        let lower = line.to_ascii_lowercase();
        let keyed = ["craft_name", "name"]
            .iter()
            .find(|key| lower.starts_with(*key))
            .and_then(|key| {
                let rest = line[key.len()..].trim_start();
                rest.strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
            });

        if let Some(value) = keyed {
            return plausible_name(value);
        }

        if bare.is_none() && !is_name_noise(line) {
            bare = plausible_name(line);
        }
    }

    bare
}

fn plausible_name(value: &str) -> Option<String> {
    let value = value.trim();
    let ok = !value.is_empty()
        && value != "-"
        && value.len() <= 32
        && !value.contains('\u{FFFD}')
        && value.chars().all(|c| !c.is_control());
    ok.then(|| value.to_string())
}

/// Probe the firmware banner and classify it.
///
/// Returns [`Error::NoResponse`] when nothing at all was received; an
/// unrecognised answer is returned as [`Identification::Unknown`].
pub fn identify(transport: &mut CliTransport<'_>, timeout: Duration) -> Result<(Identification, ProbeResponse)> {
    let response = transport.probe(VERSION_COMMAND, VERSION_TERMINATORS, timeout)?;
    match classify(&response) {
        Identification::NoResponse => Err(Error::NoResponse(timeout.as_millis() as u64)),
        identification => Ok((identification, response)),
    }
}

/// Ask the CLI for the craft name.
pub fn board_name(transport: &mut CliTransport<'_>, timeout: Duration) -> Result<Option<String>> {
    let response = transport.probe(NAME_COMMAND, &["name =", "name:"], timeout)?;
    Ok(parse_board_name(&response.lines))
}
