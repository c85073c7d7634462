//! Flight-controller port discovery and scoring.
//!
//! Every serial device is scored with independent, additive signals. The
//! higher the score, the more likely the device is a flight controller (or
//! its bootloader / USB bridge):
//!
//! | signal                                   | score |
//! |------------------------------------------|-------|
//! | known VID:PID pair                       | +10   |
//! | CDC-ACM device path (`ttyACM*`)          | +5    |
//! | otherwise USB-serial path (`ttyUSB*`)    | +3    |
//! | description mentions a FC keyword        | +5    |
//! | manufacturer is a known chip vendor      | +3    |
//!
//! Ranking is a stable sort, so equal scores keep enumeration order.

use log::{debug, trace};

use crate::port::{PortEnumerator, PortInfo};

/// Known USB VID/PID pairs of flight controllers, their bootloaders and the
/// USB-UART bridges they commonly ship with.
const KNOWN_FC_USB_IDS: &[(u16, u16, &str)] = &[
    (0x0483, 0x5740, "STM32 Virtual COM Port"),
    (0x0483, 0xDF11, "STM32 DFU bootloader"),
    (0x10C4, 0xEA60, "CP210x"),
    (0x0403, 0x6001, "FTDI"),
    (0x0403, 0x6015, "FTDI X-Series"),
    (0x2341, 0x0001, "Arduino"),
    (0x2341, 0x0043, "Arduino Uno"),
    (0x16C0, 0x0483, "Teensy"),
    (0x1FC9, 0x0083, "NXP"),
];

const DESCRIPTION_KEYWORDS: &[&str] = &["stm32", "betaflight", "inav", "arduino", "flight"];

const MANUFACTURER_KEYWORDS: &[&str] = &["stm", "silicon labs", "ftdi", "arduino"];

const SCORE_KNOWN_ID: u32 = 10;
const SCORE_ACM_PATH: u32 = 5;
const SCORE_USB_PATH: u32 = 3;
const SCORE_DESCRIPTION: u32 = 5;
const SCORE_MANUFACTURER: u32 = 3;

/// Look up a curated VID/PID pair.
pub fn known_usb_id(vid: u16, pid: u16) -> Option<&'static str> {
    KNOWN_FC_USB_IDS
        .iter()
        .find(|(v, p, _)| *v == vid && *p == pid)
        .map(|(_, _, name)| *name)
}

/// A serial device ranked as a flight-controller candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortCandidate {
    /// Device path (e.g. "/dev/ttyACM0").
    pub path: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product/description string (if available).
    pub description: Option<String>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Sum of all matching signals.
    pub score: u32,
    /// Human-readable reason for every matching signal.
    pub reasons: Vec<String>,
}

impl PortCandidate {
    /// Whether any signal matched.
    pub fn is_likely_flight_controller(&self) -> bool {
        self.score > 0
    }
}

/// Score a single port.
pub fn score_port(port: &PortInfo) -> PortCandidate {
    let mut score = 0;
    let mut reasons = Vec::new();

    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        if let Some(name) = known_usb_id(vid, pid) {
            score += SCORE_KNOWN_ID;
            reasons.push(format!("Known FC VID:PID {vid:04X}:{pid:04X} ({name})"));
        }
    }

    if port.name.contains("ACM") {
        score += SCORE_ACM_PATH;
        reasons.push("USB CDC ACM device".to_string());
    } else if port.name.contains("USB") {
        score += SCORE_USB_PATH;
        reasons.push("USB serial device".to_string());
    }

    let description = port
        .product
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if DESCRIPTION_KEYWORDS
        .iter()
        .any(|kw| description.contains(kw))
    {
        score += SCORE_DESCRIPTION;
        reasons.push("Description suggests FC".to_string());
    }

    let manufacturer = port
        .manufacturer
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if MANUFACTURER_KEYWORDS
        .iter()
        .any(|kw| manufacturer.contains(kw))
    {
        score += SCORE_MANUFACTURER;
        reasons.push(format!(
            "Known manufacturer: {}",
            port.manufacturer.as_deref().unwrap_or_default()
        ));
    }

    trace!("Scored {}: {score} ({})", port.name, reasons.join(", "));

    PortCandidate {
        path: port.name.clone(),
        vid: port.vid,
        pid: port.pid,
        description: port.product.clone(),
        manufacturer: port.manufacturer.clone(),
        score,
        reasons,
    }
}

/// Score every port and sort descending by score.
///
/// Candidates without any matching signal are kept at the end; use
/// [`rank_ports`] to drop them.
pub fn score_ports(ports: &[PortInfo]) -> Vec<PortCandidate> {
    let mut candidates: Vec<PortCandidate> = ports.iter().map(score_port).collect();
    // `sort_by` is stable: ties keep enumeration order.
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    candidates
}

/// Rank ports as flight-controller candidates, best first.
///
/// Returns an empty list if no port scores above zero.
pub fn rank_ports(ports: &[PortInfo]) -> Vec<PortCandidate> {
    score_ports(ports)
        .into_iter()
        .filter(PortCandidate::is_likely_flight_controller)
        .collect()
}

/// Enumerate and rank the ports currently present.
pub fn detect_flight_controllers(enumerator: &dyn PortEnumerator) -> Vec<PortCandidate> {
    match enumerator.list_ports() {
        Ok(ports) => rank_ports(&ports),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Pick the best flight-controller candidate, if any.
pub fn best_candidate(enumerator: &dyn PortEnumerator) -> Option<PortCandidate> {
    detect_flight_controllers(enumerator)
        .into_iter()
        .next()
}

/// Format a list of candidates for display.
pub fn format_candidates(candidates: &[PortCandidate]) -> Vec<String> {
    candidates
        .iter()
        .map(|c| {
            let ids = match (c.vid, c.pid) {
                (Some(vid), Some(pid)) => format!(" [VID:{vid:04X} PID:{pid:04X}]"),
                _ => String::new(),
            };
            let product = c
                .description
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{} (score {}){ids}{product}", c.path, c.score)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16, product: &str, manufacturer: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: Some(manufacturer.to_string()),
            product: Some(product.to_string()),
            serial_number: None,
        }
    }

    #[test]
    fn test_known_usb_id() {
        assert_eq!(known_usb_id(0x0483, 0x5740), Some("STM32 Virtual COM Port"));
        assert_eq!(known_usb_id(0x10C4, 0xEA60), Some("CP210x"));
        assert_eq!(known_usb_id(0x1A86, 0x7523), None);
    }

    #[test]
    fn test_score_stm32_vcp_on_acm() {
        let port = usb(
            "/dev/ttyACM0",
            0x0483,
            0x5740,
            "STM32 Virtual ComPort",
            "STMicroelectronics",
        );
        let candidate = score_port(&port);
        assert_eq!(candidate.score, 10 + 5 + 5 + 3);
        assert_eq!(candidate.reasons.len(), 4);
    }

    #[test]
    fn test_usb_path_only_when_not_acm() {
        assert_eq!(score_port(&PortInfo::new("/dev/ttyUSB0")).score, 3);
        assert_eq!(score_port(&PortInfo::new("/dev/ttyACM1")).score, 5);
        assert_eq!(score_port(&PortInfo::new("/dev/ttyS0")).score, 0);
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let mut port = PortInfo::new("/dev/ttyS1");
        port.product = Some("SPEEDYBEE F405 FLIGHT controller".to_string());
        port.manufacturer = Some("Silicon Labs".to_string());
        assert_eq!(score_port(&port).score, 5 + 3);
    }

    #[test]
    fn test_rank_drops_zero_scores() {
        let ports = vec![PortInfo::new("/dev/ttyS0"), PortInfo::new("/dev/ttyAMA0")];
        assert!(rank_ports(&ports).is_empty());
    }

    #[test]
    fn test_rank_sorts_descending() {
        let ports = vec![
            PortInfo::new("/dev/ttyUSB0"),
            usb("/dev/ttyACM0", 0x0483, 0x5740, "STM32", "STMicroelectronics"),
            PortInfo::new("/dev/ttyS0"),
        ];
        let ranked = rank_ports(&ports);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].path, "/dev/ttyACM0");
        assert_eq!(ranked[1].path, "/dev/ttyUSB0");
    }

    #[test]
    fn test_ties_keep_enumeration_order() {
        let ports = vec![
            PortInfo::new("/dev/ttyACM3"),
            PortInfo::new("/dev/ttyACM1"),
            PortInfo::new("/dev/ttyACM2"),
        ];
        let ranked = rank_ports(&ports);
        let order: Vec<&str> = ranked.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(order, ["/dev/ttyACM3", "/dev/ttyACM1", "/dev/ttyACM2"]);
        // Deterministic across calls.
        assert_eq!(rank_ports(&ports), ranked);
    }

    #[test]
    fn test_format_candidates() {
        let ranked = rank_ports(&[usb(
            "/dev/ttyACM0",
            0x0483,
            0x5740,
            "STM32 VCP",
            "STMicroelectronics",
        )]);
        let lines = format_candidates(&ranked);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("/dev/ttyACM0"));
        assert!(lines[0].contains("VID:0483 PID:5740"));
        assert!(lines[0].contains("STM32 VCP"));
    }
}
