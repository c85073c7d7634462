//! Passive MAVLink heartbeat detection.
//!
//! ArduPilot boards do not expose a text CLI. The most we do is listen to
//! what they stream anyway and pick out a `HEARTBEAT` (message id 0), which
//! tells us the autopilot and vehicle type. Nothing is ever sent.
//!
//! ```text
//! v1: | 0xFE | LEN | SEQ | SYS | COMP | MSG      | PAYLOAD | CRC16 |
//! v2: | 0xFD | LEN | INC | CMP | SEQ | SYS | COMP | MSG (3) | PAYLOAD | CRC16 | [SIG 13] |
//! ```

use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::Result;
use crate::protocol::transport::CliTransport;

const STX_V1: u8 = 0xFE;
const STX_V2: u8 = 0xFD;
const HEADER_LEN_V1: usize = 6;
const HEADER_LEN_V2: usize = 10;
const HEARTBEAT_ID: u32 = 0;
const HEARTBEAT_LEN: usize = 9;
const HEARTBEAT_CRC_EXTRA: u8 = 50;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_SIGNED: u8 = 0x01;

/// Upper bound of bytes captured while sniffing.
pub const SNIFF_MAX_BYTES: usize = 4096;

/// MAVLink wire version of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MavlinkVersion {
    /// MAVLink 1.
    V1,
    /// MAVLink 2.
    V2,
}

/// A decoded heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Heartbeat {
    /// Wire version the frame used.
    pub version: MavlinkVersion,
    /// Sender system id.
    pub system_id: u8,
    /// Sender component id.
    pub component_id: u8,
    /// `MAV_TYPE`.
    pub vehicle_type: u8,
    /// `MAV_AUTOPILOT`.
    pub autopilot: u8,
    /// `MAV_MODE_FLAG` bits.
    pub base_mode: u8,
    /// `MAV_STATE`.
    pub system_status: u8,
    /// Autopilot-specific mode.
    pub custom_mode: u32,
}

impl Heartbeat {
    /// Name of the `MAV_AUTOPILOT` value.
    pub fn autopilot_name(&self) -> &'static str {
        match self.autopilot {
            0 => "Generic",
            3 => "ArduPilot",
            4 => "OpenPilot",
            12 => "PX4",
            8 => "Invalid",
            _ => "Other",
        }
    }

    /// Name of the `MAV_TYPE` value.
    pub fn vehicle_name(&self) -> &'static str {
        match self.vehicle_type {
            1 => "Fixed wing",
            2 => "Quadrotor",
            3 => "Coaxial",
            4 => "Helicopter",
            10 => "Ground rover",
            11 => "Surface boat",
            12 => "Submarine",
            13 => "Hexarotor",
            14 => "Octorotor",
            15 => "Tricopter",
            _ => "Other",
        }
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAVLink {:?} heartbeat: autopilot={} ({}), type={} ({}), sys={}, comp={}, status={}",
            self.version,
            self.autopilot_name(),
            self.autopilot,
            self.vehicle_name(),
            self.vehicle_type,
            self.system_id,
            self.component_id,
            self.system_status
        )
    }
}

/// CRC-16/MCRF4XX accumulate step used by MAVLink.
fn crc_accumulate(byte: u8, crc: u16) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    let tmp = u16::from(tmp);
    (crc >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4)
}

fn frame_crc(covered: &[u8], extra: u8) -> u16 {
    let crc = covered
        .iter()
        .fold(0xFFFF, |crc, &b| crc_accumulate(b, crc));
    crc_accumulate(extra, crc)
}

/// Try to decode a heartbeat frame starting at `data[0]`.
fn parse_frame(data: &[u8]) -> Option<Heartbeat> {
    let (version, header_len) = match *data.first()? {
        STX_V1 => (MavlinkVersion::V1, HEADER_LEN_V1),
        STX_V2 => (MavlinkVersion::V2, HEADER_LEN_V2),
        _ => return None,
    };
    let payload_len = usize::from(*data.get(1)?);
    let frame_len = header_len + payload_len + 2;
    let frame = data.get(..frame_len)?;

    let (msg_id, system_id, component_id) = match version {
        MavlinkVersion::V1 => (u32::from(frame[5]), frame[3], frame[4]),
        MavlinkVersion::V2 => {
            if frame[2] & !INCOMPAT_SIGNED != 0 {
                return None;
            }
            if frame[2] & INCOMPAT_SIGNED != 0 && data.len() < frame_len + SIGNATURE_LEN {
                return None;
            }
            (LittleEndian::read_u24(&frame[7..10]), frame[5], frame[6])
        },
    };
    if msg_id != HEARTBEAT_ID || payload_len > HEARTBEAT_LEN {
        return None;
    }
    if version == MavlinkVersion::V1 && payload_len != HEARTBEAT_LEN {
        return None;
    }

    let crc = LittleEndian::read_u16(&frame[frame_len - 2..]);
    if crc != frame_crc(&frame[1..frame_len - 2], HEARTBEAT_CRC_EXTRA) {
        return None;
    }

    // MAVLink 2 truncates trailing zero bytes of the payload.
    let mut payload = [0u8; HEARTBEAT_LEN];
    payload[..payload_len].copy_from_slice(&frame[header_len..header_len + payload_len]);

    Some(Heartbeat {
        version,
        system_id,
        component_id,
        custom_mode: LittleEndian::read_u32(&payload[0..4]),
        vehicle_type: payload[4],
        autopilot: payload[5],
        base_mode: payload[6],
        system_status: payload[7],
    })
}

/// Scan a byte stream for the first valid heartbeat frame.
pub fn find_heartbeat(data: &[u8]) -> Option<Heartbeat> {
    data.iter()
        .enumerate()
        .filter(|(_, b)| matches!(**b, STX_V1 | STX_V2))
        .find_map(|(i, _)| parse_frame(&data[i..]))
}

/// Listen for a heartbeat for at most `window`.
pub fn sniff_heartbeat(transport: &mut CliTransport<'_>, window: Duration) -> Result<Option<Heartbeat>> {
    let data = transport.read_raw(window, SNIFF_MAX_BYTES)?;
    let heartbeat = find_heartbeat(&data);
    match &heartbeat {
        Some(hb) => debug!("{hb}"),
        None => debug!("No heartbeat in {} bytes", data.len()),
    }
    Ok(heartbeat)
}
