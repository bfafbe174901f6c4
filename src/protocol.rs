//! Wire format of the Extech EA15 serial stream.
//!
//! Every packet is wrapped in an STX/ETX envelope. There is no checksum and no
//! length field, so packets are told apart by their length and, for datalog
//! payloads, by a fixed session marker.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::models::{DatalogSession, Reading, SensorType, TempUnit, Temperature};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

pub const LIVE_PACKET_LEN: usize = 9;
pub const LENGTH_PACKET_LEN: usize = 5;

/// Starts every datalog session inside a bulk payload. The byte that follows
/// it is the session's interval code.
pub const SESSION_MARKER: [u8; 4] = [0x00, 0x55, 0xAA, 0x00];
pub const BULK_PREFIX: [u8; 5] = [STX, 0x00, 0x55, 0xAA, 0x00];

/// Sent after a live packet to ask for the datalog length.
pub const REQUEST_LENGTH: u8 = 0x41;
/// Sent after a live packet while waiting for the bulk payload.
pub const REQUEST_CONTINUE: u8 = 0x55;

/// Subtracted from the raw length word of a datalog-length packet.
pub const LENGTH_OFFSET: u16 = 0x8c80;

const RECORD_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Live,
    DatalogLength,
    DatalogBulk,
}

#[derive(Debug, Clone)]
pub struct DatalogDecode {
    pub sessions: Vec<DatalogSession>,
    /// The walk stopped short of the trailing ETX.
    pub truncated: bool,
}

pub fn has_envelope(buf: &[u8]) -> bool {
    buf.first() == Some(&STX) && buf.last() == Some(&ETX)
}

/// Classifies a buffer framed by inter-packet silence.
///
/// `expected_bulk` is the payload length announced by the last datalog-length
/// packet; a bulk packet only matches when it carries exactly that many bytes.
pub fn classify(buf: &[u8], expected_bulk: usize) -> Option<Packet> {
    if !has_envelope(buf) {
        return None;
    }
    if buf.starts_with(&BULK_PREFIX) {
        return (expected_bulk > 0 && buf.len() == expected_bulk + 2).then_some(Packet::DatalogBulk);
    }
    match buf.len() {
        LIVE_PACKET_LEN => Some(Packet::Live),
        LENGTH_PACKET_LEN => Some(Packet::DatalogLength),
        _ => None,
    }
}

/// Decodes a 9-byte live packet.
///
/// Never fails: a bad envelope yields an empty invalid reading, and an
/// unknown unit or sensor code yields an invalid reading with whatever
/// decoded successfully.
pub fn decode_reading(buf: &[u8], timestamp: DateTime<Utc>) -> Reading {
    if !(has_envelope(buf) && buf.len() == LIVE_PACKET_LEN) {
        return Reading::invalid(timestamp);
    }

    let (v1, u1) = decode_channel(buf[1], buf[2], buf[3]);
    let (v2, u2) = decode_channel(buf[4], buf[5], buf[6]);
    let sensor = SensorType::from_code(buf[7]);

    let valid = u1.is_some() && u2.is_some() && sensor.is_some();
    if !valid {
        warn!("undecodable reading: {}", hex(buf));
    }

    Reading {
        timestamp,
        t1: temperature(v1, u1),
        t1_unit: u1,
        t2: temperature(v2, u2),
        t2_unit: u2,
        sensor,
        valid,
    }
}

fn decode_channel(unit_byte: u8, hi: u8, lo: u8) -> (f64, Option<TempUnit>) {
    let sign = if unit_byte & 0xf0 != 0 { -1.0 } else { 1.0 };
    // The meter's two magnitude bytes combine with 255, not 256.
    let magnitude = hi as u32 * 0xff + lo as u32;
    let value = sign * magnitude as f64 / 10.0;
    (value, TempUnit::from_code(unit_byte & 0x7f))
}

fn temperature(value: f64, unit: Option<TempUnit>) -> Temperature {
    match unit {
        Some(u) => Temperature::from_unit(value, u),
        None => Temperature::default(),
    }
}

/// Payload length announced by a datalog-length packet, or `None` when the
/// raw word is below the offset.
pub fn decode_length(buf: &[u8]) -> Option<usize> {
    if !(has_envelope(buf) && buf.len() == LENGTH_PACKET_LEN) {
        return None;
    }
    let raw = u16::from_be_bytes([buf[2], buf[3]]);
    raw.checked_sub(LENGTH_OFFSET).map(usize::from)
}

/// Walks a bulk datalog payload into sessions.
///
/// Record timestamps are reconstructed as `start + offset * interval`
/// seconds, where `offset` is the record's byte position in `buf`.
pub fn decode_datalog(buf: &[u8], start: DateTime<Utc>) -> DatalogDecode {
    let mut sessions = Vec::new();
    if !has_envelope(buf) {
        return DatalogDecode {
            sessions,
            truncated: false,
        };
    }

    let mut i = 1;
    let mut in_session = false;
    let mut interval = 0u8;
    let mut readings = Vec::new();

    loop {
        if !in_session {
            if buf.len() <= i + SESSION_MARKER.len() + 1 {
                break;
            }
            if buf[i..i + SESSION_MARKER.len()] == SESSION_MARKER {
                in_session = true;
                interval = buf[i + SESSION_MARKER.len()];
                i += SESSION_MARKER.len() + 1;
            } else {
                i += 1;
            }
        } else {
            if buf.len() <= i + RECORD_LEN {
                break;
            }
            if buf[i..i + SESSION_MARKER.len()] == SESSION_MARKER {
                if !readings.is_empty() {
                    sessions.push(DatalogSession {
                        interval,
                        readings: std::mem::take(&mut readings),
                    });
                }
                interval = buf[i + SESSION_MARKER.len()];
                i += SESSION_MARKER.len() + 1;
            } else {
                let mut packet = [0u8; LIVE_PACKET_LEN];
                packet[0] = STX;
                packet[1..=RECORD_LEN].copy_from_slice(&buf[i..i + RECORD_LEN]);
                packet[LIVE_PACKET_LEN - 1] = ETX;
                let at = start + Duration::seconds(i as i64 * interval as i64);
                readings.push(decode_reading(&packet, at));
                i += RECORD_LEN;
            }
        }
    }

    let truncated = i + 1 != buf.len();
    if truncated {
        warn!("truncated download: stopped at {} of {} bytes", i + 1, buf.len());
    }

    if !readings.is_empty() {
        sessions.push(DatalogSession { interval, readings });
    }

    DatalogDecode {
        sessions,
        truncated,
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
