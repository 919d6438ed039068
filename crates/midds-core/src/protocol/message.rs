//! Message encoding/decoding
//!
//! Frame layouts (all multi-byte numbers little-endian, `CC` = 2-digit ASCII channel):
//!
//! | Message         | Layout                                   | Length      |
//! |-----------------|------------------------------------------|-------------|
//! | Input           | `$I` CC level:1 time:u64                 | 13          |
//! | Output          | `$O` CC level:1 time:u64                 | 13          |
//! | Frequency       | `$F` CC freq:f64 duty:f64 time:u64       | 28          |
//! | Monitor         | `$M` CC count:4 count x sample:u64       | 8 + 8*count |
//! | ChannelSettings | `$SC` CC mode:2 signal:1                 | 8           |
//! | SyncSettings    | `$SY` CC freq:f64 duty:f64 time:u64      | 29          |
//! | Error           | `$E` text `\n`                           | <= 64       |

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{
    ProtocolError, CHANNEL_SETTINGS_LEN, ERROR_MAX_LEN, FREQUENCY_LEN, INPUT_LEN,
    MONITOR_HEADER_LEN, MONITOR_MAX_SAMPLES, MONITOR_SAMPLE_LEN, OUTPUT_LEN, SYNC_BYTE,
    SYNC_SETTINGS_LEN,
};

/// Highest channel number that fits the 2-digit channel field
const MAX_WIRE_CHANNEL: u8 = 99;

/// Longest error text that still fits in an Error frame
const ERROR_MAX_TEXT_LEN: usize = ERROR_MAX_LEN - 3;

/// Digital level of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Logic 0
    Low,
    /// Logic 1
    High,
}

impl Level {
    /// Parse the 1-digit ASCII level field
    pub fn from_ascii(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Level::Low),
            b'1' => Some(Level::High),
            _ => None,
        }
    }

    /// Parse a written output value: any non-zero digit drives the channel high
    pub fn from_digit(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Level::Low),
            b'1'..=b'9' => Some(Level::High),
            _ => None,
        }
    }

    /// ASCII representation used on the wire
    pub fn as_ascii(self) -> u8 {
        match self {
            Level::Low => b'0',
            Level::High => b'1',
        }
    }

    /// Numeric value used for plotting (0.0 / 1.0)
    pub fn as_f64(self) -> f64 {
        match self {
            Level::Low => 0.0,
            Level::High => 1.0,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "LOW"),
            Level::High => write!(f, "HIGH"),
        }
    }
}

/// Operating mode of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelMode {
    /// Channel off
    #[default]
    #[serde(rename = "DS")]
    Disabled,
    /// Level input
    #[serde(rename = "IN")]
    Input,
    /// Driven output
    #[serde(rename = "OU")]
    Output,
    /// Rising edges timestamped
    #[serde(rename = "MR")]
    MonitorRising,
    /// Falling edges timestamped
    #[serde(rename = "MF")]
    MonitorFalling,
    /// Both edges timestamped
    #[serde(rename = "MB")]
    MonitorBoth,
}

impl ChannelMode {
    /// Two-character code used on the wire
    pub fn code(self) -> &'static str {
        match self {
            ChannelMode::Disabled => "DS",
            ChannelMode::Input => "IN",
            ChannelMode::Output => "OU",
            ChannelMode::MonitorRising => "MR",
            ChannelMode::MonitorFalling => "MF",
            ChannelMode::MonitorBoth => "MB",
        }
    }

    /// Parse a two-character mode code
    pub fn from_code(code: &[u8]) -> Option<Self> {
        match code {
            b"DS" => Some(ChannelMode::Disabled),
            b"IN" => Some(ChannelMode::Input),
            b"OU" => Some(ChannelMode::Output),
            b"MR" => Some(ChannelMode::MonitorRising),
            b"MF" => Some(ChannelMode::MonitorFalling),
            b"MB" => Some(ChannelMode::MonitorBoth),
            _ => None,
        }
    }

    /// Whether the channel reports packed edge samples
    pub fn is_monitor(self) -> bool {
        matches!(
            self,
            ChannelMode::MonitorRising | ChannelMode::MonitorFalling | ChannelMode::MonitorBoth
        )
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Electrical signal standard of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SignalType {
    /// TTL levels
    #[default]
    #[serde(rename = "T")]
    Ttl,
    /// LVDS pair
    #[serde(rename = "L")]
    Lvds,
}

impl SignalType {
    /// One-character code used on the wire
    pub fn code(self) -> u8 {
        match self {
            SignalType::Ttl => b'T',
            SignalType::Lvds => b'L',
        }
    }

    /// Parse a one-character signal code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'T' => Some(SignalType::Ttl),
            b'L' => Some(SignalType::Lvds),
            _ => None,
        }
    }
}

/// A packed edge sample: bit 0 is the edge direction (1 = rising), bits 1-63 the
/// device time in nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeSample(u64);

impl EdgeSample {
    /// Pack a timestamp and the level the channel moved to
    pub fn new(time_ns: u64, level: Level) -> Self {
        let bit = match level {
            Level::High => 1,
            Level::Low => 0,
        };
        Self((time_ns << 1) | bit)
    }

    /// Shorthand for a rising edge at `time_ns`
    pub fn rising(time_ns: u64) -> Self {
        Self::new(time_ns, Level::High)
    }

    /// Shorthand for a falling edge at `time_ns`
    pub fn falling(time_ns: u64) -> Self {
        Self::new(time_ns, Level::Low)
    }

    /// Raw packed value as sent on the wire
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Device time of the edge in nanoseconds
    pub fn time_ns(self) -> u64 {
        self.0 >> 1
    }

    /// Whether this is a rising edge
    pub fn is_rising(self) -> bool {
        self.0 & 1 == 1
    }

    /// Level of the channel right after the edge
    pub fn level(self) -> Level {
        if self.is_rising() {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<u64> for EdgeSample {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EdgeSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edge = if self.is_rising() { "rising" } else { "falling" };
        write!(f, "EdgeSample({} @ {}ns)", edge, self.time_ns())
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Level read of a channel. `level` is `None` when the device sent neither `0` nor `1`.
    Input {
        /// Channel number
        channel: u8,
        /// Level read
        level: Option<Level>,
        /// Device time in nanoseconds
        time: u64,
    },
    /// Level written to an output channel
    Output {
        /// Channel number
        channel: u8,
        /// Level driven
        level: Level,
        /// Device time in nanoseconds
        time: u64,
    },
    /// Frequency report (or request, with zeroed values)
    Frequency {
        /// Channel number
        channel: u8,
        /// Frequency in Hz
        frequency: f64,
        /// Duty cycle in percent
        duty_cycle: f64,
        /// Device time in nanoseconds
        time: u64,
    },
    /// Batch of packed edge samples
    Monitor {
        /// Channel number
        channel: u8,
        /// Edge samples in device order
        samples: Vec<EdgeSample>,
    },
    /// Channel mode and signal configuration
    ChannelSettings {
        /// Channel number
        channel: u8,
        /// Mode
        mode: ChannelMode,
        /// Signal standard
        signal: SignalType,
    },
    /// Device clock and SYNC output configuration. `channel` is `None` when SYNC is disabled.
    SyncSettings {
        /// SYNC output channel, `None` when disabled
        channel: Option<u8>,
        /// SYNC frequency in Hz
        frequency: f64,
        /// SYNC duty cycle in percent
        duty_cycle: f64,
        /// Device clock in nanoseconds
        time: u64,
    },
    /// Error text reported by the device
    Error {
        /// Text without the terminator
        text: String,
    },
}

/// Frame layout selected by the command code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Input,
    Output,
    Frequency,
    Monitor,
    ChannelSettings,
    SyncSettings,
    Error,
}

impl Message {
    /// Request the current level of a channel
    pub fn input_request(channel: u8) -> Self {
        Message::Input {
            channel,
            level: Some(Level::Low),
            time: 0,
        }
    }

    /// Request the current frequency and duty cycle of a channel
    pub fn frequency_request(channel: u8) -> Self {
        Message::Frequency {
            channel,
            frequency: 0.0,
            duty_cycle: 0.0,
            time: 0,
        }
    }

    /// Short name of the variant, used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Input { .. } => "Input",
            Message::Output { .. } => "Output",
            Message::Frequency { .. } => "Frequency",
            Message::Monitor { .. } => "Monitor",
            Message::ChannelSettings { .. } => "ChannelSettings",
            Message::SyncSettings { .. } => "SyncSettings",
            Message::Error { .. } => "Error",
        }
    }

    /// Channel the message is addressed to, if any
    pub fn channel(&self) -> Option<u8> {
        match self {
            Message::Input { channel, .. }
            | Message::Output { channel, .. }
            | Message::Frequency { channel, .. }
            | Message::Monitor { channel, .. }
            | Message::ChannelSettings { channel, .. } => Some(*channel),
            Message::SyncSettings { channel, .. } => *channel,
            Message::Error { .. } => None,
        }
    }

    /// Encode the message to its wire representation
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.name();
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.push(SYNC_BYTE);

        match self {
            Message::Input {
                channel,
                level,
                time,
            } => {
                let level = level.ok_or_else(|| ProtocolError::invalid(name, "missing level"))?;
                bytes.push(b'I');
                push_channel(&mut bytes, *channel, name)?;
                bytes.push(level.as_ascii());
                push_u64(&mut bytes, *time);
            }
            Message::Output {
                channel,
                level,
                time,
            } => {
                bytes.push(b'O');
                push_channel(&mut bytes, *channel, name)?;
                bytes.push(level.as_ascii());
                push_u64(&mut bytes, *time);
            }
            Message::Frequency {
                channel,
                frequency,
                duty_cycle,
                time,
            } => {
                bytes.push(b'F');
                push_channel(&mut bytes, *channel, name)?;
                push_f64(&mut bytes, *frequency);
                push_f64(&mut bytes, *duty_cycle);
                push_u64(&mut bytes, *time);
            }
            Message::Monitor { channel, samples } => {
                if samples.len() > MONITOR_MAX_SAMPLES {
                    return Err(ProtocolError::invalid(
                        name,
                        format!("{} samples exceed the 4-digit count", samples.len()),
                    ));
                }
                bytes.push(b'M');
                push_channel(&mut bytes, *channel, name)?;
                bytes.extend_from_slice(format!("{:04}", samples.len()).as_bytes());
                for sample in samples {
                    push_u64(&mut bytes, sample.raw());
                }
            }
            Message::ChannelSettings {
                channel,
                mode,
                signal,
            } => {
                bytes.extend_from_slice(b"SC");
                push_channel(&mut bytes, *channel, name)?;
                bytes.extend_from_slice(mode.code().as_bytes());
                bytes.push(signal.code());
            }
            Message::SyncSettings {
                channel,
                frequency,
                duty_cycle,
                time,
            } => {
                bytes.extend_from_slice(b"SY");
                match channel {
                    Some(ch) => push_channel(&mut bytes, *ch, name)?,
                    None => bytes.extend_from_slice(b"-1"),
                }
                push_f64(&mut bytes, *frequency);
                push_f64(&mut bytes, *duty_cycle);
                push_u64(&mut bytes, *time);
            }
            Message::Error { text } => {
                if text.len() > ERROR_MAX_TEXT_LEN {
                    return Err(ProtocolError::invalid(
                        name,
                        format!("text is {} bytes, limit {}", text.len(), ERROR_MAX_TEXT_LEN),
                    ));
                }
                if !text.is_ascii() || text.contains('\n') {
                    return Err(ProtocolError::invalid(
                        name,
                        "text must be ASCII without newlines",
                    ));
                }
                bytes.push(b'E');
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(b'\n');
            }
        }

        Ok(bytes)
    }

    /// Expected encoded size of the message
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::Input { .. } => INPUT_LEN,
            Message::Output { .. } => OUTPUT_LEN,
            Message::Frequency { .. } => FREQUENCY_LEN,
            Message::Monitor { samples, .. } => {
                MONITOR_HEADER_LEN + samples.len() * MONITOR_SAMPLE_LEN
            }
            Message::ChannelSettings { .. } => CHANNEL_SETTINGS_LEN,
            Message::SyncSettings { .. } => SYNC_SETTINGS_LEN,
            Message::Error { text } => text.len() + 3,
        }
    }

    /// Structurally decode a complete frame whose length was already determined
    pub(crate) fn decode(kind: FrameKind, frame: &[u8]) -> Result<Self, ProtocolError> {
        match kind {
            FrameKind::Input => Ok(Message::Input {
                channel: parse_channel(&frame[2..4])?,
                level: Level::from_ascii(frame[4]),
                time: LittleEndian::read_u64(&frame[5..13]),
            }),
            FrameKind::Output => {
                let level = Level::from_digit(frame[4]).ok_or_else(|| {
                    ProtocolError::malformed(format!("output value byte 0x{:02x}", frame[4]))
                })?;
                Ok(Message::Output {
                    channel: parse_channel(&frame[2..4])?,
                    level,
                    time: LittleEndian::read_u64(&frame[5..13]),
                })
            }
            FrameKind::Frequency => Ok(Message::Frequency {
                channel: parse_channel(&frame[2..4])?,
                frequency: LittleEndian::read_f64(&frame[4..12]),
                duty_cycle: LittleEndian::read_f64(&frame[12..20]),
                time: LittleEndian::read_u64(&frame[20..28]),
            }),
            FrameKind::Monitor => {
                let channel = parse_channel(&frame[2..4])?;
                let count = parse_monitor_count(&frame[4..8])
                    .ok_or_else(|| ProtocolError::malformed("monitor sample count"))?;
                let payload = &frame[MONITOR_HEADER_LEN..];
                if payload.len() != count * MONITOR_SAMPLE_LEN {
                    return Err(ProtocolError::malformed("monitor payload length"));
                }
                let samples = payload
                    .chunks_exact(MONITOR_SAMPLE_LEN)
                    .map(|chunk| EdgeSample::from(LittleEndian::read_u64(chunk)))
                    .collect();
                Ok(Message::Monitor { channel, samples })
            }
            FrameKind::ChannelSettings => {
                let channel = parse_channel(&frame[3..5])?;
                let mode = ChannelMode::from_code(&frame[5..7]).ok_or_else(|| {
                    ProtocolError::malformed(format!(
                        "mode code {:?}",
                        String::from_utf8_lossy(&frame[5..7])
                    ))
                })?;
                let signal = SignalType::from_code(frame[7]).ok_or_else(|| {
                    ProtocolError::malformed(format!("signal code 0x{:02x}", frame[7]))
                })?;
                Ok(Message::ChannelSettings {
                    channel,
                    mode,
                    signal,
                })
            }
            FrameKind::SyncSettings => {
                let channel = match &frame[3..5] {
                    b"-1" => None,
                    digits => Some(parse_channel(digits)?),
                };
                Ok(Message::SyncSettings {
                    channel,
                    frequency: LittleEndian::read_f64(&frame[5..13]),
                    duty_cycle: LittleEndian::read_f64(&frame[13..21]),
                    time: LittleEndian::read_u64(&frame[21..29]),
                })
            }
            FrameKind::Error => {
                let body = &frame[2..frame.len() - 1];
                Ok(Message::Error {
                    text: String::from_utf8_lossy(body).into_owned(),
                })
            }
        }
    }
}

/// Parse the 4-digit ASCII sample count of a Monitor header
pub(crate) fn parse_monitor_count(digits: &[u8]) -> Option<usize> {
    parse_ascii_decimal(digits)
}

fn parse_channel(digits: &[u8]) -> Result<u8, ProtocolError> {
    parse_ascii_decimal(digits)
        .map(|n| n as u8)
        .ok_or_else(|| {
            ProtocolError::malformed(format!(
                "channel field {:?}",
                String::from_utf8_lossy(digits)
            ))
        })
}

fn parse_ascii_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(
        digits
            .iter()
            .fold(0usize, |acc, d| acc * 10 + (d - b'0') as usize),
    )
}

fn push_channel(bytes: &mut Vec<u8>, channel: u8, name: &'static str) -> Result<(), ProtocolError> {
    if channel > MAX_WIRE_CHANNEL {
        return Err(ProtocolError::invalid(
            name,
            format!("channel {} does not fit two digits", channel),
        ));
    }
    bytes.extend_from_slice(format!("{:02}", channel).as_bytes());
    Ok(())
}

fn push_u64(bytes: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, value);
    bytes.extend_from_slice(&buf);
}

fn push_f64(bytes: &mut Vec<u8>, value: f64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_f64(&mut buf, value);
    bytes.extend_from_slice(&buf);
}

/// Convert a device timestamp (UNIX nanoseconds) to a UTC date
pub fn device_time_to_datetime(time_ns: u64) -> DateTime<Utc> {
    let secs = (time_ns / 1_000_000_000) as i64;
    let nanos = (time_ns % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Convert a UTC date to a device timestamp (UNIX nanoseconds), clamping pre-epoch dates to 0
pub fn datetime_to_device_time(date: DateTime<Utc>) -> u64 {
    date.timestamp_nanos_opt()
        .map(|ns| ns.max(0) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_input_layout() {
        let msg = Message::Input {
            channel: 7,
            level: Some(Level::High),
            time: 0x0102_0304_0506_0708,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), INPUT_LEN);
        assert_eq!(&bytes[..5], b"$I071");
        assert_eq!(&bytes[5..], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_input_without_level_is_invalid() {
        let msg = Message::Input {
            channel: 1,
            level: None,
            time: 0,
        };
        assert!(matches!(
            msg.encode(),
            Err(ProtocolError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_unknown_input_level_decodes_as_none() {
        let mut frame = Message::input_request(3).encode().unwrap();
        frame[4] = b' ';
        let msg = Message::decode(FrameKind::Input, &frame).unwrap();
        assert_eq!(
            msg,
            Message::Input {
                channel: 3,
                level: None,
                time: 0
            }
        );
    }

    #[test]
    fn test_output_value_digits() {
        let mut frame = Message::Output {
            channel: 2,
            level: Level::Low,
            time: 5,
        }
        .encode()
        .unwrap();

        frame[4] = b'7';
        assert_eq!(
            Message::decode(FrameKind::Output, &frame).unwrap(),
            Message::Output {
                channel: 2,
                level: Level::High,
                time: 5,
            }
        );

        frame[4] = b'x';
        assert!(matches!(
            Message::decode(FrameKind::Output, &frame),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_channel_settings_layout() {
        let msg = Message::ChannelSettings {
            channel: 12,
            mode: ChannelMode::MonitorBoth,
            signal: SignalType::Lvds,
        };
        assert_eq!(msg.encode().unwrap(), b"$SC12MBL".to_vec());
    }

    #[test]
    fn test_sync_disabled_channel() {
        let msg = Message::SyncSettings {
            channel: None,
            frequency: 1.0,
            duty_cycle: 50.0,
            time: 42,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), SYNC_SETTINGS_LEN);
        assert_eq!(&bytes[..5], b"$SY-1");
        assert_eq!(Message::decode(FrameKind::SyncSettings, &bytes).unwrap(), msg);
    }

    #[test]
    fn test_channel_out_of_range() {
        let msg = Message::frequency_request(100);
        assert!(msg.encode().is_err());
    }

    #[test]
    fn test_error_text_limits() {
        let ok = Message::Error {
            text: "x".repeat(ERROR_MAX_TEXT_LEN),
        };
        assert_eq!(ok.encode().unwrap().len(), ERROR_MAX_LEN);

        let too_long = Message::Error {
            text: "x".repeat(ERROR_MAX_TEXT_LEN + 1),
        };
        assert!(too_long.encode().is_err());

        let newline = Message::Error {
            text: "a\nb".to_string(),
        };
        assert!(newline.encode().is_err());
    }

    #[test]
    fn test_edge_sample_packing() {
        let sample = EdgeSample::rising(1_500_000);
        assert_eq!(sample.raw(), 3_000_001);
        assert!(sample.is_rising());
        assert_eq!(sample.time_ns(), 1_500_000);
        assert_eq!(EdgeSample::falling(10).level(), Level::Low);
    }

    #[test]
    fn test_mode_codes() {
        for mode in [
            ChannelMode::Disabled,
            ChannelMode::Input,
            ChannelMode::Output,
            ChannelMode::MonitorRising,
            ChannelMode::MonitorFalling,
            ChannelMode::MonitorBoth,
        ] {
            assert_eq!(ChannelMode::from_code(mode.code().as_bytes()), Some(mode));
        }
        assert_eq!(ChannelMode::from_code(b"FR"), None);
    }

    #[test]
    fn test_device_time_conversion() {
        let date = device_time_to_datetime(1_700_000_000_123_456_789);
        assert_eq!(date.timestamp(), 1_700_000_000);
        assert_eq!(datetime_to_device_time(date), 1_700_000_000_123_456_789);
    }
}
