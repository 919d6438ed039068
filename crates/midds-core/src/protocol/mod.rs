//! Wire Protocol
//!
//! Implements the MIDDS binary protocol spoken over the serial link.
//!
//! Every frame starts with the sync byte `$` followed by a command code. Channel
//! numbers and counts are zero-padded ASCII decimal, numeric payloads are
//! little-endian.

mod decoder;
mod error;
pub mod link;
mod message;
pub mod serial;

pub use decoder::{DecoderStats, FrameDecoder};
pub use error::ProtocolError;
pub use link::{DeviceLink, SerialLink};
pub use message::{
    datetime_to_device_time, device_time_to_datetime, ChannelMode, EdgeSample, Level, Message,
    SignalType,
};
pub use serial::{clear_buffers, configure_port, open_port};

/// First byte of every frame
pub const SYNC_BYTE: u8 = b'$';

/// Literal command that opens a session with the device
pub const CONNECT_COMMAND: &[u8] = b"$CONN";

/// Literal command that closes a session with the device
pub const DISCONNECT_COMMAND: &[u8] = b"$DISC";

/// Default baud rate of the device's USB CDC link
pub const DEFAULT_BAUD_RATE: u32 = 2_000_000;

/// Per-read timeout on the serial link in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1;

/// Number of channels exposed by the device
pub const CHANNEL_COUNT: usize = 14;

/// Total length of an Input frame
pub const INPUT_LEN: usize = 13;
/// Total length of an Output frame
pub const OUTPUT_LEN: usize = 13;
/// Total length of a Frequency frame
pub const FREQUENCY_LEN: usize = 28;
/// Length of the Monitor header preceding the packed samples
pub const MONITOR_HEADER_LEN: usize = 8;
/// Size of one packed edge sample
pub const MONITOR_SAMPLE_LEN: usize = 8;
/// Largest sample count representable in the 4-digit count field
pub const MONITOR_MAX_SAMPLES: usize = 9999;
/// Total length of a ChannelSettings frame
pub const CHANNEL_SETTINGS_LEN: usize = 8;
/// Total length of a SyncSettings frame
pub const SYNC_SETTINGS_LEN: usize = 29;
/// Upper bound of an Error frame, header and terminator included
pub const ERROR_MAX_LEN: usize = 64;
