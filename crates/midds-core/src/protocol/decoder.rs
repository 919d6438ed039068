//! Stream decoder
//!
//! Reassembles frames from raw serial reads of arbitrary size. Bytes stay in the
//! buffer until a frame is fully available; on a failed structural decode only the
//! leading sync byte is dropped so a valid frame hidden behind a false sync is
//! still recovered.

use tracing::{debug, trace};

use super::message::{parse_monitor_count, FrameKind};
use super::{
    Message, CHANNEL_SETTINGS_LEN, ERROR_MAX_LEN, FREQUENCY_LEN, INPUT_LEN, MONITOR_HEADER_LEN,
    MONITOR_SAMPLE_LEN, OUTPUT_LEN, SYNC_BYTE, SYNC_SETTINGS_LEN,
};
use crate::recording::RawRecorder;

/// Consumed prefix size above which the buffer is compacted
const COMPACT_THRESHOLD: usize = 4096;

/// Counters describing what the decoder has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames decoded successfully
    pub frames: u64,
    /// Bytes dropped while scanning for a sync byte
    pub noise_bytes: u64,
    /// Candidate frames rejected by the structural decode
    pub malformed_frames: u64,
}

/// Outcome of inspecting the bytes following a sync byte
enum Scan {
    /// A complete frame of the given layout and length is buffered
    Complete(FrameKind, usize),
    /// More bytes are needed before anything can be decided
    Incomplete,
    /// The candidate can never become a valid frame
    Invalid(&'static str),
}

/// Stateful byte-stream decoder with a recording tee
pub struct FrameDecoder {
    /// Received bytes; everything before `start` is already consumed
    buffer: Vec<u8>,
    start: usize,
    recorder: RawRecorder,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a decoder whose recordings go to `recorder`
    pub fn new(recorder: RawRecorder) -> Self {
        Self {
            buffer: Vec::with_capacity(COMPACT_THRESHOLD),
            start: 0,
            recorder,
            stats: DecoderStats::default(),
        }
    }

    /// Append `bytes` and return the next complete message, if any.
    ///
    /// When `recording` is set the bytes are first written to the active recording,
    /// opening one if needed; the first call with `recording` cleared finalizes it.
    /// At most one message is returned per call: keep calling with an empty slice
    /// until `None` to drain every buffered frame.
    pub fn feed(&mut self, bytes: &[u8], recording: bool) -> Option<Message> {
        self.recorder.tee(bytes, recording);
        self.push(bytes);
        self.next_message()
    }

    /// Append bytes without decoding
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next buffered message
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            let pending = &self.buffer[self.start..];
            match pending.iter().position(|&b| b == SYNC_BYTE) {
                Some(0) => {}
                Some(noise) => self.discard_noise(noise),
                None => {
                    let noise = pending.len();
                    self.discard_noise(noise);
                    self.compact();
                    return None;
                }
            }

            let pending = &self.buffer[self.start..];
            match scan_frame(pending) {
                Scan::Incomplete => {
                    self.compact();
                    return None;
                }
                Scan::Invalid(reason) => self.reject_sync(reason),
                Scan::Complete(kind, len) => {
                    match Message::decode(kind, &pending[..len]) {
                        Ok(message) => {
                            self.start += len;
                            self.stats.frames += 1;
                            self.compact();
                            return Some(message);
                        }
                        Err(e) => {
                            debug!("Dropping sync byte of {:?} candidate: {}", kind, e);
                            self.stats.malformed_frames += 1;
                            self.start += 1;
                        }
                    }
                }
            }
        }
    }

    /// Number of buffered bytes not yet consumed
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// Decoder counters
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop all buffered bytes (the recording, if any, stays open)
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.start = 0;
    }

    /// Recording tee owned by this decoder
    pub fn recorder(&self) -> &RawRecorder {
        &self.recorder
    }

    /// Mutable access to the recording tee, used to start and stop recordings
    pub fn recorder_mut(&mut self) -> &mut RawRecorder {
        &mut self.recorder
    }

    fn discard_noise(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        trace!("Discarding {} bytes before sync", count);
        self.start += count;
        self.stats.noise_bytes += count as u64;
    }

    fn reject_sync(&mut self, reason: &'static str) {
        debug!("Dropping sync byte: {}", reason);
        self.stats.malformed_frames += 1;
        self.start += 1;
    }

    fn compact(&mut self) {
        if self.start == self.buffer.len() {
            self.buffer.clear();
            self.start = 0;
        } else if self.start >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
    }
}

/// Classify the bytes at the front of `pending`, which starts with a sync byte
fn scan_frame(pending: &[u8]) -> Scan {
    if pending.len() < 2 {
        return Scan::Incomplete;
    }

    let fixed = |kind: FrameKind, len: usize| {
        if pending.len() < len {
            Scan::Incomplete
        } else {
            Scan::Complete(kind, len)
        }
    };

    match pending[1] {
        b'I' => fixed(FrameKind::Input, INPUT_LEN),
        b'O' => fixed(FrameKind::Output, OUTPUT_LEN),
        b'F' => fixed(FrameKind::Frequency, FREQUENCY_LEN),
        b'M' => {
            if pending.len() < MONITOR_HEADER_LEN {
                return Scan::Incomplete;
            }
            match parse_monitor_count(&pending[4..8]) {
                Some(count) => fixed(
                    FrameKind::Monitor,
                    MONITOR_HEADER_LEN + count * MONITOR_SAMPLE_LEN,
                ),
                None => Scan::Invalid("monitor sample count is not numeric"),
            }
        }
        b'S' => {
            if pending.len() < 3 {
                return Scan::Incomplete;
            }
            match pending[2] {
                b'C' => fixed(FrameKind::ChannelSettings, CHANNEL_SETTINGS_LEN),
                b'Y' => fixed(FrameKind::SyncSettings, SYNC_SETTINGS_LEN),
                _ => Scan::Invalid("unknown settings sub-command"),
            }
        }
        b'E' => {
            let window = &pending[..pending.len().min(ERROR_MAX_LEN)];
            match window.iter().position(|&b| b == b'\n') {
                Some(end) => Scan::Complete(FrameKind::Error, end + 1),
                None if pending.len() >= ERROR_MAX_LEN => {
                    Scan::Invalid("error text not terminated within 64 bytes")
                }
                None => Scan::Incomplete,
            }
        }
        _ => Scan::Invalid("unknown command code"),
    }
}
