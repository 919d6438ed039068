//! Raw Traffic Recording
//!
//! Tees every byte received from the device into a timestamped file, decoded or
//! not, so a session can be replayed or inspected later.

mod recorder;

pub use recorder::{RawRecorder, RecordingError};

use chrono::{DateTime, Local};
use std::path::PathBuf;

/// File name prefix of every recording
pub const FILE_PREFIX: &str = "MIDDS_REC_";

/// Extension of recording files
pub const FILE_EXTENSION: &str = "bin";

/// Build the file name of a recording started at `started`
pub fn recording_file_name(started: DateTime<Local>) -> String {
    format!(
        "{}{}.{}",
        FILE_PREFIX,
        started.format("%Y-%m-%d_%H-%M-%S"),
        FILE_EXTENSION
    )
}

/// Default directory for recordings (`~/Documents/MIDDS Recordings`)
pub fn default_recordings_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .map(|base| base.join("MIDDS Recordings"))
        .unwrap_or_else(|| PathBuf::from("."))
}
