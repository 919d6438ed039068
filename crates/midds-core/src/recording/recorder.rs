//! Raw byte recorder
//!
//! Records the unprocessed serial stream of the device.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

use super::recording_file_name;

/// Errors raised while recording
#[derive(Error, Debug)]
pub enum RecordingError {
    /// The recording file could not be created
    #[error("Could not create recording '{}': {source}", path.display())]
    Create {
        /// File or directory being created
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Appending to the recording failed
    #[error("Could not write recording '{}': {source}", path.display())]
    Write {
        /// Recording file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// An open recording file
struct ActiveRecording {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
    started: Instant,
}

/// Recorder state
pub struct RawRecorder {
    /// Directory new recordings are created in
    directory: PathBuf,
    /// Currently open recording
    active: Option<ActiveRecording>,
    /// Set after a failure until recording is switched off, so a broken target is not retried
    /// on every read
    failed: bool,
    /// Last error not yet reported to the user
    last_error: Option<RecordingError>,
}

impl RawRecorder {
    /// Create a recorder writing into `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            active: None,
            failed: false,
            last_error: None,
        }
    }

    /// Check if a recording file is open
    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Path of the open recording
    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    /// Bytes written to the open recording
    pub fn bytes_written(&self) -> u64 {
        self.active.as_ref().map(|a| a.bytes).unwrap_or(0)
    }

    /// Start a fresh recording, finalizing any open one first
    pub fn start(&mut self) -> Result<PathBuf, RecordingError> {
        if self.active.is_some() {
            self.stop()?;
        }

        let (path, file) = self.create_fresh_file()?;
        info!("Recording raw traffic to {}", path.display());
        self.active = Some(ActiveRecording {
            path: path.clone(),
            writer: BufWriter::new(file),
            bytes: 0,
            started: Instant::now(),
        });
        self.failed = false;
        Ok(path)
    }

    /// Flush and close the open recording, returning its path
    pub fn stop(&mut self) -> Result<Option<PathBuf>, RecordingError> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };

        active.writer.flush().map_err(|source| RecordingError::Write {
            path: active.path.clone(),
            source,
        })?;
        info!(
            "Recording {} finished: {} bytes in {:.1}s",
            active.path.display(),
            active.bytes,
            active.started.elapsed().as_secs_f64()
        );
        Ok(Some(active.path))
    }

    /// Append bytes to the open recording
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RecordingError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active
            .writer
            .write_all(bytes)
            .map_err(|source| RecordingError::Write {
                path: active.path.clone(),
                source,
            })?;
        active.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Edge-triggered tee used on every read.
    ///
    /// While `recording` is set the bytes are appended, opening a file if none is open.
    /// The first call with `recording` cleared finalizes the open file. Failures are
    /// logged and kept for [`take_error`](Self::take_error).
    pub fn tee(&mut self, bytes: &[u8], recording: bool) {
        if !recording {
            self.failed = false;
            if self.active.is_some() {
                if let Err(e) = self.stop() {
                    self.fail(e);
                }
            }
            return;
        }

        if self.failed {
            return;
        }
        if self.active.is_none() {
            if let Err(e) = self.start() {
                self.fail(e);
                return;
            }
        }
        if bytes.is_empty() {
            return;
        }
        if let Err(e) = self.write(bytes) {
            self.active = None;
            self.fail(e);
        }
    }

    /// Take the last unreported error
    pub fn take_error(&mut self) -> Option<RecordingError> {
        self.last_error.take()
    }

    fn fail(&mut self, e: RecordingError) {
        error!("{}", e);
        self.failed = true;
        self.last_error = Some(e);
    }

    fn create_fresh_file(&self) -> Result<(PathBuf, File), RecordingError> {
        fs::create_dir_all(&self.directory).map_err(|source| RecordingError::Create {
            path: self.directory.clone(),
            source,
        })?;

        let name = recording_file_name(Local::now());
        let stem = name.trim_end_matches(&format!(".{}", super::FILE_EXTENSION));
        let mut suffix = 0u32;
        loop {
            let file_name = if suffix == 0 {
                name.clone()
            } else {
                format!("{}_{}.{}", stem, suffix, super::FILE_EXTENSION)
            };
            let path = self.directory.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(source) => return Err(RecordingError::Create { path, source }),
            }
        }
    }
}

impl Drop for RawRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_basic() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RawRecorder::new(dir.path());

        assert!(!recorder.is_recording());

        let path = recorder.start().unwrap();
        assert!(recorder.is_recording());

        recorder.write(b"$I").unwrap();
        recorder.write(b"00").unwrap();
        assert_eq!(recorder.bytes_written(), 4);

        assert_eq!(recorder.stop().unwrap(), Some(path.clone()));
        assert!(!recorder.is_recording());
        assert_eq!(fs::read(&path).unwrap(), b"$I00".to_vec());
    }

    #[test]
    fn test_recordings_in_same_second_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RawRecorder::new(dir.path());

        let first = recorder.start().unwrap();
        let second = recorder.start().unwrap();
        recorder.stop().unwrap();

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn test_tee_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = RawRecorder::new(dir.path());

        recorder.tee(b"before", false);
        assert!(!recorder.is_recording());

        recorder.tee(b"abc", true);
        let path = recorder.current_path().unwrap().to_path_buf();
        recorder.tee(b"def", true);
        recorder.tee(b"after", false);

        assert!(!recorder.is_recording());
        assert_eq!(fs::read(path).unwrap(), b"abcdef".to_vec());
    }

    #[test]
    fn test_unwritable_directory_reports_once() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let mut recorder = RawRecorder::new(&blocker);

        recorder.tee(b"abc", true);
        assert!(recorder.take_error().is_some());
        recorder.tee(b"def", true);
        assert!(recorder.take_error().is_none());
    }
}
