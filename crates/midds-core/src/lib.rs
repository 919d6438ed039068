//! # MIDDS Core Library
//!
//! Host-side supervisor for the MIDDS multi-channel timing and IO device.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The MIDDS binary wire protocol (encoding and a resynchronizing stream decoder)
//! - Per-channel timing analysis: levels, frequency, duty cycle and edge deltas
//! - A session controller driving the serial link on a dedicated thread
//! - Raw traffic recording
//! - A simulated device for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use midds_core::prelude::*;
//!
//! let config = ProgramConfig::from_file("midds.json")?;
//! let controller = SessionController::with_serial(&config);
//! let session = controller.handle();
//! let worker = controller.spawn()?;
//!
//! session.open();
//! for channel in session.snapshots() {
//!     println!("CH{}: {:?}", channel.number, channel.frequency);
//! }
//! session.shutdown();
//! worker.join().ok();
//! ```

pub mod channel;
pub mod config;
pub mod demo;
pub mod protocol;
pub mod recording;
pub mod session;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::channel::{Channel, ChannelSnapshot, ModeSettings, Reading, TimingError};
    pub use crate::config::{ChannelConfig, ConfigError, ProgramConfig, SyncConfig};
    pub use crate::demo::DemoDevice;
    pub use crate::protocol::{
        ChannelMode, DeviceLink, EdgeSample, FrameDecoder, Level, Message, ProtocolError,
        SignalType,
    };
    pub use crate::recording::RawRecorder;
    pub use crate::session::{
        ControllerTimings, Notification, SessionController, SessionHandle, SessionState,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
