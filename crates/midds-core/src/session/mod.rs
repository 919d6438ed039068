//! Device Session Controller
//!
//! A [`SessionController`] owns the device link and runs the polling loop on a
//! dedicated thread. The presentation layer talks to it through a cloneable
//! [`SessionHandle`]: requests are one-shot flags, channel state is shared under
//! a single lock and results come back as notifications.

mod controller;
mod handle;
mod notify;
mod signals;

pub use controller::{ControllerTimings, LinkOpener, SessionController};
pub use handle::SessionHandle;
pub use notify::{Notification, NotificationSlot, Notifications};
pub use signals::{SessionSignals, SignalFlag};

use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::channel::Channel;
use crate::config::{ProgramConfig, SyncConfig};
use crate::protocol::DecoderStats;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    /// No link
    #[default]
    Disconnected,
    /// Opening the link and configuring the device
    Connecting,
    /// Session established
    Connected,
    /// Closing the link
    Disconnecting,
}

/// Settings the controller reads on every request
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Serial port to open
    pub serial_port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Interval between recurring requests
    pub update_interval: Duration,
    /// SYNC output settings
    pub sync: SyncConfig,
}

impl SessionSettings {
    /// Settings from the startup configuration
    pub fn from_config(config: &ProgramConfig) -> Self {
        Self {
            serial_port: config.serial_port.clone(),
            baud_rate: config.baud_rate,
            update_interval: config.update_interval(),
            sync: config.sync,
        }
    }
}

/// State shared by the controller and its handles
#[derive(Debug)]
pub(crate) struct Shared {
    pub channels: Mutex<Vec<Channel>>,
    pub settings: Mutex<SessionSettings>,
    pub commands: Mutex<VecDeque<Vec<u8>>>,
    pub signals: SessionSignals,
    pub notifications: Notifications,
    pub state: Mutex<SessionState>,
    pub device_connected: AtomicBool,
    pub recording: AtomicBool,
    pub recording_path: Mutex<Option<PathBuf>>,
    pub stats: Mutex<DecoderStats>,
}

impl Shared {
    pub fn new(config: &ProgramConfig) -> Self {
        Self {
            channels: Mutex::new(config.build_channels()),
            settings: Mutex::new(SessionSettings::from_config(config)),
            commands: Mutex::new(VecDeque::new()),
            signals: SessionSignals::default(),
            notifications: Notifications::default(),
            state: Mutex::new(SessionState::Disconnected),
            device_connected: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            recording_path: Mutex::new(None),
            stats: Mutex::new(DecoderStats::default()),
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
