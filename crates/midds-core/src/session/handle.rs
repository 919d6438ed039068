//! Presentation-side access to a running session

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{lock, Notification, SessionSettings, SessionState, Shared};
use crate::channel::{Channel, ChannelSnapshot};
use crate::config::{ChannelConfig, ConfigError, SyncConfig};
use crate::protocol::{ChannelMode, DecoderStats, Level, Message, ProtocolError, CHANNEL_COUNT};

/// Cloneable handle to a [`SessionController`](super::SessionController)
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Request a connection to the configured serial port
    pub fn open(&self) {
        self.shared.signals.open.set();
    }

    /// Select `port` and request a connection to it
    pub fn open_port(&self, port: impl Into<String>) {
        lock(&self.shared.settings).serial_port = Some(port.into());
        self.open();
    }

    /// Request the session to be closed
    pub fn close(&self) {
        self.shared.signals.close.set();
    }

    /// Request the channel table to be pushed to the device
    pub fn apply_channels(&self) {
        self.shared.signals.apply_channels.set();
    }

    /// Request the clock and SYNC settings to be pushed to the device
    pub fn apply_sync(&self) {
        self.shared.signals.apply_sync.set();
    }

    /// Request a fresh recording
    pub fn start_recording(&self) {
        self.shared.signals.start_recording.set();
    }

    /// Request the recording to be finalized
    pub fn stop_recording(&self) {
        self.shared.signals.stop_recording.set();
    }

    /// Ask the controller loop to exit
    pub fn shutdown(&self) {
        self.shared.signals.stop.set();
    }

    /// Replace the SYNC settings; takes effect with [`apply_sync`](Self::apply_sync)
    pub fn set_sync(&self, sync: SyncConfig) {
        lock(&self.shared.settings).sync = sync;
    }

    /// Change how often recurring requests are sent
    pub fn set_update_interval(&self, interval: Duration) {
        lock(&self.shared.settings).update_interval = interval;
    }

    /// Current session settings
    pub fn settings(&self) -> SessionSettings {
        lock(&self.shared.settings).clone()
    }

    /// Replace one channel's configuration; takes effect with [`apply_channels`](Self::apply_channels)
    pub fn configure_channel(&self, config: &ChannelConfig) -> Result<(), ConfigError> {
        self.with_channel_mut(config.number, |channel| channel.apply_config(config))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "number".to_string(),
                reason: format!("channel {} does not exist", config.number),
            })
    }

    /// Switch a channel's mode, keeping only options that belong to the new mode
    pub fn set_channel_mode(&self, number: u8, mode: ChannelMode) -> bool {
        self.with_channel_mut(number, |channel| channel.set_mode(mode))
            .is_some()
    }

    /// Reset a channel's measurements and histories
    pub fn clear_channel(&self, number: u8) -> bool {
        self.with_channel_mut(number, Channel::clear).is_some()
    }

    /// Queue an Output message driving `number` to `level`
    pub fn set_output_level(&self, number: u8, level: Level) -> Result<(), ProtocolError> {
        if usize::from(number) >= CHANNEL_COUNT {
            return Err(ProtocolError::InvalidArguments {
                message: "Output",
                reason: format!("channel {} does not exist", number),
            });
        }
        let frame = Message::Output {
            channel: number,
            level,
            time: 0,
        }
        .encode()?;
        self.queue_command(frame);
        Ok(())
    }

    /// Queue raw bytes to be written verbatim on the next tick
    pub fn queue_command(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            lock(&self.shared.commands).push_back(bytes);
        }
    }

    /// Read views of every channel
    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        lock(&self.shared.channels)
            .iter()
            .map(Channel::snapshot)
            .collect()
    }

    /// Read view of one channel
    pub fn snapshot(&self, number: u8) -> Option<ChannelSnapshot> {
        self.with_channel(number, Channel::snapshot)
    }

    /// Run `f` on a channel under the channel table lock
    pub fn with_channel<R>(&self, number: u8, f: impl FnOnce(&Channel) -> R) -> Option<R> {
        lock(&self.shared.channels)
            .iter()
            .find(|c| c.number() == number)
            .map(f)
    }

    fn with_channel_mut<R>(&self, number: u8, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        lock(&self.shared.channels)
            .iter_mut()
            .find(|c| c.number() == number)
            .map(f)
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Whether the device session is established
    pub fn is_connected(&self) -> bool {
        self.shared.device_connected.load(Ordering::Acquire)
    }

    /// Whether raw traffic is being recorded
    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    /// File of the current or last recording
    pub fn recording_path(&self) -> Option<PathBuf> {
        lock(&self.shared.recording_path).clone()
    }

    /// Decoder counters as of the last tick
    pub fn decoder_stats(&self) -> DecoderStats {
        *lock(&self.shared.stats)
    }

    /// Acknowledge the latest error
    pub fn take_error(&self) -> Option<Notification> {
        self.shared.notifications.take_error()
    }

    /// Acknowledge the latest informational message
    pub fn take_message(&self) -> Option<Notification> {
        self.shared.notifications.take_message()
    }
}
