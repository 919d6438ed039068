//! Session controller loop

use chrono::Utc;
use std::fmt::Display;
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{lock, SessionHandle, SessionState, Shared};
use crate::channel::{TimingError, PARITY_WARNING_THRESHOLD};
use crate::config::ProgramConfig;
use crate::protocol::{
    datetime_to_device_time, DeviceLink, FrameDecoder, Message, ProtocolError, SerialLink,
    CONNECT_COMMAND, DISCONNECT_COMMAND,
};
use crate::recording::RawRecorder;

/// Opens the link to the device given a port name and a baud rate
pub type LinkOpener =
    Box<dyn FnMut(&str, u32) -> Result<Box<dyn DeviceLink>, ProtocolError> + Send>;

/// Waits used by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerTimings {
    /// Wait after `$CONN` before reading the greeting
    pub greeting_wait: Duration,
    /// Time allowed to receive the rest of a reply line
    pub line_timeout: Duration,
    /// Wait after each ChannelSettings record for a rejection
    pub reply_window: Duration,
    /// Wait after `$DISC` before reading the reply
    pub disconnect_wait: Duration,
    /// Sleep between two ticks of [`SessionController::run`]
    pub tick_interval: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self {
            greeting_wait: Duration::from_millis(100),
            line_timeout: Duration::from_millis(10),
            reply_window: Duration::from_millis(5),
            disconnect_wait: Duration::from_millis(100),
            tick_interval: Duration::from_millis(5),
        }
    }
}

impl ControllerTimings {
    /// No waits at all, for links that answer synchronously
    pub fn immediate() -> Self {
        Self {
            greeting_wait: Duration::ZERO,
            line_timeout: Duration::ZERO,
            reply_window: Duration::ZERO,
            disconnect_wait: Duration::ZERO,
            tick_interval: Duration::ZERO,
        }
    }
}

/// Owner of the device link and of the polling loop
pub struct SessionController {
    shared: Arc<Shared>,
    opener: LinkOpener,
    link: Option<Box<dyn DeviceLink>>,
    decoder: FrameDecoder,
    timings: ControllerTimings,
    last_poll: Option<Instant>,
    recording: bool,
}

impl SessionController {
    /// Create a controller opening links with `opener`
    pub fn new(config: &ProgramConfig, opener: LinkOpener) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            opener,
            link: None,
            decoder: FrameDecoder::new(RawRecorder::new(config.recordings_dir())),
            timings: ControllerTimings::default(),
            last_poll: None,
            recording: false,
        }
    }

    /// Create a controller talking to a serial port
    pub fn with_serial(config: &ProgramConfig) -> Self {
        Self::new(
            config,
            Box::new(|port, baud_rate| {
                let link = SerialLink::open(port, baud_rate)?;
                Ok(Box::new(link) as Box<dyn DeviceLink>)
            }),
        )
    }

    /// Replace the waits used by the controller
    pub fn with_timings(mut self, timings: ControllerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Handle for the presentation layer
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(Arc::clone(&self.shared))
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    /// Run the loop until [`SessionHandle::shutdown`] is requested
    pub fn run(mut self) {
        info!("Session controller started");
        while !self.shared.signals.stop.take() {
            self.tick();
            if !self.timings.tick_interval.is_zero() {
                thread::sleep(self.timings.tick_interval);
            }
        }
        self.disconnect();
        self.stop_recording();
        info!("Session controller stopped");
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("midds-session".to_string())
            .spawn(move || self.run())
    }

    /// Handle pending requests, then exchange data with the device once
    pub fn tick(&mut self) {
        let signals = &self.shared.signals;
        let close = signals.close.take();
        let open = signals.open.take();
        let apply_channels = signals.apply_channels.take();
        let apply_sync = signals.apply_sync.take();
        let stop_recording = signals.stop_recording.take();
        let start_recording = signals.start_recording.take();

        if close {
            self.disconnect();
        }
        if open {
            self.connect();
        }
        if apply_channels && self.link.is_some() {
            if let Err(e) = self.push_configuration() {
                self.fail_link("Error applying configuration", &e);
            }
        }
        if apply_sync && self.link.is_some() {
            if let Err(e) = self.send_sync() {
                self.fail_link("Serial port error", &e);
            }
        }
        if stop_recording {
            self.stop_recording();
        }
        if start_recording {
            self.start_recording();
        }

        if self.link.is_some() {
            if let Err(e) = self.poll_device() {
                self.fail_link("Serial port error", &e);
            }
        }
        self.send_queued_commands();
        self.check_recorder();
        *lock(&self.shared.stats) = self.decoder.stats();
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.shared.state);
        if *current != state {
            debug!("Session state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn connect(&mut self) {
        if self.link.is_some() {
            debug!("Open requested while already connected");
            return;
        }
        let settings = lock(&self.shared.settings).clone();
        let Some(port) = settings.serial_port else {
            self.shared
                .notifications
                .raise_error("Serial port error", "No serial port selected");
            return;
        };

        self.set_state(SessionState::Connecting);
        match self.open_session(&port, settings.baud_rate) {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                info!("Connected to {} at {} baud", port, settings.baud_rate);
            }
            Err(e) => {
                self.link = None;
                self.decoder.clear();
                self.shared.device_connected.store(false, Ordering::Release);
                self.set_state(SessionState::Disconnected);
                self.shared
                    .notifications
                    .raise_error("Serial port error", format!("{}: {}", port, e));
            }
        }
    }

    fn open_session(&mut self, port: &str, baud_rate: u32) -> Result<(), ProtocolError> {
        let mut link = (self.opener)(port, baud_rate)?;
        link.write_all(CONNECT_COMMAND)?;
        link.flush()?;
        sleep(self.timings.greeting_wait);

        let greeting = link.read_line(self.timings.line_timeout)?;
        info!("Device greeting: {}", String::from_utf8_lossy(&greeting).trim());

        self.decoder.clear();
        self.link = Some(link);

        // The device only drives SYNC on a channel already configured as MB, so the
        // settings are sent again once the channels are configured.
        self.send_sync()?;
        self.shared.device_connected.store(true, Ordering::Release);

        // A rejection of the first SYNC record must not be blamed on channel 0
        sleep(self.timings.reply_window);
        for message in self.read_messages()? {
            self.dispatch(message);
        }
        self.push_configuration()?;
        self.send_sync()?;

        self.last_poll = None;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            self.set_state(SessionState::Disconnecting);
            let sent = link
                .write_all(DISCONNECT_COMMAND)
                .and_then(|()| link.flush());
            match sent {
                Ok(()) => {
                    sleep(self.timings.disconnect_wait);
                    match link.read_line(self.timings.line_timeout) {
                        Ok(reply) => {
                            debug!("Disconnect reply: {}", String::from_utf8_lossy(&reply).trim())
                        }
                        Err(e) => debug!("No disconnect reply: {}", e),
                    }
                }
                Err(e) => warn!("Could not send disconnect command: {}", e),
            }
            info!("Disconnected from device");
            self.stop_recording();
        }

        self.decoder.clear();
        self.shared.device_connected.store(false, Ordering::Release);
        self.set_state(SessionState::Disconnected);
    }

    /// Drop the link after an I/O failure
    fn fail_link(&mut self, title: &str, error: &dyn Display) {
        self.link = None;
        self.decoder.clear();
        self.shared.device_connected.store(false, Ordering::Release);
        self.set_state(SessionState::Disconnected);
        self.shared
            .notifications
            .raise_error(title, error.to_string());
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        link.write_all(bytes)?;
        link.flush()?;
        Ok(())
    }

    /// Set the device clock to now and push the SYNC output settings
    fn send_sync(&mut self) -> Result<(), ProtocolError> {
        let sync = lock(&self.shared.settings).sync;
        let frame = sync
            .message(datetime_to_device_time(Utc::now()))
            .encode()?;
        debug!(
            "Sending SYNC settings: channel {:?}, {} Hz, {}%",
            sync.channel, sync.frequency, sync.duty_cycle
        );
        self.write_frame(&frame)
    }

    /// Send every channel's settings in order, collecting rejections.
    ///
    /// A rejected channel is marked as not well configured and the push goes on
    /// with the next channel.
    fn push_configuration(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let records = lock(&self.shared.channels)
            .iter()
            .map(|channel| Ok((channel.number(), channel.settings_message().encode()?)))
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let mut rejected = Vec::new();
        for (number, frame) in records {
            self.write_frame(&frame)?;
            sleep(self.timings.reply_window);

            let mut accepted = true;
            for message in self.read_messages()? {
                match message {
                    Message::Error { text } if accepted => {
                        accepted = false;
                        self.shared
                            .notifications
                            .raise_error("MIDDS Error", format!("Channel {}: {}", number, text));
                    }
                    other => self.dispatch(other),
                }
            }

            if let Some(channel) = lock(&self.shared.channels)
                .iter_mut()
                .find(|c| c.number() == number)
            {
                channel.set_well_configured(accepted);
            }
            if !accepted {
                rejected.push(number);
            }
        }

        if rejected.is_empty() {
            info!("Channel configuration applied");
        } else {
            warn!("Device rejected the configuration of channels {:?}", rejected);
        }
        Ok(rejected)
    }

    /// Read what the link has buffered and decode every complete frame
    fn read_messages(&mut self) -> Result<Vec<Message>, ProtocolError> {
        let link = self.link.as_mut().ok_or(ProtocolError::NotConnected)?;
        let bytes = link.read_available()?;

        let mut messages = Vec::new();
        let mut next = self.decoder.feed(&bytes, self.recording);
        while let Some(message) = next {
            messages.push(message);
            next = self.decoder.feed(&[], self.recording);
        }
        Ok(messages)
    }

    fn poll_device(&mut self) -> Result<(), ProtocolError> {
        for message in self.read_messages()? {
            self.dispatch(message);
        }

        let interval = lock(&self.shared.settings).update_interval;
        let due = self
            .last_poll
            .map_or(true, |last| last.elapsed() >= interval);
        if due {
            self.last_poll = Some(Instant::now());
            let requests: Vec<Message> = lock(&self.shared.channels)
                .iter()
                .flat_map(|c| c.recurring_requests())
                .collect();
            if !requests.is_empty() {
                let mut bytes = Vec::new();
                for request in &requests {
                    bytes.extend(request.encode()?);
                }
                self.write_frame(&bytes)?;
            }
        }
        Ok(())
    }

    fn send_queued_commands(&mut self) {
        let commands: Vec<Vec<u8>> = lock(&self.shared.commands).drain(..).collect();
        if commands.is_empty() {
            return;
        }
        if self.link.is_none() {
            warn!("Dropping {} queued commands: not connected", commands.len());
            return;
        }
        for command in commands {
            if let Err(e) = self.write_frame(&command) {
                self.fail_link("Serial port error", &e);
                return;
            }
        }
    }

    /// Apply a decoded message to its channel
    fn dispatch(&mut self, message: Message) {
        let number = match &message {
            Message::Error { text } => {
                self.shared.notifications.raise_error("MIDDS Error", text.clone());
                return;
            }
            Message::SyncSettings { .. } => {
                debug!("Ignoring {:?}", message);
                return;
            }
            other => match other.channel() {
                Some(number) => number,
                None => return,
            },
        };

        let warn_parity = {
            let mut channels = lock(&self.shared.channels);
            let Some(channel) = channels.iter_mut().find(|c| c.number() == number) else {
                debug!("{} message for unknown channel {}", message.name(), number);
                return;
            };
            match channel.apply_message(&message) {
                Ok(()) => false,
                Err(e @ TimingError::ModeMismatch { .. }) => {
                    debug!("Channel {}: {}", number, e);
                    false
                }
                Err(_) => channel.consecutive_parity_errors() == PARITY_WARNING_THRESHOLD,
            }
        };

        if warn_parity {
            self.shared.notifications.raise_error(
                "Edge parity errors",
                format!(
                    "Channel {} keeps reporting consecutive edges of the same direction",
                    number
                ),
            );
        }
    }

    fn start_recording(&mut self) {
        match self.decoder.recorder_mut().start() {
            Ok(path) => {
                self.recording = true;
                self.shared.recording.store(true, Ordering::Release);
                *lock(&self.shared.recording_path) = Some(path.clone());
                self.shared.notifications.raise_message(
                    "Started recording",
                    format!("The recording will be stored in '{}'.", path.display()),
                );
            }
            Err(e) => self
                .shared
                .notifications
                .raise_error("Recording error", e.to_string()),
        }
    }

    fn stop_recording(&mut self) {
        if !self.recording {
            return;
        }
        self.recording = false;
        self.shared.recording.store(false, Ordering::Release);
        match self.decoder.recorder_mut().stop() {
            Ok(Some(path)) => self.shared.notifications.raise_message(
                "Stopped recording",
                format!("The recording is saved in '{}'.", path.display()),
            ),
            Ok(None) => {}
            Err(e) => self
                .shared
                .notifications
                .raise_error("Recording error", e.to_string()),
        }
    }

    /// Surface failures of the recording tee
    fn check_recorder(&mut self) {
        if let Some(e) = self.decoder.recorder_mut().take_error() {
            self.recording = false;
            self.shared.recording.store(false, Ordering::Release);
            self.shared
                .notifications
                .raise_error("Recording error", e.to_string());
        }
    }
}

fn sleep(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
