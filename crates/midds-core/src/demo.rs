//! Demo Mode - Simulated MIDDS device
//!
//! An in-process [`DeviceLink`] that speaks the device protocol, so the session
//! controller can run without hardware. Every enabled channel sees a square wave
//! with a little period jitter; monitor channels stream their edges, Input and
//! Frequency requests are answered from the same waves.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;
use tracing::{debug, trace};

use crate::protocol::{
    datetime_to_device_time, ChannelMode, DeviceLink, EdgeSample, FrameDecoder, Level, Message,
    SignalType, CHANNEL_COUNT, CONNECT_COMMAND, DISCONNECT_COMMAND,
};
use crate::recording::RawRecorder;
use crate::session::LinkOpener;

/// Channels backed by a hardware timer; the others are plain GPIOs
pub const DEMO_TIMER_CHANNELS: u8 = 8;

/// Line sent in reply to `$CONN`
pub const DEMO_GREETING: &[u8] = b"Connected to MIDDS demo device\n";

/// Line sent in reply to `$DISC`
pub const DEMO_FAREWELL: &[u8] = b"Disconnected from MIDDS demo device\n";

/// Most samples packed into one Monitor frame
const SAMPLES_PER_FRAME: usize = 256;

/// Edges older than this are skipped instead of streamed
const MAX_BACKLOG_NS: u64 = 1_000_000_000;

const RR_INVALID_CHANNEL: &str = "RR_INVALID_CHANNEL";
const RR_INVALID_MODE: &str = "RR_INVALID_MODE";
const RR_INVALID_SIGNAL_TYPE: &str = "RR_INVALID_SIGNAL_TYPE";
const RR_SYNC_PARAMS: &str = "RR_SYNC_PARAMS";

#[derive(Debug, Clone)]
struct DemoChannel {
    mode: ChannelMode,
    signal: SignalType,
    /// Driven level in Output mode
    output: Level,
    frequency: f64,
    duty_cycle: f64,
    /// Next edge of the simulated wave
    next_edge: u64,
    /// Level the wave moves to at `next_edge`
    next_level: Level,
}

impl DemoChannel {
    fn new(number: u8) -> Self {
        Self {
            mode: ChannelMode::Disabled,
            signal: SignalType::Ttl,
            output: Level::Low,
            frequency: 10.0 * f64::from(number + 1),
            duty_cycle: 20.0 + 5.0 * f64::from(number),
            next_edge: 0,
            next_level: Level::High,
        }
    }

    fn is_timer(number: u8) -> bool {
        number < DEMO_TIMER_CHANNELS
    }

    /// Level of a streamed wave, i.e. the opposite of its next edge
    fn wave_level(&self) -> Level {
        match self.next_level {
            Level::High => Level::Low,
            Level::Low => Level::High,
        }
    }

    /// Level of the ideal wave at device time `now`, counting from `next_edge`
    fn level_at(&self, now: u64) -> Level {
        if self.frequency <= 0.0 {
            return Level::Low;
        }
        let period_ns = 1e9 / self.frequency;
        let phase = now.saturating_sub(self.next_edge) as f64 % period_ns;
        if phase < period_ns * self.duty_cycle / 100.0 {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Simulated device
pub struct DemoDevice {
    rng: StdRng,
    decoder: FrameDecoder,
    outbox: VecDeque<u8>,
    connected: bool,
    /// Device time at `clock_start`
    clock_base: u64,
    clock_start: Instant,
    sync_channel: Option<u8>,
    sync_frequency: f64,
    sync_duty_cycle: f64,
    channels: Vec<DemoChannel>,
}

impl Default for DemoDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoDevice {
    /// Demo device seeded from entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a device with reproducible jitter
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            decoder: FrameDecoder::new(RawRecorder::new(std::env::temp_dir())),
            outbox: VecDeque::new(),
            connected: false,
            clock_base: datetime_to_device_time(Utc::now()),
            clock_start: Instant::now(),
            sync_channel: None,
            sync_frequency: 1.0,
            sync_duty_cycle: 50.0,
            channels: (0..CHANNEL_COUNT as u8).map(DemoChannel::new).collect(),
        }
    }

    /// Opener handing out a fresh demo device for every connection
    pub fn opener() -> LinkOpener {
        Box::new(|port, _baud_rate| {
            debug!("Opening demo device in place of {}", port);
            Ok(Box::new(DemoDevice::new()) as Box<dyn DeviceLink>)
        })
    }

    /// Whether a `$CONN` was received without a later `$DISC`
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Mode the device has applied to `number`
    pub fn channel_mode(&self, number: u8) -> Option<ChannelMode> {
        self.channels.get(usize::from(number)).map(|c| c.mode)
    }

    /// Level driven on an Output channel
    pub fn output_level(&self, number: u8) -> Option<Level> {
        self.channels.get(usize::from(number)).map(|c| c.output)
    }

    fn device_time(&self) -> u64 {
        self.clock_base + self.clock_start.elapsed().as_nanos() as u64
    }

    fn send(&mut self, message: &Message) {
        match message.encode() {
            Ok(frame) => self.outbox.extend(frame),
            Err(e) => debug!("Demo device could not encode {}: {}", message.name(), e),
        }
    }

    fn send_error(&mut self, text: &str) {
        self.send(&Message::Error {
            text: text.to_string(),
        });
    }

    fn receive(&mut self, bytes: &[u8]) {
        if bytes.starts_with(CONNECT_COMMAND) {
            self.connected = true;
            self.outbox.extend(DEMO_GREETING);
            return;
        }
        if bytes.starts_with(DISCONNECT_COMMAND) {
            self.connected = false;
            self.outbox.extend(DEMO_FAREWELL);
            for (number, channel) in self.channels.iter_mut().enumerate() {
                *channel = DemoChannel::new(number as u8);
            }
            return;
        }

        self.decoder.push(bytes);
        while let Some(message) = self.decoder.next_message() {
            if self.connected {
                self.execute(message);
            }
        }
    }

    fn execute(&mut self, message: Message) {
        trace!("Demo device received {:?}", message);
        let now = self.device_time();
        match message {
            Message::Input { channel, .. } => {
                let Some(ch) = self.channels.get(usize::from(channel)) else {
                    return self.send_error(RR_INVALID_CHANNEL);
                };
                let level = match ch.mode {
                    ChannelMode::Disabled => return self.send_error(RR_INVALID_MODE),
                    ChannelMode::Output => ch.output,
                    mode if mode.is_monitor() => ch.wave_level(),
                    _ => ch.level_at(now),
                };
                self.send(&Message::Input {
                    channel,
                    level: Some(level),
                    time: now,
                });
            }
            Message::Output { channel, level, .. } => {
                let Some(ch) = self.channels.get_mut(usize::from(channel)) else {
                    return self.send_error(RR_INVALID_CHANNEL);
                };
                if ch.mode != ChannelMode::Output {
                    return self.send_error(RR_INVALID_MODE);
                }
                ch.output = level;
            }
            Message::Frequency { channel, .. } => {
                let Some(ch) = self.channels.get(usize::from(channel)) else {
                    return self.send_error(RR_INVALID_CHANNEL);
                };
                if ch.mode != ChannelMode::Input || !DemoChannel::is_timer(channel) {
                    return self.send_error(RR_INVALID_MODE);
                }
                let (frequency, duty_cycle) = (ch.frequency, ch.duty_cycle);
                let jitter = self.rng.gen_range(0.995..1.005);
                self.send(&Message::Frequency {
                    channel,
                    frequency: frequency * jitter,
                    duty_cycle,
                    time: now,
                });
            }
            Message::ChannelSettings {
                channel,
                mode,
                signal,
            } => {
                let Some(ch) = self.channels.get_mut(usize::from(channel)) else {
                    return self.send_error(RR_INVALID_CHANNEL);
                };
                if signal == SignalType::Lvds && !DemoChannel::is_timer(channel) {
                    return self.send_error(RR_INVALID_SIGNAL_TYPE);
                }
                ch.mode = mode;
                ch.signal = signal;
                ch.next_edge = now;
                ch.next_level = Level::High;
                self.apply_sync_wave();
            }
            Message::SyncSettings {
                channel,
                frequency,
                duty_cycle,
                time,
            } => {
                if let Some(number) = channel {
                    if usize::from(number) >= CHANNEL_COUNT {
                        return self.send_error(RR_INVALID_CHANNEL);
                    }
                    if !DemoChannel::is_timer(number) {
                        return self.send_error(RR_SYNC_PARAMS);
                    }
                }
                if !(0.01..=99.99).contains(&frequency) || !(0.0..100.0).contains(&duty_cycle) {
                    return self.send_error(RR_SYNC_PARAMS);
                }
                self.clock_base = time;
                self.clock_start = Instant::now();
                self.sync_channel = channel;
                self.sync_frequency = frequency;
                self.sync_duty_cycle = duty_cycle;
                for ch in &mut self.channels {
                    ch.next_edge = time;
                    ch.next_level = Level::High;
                }
                self.apply_sync_wave();
            }
            Message::Monitor { .. } | Message::Error { .. } => {}
        }
    }

    /// The SYNC output drives its channel once that channel monitors both edges
    fn apply_sync_wave(&mut self) {
        let Some(number) = self.sync_channel else {
            return;
        };
        let (frequency, duty_cycle) = (self.sync_frequency, self.sync_duty_cycle);
        if let Some(ch) = self.channels.get_mut(usize::from(number)) {
            if ch.mode == ChannelMode::MonitorBoth {
                ch.frequency = frequency;
                ch.duty_cycle = duty_cycle;
            }
        }
    }

    /// Queue Monitor frames for every edge that happened since the last call
    fn stream_edges(&mut self) {
        if !self.connected {
            return;
        }
        let now = self.device_time();

        for number in 0..self.channels.len() {
            let ch = &self.channels[number];
            if !ch.mode.is_monitor() || ch.frequency <= 0.0 {
                continue;
            }
            let period_ns = 1e9 / ch.frequency;
            let high_ns = period_ns * ch.duty_cycle / 100.0;
            let mode = ch.mode;
            let mut next_edge = ch.next_edge.max(now.saturating_sub(MAX_BACKLOG_NS));
            let mut next_level = ch.next_level;

            let mut samples = Vec::new();
            while next_edge <= now {
                let keep = match mode {
                    ChannelMode::MonitorRising => next_level == Level::High,
                    ChannelMode::MonitorFalling => next_level == Level::Low,
                    _ => true,
                };
                if keep {
                    samples.push(EdgeSample::new(next_edge, next_level));
                }
                let span = match next_level {
                    Level::High => high_ns,
                    Level::Low => period_ns - high_ns,
                };
                let jitter = self.rng.gen_range(0.99..1.01);
                next_edge += (span * jitter).max(1.0) as u64;
                next_level = match next_level {
                    Level::High => Level::Low,
                    Level::Low => Level::High,
                };
            }

            let ch = &mut self.channels[number];
            ch.next_edge = next_edge;
            ch.next_level = next_level;

            for chunk in samples.chunks(SAMPLES_PER_FRAME) {
                self.send(&Message::Monitor {
                    channel: number as u8,
                    samples: chunk.to_vec(),
                });
            }
        }
    }
}

impl Read for DemoDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbox.is_empty() {
            self.stream_edges();
        }
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for DemoDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DeviceLink for DemoDevice {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.stream_edges();
        Ok(u32::try_from(self.outbox.len()).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(device: &mut DemoDevice) -> Vec<Message> {
        let bytes = device.read_available().unwrap();
        let mut decoder = FrameDecoder::new(RawRecorder::new(std::env::temp_dir()));
        let mut out = Vec::new();
        let mut next = decoder.feed(&bytes, false);
        while let Some(msg) = next {
            out.push(msg);
            next = decoder.feed(&[], false);
        }
        out
    }

    fn connected() -> DemoDevice {
        let mut device = DemoDevice::with_seed(7);
        device.write_all(CONNECT_COMMAND).unwrap();
        let greeting = device.read_line(std::time::Duration::from_millis(10)).unwrap();
        assert_eq!(greeting, DEMO_GREETING[..DEMO_GREETING.len() - 1].to_vec());
        device
    }

    fn configure(device: &mut DemoDevice, channel: u8, mode: ChannelMode, signal: SignalType) {
        let frame = Message::ChannelSettings {
            channel,
            mode,
            signal,
        }
        .encode()
        .unwrap();
        device.write_all(&frame).unwrap();
    }

    #[test]
    fn test_rejects_lvds_on_gpio() {
        let mut device = connected();
        configure(&mut device, 12, ChannelMode::Input, SignalType::Lvds);
        assert_eq!(
            decode_all(&mut device),
            vec![Message::Error {
                text: RR_INVALID_SIGNAL_TYPE.to_string()
            }]
        );
    }

    #[test]
    fn test_answers_input_request() {
        let mut device = connected();
        configure(&mut device, 1, ChannelMode::Output, SignalType::Ttl);
        device
            .write_all(
                &Message::Output {
                    channel: 1,
                    level: Level::High,
                    time: 0,
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        device
            .write_all(&Message::input_request(1).encode().unwrap())
            .unwrap();

        let messages = decode_all(&mut device);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            Message::Input {
                channel: 1,
                level: Some(Level::High),
                ..
            }
        ));
    }

    #[test]
    fn test_streams_alternating_edges() {
        let mut device = connected();
        configure(&mut device, 0, ChannelMode::MonitorBoth, SignalType::Ttl);
        std::thread::sleep(std::time::Duration::from_millis(250));

        let samples: Vec<EdgeSample> = decode_all(&mut device)
            .into_iter()
            .filter_map(|m| match m {
                Message::Monitor { channel: 0, samples } => Some(samples),
                _ => None,
            })
            .flatten()
            .collect();

        assert!(samples.len() >= 2);
        assert!(samples
            .windows(2)
            .all(|w| w[0].is_rising() != w[1].is_rising()));
    }

    #[test]
    fn test_ignores_requests_before_connect() {
        let mut device = DemoDevice::with_seed(1);
        device
            .write_all(&Message::input_request(0).encode().unwrap())
            .unwrap();
        assert!(decode_all(&mut device).is_empty());
    }
}
