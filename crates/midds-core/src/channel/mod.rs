//! Channel Timing Engine
//!
//! Per-channel state: configuration, derived measurements with staleness, plot
//! histories and the edge analyzer of the monitor modes. Decoded messages are
//! routed into a channel with [`Channel::apply_message`].

mod error;
mod history;
mod settings;
mod timing;

pub use error::TimingError;
pub use history::{History, Measurement, PlotPoint, PlotSeries, MIN_PLOT_INTERVAL};
pub use settings::{InputOptions, ModeSettings, MonitorOptions, OutputOptions};
pub use timing::{CycleEstimate, Delta, EdgeAnalyzer, EdgeBatch, EdgePolarity};

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::protocol::{ChannelMode, EdgeSample, Level, Message, SignalType};

/// Age after which a measurement reads as unknown
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

/// Capacity of the level plot history
pub const LEVEL_HISTORY_CAPACITY: usize = 200;

/// Capacity of the frequency, duty cycle and delta plot histories
pub const MEASUREMENT_HISTORY_CAPACITY: usize = 1000;

/// Capacity of the raw delta buffer
pub const DELTA_CAPACITY: usize = 10_000;

/// Consecutive parity errors after which a channel's edges are considered broken
pub const PARITY_WARNING_THRESHOLD: u32 = 5;

/// Value of a measurement as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Reading<T> {
    /// Fresh value
    Known(T),
    /// Never measured, measured without a usable value, or stale
    Unknown,
    /// The channel's mode does not produce this measurement
    NotApplicable,
}

impl<T> Reading<T> {
    fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Reading::Known(v),
            None => Reading::Unknown,
        }
    }

    /// Value, if known
    pub fn known(self) -> Option<T> {
        match self {
            Reading::Known(v) => Some(v),
            _ => None,
        }
    }

    /// Whether a fresh value is available
    pub fn is_known(&self) -> bool {
        matches!(self, Reading::Known(_))
    }
}

/// Read view of a channel at one instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    /// Channel number
    pub number: u8,
    /// Display name
    pub name: String,
    /// Configured mode
    pub mode: ChannelMode,
    /// Configured signal standard
    pub signal: SignalType,
    /// Whether the device accepted the configuration
    pub well_configured: bool,
    /// False while parity errors keep repeating
    pub edges_well_formed: bool,
    /// Parity errors since the last clear
    pub parity_errors: u64,
    /// Current level
    pub level: Reading<Level>,
    /// Frequency in Hz
    pub frequency: Reading<f64>,
    /// Duty cycle in percent
    pub duty_cycle: Reading<f64>,
    /// Latest delta closed by a rising edge, in seconds
    pub rising_delta: Reading<f64>,
    /// Latest delta closed by a falling edge, in seconds
    pub falling_delta: Reading<f64>,
}

/// A device channel and everything measured on it
#[derive(Debug, Clone)]
pub struct Channel {
    number: u8,
    name: String,
    signal: SignalType,
    settings: ModeSettings,
    well_configured: bool,
    stale_after: Duration,

    level: Measurement<Level>,
    frequency: Measurement<f64>,
    duty_cycle: Measurement<f64>,
    rising_delta: Measurement<f64>,
    falling_delta: Measurement<f64>,

    level_plot: PlotSeries,
    frequency_plot: PlotSeries,
    duty_cycle_plot: PlotSeries,
    rising_delta_plot: PlotSeries,
    falling_delta_plot: PlotSeries,
    deltas: History<Delta>,

    edges: Option<EdgeAnalyzer>,
    parity_errors: u64,
    consecutive_parity_errors: u32,
}

impl Channel {
    /// A disabled TTL channel
    pub fn new(number: u8) -> Self {
        Self {
            number,
            name: String::new(),
            signal: SignalType::Ttl,
            settings: ModeSettings::Disabled,
            well_configured: false,
            stale_after: DEFAULT_STALE_AFTER,
            level: Measurement::default(),
            frequency: Measurement::default(),
            duty_cycle: Measurement::default(),
            rising_delta: Measurement::default(),
            falling_delta: Measurement::default(),
            level_plot: PlotSeries::new(LEVEL_HISTORY_CAPACITY),
            frequency_plot: PlotSeries::new(MEASUREMENT_HISTORY_CAPACITY),
            duty_cycle_plot: PlotSeries::new(MEASUREMENT_HISTORY_CAPACITY),
            rising_delta_plot: PlotSeries::new(MEASUREMENT_HISTORY_CAPACITY),
            falling_delta_plot: PlotSeries::new(MEASUREMENT_HISTORY_CAPACITY),
            deltas: History::with_capacity(DELTA_CAPACITY),
            edges: None,
            parity_errors: 0,
            consecutive_parity_errors: 0,
        }
    }

    /// Build a channel from its startup configuration
    pub fn from_config(config: &ChannelConfig) -> Self {
        let mut channel = Self::new(config.number);
        channel.apply_config(config);
        channel
    }

    /// Replace name, signal and mode settings. Measurements are cleared when the mode changes.
    pub fn apply_config(&mut self, config: &ChannelConfig) {
        self.name = config.name.clone();
        self.set_signal(config.signal);
        self.set_settings(config.settings);
    }

    /// Current configuration as a record
    pub fn config(&self) -> ChannelConfig {
        ChannelConfig {
            number: self.number,
            name: self.name.clone(),
            signal: self.signal,
            settings: self.settings,
        }
    }

    /// Channel number on the device
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the channel
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Configured mode
    pub fn mode(&self) -> ChannelMode {
        self.settings.mode()
    }

    /// Configured signal standard
    pub fn signal(&self) -> SignalType {
        self.signal
    }

    /// Mode and mode options
    pub fn settings(&self) -> ModeSettings {
        self.settings
    }

    /// Switch mode, keeping options only if they already belong to `mode`
    pub fn set_mode(&mut self, mode: ChannelMode) {
        self.set_settings(self.settings.project(mode));
    }

    /// Replace the mode settings
    pub fn set_settings(&mut self, settings: ModeSettings) {
        let mode_changed = settings.mode() != self.mode();
        self.settings = settings;
        if mode_changed {
            self.well_configured = false;
            self.clear();
        }
    }

    /// Change the signal standard; the device has to be reconfigured
    pub fn set_signal(&mut self, signal: SignalType) {
        if signal != self.signal {
            self.signal = signal;
            self.well_configured = false;
        }
    }

    /// Whether the device confirmed the current configuration
    pub fn is_well_configured(&self) -> bool {
        self.well_configured
    }

    /// Record whether the device accepted the configuration
    pub fn set_well_configured(&mut self, well_configured: bool) {
        self.well_configured = well_configured;
    }

    /// Change the age after which measurements read as unknown
    pub fn set_stale_after(&mut self, timeout: Duration) {
        self.stale_after = timeout;
    }

    /// ChannelSettings record pushing this channel's configuration to the device
    pub fn settings_message(&self) -> Message {
        Message::ChannelSettings {
            channel: self.number,
            mode: self.mode(),
            signal: self.signal,
        }
    }

    /// Requests to send on every update interval
    pub fn recurring_requests(&self) -> Vec<Message> {
        let mut requests = Vec::new();
        match self.settings {
            ModeSettings::Input(options) => {
                if options.report_level {
                    requests.push(Message::input_request(self.number));
                }
                if options.report_frequency {
                    requests.push(Message::frequency_request(self.number));
                }
            }
            ModeSettings::Output(options) if options.readback_level => {
                requests.push(Message::input_request(self.number));
            }
            _ => {}
        }
        requests
    }

    /// Route a decoded message into the channel
    pub fn apply_message(&mut self, message: &Message) -> Result<(), TimingError> {
        self.apply_message_at(message, Instant::now())
    }

    /// Route a decoded message into the channel, stamping updates with `now`
    pub fn apply_message_at(&mut self, message: &Message, now: Instant) -> Result<(), TimingError> {
        let mode = self.mode();
        match message {
            Message::Input { level, time, .. } if mode != ChannelMode::Disabled => {
                self.record_level(*level, *time, now);
                Ok(())
            }
            Message::Output { level, time, .. } if mode == ChannelMode::Output => {
                self.record_level(Some(*level), *time, now);
                Ok(())
            }
            Message::Frequency {
                frequency,
                duty_cycle,
                time,
                ..
            } if mode == ChannelMode::Input => {
                self.frequency.set(*frequency, now);
                self.duty_cycle.set(*duty_cycle, now);
                if matches!(self.settings, ModeSettings::Input(o) if o.report_frequency) {
                    self.frequency_plot.push(*time, *frequency);
                    self.duty_cycle_plot.push(*time, *duty_cycle);
                }
                Ok(())
            }
            Message::Monitor { samples, .. } if mode.is_monitor() => {
                self.record_edges(samples, now)
            }
            Message::ChannelSettings {
                mode: echoed_mode,
                signal,
                ..
            } => {
                self.well_configured = *echoed_mode == mode && *signal == self.signal;
                if !self.well_configured {
                    warn!(
                        "Channel {} reports {}/{:?}, configured as {}/{:?}",
                        self.number, echoed_mode, signal, mode, self.signal
                    );
                }
                Ok(())
            }
            other => Err(TimingError::ModeMismatch {
                mode,
                message: other.name(),
            }),
        }
    }

    /// Reset measurements, histories and edge state without touching configuration
    pub fn clear(&mut self) {
        self.level.clear();
        self.frequency.clear();
        self.duty_cycle.clear();
        self.rising_delta.clear();
        self.falling_delta.clear();
        self.level_plot.clear();
        self.frequency_plot.clear();
        self.duty_cycle_plot.clear();
        self.rising_delta_plot.clear();
        self.falling_delta_plot.clear();
        self.deltas.clear();
        self.edges = EdgePolarity::for_mode(self.mode()).map(EdgeAnalyzer::new);
        self.parity_errors = 0;
        self.consecutive_parity_errors = 0;
    }

    /// Current level
    pub fn level(&self) -> Reading<Level> {
        self.level_at(Instant::now())
    }

    /// Level as seen at `now`
    pub fn level_at(&self, now: Instant) -> Reading<Level> {
        if self.mode() == ChannelMode::Disabled {
            return Reading::NotApplicable;
        }
        Reading::from_option(self.level.get(now, self.stale_after))
    }

    /// Current frequency
    pub fn frequency(&self) -> Reading<f64> {
        self.frequency_at(Instant::now())
    }

    /// Frequency as seen at `now`
    pub fn frequency_at(&self, now: Instant) -> Reading<f64> {
        match self.mode() {
            ChannelMode::Input
            | ChannelMode::MonitorRising
            | ChannelMode::MonitorFalling
            | ChannelMode::MonitorBoth => {
                Reading::from_option(self.frequency.get(now, self.stale_after))
            }
            _ => Reading::NotApplicable,
        }
    }

    /// Duty cycle as seen at `now`
    pub fn duty_cycle_at(&self, now: Instant) -> Reading<f64> {
        match self.mode() {
            ChannelMode::Input | ChannelMode::MonitorBoth => {
                Reading::from_option(self.duty_cycle.get(now, self.stale_after))
            }
            _ => Reading::NotApplicable,
        }
    }

    /// Rising delta as seen at `now`
    pub fn rising_delta_at(&self, now: Instant) -> Reading<f64> {
        match self.mode() {
            ChannelMode::MonitorRising | ChannelMode::MonitorBoth => {
                Reading::from_option(self.rising_delta.get(now, self.stale_after))
            }
            _ => Reading::NotApplicable,
        }
    }

    /// Falling delta as seen at `now`
    pub fn falling_delta_at(&self, now: Instant) -> Reading<f64> {
        match self.mode() {
            ChannelMode::MonitorFalling | ChannelMode::MonitorBoth => {
                Reading::from_option(self.falling_delta.get(now, self.stale_after))
            }
            _ => Reading::NotApplicable,
        }
    }

    /// Total parity errors since the last clear
    pub fn parity_errors(&self) -> u64 {
        self.parity_errors
    }

    /// Parity errors since the last clean batch
    pub fn consecutive_parity_errors(&self) -> u32 {
        self.consecutive_parity_errors
    }

    /// False once parity errors keep repeating without a clean batch in between
    pub fn edges_well_formed(&self) -> bool {
        self.consecutive_parity_errors < PARITY_WARNING_THRESHOLD
    }

    /// Decimated level plot
    pub fn level_history(&self) -> &PlotSeries {
        &self.level_plot
    }

    /// Decimated frequency plot
    pub fn frequency_history(&self) -> &PlotSeries {
        &self.frequency_plot
    }

    /// Decimated duty cycle plot
    pub fn duty_cycle_history(&self) -> &PlotSeries {
        &self.duty_cycle_plot
    }

    /// Decimated rising delta plot
    pub fn rising_delta_history(&self) -> &PlotSeries {
        &self.rising_delta_plot
    }

    /// Decimated falling delta plot
    pub fn falling_delta_history(&self) -> &PlotSeries {
        &self.falling_delta_plot
    }

    /// Every recent inter-edge delta, oldest first
    pub fn deltas(&self) -> &History<Delta> {
        &self.deltas
    }

    /// Read view at the current instant
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Read view as seen at `now`
    pub fn snapshot_at(&self, now: Instant) -> ChannelSnapshot {
        ChannelSnapshot {
            number: self.number,
            name: self.name.clone(),
            mode: self.mode(),
            signal: self.signal,
            well_configured: self.well_configured,
            edges_well_formed: self.edges_well_formed(),
            parity_errors: self.parity_errors,
            level: self.level_at(now),
            frequency: self.frequency_at(now),
            duty_cycle: self.duty_cycle_at(now),
            rising_delta: self.rising_delta_at(now),
            falling_delta: self.falling_delta_at(now),
        }
    }

    fn record_level(&mut self, level: Option<Level>, time_ns: u64, now: Instant) {
        match level {
            Some(level) => {
                self.level.set(level, now);
                self.level_plot.push(time_ns, level.as_f64());
            }
            None => self.level.set_unknown(now),
        }
    }

    fn record_edges(&mut self, samples: &[EdgeSample], now: Instant) -> Result<(), TimingError> {
        let mode = self.mode();
        let options = self.settings.monitor().unwrap_or_default();
        let analyzer = self.edges.get_or_insert_with(|| {
            EdgeAnalyzer::new(EdgePolarity::for_mode(mode).unwrap_or(EdgePolarity::Both))
        });

        let batch = match analyzer.process(samples) {
            Ok(batch) => batch,
            Err(e) => {
                self.parity_errors += 1;
                self.consecutive_parity_errors = self.consecutive_parity_errors.saturating_add(1);
                warn!("Channel {}: {}", self.number, e);
                return Err(e);
            }
        };
        self.consecutive_parity_errors = 0;

        if let Some(last) = samples.last() {
            self.record_level(Some(last.level()), last.time_ns(), now);
        }

        for delta in &batch.deltas {
            self.deltas.push(*delta);
        }
        let latest = |edge: Level| batch.deltas.iter().rev().find(|d| d.edge == edge);
        let (rising, falling) = match mode {
            ChannelMode::MonitorBoth => (latest(Level::High), latest(Level::Low)),
            ChannelMode::MonitorRising => (batch.deltas.last(), None),
            ChannelMode::MonitorFalling => (None, batch.deltas.last()),
            _ => (None, None),
        };
        if let Some(d) = rising {
            self.rising_delta.set(d.seconds, now);
            if options.plot_deltas {
                self.rising_delta_plot.push(d.time_ns, d.seconds);
            }
        }
        if let Some(d) = falling {
            self.falling_delta.set(d.seconds, now);
            if options.plot_deltas {
                self.falling_delta_plot.push(d.time_ns, d.seconds);
            }
        }

        if let Some(cycles) = batch.cycles {
            debug!(
                "Channel {}: {} cycles, {:.3} Hz",
                self.number, cycles.cycles, cycles.frequency
            );
            self.frequency.set(cycles.frequency, now);
            if options.plot_frequency {
                self.frequency_plot.push(cycles.time_ns, cycles.frequency);
            }
            if let Some(duty) = cycles.duty_cycle {
                self.duty_cycle.set(duty, now);
                if options.plot_frequency {
                    self.duty_cycle_plot.push(cycles.time_ns, duty);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn monitor_both(number: u8) -> Channel {
        let mut channel = Channel::new(number);
        channel.set_mode(ChannelMode::MonitorBoth);
        channel
    }

    fn monitor(samples: Vec<EdgeSample>) -> Message {
        Message::Monitor {
            channel: 0,
            samples,
        }
    }

    #[test]
    fn test_monitor_both_reports_frequency_duty_and_deltas() {
        let now = Instant::now();
        let mut channel = monitor_both(0);
        channel
            .apply_message_at(
                &monitor(vec![
                    EdgeSample::rising(0),
                    EdgeSample::falling(300_000),
                    EdgeSample::rising(1_000_000),
                    EdgeSample::falling(1_300_000),
                ]),
                now,
            )
            .unwrap();

        let snap = channel.snapshot_at(now);
        assert!((snap.frequency.known().unwrap() - 1000.0).abs() < 1e-9);
        assert!((snap.duty_cycle.known().unwrap() - 30.0).abs() < 1e-9);
        assert!((snap.rising_delta.known().unwrap() - 0.0007).abs() < 1e-12);
        assert!((snap.falling_delta.known().unwrap() - 0.0003).abs() < 1e-12);
        assert_eq!(snap.level, Reading::Known(Level::Low));
        assert_eq!(channel.deltas().len(), 3);
    }

    #[test]
    fn test_single_edge_mode_has_one_delta() {
        let now = Instant::now();
        let mut channel = Channel::new(2);
        channel.set_mode(ChannelMode::MonitorRising);
        channel
            .apply_message_at(
                &monitor(vec![EdgeSample::rising(0), EdgeSample::rising(2_000_000)]),
                now,
            )
            .unwrap();

        assert!((channel.rising_delta_at(now).known().unwrap() - 0.002).abs() < 1e-12);
        assert_eq!(channel.falling_delta_at(now), Reading::NotApplicable);
        assert_eq!(channel.duty_cycle_at(now), Reading::NotApplicable);
    }

    #[test]
    fn test_falling_edge_mode_has_one_delta() {
        let now = Instant::now();
        let mut channel = Channel::new(3);
        channel.set_mode(ChannelMode::MonitorFalling);
        channel
            .apply_message_at(
                &monitor(vec![
                    EdgeSample::falling(0),
                    EdgeSample::falling(4_000_000),
                    EdgeSample::falling(8_000_000),
                ]),
                now,
            )
            .unwrap();

        assert!((channel.falling_delta_at(now).known().unwrap() - 0.004).abs() < 1e-12);
        assert_eq!(channel.rising_delta_at(now), Reading::NotApplicable);
        assert!((channel.frequency_at(now).known().unwrap() - 250.0).abs() < 1e-9);
        assert_eq!(channel.duty_cycle_at(now), Reading::NotApplicable);
        assert_eq!(channel.level_at(now), Reading::Known(Level::Low));
    }

    #[test]
    fn test_mode_mismatch() {
        let mut channel = Channel::new(1);
        channel.set_mode(ChannelMode::Output);

        let err = channel
            .apply_message(&monitor(vec![EdgeSample::rising(0)]))
            .unwrap_err();
        assert_eq!(
            err,
            TimingError::ModeMismatch {
                mode: ChannelMode::Output,
                message: "Monitor"
            }
        );

        // Output channels still accept Input-shaped level echoes
        channel
            .apply_message(&Message::Input {
                channel: 1,
                level: Some(Level::High),
                time: 5,
            })
            .unwrap();
        assert_eq!(channel.level(), Reading::Known(Level::High));
    }

    #[test]
    fn test_unknown_input_level() {
        let mut channel = Channel::new(0);
        channel.set_mode(ChannelMode::Input);
        channel
            .apply_message(&Message::Input {
                channel: 0,
                level: None,
                time: 1,
            })
            .unwrap();
        assert_eq!(channel.level(), Reading::Unknown);
    }

    #[test]
    fn test_repeated_parity_errors() {
        let mut channel = monitor_both(3);
        for i in 0..PARITY_WARNING_THRESHOLD as u64 {
            let result = channel.apply_message(&monitor(vec![
                EdgeSample::rising(i * 10),
                EdgeSample::rising(i * 10 + 1),
            ]));
            assert!(result.unwrap_err().is_edge_error());
        }
        assert!(!channel.edges_well_formed());
        assert_eq!(channel.parity_errors(), 5);

        channel
            .apply_message(&monitor(vec![EdgeSample::rising(100)]))
            .unwrap();
        assert!(channel.edges_well_formed());
    }

    #[test]
    fn test_recurring_requests() {
        let mut channel = Channel::new(4);
        assert!(channel.recurring_requests().is_empty());

        channel.set_settings(ModeSettings::Input(InputOptions {
            report_level: true,
            report_frequency: true,
        }));
        assert_eq!(
            channel.recurring_requests(),
            vec![Message::input_request(4), Message::frequency_request(4)]
        );

        channel.set_mode(ChannelMode::Output);
        assert_eq!(channel.recurring_requests(), vec![Message::input_request(4)]);
    }

    #[test]
    fn test_settings_echo() {
        let mut channel = monitor_both(6);
        channel
            .apply_message(&Message::ChannelSettings {
                channel: 6,
                mode: ChannelMode::MonitorBoth,
                signal: SignalType::Ttl,
            })
            .unwrap();
        assert!(channel.is_well_configured());

        channel
            .apply_message(&Message::ChannelSettings {
                channel: 6,
                mode: ChannelMode::Input,
                signal: SignalType::Ttl,
            })
            .unwrap();
        assert!(!channel.is_well_configured());
    }

    #[test]
    fn test_clear_keeps_configuration() {
        let now = Instant::now();
        let mut channel = monitor_both(0);
        channel.set_name("clock");
        channel
            .apply_message_at(
                &monitor(vec![EdgeSample::rising(0), EdgeSample::falling(10)]),
                now,
            )
            .unwrap();
        assert!(channel.level_at(now).is_known());

        channel.clear();
        assert_eq!(channel.level_at(now), Reading::Unknown);
        assert!(channel.deltas().is_empty());
        assert_eq!(channel.mode(), ChannelMode::MonitorBoth);
        assert_eq!(channel.name(), "clock");
    }
}
