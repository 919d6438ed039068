//! Mode-scoped channel options
//!
//! Each mode carries only the options that make sense for it. Changing the mode
//! of a channel projects its options onto the new mode, so options of the old
//! mode never survive a switch.

use serde::{Deserialize, Serialize};

use crate::protocol::ChannelMode;

/// Options of an Input channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputOptions {
    /// Poll the level on every update interval
    pub report_level: bool,
    /// Poll frequency and duty cycle on every update interval
    pub report_frequency: bool,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            report_level: true,
            report_frequency: false,
        }
    }
}

/// Options of an Output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Poll the driven level back on every update interval
    pub readback_level: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            readback_level: true,
        }
    }
}

/// Options of the monitor modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOptions {
    /// Record frequency and duty cycle into the plot history
    pub plot_frequency: bool,
    /// Record rising and falling deltas into the plot history
    pub plot_deltas: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            plot_frequency: true,
            plot_deltas: true,
        }
    }
}

/// Mode of a channel together with the options of that mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum ModeSettings {
    /// Channel off
    #[default]
    #[serde(rename = "DS")]
    Disabled,
    /// Level input
    #[serde(rename = "IN")]
    Input(InputOptions),
    /// Driven output
    #[serde(rename = "OU")]
    Output(OutputOptions),
    /// Rising edges timestamped
    #[serde(rename = "MR")]
    MonitorRising(MonitorOptions),
    /// Falling edges timestamped
    #[serde(rename = "MF")]
    MonitorFalling(MonitorOptions),
    /// Both edges timestamped
    #[serde(rename = "MB")]
    MonitorBoth(MonitorOptions),
}

impl ModeSettings {
    /// Default options for `mode`
    pub fn defaults_for(mode: ChannelMode) -> Self {
        match mode {
            ChannelMode::Disabled => ModeSettings::Disabled,
            ChannelMode::Input => ModeSettings::Input(InputOptions::default()),
            ChannelMode::Output => ModeSettings::Output(OutputOptions::default()),
            ChannelMode::MonitorRising => ModeSettings::MonitorRising(MonitorOptions::default()),
            ChannelMode::MonitorFalling => ModeSettings::MonitorFalling(MonitorOptions::default()),
            ChannelMode::MonitorBoth => ModeSettings::MonitorBoth(MonitorOptions::default()),
        }
    }

    /// Mode these settings belong to
    pub fn mode(&self) -> ChannelMode {
        match self {
            ModeSettings::Disabled => ChannelMode::Disabled,
            ModeSettings::Input(_) => ChannelMode::Input,
            ModeSettings::Output(_) => ChannelMode::Output,
            ModeSettings::MonitorRising(_) => ChannelMode::MonitorRising,
            ModeSettings::MonitorFalling(_) => ChannelMode::MonitorFalling,
            ModeSettings::MonitorBoth(_) => ChannelMode::MonitorBoth,
        }
    }

    /// Keep these options if they already belong to `mode`, otherwise use the mode's defaults
    pub fn project(self, mode: ChannelMode) -> Self {
        if self.mode() == mode {
            self
        } else {
            Self::defaults_for(mode)
        }
    }

    /// Monitor options, if this is a monitor mode
    pub fn monitor(&self) -> Option<MonitorOptions> {
        match self {
            ModeSettings::MonitorRising(o)
            | ModeSettings::MonitorFalling(o)
            | ModeSettings::MonitorBoth(o) => Some(*o),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_discards_foreign_options() {
        let input = ModeSettings::Input(InputOptions {
            report_level: false,
            report_frequency: true,
        });

        assert_eq!(input.project(ChannelMode::Input), input);
        assert_eq!(
            input.project(ChannelMode::Output),
            ModeSettings::Output(OutputOptions::default())
        );
        assert_eq!(input.project(ChannelMode::Input).mode(), ChannelMode::Input);
    }

    #[test]
    fn test_serde_shape() {
        let json = r#"{"mode":"IN","report_frequency":true}"#;
        let settings: ModeSettings = serde_json::from_str(json).unwrap();
        assert_eq!(
            settings,
            ModeSettings::Input(InputOptions {
                report_level: true,
                report_frequency: true,
            })
        );

        let disabled: ModeSettings = serde_json::from_str(r#"{"mode":"DS"}"#).unwrap();
        assert_eq!(disabled, ModeSettings::Disabled);
    }
}
