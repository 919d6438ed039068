//! Edge timing
//!
//! Turns batches of packed edge samples into inter-edge deltas and cycle
//! estimates. Samples of one channel arrive in many batches, so the analyzer
//! carries the tail of each batch into the next one: the last sample for the
//! delta chain and the last period-starting edge for the cycle walk.

use tracing::trace;

use super::TimingError;
use crate::protocol::{ChannelMode, EdgeSample, Level};

/// Which edges a monitor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePolarity {
    /// Only rising edges are reported
    Rising,
    /// Only falling edges are reported
    Falling,
    /// Edges alternate
    Both,
}

impl EdgePolarity {
    /// Polarity reported by a monitor mode
    pub fn for_mode(mode: ChannelMode) -> Option<Self> {
        match mode {
            ChannelMode::MonitorRising => Some(EdgePolarity::Rising),
            ChannelMode::MonitorFalling => Some(EdgePolarity::Falling),
            ChannelMode::MonitorBoth => Some(EdgePolarity::Both),
            _ => None,
        }
    }

    /// Whether `sample` starts a new period
    fn starts_period(self, sample: EdgeSample) -> bool {
        match self {
            EdgePolarity::Rising | EdgePolarity::Both => sample.is_rising(),
            EdgePolarity::Falling => !sample.is_rising(),
        }
    }
}

/// Time between two consecutive samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta {
    /// Elapsed time in seconds
    pub seconds: f64,
    /// Level the channel moved to at the closing edge
    pub edge: Level,
    /// Device time of the closing edge
    pub time_ns: u64,
}

/// Frequency estimate over the complete cycles of a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleEstimate {
    /// Completed periods
    pub cycles: usize,
    /// Frequency in Hz
    pub frequency: f64,
    /// Percentage of each period spent high, only known when both edges are reported
    pub duty_cycle: Option<f64>,
    /// Device time of the edge closing the last cycle
    pub time_ns: u64,
}

/// Result of analyzing one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeBatch {
    /// Deltas between consecutive edges
    pub deltas: Vec<Delta>,
    /// Cycles closed by this batch
    pub cycles: Option<CycleEstimate>,
}

/// Stateful edge analyzer of one monitor channel
#[derive(Debug, Clone)]
pub struct EdgeAnalyzer {
    polarity: EdgePolarity,
    /// Samples not closed into a cycle yet; starts on a period edge when non-empty
    pending: Vec<EdgeSample>,
    /// Last sample seen, opening the next delta
    carry: Option<EdgeSample>,
}

impl EdgeAnalyzer {
    /// Analyzer expecting edges of `polarity`
    pub fn new(polarity: EdgePolarity) -> Self {
        Self {
            polarity,
            pending: Vec::new(),
            carry: None,
        }
    }

    /// Edge directions this analyzer expects
    pub fn polarity(&self) -> EdgePolarity {
        self.polarity
    }

    /// Forget all carried samples
    pub fn reset(&mut self) {
        self.pending.clear();
        self.carry = None;
    }

    /// Analyze the next batch of samples.
    ///
    /// On a parity violation the carried state is dropped and nothing from the
    /// batch is reported.
    pub fn process(&mut self, samples: &[EdgeSample]) -> Result<EdgeBatch, TimingError> {
        if let Err(e) = self.check_parity(samples) {
            self.reset();
            return Err(e);
        }

        let deltas = self.collect_deltas(samples);
        self.pending.extend_from_slice(samples);
        let cycles = self.walk_cycles();

        Ok(EdgeBatch { deltas, cycles })
    }

    fn check_parity(&self, samples: &[EdgeSample]) -> Result<(), TimingError> {
        let edge_name = |s: EdgeSample| if s.is_rising() { "rising" } else { "falling" };

        match self.polarity {
            EdgePolarity::Both => {
                let mut previous = self.carry;
                for (index, &sample) in samples.iter().enumerate() {
                    if let Some(prev) = previous {
                        if prev.is_rising() == sample.is_rising() {
                            return Err(TimingError::EdgeParity {
                                index,
                                edge: edge_name(sample),
                            });
                        }
                    }
                    previous = Some(sample);
                }
            }
            EdgePolarity::Rising | EdgePolarity::Falling => {
                if let Some(index) = samples
                    .iter()
                    .position(|&s| !self.polarity.starts_period(s))
                {
                    return Err(TimingError::UnexpectedEdge {
                        index,
                        edge: edge_name(samples[index]),
                    });
                }
            }
        }
        Ok(())
    }

    fn collect_deltas(&mut self, samples: &[EdgeSample]) -> Vec<Delta> {
        let mut deltas = Vec::with_capacity(samples.len());
        for &sample in samples {
            if let Some(prev) = self.carry {
                deltas.push(Delta {
                    seconds: ns_to_seconds(sample.time_ns().saturating_sub(prev.time_ns())),
                    edge: sample.level(),
                    time_ns: sample.time_ns(),
                });
            }
            self.carry = Some(sample);
        }
        deltas
    }

    /// Close every complete cycle in `pending`, keeping the open tail
    fn walk_cycles(&mut self) -> Option<CycleEstimate> {
        let polarity = self.polarity;
        let Some(first) = self.pending.iter().position(|&s| polarity.starts_period(s)) else {
            self.pending.clear();
            return None;
        };
        self.pending.drain(..first);

        let starts: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, s)| polarity.starts_period(**s))
            .map(|(i, _)| i)
            .collect();

        let mut period_ns: u64 = 0;
        let mut high_ns: u64 = 0;
        for pair in starts.windows(2) {
            let (open, close) = (self.pending[pair[0]], self.pending[pair[1]]);
            period_ns += close.time_ns().saturating_sub(open.time_ns());
            if polarity == EdgePolarity::Both {
                // Strict alternation puts the falling edge right after the opening rising edge
                let fall = self.pending[pair[0] + 1];
                high_ns += fall.time_ns().saturating_sub(open.time_ns());
            }
        }

        let cycles = starts.len().saturating_sub(1);
        let last_start = starts[starts.len() - 1];
        let closing_time = self.pending[last_start].time_ns();
        self.pending.drain(..last_start);

        if cycles == 0 || period_ns == 0 {
            return None;
        }

        let estimate = CycleEstimate {
            cycles,
            frequency: cycles as f64 / ns_to_seconds(period_ns),
            duty_cycle: (polarity == EdgePolarity::Both)
                .then(|| high_ns as f64 / period_ns as f64 * 100.0),
            time_ns: closing_time,
        };
        trace!(
            "{} cycles over {}ns: {:.3} Hz",
            cycles,
            period_ns,
            estimate.frequency
        );
        Some(estimate)
    }
}

fn ns_to_seconds(ns: u64) -> f64 {
    ns as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn both() -> EdgeAnalyzer {
        EdgeAnalyzer::new(EdgePolarity::Both)
    }

    #[test]
    fn test_square_wave_frequency_and_duty() {
        let mut analyzer = both();
        let batch = analyzer
            .process(&[
                EdgeSample::rising(0),
                EdgeSample::falling(500_000),
                EdgeSample::rising(1_000_000),
                EdgeSample::falling(1_500_000),
            ])
            .unwrap();

        let cycles = batch.cycles.unwrap();
        assert_eq!(cycles.cycles, 1);
        assert!((cycles.frequency - 1000.0).abs() < 1e-9);
        assert!((cycles.duty_cycle.unwrap() - 50.0).abs() < 1e-9);
        assert_eq!(batch.deltas.len(), 3);
    }

    #[test]
    fn test_cycle_spanning_batches() {
        let mut analyzer = both();
        let first = analyzer
            .process(&[EdgeSample::rising(0), EdgeSample::falling(250_000)])
            .unwrap();
        assert_eq!(first.cycles, None);

        let second = analyzer
            .process(&[EdgeSample::rising(1_000_000), EdgeSample::falling(1_250_000)])
            .unwrap();
        let cycles = second.cycles.unwrap();
        assert_eq!(cycles.cycles, 1);
        assert!((cycles.duty_cycle.unwrap() - 25.0).abs() < 1e-9);
        // First delta of the batch closes the carried falling edge
        assert_eq!(second.deltas[0].edge, Level::High);
        assert!((second.deltas[0].seconds - 0.00075).abs() < 1e-12);
    }

    #[test]
    fn test_leading_falling_edge_is_skipped() {
        let mut analyzer = both();
        let batch = analyzer
            .process(&[
                EdgeSample::falling(0),
                EdgeSample::rising(100),
                EdgeSample::falling(200),
                EdgeSample::rising(400),
            ])
            .unwrap();
        let cycles = batch.cycles.unwrap();
        assert_eq!(cycles.cycles, 1);
        assert!((cycles.duty_cycle.unwrap() - 33.333_333).abs() < 1e-3);
    }

    #[test]
    fn test_parity_error_resets_state() {
        let mut analyzer = both();
        analyzer.process(&[EdgeSample::rising(0)]).unwrap();

        let err = analyzer.process(&[EdgeSample::rising(10)]).unwrap_err();
        assert_eq!(
            err,
            TimingError::EdgeParity {
                index: 0,
                edge: "rising"
            }
        );

        // No carried sample survives the error
        let batch = analyzer.process(&[EdgeSample::falling(20)]).unwrap();
        assert!(batch.deltas.is_empty());
        assert_eq!(batch.cycles, None);
    }

    #[test]
    fn test_single_edge_monitor() {
        let mut analyzer = EdgeAnalyzer::new(EdgePolarity::Falling);
        let batch = analyzer
            .process(&[
                EdgeSample::falling(0),
                EdgeSample::falling(2_000),
                EdgeSample::falling(4_000),
            ])
            .unwrap();
        let cycles = batch.cycles.unwrap();
        assert_eq!(cycles.cycles, 2);
        assert!((cycles.frequency - 500_000.0).abs() < 1e-6);
        assert_eq!(cycles.duty_cycle, None);

        assert!(analyzer.process(&[EdgeSample::rising(5_000)]).is_err());
    }
}
