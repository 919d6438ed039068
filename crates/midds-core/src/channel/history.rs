//! Bounded measurement history
//!
//! Holds the latest value of each measurement with the instant it arrived, plus
//! ring buffers feeding the plots.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Minimum device time between two points of a plot series
pub const MIN_PLOT_INTERVAL: Duration = Duration::from_millis(200);

/// Latest value of a measurement and when it was stored
#[derive(Debug, Clone, Copy)]
pub struct Measurement<T> {
    value: Option<T>,
    updated: Option<Instant>,
}

impl<T> Default for Measurement<T> {
    fn default() -> Self {
        Self {
            value: None,
            updated: None,
        }
    }
}

impl<T: Copy> Measurement<T> {
    /// Store `value` as measured at `now`
    pub fn set(&mut self, value: T, now: Instant) {
        self.value = Some(value);
        self.updated = Some(now);
    }

    /// Record that a reading arrived but carried no usable value
    pub fn set_unknown(&mut self, now: Instant) {
        self.value = None;
        self.updated = Some(now);
    }

    /// Value if it was stored at most `timeout` before `now`
    pub fn get(&self, now: Instant, timeout: Duration) -> Option<T> {
        match self.updated {
            Some(at) if now.saturating_duration_since(at) <= timeout => self.value,
            _ => None,
        }
    }

    /// Last stored value regardless of age
    pub fn last(&self) -> Option<T> {
        self.value
    }

    /// Forget the value
    pub fn clear(&mut self) {
        self.value = None;
        self.updated = None;
    }
}

/// Ring buffer that drops its oldest entry when full
#[derive(Debug, Clone)]
pub struct History<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> History<T> {
    /// Create an empty ring holding at most `capacity` items
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append an item, evicting the oldest one when full
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Items, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// Most recent item
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of stored items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every item
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// A point of a plot series: device time and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlotPoint {
    /// Device time in nanoseconds
    pub time_ns: u64,
    /// Measured value
    pub value: f64,
}

/// Plot history decimated on device time
#[derive(Debug, Clone)]
pub struct PlotSeries {
    points: History<PlotPoint>,
    min_interval_ns: u64,
}

impl PlotSeries {
    /// Create an empty series keeping at most `capacity` points
    pub fn new(capacity: usize) -> Self {
        Self {
            points: History::with_capacity(capacity),
            min_interval_ns: MIN_PLOT_INTERVAL.as_nanos() as u64,
        }
    }

    /// Append a point unless it follows the previous one too closely.
    ///
    /// A time earlier than the previous point means the device clock was reset and
    /// is always accepted.
    pub fn push(&mut self, time_ns: u64, value: f64) -> bool {
        if let Some(last) = self.points.last() {
            if time_ns >= last.time_ns && time_ns - last.time_ns < self.min_interval_ns {
                return false;
            }
        }
        self.points.push(PlotPoint { time_ns, value });
        true
    }

    /// Kept points, oldest first
    pub fn points(&self) -> impl DoubleEndedIterator<Item = &PlotPoint> + ExactSizeIterator {
        self.points.iter()
    }

    /// Number of kept points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no point was kept
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Drop every point
    pub fn clear(&mut self) {
        self.points.clear();
    }
}
