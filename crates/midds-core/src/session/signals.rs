//! Request flags between the presentation layer and the controller loop

use std::sync::atomic::{AtomicBool, Ordering};

/// Level-triggered one-shot request.
///
/// Setting an already set flag has no further effect, so a burst of identical
/// requests is handled once.
#[derive(Debug, Default)]
pub struct SignalFlag(AtomicBool);

impl SignalFlag {
    /// Raise the flag
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Observe and clear the flag
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Whether the flag is raised, without clearing it
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Every request the controller loop observes
#[derive(Debug, Default)]
pub struct SessionSignals {
    /// Open the link
    pub open: SignalFlag,
    /// Close the link
    pub close: SignalFlag,
    /// Push the channel table
    pub apply_channels: SignalFlag,
    /// Push the clock and SYNC settings
    pub apply_sync: SignalFlag,
    /// Start a recording
    pub start_recording: SignalFlag,
    /// Stop the recording
    pub stop_recording: SignalFlag,
    /// Leave the controller loop
    pub stop: SignalFlag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_coalesce() {
        let flag = SignalFlag::default();
        flag.set();
        flag.set();
        assert!(flag.is_set());
        assert!(flag.take());
        assert!(!flag.take());
    }
}
