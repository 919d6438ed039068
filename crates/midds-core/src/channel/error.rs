//! Timing engine errors

use thiserror::Error;

use crate::protocol::ChannelMode;

/// Errors raised while applying a message to a channel
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimingError {
    /// Two consecutive edges of the same direction
    #[error("Edge parity error at sample {index}: two consecutive {edge} edges")]
    EdgeParity {
        /// Position of the offending sample
        index: usize,
        /// Direction of both edges
        edge: &'static str,
    },

    /// An edge the channel mode never produces
    #[error("Unexpected {edge} edge at sample {index} for a single-edge monitor")]
    UnexpectedEdge {
        /// Position of the offending sample
        index: usize,
        /// Direction of the edge
        edge: &'static str,
    },

    /// A message the channel mode does not accept
    #[error("{message} message is not relevant to a {mode} channel")]
    ModeMismatch {
        /// Mode of the channel
        mode: ChannelMode,
        /// Name of the rejected message
        message: &'static str,
    },
}

impl TimingError {
    /// Whether the error invalidated the channel's in-flight edge state
    pub fn is_edge_error(&self) -> bool {
        matches!(
            self,
            TimingError::EdgeParity { .. } | TimingError::UnexpectedEdge { .. }
        )
    }
}
