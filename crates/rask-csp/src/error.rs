// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel and frame errors.
//!
//! Every variant of `ChanError` is a programmer error or a deliberate
//! backpressure tripwire. They abort the current continuation and are
//! never retried.

use std::fmt;

use thiserror::Error;

/// Which pending queue of a channel overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    Takes,
    Puts,
}

impl fmt::Display for QueueSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueSide::Takes => write!(f, "takes"),
            QueueSide::Puts => write!(f, "puts"),
        }
    }
}

/// A fatal channel protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChanError {
    /// The absent value reached a put.
    #[error("cannot put the absent value on a channel")]
    AbsentValue,

    /// A handler reported itself active but refused to commit.
    #[error("handler was active but could not be committed")]
    DoubleCommit,

    /// Too many parked operations on one side of a channel.
    #[error(
        "no more than {limit} pending {side} are allowed on a single channel; \
         consider using a windowed buffer"
    )]
    QueueOverflow { side: QueueSide, limit: usize },

    /// An `alts` set both takes from and puts to one channel.
    #[error("alts operations {take} and {put} target the same channel from both sides")]
    ConflictingAlt { take: usize, put: usize },

    /// A frame referenced a local slot it does not have.
    #[error("local slot {slot} is out of range (frame has {len} locals)")]
    BadSlot { slot: usize, len: usize },
}

/// An error that escaped a frame's transition loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error(transparent)]
    Chan(#[from] ChanError),

    /// The transition function itself failed.
    #[error("frame faulted at state {pc}: {message}")]
    Fault { pc: usize, message: String },
}

impl FrameError {
    pub fn fault(pc: usize, message: impl Into<String>) -> Self {
        FrameError::Fault {
            pc,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_message_names_side_and_limit() {
        let err = ChanError::QueueOverflow {
            side: QueueSide::Puts,
            limit: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("1024"));
        assert!(msg.contains("pending puts"));
    }

    #[test]
    fn chan_errors_convert_into_frame_errors() {
        let err: FrameError = ChanError::AbsentValue.into();
        assert_eq!(err, FrameError::Chan(ChanError::AbsentValue));
        assert_eq!(err.to_string(), "cannot put the absent value on a channel");
    }
}
