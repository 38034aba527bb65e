//! Error taxonomy for console sessions.
//!
//! [`SessionError`] covers everything that can go wrong once a script is
//! loaded. Script loading itself reports through [`anyhow`], like the rest of
//! the parsing layer.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while connecting to or driving a console.
///
/// Only [`SessionError::Connection`] ever escapes [`crate::run`]. Every other
/// variant is resolved by the step engine into a [`crate::Verdict`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport could not be established.
    #[error("cannot connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: io::Error,
    },

    /// A read or write failed mid-session.
    #[error("console i/o failed: {0}")]
    Io(#[from] io::Error),

    /// The remote end closed the stream.
    #[error("connection closed by remote")]
    Closed,

    /// No pattern matched before the step deadline.
    #[error("step '{step}' timed out after {after:?}")]
    StepTimeout { step: String, after: Duration },

    /// A step timed out more often than its policy allows.
    #[error("step '{step}' gave up after {timeouts} consecutive timeouts")]
    RetryExhausted { step: String, timeouts: u32 },

    /// The caller asked the session to stop.
    #[error("session cancelled")]
    Cancelled,

    /// The overall session deadline elapsed.
    #[error("session deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The script made more step transitions than allowed.
    #[error("step limit of {0} transitions exceeded")]
    StepLimit(usize),
}

impl SessionError {
    pub(crate) fn connection(target: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            target: target.into(),
            source,
        }
    }

    /// Whether this error ends the session as cancelled rather than failed.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded(_))
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
