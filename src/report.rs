//! The outcome of a session.

use crate::transcript::Transcript;
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Process exit codes used by the command-line tool.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// Bad arguments or an invalid script.
    pub const USAGE: i32 = 1;
    pub const CONNECTION: i32 = 2;
    /// A failure terminal, exhausted retries, or a broken connection.
    pub const FAILURE: i32 = 3;
    /// The session deadline passed or the run was interrupted.
    pub const CANCELLED: i32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Success,
    Failure,
    Cancelled,
}

/// Everything known about a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub script: String,
    pub target: Option<String>,
    pub verdict: Verdict,
    /// The step that was active when the session ended.
    pub terminal_step: Option<String>,
    pub reason: String,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub retries: u32,
    /// Every step entered, in order, including re-entries.
    pub path: Vec<String>,
    pub transcript: Transcript,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }

    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            Verdict::Success => exit_code::SUCCESS,
            Verdict::Failure => exit_code::FAILURE,
            Verdict::Cancelled => exit_code::CANCELLED,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
