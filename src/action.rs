//! The [`ScriptAction`] trait and the [`Context`] type actions receive when executed.

use crate::error::{Result, SessionError};
use crate::parser::duration;
use crate::transport::Transport;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Receives every byte the console sends, plus `show` annotations.
pub type OutputHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Delays applied to outgoing text.
///
/// Legacy consoles drop input that arrives faster than they can consume it,
/// so every write is paced per character and per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pacing {
    #[serde(with = "duration")]
    pub char_delay: Duration,
    /// Pause after each CR or LF.
    #[serde(with = "duration")]
    pub line_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            char_delay: Duration::ZERO,
            line_delay: Duration::from_millis(100),
        }
    }
}

/// Execution context passed to [`ScriptAction::execute`].
///
/// Provides paced access to the console, the output handler, and
/// cancellation-aware pauses.
pub struct Context<'a> {
    transport: &'a mut dyn Transport,
    output: &'a OutputHandler,
    pacing: Pacing,
    line_ending: &'a [u8],
    cancel: &'a CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        transport: &'a mut dyn Transport,
        output: &'a OutputHandler,
        pacing: Pacing,
        line_ending: &'a [u8],
        cancel: &'a CancellationToken,
        deadline: Option<(Instant, Duration)>,
    ) -> Self {
        Self {
            transport,
            output,
            pacing,
            line_ending,
            cancel,
            deadline,
        }
    }

    /// Send bytes to the console with the session's pacing applied.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!(data = %String::from_utf8_lossy(data).escape_debug(), "send");
        if self.pacing.char_delay.is_zero() {
            for piece in data.split_inclusive(|b| is_eol(*b)) {
                self.transport.write(piece).await?;
                if piece.last().copied().is_some_and(is_eol) {
                    self.pause(self.pacing.line_delay).await?;
                }
            }
        } else {
            for &byte in data {
                self.transport.write(&[byte]).await?;
                let delay = if is_eol(byte) {
                    self.pacing.line_delay.max(self.pacing.char_delay)
                } else {
                    self.pacing.char_delay
                };
                self.pause(delay).await?;
            }
        }
        Ok(())
    }

    /// Write bytes in one piece, bypassing pacing.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write(data).await
    }

    /// The script's line terminator (CR unless configured otherwise).
    pub fn line_ending(&self) -> &[u8] {
        self.line_ending
    }

    /// Pass bytes through the output handler.
    pub fn emit(&self, data: &[u8]) {
        (self.output)(data);
    }

    /// Sleep for `duration`, returning early with an error if the session is
    /// cancelled or its deadline passes.
    pub async fn pause(&mut self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        let wake = instant_after(Instant::now(), duration);
        let cancel = self.cancel;
        match self.deadline {
            Some((deadline, budget)) if deadline < wake => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(SessionError::Cancelled),
                    _ = sleep_until(deadline) => Err(SessionError::DeadlineExceeded(budget)),
                }
            }
            _ => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(SessionError::Cancelled),
                    _ = sleep_until(wake) => Ok(()),
                }
            }
        }
    }
}

/// `from + duration`, or roughly thirty years out when that overflows.
pub(crate) fn instant_after(from: Instant, duration: Duration) -> Instant {
    from.checked_add(duration)
        .unwrap_or_else(|| from + Duration::from_secs(86400 * 365 * 30))
}

fn is_eol(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

/// A single action a script runs when a pattern matches or a step retries.
///
/// Implement this trait to add a new action. Then:
///
/// 1. Define `pub const NAME: &'static str` on your struct, the keyword used
///    in action lines (e.g. `"send"`, `"wait"`).
/// 2. Re-export the struct from `src/actions/mod.rs`.
/// 3. Add one entry to the `REGISTRY` in [`crate::parser`]:
///    `(MyAction::NAME, MyAction::parse_boxed)`.
#[async_trait]
pub trait ScriptAction: Send + Sync + 'static {
    /// The action keyword, accessible at runtime through a trait object.
    fn name(&self) -> &'static str;

    /// Parse this action from the argument string (everything after the
    /// keyword on the action line).
    fn parse(args: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Parse and box this action. Used as the function-pointer type stored in
    /// the action registry.
    fn parse_boxed(args: &str) -> anyhow::Result<Box<dyn ScriptAction>>
    where
        Self: Sized,
    {
        Ok(Box::new(Self::parse(args)?))
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()>;
}
