//! # scriptcon
//!
//! A step-script engine for driving remote, line-oriented consoles.
//!
//! Scriptcon connects to a console (a simulator's TCP port, a telnet server,
//! or a local client program in a PTY), then walks a declarative script:
//! each step waits for one of several expected strings, runs the actions
//! bound to whichever appears first, and moves on to the next step. Timeouts
//! are retried with optional nudges before the step gives up.
//!
//! ## Quick start
//!
//! ```no_run
//! use scriptcon::{Overrides, RunOptions, Script, Target};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let script = Script::from_toml_str(r#"
//! name = "login"
//!
//! [[steps]]
//! name = "login"
//! [[steps.on]]
//! text = "User:"
//! do = ['sendline "[1,2]"']
//! goto = "password"
//!
//! [[steps]]
//! name = "password"
//! [[steps.on]]
//! text = "Password:"
//! do = ['sendline "secret"']
//! finish = "success"
//! "#)?
//!     .compile(&Overrides::default())?;
//!
//!     let target: Target = "localhost:2323".parse()?;
//!     let report = scriptcon::run(&target, &script, RunOptions::default(), CancellationToken::new()).await?;
//!     println!("{:?}: {}", report.verdict, report.reason);
//!     Ok(())
//! }
//! ```
//!
//! ## Action lines
//!
//! | Action | Description |
//! |--------|-------------|
//! | `send "text"` | Send bytes exactly as written (`\r`, `\n`, `\t`, `\xHH` escapes) |
//! | `sendline "text"` | Send text followed by the script's line ending |
//! | `type "text"` | Type with random 50-150ms per-character delays, then submit |
//! | `key Ctrl+Z` | Send a key press (`Enter`, `Esc`, `Break`, `Ctrl+`, `Alt+`, ...) |
//! | `wait 2s` | Pause (`ms` or `s` units, floats allowed) |
//! | `show "text"` | Write a note to the output handler |
//!
//! ## Implementing a custom action
//!
//! Implement [`ScriptAction`] and register it in the parser:
//!
//! ```no_run
//! use scriptcon::action::{Context, ScriptAction};
//! use async_trait::async_trait;
//!
//! pub struct Bell;
//!
//! impl Bell {
//!     pub const NAME: &'static str = "bell";
//! }
//!
//! #[async_trait]
//! impl ScriptAction for Bell {
//!     fn name(&self) -> &'static str { Self::NAME }
//!
//!     fn parse(_args: &str) -> anyhow::Result<Self> {
//!         Ok(Self)
//!     }
//!
//!     async fn execute(&self, ctx: &mut Context<'_>) -> scriptcon::Result<()> {
//!         ctx.send(b"\x07").await
//!     }
//! }
//! ```

pub mod action;
pub mod actions;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod parser;
pub mod report;
pub mod retry;
pub mod script;
pub mod transcript;
pub mod transport;

pub use action::{Context, OutputHandler, Pacing, ScriptAction};
pub use actions::{KeyPress, SendLine, SendText, Show, TypeText, Wait};
pub use engine::{Engine, SessionOptions};
pub use error::{Result, SessionError};
pub use matcher::{Match, Matcher, Pattern, PatternSet};
pub use parser::{parse_actions, parse_line};
pub use report::{SessionReport, Verdict};
pub use retry::{Backoff, RetryPolicy};
pub use script::{CompiledScript, Overrides, Script};
pub use transcript::{Encoding, Transcript};
pub use transport::{ConnectOptions, Target, Transport};

use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options for [`run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub connect: ConnectOptions,
    pub session: SessionOptions,
}

/// Connect to `target` and run `script` to completion.
///
/// The session deadline and `cancel` already apply while connecting.
///
/// # Errors
///
/// Only a failure to connect is returned as an error. Everything that goes
/// wrong after that is reported in the [`SessionReport`] verdict.
pub async fn run(
    target: &Target,
    script: &CompiledScript,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<SessionReport> {
    let started = Instant::now();
    let deadline = options.session.deadline;
    let engine = Engine::new(script, options.session);

    let mut report = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(%target, "cancelled while connecting");
            engine.abandoned(started, SessionError::Cancelled)
        }
        budget = expire(started, deadline) => {
            warn!(%target, "deadline passed while connecting");
            engine.abandoned(started, SessionError::DeadlineExceeded(budget))
        }
        opened = transport::open(target, &options.connect) => {
            let transport = opened?;
            info!(%target, script = %script.name, "connected");
            engine.run_since(started, transport, cancel.clone()).await
        }
    };
    report.target = Some(target.to_string());
    Ok(report)
}

/// Resolves with the budget once the session deadline passes, never without one.
async fn expire(started: Instant, deadline: Option<Duration>) -> Duration {
    match deadline {
        Some(budget) => {
            sleep_until(action::instant_after(started, budget)).await;
            budget
        }
        None => std::future::pending().await,
    }
}
