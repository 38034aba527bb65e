//! The step engine: runs a [`CompiledScript`] against a [`Transport`].
//!
//! A session watches the transcript for the active step's patterns, runs the
//! actions bound to whichever matches first, and follows its transition until
//! a terminal is reached. Every outcome, including errors, ends up as exactly
//! one [`Verdict`] in the [`SessionReport`].

use crate::action::{Context, OutputHandler, ScriptAction, instant_after};
use crate::error::{Result, SessionError};
use crate::matcher::{DEFAULT_REGEX_WINDOW, Match, Matcher};
use crate::report::{SessionReport, Verdict};
use crate::retry::{RetryController, RetryDecision};
use crate::script::{CompiledScript, Finish, OnTimeout, Step, Transition};
use crate::transcript::Transcript;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How much trailing console text to log when a step gives up.
const LAST_OUTPUT: usize = 120;

/// Per-run settings that are not part of the script.
#[derive(Clone)]
pub struct SessionOptions {
    /// Budget for the whole session.
    pub deadline: Option<Duration>,
    /// Maximum number of step transitions before the session fails.
    pub max_transitions: Option<usize>,
    pub regex_window: usize,
    /// Receives console output as it arrives.
    pub output: OutputHandler,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            max_transitions: None,
            regex_window: DEFAULT_REGEX_WINDOW,
            output: Arc::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("deadline", &self.deadline)
            .field("max_transitions", &self.max_transitions)
            .field("regex_window", &self.regex_window)
            .finish_non_exhaustive()
    }
}

/// Executes a script. One engine can run any number of sessions, one after
/// another or concurrently.
pub struct Engine<'s> {
    script: &'s CompiledScript,
    options: SessionOptions,
}

/// Mutable state owned by one session.
struct Session {
    transcript: Transcript,
    matcher: Matcher,
    retry: RetryController,
    path: Vec<String>,
    current: usize,
    /// Session deadline and the budget it was derived from.
    deadline: Option<(Instant, Duration)>,
}

impl<'s> Engine<'s> {
    pub fn new(script: &'s CompiledScript, options: SessionOptions) -> Self {
        Self { script, options }
    }

    /// Run one session to completion and close the transport.
    ///
    /// Never fails: I/O errors, exhausted retries, cancellation and the
    /// session deadline are all reported through the returned verdict.
    pub async fn run<T: Transport>(
        &self,
        transport: T,
        cancel: CancellationToken,
    ) -> SessionReport {
        self.run_since(Instant::now(), transport, cancel).await
    }

    /// Like [`Engine::run`], with the session clock started at `started`.
    pub(crate) async fn run_since<T: Transport>(
        &self,
        started: Instant,
        mut transport: T,
        cancel: CancellationToken,
    ) -> SessionReport {
        let mut session = self.session(started);
        let outcome = self.drive(&mut transport, &mut session, &cancel).await;
        transport.close().await;
        self.conclude(started, session, outcome)
    }

    /// Report for a session that ended before a transport was established.
    pub(crate) fn abandoned(&self, started: Instant, error: SessionError) -> SessionReport {
        self.conclude(started, self.session(started), Err(error))
    }

    fn session(&self, started: Instant) -> Session {
        Session {
            transcript: Transcript::new(self.script.encoding),
            matcher: Matcher::new().with_regex_window(self.options.regex_window),
            retry: RetryController::new(),
            path: Vec::new(),
            current: self.script.start,
            deadline: self.options.deadline.map(|d| (instant_after(started, d), d)),
        }
    }

    fn conclude(
        &self,
        started: Instant,
        mut session: Session,
        outcome: Result<(Finish, String)>,
    ) -> SessionReport {
        session.transcript.finish();

        let (verdict, reason) = match outcome {
            Ok((Finish::Success, reason)) => (Verdict::Success, reason),
            Ok((Finish::Failure, reason)) => (Verdict::Failure, reason),
            Err(e) if e.is_cancellation() => (Verdict::Cancelled, e.to_string()),
            Err(e) => (Verdict::Failure, e.to_string()),
        };
        let terminal_step = if session.path.is_empty() {
            None
        } else {
            self.script.steps.get(session.current).map(|s| s.name.clone())
        };
        info!(
            script = %self.script.name,
            ?verdict,
            step = terminal_step.as_deref().unwrap_or(""),
            %reason,
            "session finished"
        );

        SessionReport {
            script: self.script.name.clone(),
            target: None,
            verdict,
            terminal_step,
            reason,
            elapsed: started.elapsed(),
            retries: session.retry.total_retries(),
            path: session.path,
            transcript: session.transcript,
        }
    }

    async fn drive<T: Transport>(
        &self,
        transport: &mut T,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(Finish, String)> {
        let mut transitions = 0usize;
        loop {
            let step = &self.script.steps[session.current];
            session.path.push(step.name.clone());
            info!(step = %step.name, "entering step");

            if let Some(finish) = step.finish {
                return Ok((finish, format!("reached terminal step '{}'", step.name)));
            }

            session.matcher.rewatch();
            match self.run_step(step, transport, session, cancel).await? {
                (Transition::Finish(finish), reason) => return Ok((finish, reason)),
                (Transition::Goto(next), _) => {
                    transitions += 1;
                    if let Some(max) = self.options.max_transitions {
                        if transitions > max {
                            return Err(SessionError::StepLimit(max));
                        }
                    }
                    session.current = next;
                }
            }
        }
    }

    /// Wait on one step until a pattern matches or the step gives up.
    async fn run_step<T: Transport>(
        &self,
        step: &Step,
        transport: &mut T,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> Result<(Transition, String)> {
        let index = session.current;
        loop {
            let mut step_deadline = instant_after(Instant::now(), step.timeout);
            if let Some((deadline, _)) = session.deadline {
                step_deadline = step_deadline.min(deadline);
            }

            if let Some(hit) = self
                .watch(step, transport, session, cancel, step_deadline)
                .await?
            {
                session.retry.on_match(index);
                debug!(
                    step = %step.name,
                    pattern = %hit.label,
                    at = hit.end,
                    captures = ?hit.captures,
                    "matched"
                );
                let arm = &step.arms[hit.index];
                self.perform(&arm.actions, transport, session, cancel).await?;
                let reason = format!("'{}' matched in step '{}'", hit.label, step.name);
                return Ok((arm.then, reason));
            }

            if let Some((deadline, budget)) = session.deadline {
                if Instant::now() >= deadline {
                    return Err(SessionError::DeadlineExceeded(budget));
                }
            }

            let timeout = SessionError::StepTimeout {
                step: step.name.clone(),
                after: step.timeout,
            };
            let (timeouts, decision) = session.retry.on_timeout(index, &step.retry);
            match decision {
                RetryDecision::Retry(delay) => {
                    warn!(
                        error = %timeout,
                        attempt = timeouts,
                        max_retries = step.retry.max_retries,
                        ?delay,
                        "retrying"
                    );
                    self.context(transport, session, cancel)
                        .pause(delay)
                        .await?;
                    self.perform(&step.nudge, transport, session, cancel).await?;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        error = %timeout,
                        timeouts,
                        last_output = %session.transcript.tail(LAST_OUTPUT).escape_debug(),
                        "giving up"
                    );
                    session.retry.on_match(index);
                    let exhausted = SessionError::RetryExhausted {
                        step: step.name.clone(),
                        timeouts,
                    };
                    return match step.on_timeout {
                        OnTimeout::Fail => Err(exhausted),
                        OnTimeout::Succeed => Ok((
                            Transition::Finish(Finish::Success),
                            format!("step '{}' went quiet", step.name),
                        )),
                        OnTimeout::Goto(next) => Ok((Transition::Goto(next), exhausted.to_string())),
                    };
                }
            }
        }
    }

    /// Read until the step's patterns match or `step_deadline` passes.
    ///
    /// Bytes that arrive after the deadline are recorded but left for the next
    /// attempt to match.
    async fn watch<T: Transport>(
        &self,
        step: &Step,
        transport: &mut T,
        session: &mut Session,
        cancel: &CancellationToken,
        step_deadline: Instant,
    ) -> Result<Option<Match>> {
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            if let Some(hit) = session
                .matcher
                .find(session.transcript.text(), &step.patterns)
            {
                return Ok(Some(hit));
            }
            if Instant::now() >= step_deadline {
                return Ok(None);
            }

            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                read = transport.read_available(step_deadline) => read?,
            };
            if chunk.is_empty() {
                continue;
            }

            trace!(bytes = chunk.len(), "received");
            session.transcript.append(&chunk);
            (self.options.output)(&chunk);

            if Instant::now() > step_deadline {
                debug!(step = %step.name, bytes = chunk.len(), "late output held for next attempt");
                return Ok(None);
            }
        }
    }

    async fn perform<T: Transport>(
        &self,
        actions: &[Box<dyn ScriptAction>],
        transport: &mut T,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ctx = self.context(transport, session, cancel);
        for action in actions {
            debug!(action = action.name(), "running action");
            action.execute(&mut ctx).await?;
        }
        Ok(())
    }

    fn context<'a, T: Transport>(
        &'a self,
        transport: &'a mut T,
        session: &Session,
        cancel: &'a CancellationToken,
    ) -> Context<'a> {
        Context::new(
            transport,
            &self.options.output,
            self.script.pacing,
            &self.script.line_ending,
            cancel,
            session.deadline,
        )
    }
}
