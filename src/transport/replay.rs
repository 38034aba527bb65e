use super::Transport;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// An in-memory console that plays back timed output and records input.
///
/// Chunk delays are relative to the previous chunk; the clock starts on the
/// first read or write. Useful for dry runs of a script and for tests.
///
/// ```
/// use scriptcon::transport::ReplayTransport;
/// use std::time::Duration;
///
/// let console = ReplayTransport::new()
///     .chunk(Duration::from_secs(1), "User:")
///     .chunk(Duration::from_secs(1), "Password:");
/// let handle = console.handle();
/// assert!(handle.written().is_empty());
/// ```
pub struct ReplayTransport {
    script: VecDeque<(Duration, Vec<u8>)>,
    started: Option<Instant>,
    elapsed_due: Duration,
    close_at_end: bool,
    closed: bool,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    written: Mutex<Vec<u8>>,
    closes: AtomicU32,
}

/// Observes a [`ReplayTransport`] after it has been handed to a session.
#[derive(Clone)]
pub struct ReplayHandle {
    shared: Arc<Shared>,
}

impl ReplayHandle {
    /// Everything the session has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Number of times the underlying resource was released.
    pub fn close_count(&self) -> u32 {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

impl Default for ReplayTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            started: None,
            elapsed_due: Duration::ZERO,
            close_at_end: false,
            closed: false,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Emit `data` once `delay` has passed since the previous chunk.
    #[must_use]
    pub fn chunk(mut self, delay: Duration, data: impl Into<Vec<u8>>) -> Self {
        self.script.push_back((delay, data.into()));
        self
    }

    /// Report end-of-stream once every chunk has been read.
    #[must_use]
    pub fn then_close(mut self) -> Self {
        self.close_at_end = true;
        self
    }

    pub fn handle(&self) -> ReplayHandle {
        ReplayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn origin(&mut self) -> Instant {
        *self.started.get_or_insert_with(Instant::now)
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.origin();
        self.shared
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let origin = self.origin();
        let Some((delay, _)) = self.script.front() else {
            if self.close_at_end {
                return Err(SessionError::Closed);
            }
            sleep_until(deadline).await;
            return Ok(Vec::new());
        };

        let due = origin + self.elapsed_due + *delay;
        if due > deadline {
            sleep_until(deadline).await;
            return Ok(Vec::new());
        }
        sleep_until(due).await;
        match self.script.pop_front() {
            Some((delay, data)) => {
                self.elapsed_due += delay;
                Ok(data)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
