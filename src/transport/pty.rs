use super::Transport;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::thread;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// A console reached through a local program (typically a telnet client)
/// running inside a PTY.
pub struct PtyTransport {
    #[allow(dead_code)]
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    writer: Option<Box<dyn Write + Send>>,
    output: UnboundedReceiver<Vec<u8>>,
    command: String,
}

impl PtyTransport {
    /// Spawn `program` in a PTY and start forwarding its output.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let fail = |what: &str, e: anyhow::Error| {
            SessionError::connection(command.clone(), io::Error::other(format!("{what}: {e:#}")))
        };

        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| fail("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| fail("failed to spawn command", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| fail("failed to get PTY writer", e))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| fail("failed to get PTY reader", e))?;

        debug!(command = %command, "spawned");
        Ok(Self {
            master: pair.master,
            child: Some(child),
            writer: Some(writer),
            output: spawn_reader(reader),
            command,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Forward PTY output from a blocking reader thread into an async channel.
fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = unbounded_channel();

    thread::spawn(move || {
        let mut buffer = [0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break, // EOF
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(_) => break,
            }
        }
    });

    rx
}

#[async_trait]
impl Transport for PtyTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(SessionError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        if self.writer.is_none() {
            return Err(SessionError::Closed);
        }
        match timeout_at(deadline, self.output.recv()).await {
            Err(_) => Ok(Vec::new()),
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(SessionError::Closed),
        }
    }

    async fn close(&mut self) {
        self.writer.take();
        if let Some(mut child) = self.child.take() {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.kill();
            }
            // Reaping blocks until the child is gone.
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            debug!(command = %self.command, reaped = matches!(status, Ok(Ok(_))), "closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.child.is_none()
    }
}
