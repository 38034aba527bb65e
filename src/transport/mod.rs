//! Byte-stream transports to a console.
//!
//! A [`Transport`] is owned by exactly one session. Reads are bounded by a
//! deadline and may return nothing; writes are flushed before they return.

mod pty;
mod replay;
mod tcp;
mod telnet;

pub use pty::PtyTransport;
pub use replay::{ReplayHandle, ReplayTransport};
pub use tcp::TcpTransport;
pub use telnet::Telnet;

use crate::error::Result;
use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// A duplex byte stream to a remote console.
#[async_trait]
pub trait Transport: Send {
    /// Write all of `data` and flush it.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Return whatever arrives before `deadline`.
    ///
    /// An empty vector means the deadline passed with nothing to read. The
    /// remote end closing the stream is reported as
    /// [`SessionError::Closed`](crate::SessionError::Closed).
    async fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>>;

    /// Release the underlying resource. Calling this more than once is a no-op.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        (**self).read_available(deadline).await
    }

    async fn close(&mut self) {
        (**self).close().await;
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Where the console lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A TCP console port, optionally speaking telnet.
    Tcp {
        host: String,
        port: u16,
        telnet: bool,
    },
    /// A local program (e.g. a telnet client) run inside a PTY.
    Command { program: String, args: Vec<String> },
}

impl Target {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
            telnet: false,
        }
    }

    pub fn command(program: impl Into<String>, args: &[impl AsRef<str>]) -> Self {
        Self::Command {
            program: program.into(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }

    /// Switch telnet filtering on for TCP targets. Commands are unaffected.
    #[must_use]
    pub fn with_telnet(mut self, enabled: bool) -> Self {
        if let Self::Tcp { telnet, .. } = &mut self {
            *telnet = enabled;
        }
        self
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    /// Accepts `host:port`, `tcp://host:port` and `telnet://host:port`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let (telnet, rest) = if let Some(rest) = s.strip_prefix("telnet://") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            (false, rest)
        } else {
            (false, s)
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Target must be host:port, got: {}", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(anyhow!("Target host is empty: {}", s));
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in target: {}", s))?;
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
            telnet,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp {
                host,
                port,
                telnet: true,
            } => write!(f, "telnet://{host}:{port}"),
            Self::Tcp { host, port, .. } => write!(f, "{host}:{port}"),
            Self::Command { program, args } if args.is_empty() => write!(f, "{program}"),
            Self::Command { program, args } => write!(f, "{program} {}", args.join(" ")),
        }
    }
}

/// Knobs for establishing a transport.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Reset TCP connections on close instead of a graceful shutdown, so a
    /// single-connection console port is free again immediately.
    pub zero_linger: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            zero_linger: true,
        }
    }
}

/// Open a transport to `target`.
///
/// # Errors
///
/// Returns [`SessionError::Connection`](crate::SessionError::Connection) on
/// refusal, resolution failure, connect timeout, or a command that cannot be
/// spawned.
pub async fn open(target: &Target, options: &ConnectOptions) -> Result<Box<dyn Transport>> {
    match target {
        Target::Tcp { host, port, telnet } => {
            let tcp = TcpTransport::connect(host, *port, options).await?;
            if *telnet {
                Ok(Box::new(Telnet::new(tcp)))
            } else {
                Ok(Box::new(tcp))
            }
        }
        Target::Command { program, args } => Ok(Box::new(PtyTransport::spawn(program, args)?)),
    }
}
