use super::{ConnectOptions, Transport};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// A console reached over a plain TCP socket.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
    zero_linger: bool,
    buffer: Vec<u8>,
}

impl TcpTransport {
    /// Connect to `host:port` within the configured connect timeout.
    pub async fn connect(host: &str, port: u16, options: &ConnectOptions) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let stream = match timeout(options.connect_timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SessionError::connection(peer, e)),
            Err(_) => {
                return Err(SessionError::connection(
                    peer,
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", options.connect_timeout),
                    ),
                ));
            }
        };
        Self::from_stream(stream, peer, options)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(
        stream: TcpStream,
        peer: impl Into<String>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let peer = peer.into();
        // The console is character oriented; small writes must go out at once.
        stream
            .set_nodelay(true)
            .map_err(|e| SessionError::connection(peer.clone(), e))?;
        if options.zero_linger {
            #[allow(deprecated)]
            let linger = stream.set_linger(Some(Duration::ZERO));
            linger.map_err(|e| SessionError::connection(peer.clone(), e))?;
        }
        debug!(peer = %peer, "connected");
        Ok(Self {
            stream: Some(stream),
            peer,
            zero_linger: options.zero_linger,
            buffer: vec![0; READ_CHUNK],
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(SessionError::Closed)?;
        stream.write_all(data).await?;
        stream.flush().await?;
        trace!(bytes = data.len(), "sent");
        Ok(())
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(SessionError::Closed)?;
        match timeout_at(deadline, stream.read(&mut self.buffer)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(SessionError::Closed),
            Ok(Ok(n)) => Ok(self.buffer[..n].to_vec()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // With zero linger, dropping the socket resets it.
            if !self.zero_linger {
                let _ = stream.shutdown().await;
            }
            debug!(peer = %self.peer, "closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}
