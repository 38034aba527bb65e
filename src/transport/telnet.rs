use super::Transport;
use crate::error::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Strips telnet negotiation from a transport and refuses every option
/// except remote echo and suppress-go-ahead.
///
/// Requests for a state an option is already in are not answered, so a
/// peer that repeats itself cannot start a negotiation loop.
pub struct Telnet<T> {
    inner: T,
    state: State,
    /// Options the server currently has enabled, by option code.
    remote: [bool; 256],
}

impl<T: Transport> Telnet<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            state: State::Data,
            remote: [false; 256],
        }
    }

    /// The reply to `cmd option`, if any. Local options are never enabled,
    /// so every DO is refused and every DONT is already satisfied.
    fn answer(&mut self, cmd: u8, option: u8) -> Option<u8> {
        let enabled = &mut self.remote[usize::from(option)];
        match cmd {
            DO => Some(WONT),
            WILL if *enabled => None,
            WILL if option == OPT_ECHO || option == OPT_SGA => {
                *enabled = true;
                Some(DO)
            }
            WILL => Some(DONT),
            WONT if *enabled => {
                *enabled = false;
                Some(DONT)
            }
            _ => None,
        }
    }

    /// Split `input` into console data and the negotiation replies it calls for.
    fn filter(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();
        for &byte in input {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    data.push(IAC);
                    State::Data
                }
                (State::Iac, cmd @ (DO | DONT | WILL | WONT)) => State::Negotiate(cmd),
                (State::Iac, SB) => State::Sub,
                (State::Iac, _) => State::Data,
                (State::Negotiate(cmd), option) => {
                    if let Some(answer) = self.answer(cmd, option) {
                        trace!(cmd, option, answer, "telnet negotiation");
                        replies.extend_from_slice(&[IAC, answer, option]);
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
        (data, replies)
    }
}

fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

#[async_trait]
impl<T: Transport> Transport for Telnet<T> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.contains(&IAC) {
            self.inner.write(&escape(data)).await
        } else {
            self.inner.write(data).await
        }
    }

    async fn read_available(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            let chunk = self.inner.read_available(deadline).await?;
            if chunk.is_empty() {
                return Ok(chunk);
            }
            let (data, replies) = self.filter(&chunk);
            if !replies.is_empty() {
                self.inner.write(&replies).await?;
            }
            if !data.is_empty() {
                return Ok(data);
            }
        }
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
