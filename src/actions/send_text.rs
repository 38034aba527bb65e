//! [`SendText`] and [`SendLine`] actions: send bytes to the console with pacing.
//!
//! Script syntax:
//! - `send "[1,2]\r"`: exactly these bytes, nothing appended
//! - `sendline "DIR"`: the text followed by the script's line ending

use crate::action::{Context, ScriptAction};
use crate::error::Result;
use crate::parser::parse_quoted_bytes;
use async_trait::async_trait;

/// Sends bytes to the console exactly as written.
pub struct SendText {
    pub data: Vec<u8>,
}

impl SendText {
    pub const NAME: &'static str = "send";

    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ScriptAction for SendText {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(args: &str) -> anyhow::Result<Self> {
        Ok(Self::new(parse_quoted_bytes(args)?))
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.send(&self.data).await
    }
}

/// Sends a line of text terminated by the script's line ending.
pub struct SendLine {
    pub data: Vec<u8>,
}

impl SendLine {
    pub const NAME: &'static str = "sendline";

    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ScriptAction for SendLine {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(args: &str) -> anyhow::Result<Self> {
        Ok(Self::new(parse_quoted_bytes(args)?))
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let mut line = self.data.clone();
        line.extend_from_slice(ctx.line_ending());
        ctx.send(&line).await
    }
}
