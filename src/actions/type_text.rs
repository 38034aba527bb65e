//! [`TypeText`] action: types text one character at a time, like a person.
//!
//! Script syntax:
//! - `type "21-DEC-76"`: 50-150ms between characters
//! - `type "12:00 AM" 20ms 40ms`: custom bounds

use crate::action::{Context, ScriptAction};
use crate::error::Result;
use crate::parser::{parse_duration, parse_quoted_string, split_quoted};
use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

/// Sends `text` one character at a time with random per-character delays,
/// then submits it with the script's line ending.
pub struct TypeText {
    pub text: String,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl TypeText {
    pub const NAME: &'static str = "type";

    /// Create a `TypeText` action with default timing (50-150ms per character).
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_timing(text, Duration::from_millis(50), Duration::from_millis(150))
    }

    /// Create a `TypeText` action with custom per-character timing.
    pub fn with_timing(text: impl Into<String>, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            text: text.into(),
            min_delay,
            max_delay,
        }
    }
}

#[async_trait]
impl ScriptAction for TypeText {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(args: &str) -> anyhow::Result<Self> {
        let (quoted, rest) = split_quoted(args)?;
        let text = parse_quoted_string(quoted)?;
        let bounds: Vec<&str> = rest.split_whitespace().collect();
        match bounds.as_slice() {
            [] => Ok(Self::new(text)),
            [min, max] => {
                let (min, max) = (parse_duration(min)?, parse_duration(max)?);
                if min > max {
                    return Err(anyhow!("Minimum delay exceeds maximum: {:?} > {:?}", min, max));
                }
                Ok(Self::with_timing(text, min, max))
            }
            _ => Err(anyhow!("Expected two delays after text, got: {}", rest)),
        }
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let mut buf = [0u8; 4];
        for ch in self.text.chars() {
            ctx.write_raw(ch.encode_utf8(&mut buf).as_bytes()).await?;
            // Drop rng before the await so it does not cross the yield point.
            let delay = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.min_delay..=self.max_delay)
            };
            ctx.pause(delay).await?;
        }

        // Longer pause after the last character before submitting.
        ctx.pause(self.max_delay.saturating_mul(2)).await?;
        let ending = ctx.line_ending().to_vec();
        ctx.send(&ending).await
    }
}
