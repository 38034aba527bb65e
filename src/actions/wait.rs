//! [`Wait`] action: an explicit settle delay.
//!
//! Script syntax: `wait 500ms` or `wait 1.5s`

use crate::action::{Context, ScriptAction};
use crate::error::Result;
use crate::parser::parse_duration;
use async_trait::async_trait;
use std::time::Duration;

/// Pauses for a fixed duration before the next action. Cancellation and the
/// session deadline cut the pause short.
pub struct Wait {
    pub duration: Duration,
}

impl Wait {
    pub const NAME: &'static str = "wait";
}

#[async_trait]
impl ScriptAction for Wait {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(args: &str) -> anyhow::Result<Self> {
        Ok(Self {
            duration: parse_duration(args)?,
        })
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.pause(self.duration).await
    }
}
