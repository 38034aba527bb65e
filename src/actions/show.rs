//! [`Show`] action: writes a note to the output handler.
//!
//! Script syntax: `show "*** Logged in ***"`

use crate::action::{Context, ScriptAction};
use crate::error::Result;
use crate::parser::parse_quoted_string;
use async_trait::async_trait;

/// Writes text to the output handler without sending anything to the console.
///
/// Useful for marking progress through a long procedure in the live output.
pub struct Show {
    pub data: Vec<u8>,
}

impl Show {
    pub const NAME: &'static str = "show";

    /// Create a `Show` action from a string. A newline is appended automatically.
    pub fn new(text: impl Into<String>) -> Self {
        let mut t = text.into();
        t.push('\n');
        Self {
            data: t.into_bytes(),
        }
    }
}

#[async_trait]
impl ScriptAction for Show {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(args: &str) -> anyhow::Result<Self> {
        Ok(Self::new(parse_quoted_string(args)?))
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.emit(&self.data);
        Ok(())
    }
}
