//! [`KeyPress`] action: sends a named key or control character.
//!
//! Script syntax: `key Enter`, `key Ctrl+Z`, `key Break`, `key Alt+x`, `key Esc`

use crate::action::{Context, ScriptAction};
use crate::error::Result;
use anyhow::anyhow;
use async_trait::async_trait;

/// Sends the byte sequence for a single key press.
pub struct KeyPress {
    pub key: String,
    pub bytes: Vec<u8>,
}

impl KeyPress {
    pub const NAME: &'static str = "key";
}

fn named_key(name: &str) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match name.to_ascii_lowercase().as_str() {
        "enter" | "return" | "cr" => b"\r",
        "linefeed" | "lf" => b"\n",
        "tab" => b"\t",
        "space" => b" ",
        "backspace" | "bs" => b"\x08",
        "delete" | "del" | "rubout" => b"\x7f",
        "esc" | "escape" => b"\x1b",
        // SIMH's default interrupt character
        "break" => b"\x05",
        "up" => b"\x1b[A",
        "down" => b"\x1b[B",
        "right" => b"\x1b[C",
        "left" => b"\x1b[D",
        _ => return None,
    };
    Some(bytes)
}

fn control(key: &str) -> Option<u8> {
    let mut chars = key.chars();
    let ch = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    match ch.to_ascii_uppercase() {
        c @ ('@'..='_') => Some(c as u8 & 0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

fn key_bytes(name: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(bytes) = named_key(name) {
        return Ok(bytes.to_vec());
    }
    if let Some((modifier, key)) = name.split_once('+') {
        return match modifier.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => control(key)
                .map(|b| vec![b])
                .ok_or_else(|| anyhow!("No control character for: {}", key)),
            "alt" | "meta" => {
                let mut bytes = vec![0x1b];
                bytes.extend(key_bytes(key)?);
                Ok(bytes)
            }
            "shift" => {
                let upper = key.to_ascii_uppercase();
                if upper.chars().count() == 1 {
                    Ok(upper.into_bytes())
                } else {
                    key_bytes(key)
                }
            }
            _ => Err(anyhow!("Unknown modifier: {}", modifier)),
        };
    }
    if name.chars().count() == 1 {
        return Ok(name.as_bytes().to_vec());
    }
    Err(anyhow!("Unknown key: {}", name))
}

#[async_trait]
impl ScriptAction for KeyPress {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(args: &str) -> anyhow::Result<Self> {
        let key = args.trim();
        if key.is_empty() {
            return Err(anyhow!("Expected a key name after 'key'"));
        }
        Ok(Self {
            key: key.to_string(),
            bytes: key_bytes(key)?,
        })
    }

    async fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.send(&self.bytes).await
    }
}
