//! The cumulative record of everything a console sent during a session.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::ops::Range;
use std::time::Duration;
use tokio::time::Instant;

/// How received bytes are turned into text for matching and logging.
///
/// Decoding never fails: invalid UTF-8 sequences become U+FFFD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    #[serde(alias = "utf-8")]
    Utf8,
    #[serde(alias = "latin-1", alias = "iso-8859-1")]
    Latin1,
}

/// One chunk as it arrived from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Time since the transcript was started.
    pub at: Duration,
    /// Byte range in [`Transcript::raw`].
    pub raw: Range<usize>,
    /// Byte range in [`Transcript::text`].
    pub text: Range<usize>,
}

/// Raw bytes plus their decoded text, in arrival order.
///
/// The buffer only grows while a session runs, so a pattern can match text
/// that spans several chunks.
#[derive(Debug, Clone)]
pub struct Transcript {
    encoding: Encoding,
    started: Instant,
    raw: Vec<u8>,
    text: String,
    entries: Vec<Entry>,
    /// Incomplete UTF-8 sequence held back until the next chunk.
    pending: Vec<u8>,
}

impl Transcript {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            started: Instant::now(),
            raw: Vec::new(),
            text: String::new(),
            entries: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Append a received chunk and return the range of newly decoded text.
    pub fn append(&mut self, chunk: &[u8]) -> Range<usize> {
        let raw_start = self.raw.len();
        let text_start = self.text.len();
        self.raw.extend_from_slice(chunk);
        match self.encoding {
            Encoding::Utf8 => self.decode_utf8(chunk),
            Encoding::Latin1 => self.text.extend(chunk.iter().map(|&b| char::from(b))),
        }
        self.entries.push(Entry {
            at: self.started.elapsed(),
            raw: raw_start..self.raw.len(),
            text: text_start..self.text.len(),
        });
        text_start..self.text.len()
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);
        let mut rest = &bytes[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.text.push_str(s);
                    return;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    if let Ok(s) = std::str::from_utf8(valid) {
                        self.text.push_str(s);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Flush a dangling partial UTF-8 sequence as a replacement character.
    ///
    /// The held bytes were already recorded with their chunk, so the new entry
    /// covers only the replacement text.
    pub(crate) fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.pending.clear();
            let text_start = self.text.len();
            self.text.push(char::REPLACEMENT_CHARACTER);
            self.entries.push(Entry {
                at: self.started.elapsed(),
                raw: self.raw.len()..self.raw.len(),
                text: text_start..self.text.len(),
            });
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The last `max` bytes of decoded text, cut on a character boundary.
    pub fn tail(&self, max: usize) -> &str {
        let mut start = self.text.len().saturating_sub(max);
        while !self.text.is_char_boundary(start) {
            start += 1;
        }
        &self.text[start..]
    }
}

impl Serialize for Transcript {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct EntryRecord<'a> {
            at_ms: u128,
            text: &'a str,
        }

        let entries: Vec<EntryRecord<'_>> = self
            .entries
            .iter()
            .map(|e| EntryRecord {
                at_ms: e.at.as_millis(),
                text: &self.text[e.text.clone()],
            })
            .collect();

        let mut state = serializer.serialize_struct("Transcript", 3)?;
        state.serialize_field("encoding", &self.encoding)?;
        state.serialize_field("bytes", &self.raw.len())?;
        state.serialize_field("entries", &entries)?;
        state.end()
    }
}
