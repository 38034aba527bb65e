//! Pattern matching over a growing transcript.
//!
//! The [`Matcher`] reports the match that *ends* first among all watched
//! patterns. Ties on the end offset go to the lowest rank, then to the
//! earliest declaration. Each call only rescans a trailing window of text that
//! could still complete a match, so long sessions do not pay for their whole
//! history on every chunk.

use regex::{Captures, Regex};
use std::fmt;

/// Default lookback for regex patterns, in bytes of decoded text.
pub const DEFAULT_REGEX_WINDOW: usize = 4096;

#[derive(Clone)]
pub enum PatternKind {
    Literal(String),
    Regex(Regex),
}

impl fmt::Debug for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => write!(f, "Literal({s:?})"),
            Self::Regex(r) => write!(f, "Regex({:?})", r.as_str()),
        }
    }
}

/// A trigger to watch for in the console output.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub kind: PatternKind,
    pub label: String,
    /// Tie-break order. `None` means declaration order.
    pub rank: Option<u32>,
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            label: text.clone(),
            kind: PatternKind::Literal(text),
            rank: None,
        }
    }

    pub fn regex(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            label: source.to_string(),
            kind: PatternKind::Regex(Regex::new(source)?),
            rank: None,
        })
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Earliest-ending match at or after `from`, as `(start, end, captures)`.
    fn earliest(&self, text: &str, from: usize) -> Option<(usize, usize, Vec<Option<String>>)> {
        match &self.kind {
            PatternKind::Literal(lit) => text[from..]
                .find(lit.as_str())
                .map(|pos| (from + pos, from + pos + lit.len(), Vec::new())),
            PatternKind::Regex(re) => {
                let end = re.shortest_match_at(text, from)?;
                let caps = captures_ending_at(re, text, from, end)
                    .or_else(|| re.captures_at(&text[..end], from));
                match caps {
                    Some(caps) => {
                        let start = caps.get(0).map_or(end, |m| m.start());
                        let groups = caps
                            .iter()
                            .skip(1)
                            .map(|g| g.map(|m| m.as_str().to_string()))
                            .collect();
                        Some((start, end, groups))
                    }
                    None => Some((end, end, Vec::new())),
                }
            }
        }
    }
}

/// Captures of a match that ends exactly at `end`, searched in the full text
/// so look-around assertions at `end` see what follows it.
fn captures_ending_at<'t>(
    re: &Regex,
    text: &'t str,
    from: usize,
    end: usize,
) -> Option<Captures<'t>> {
    let mut at = from;
    while at <= end {
        let caps = re.captures_at(text, at)?;
        let whole = caps.get(0)?;
        if whole.end() == end {
            return Some(caps);
        }
        if whole.start() >= end {
            return None;
        }
        at = whole.start() + text[whole.start()..].chars().next().map_or(1, char::len_utf8);
    }
    None
}

/// The patterns a step watches, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
    max_literal: usize,
    has_regex: bool,
}

impl PatternSet {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        let mut set = Self::default();
        for pattern in patterns {
            set.push(pattern);
        }
        set
    }

    pub fn push(&mut self, pattern: Pattern) {
        match &pattern.kind {
            PatternKind::Literal(lit) => self.max_literal = self.max_literal.max(lit.len()),
            PatternKind::Regex(_) => self.has_regex = true,
        }
        self.patterns.push(pattern);
    }

    pub fn get(&self, index: usize) -> Option<&Pattern> {
        self.patterns.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// How far behind already-scanned text a new match could begin.
    fn lookback(&self, regex_window: usize) -> usize {
        let literal = self.max_literal.saturating_sub(1);
        if self.has_regex {
            literal.max(regex_window)
        } else {
            literal
        }
    }

    fn effective_rank(&self, index: usize) -> u32 {
        self.patterns[index]
            .rank
            .unwrap_or(u32::try_from(index).unwrap_or(u32::MAX))
    }
}

/// A pattern hit, positioned in transcript text offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Declaration index of the pattern within its set.
    pub index: usize,
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Regex capture groups, excluding the whole match.
    pub captures: Vec<Option<String>>,
}

/// Incremental matcher state for one session.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Text before this offset belongs to earlier matches.
    consumed: usize,
    /// Text before this offset has been searched with the current set.
    scanned: usize,
    regex_window: usize,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            consumed: 0,
            scanned: 0,
            regex_window: DEFAULT_REGEX_WINDOW,
        }
    }

    #[must_use]
    pub fn with_regex_window(mut self, window: usize) -> Self {
        self.regex_window = window;
        self
    }

    /// Start watching a different pattern set. Unconsumed text is searched again.
    pub fn rewatch(&mut self) {
        self.scanned = self.consumed;
    }

    /// Search text that arrived since the last call.
    ///
    /// On a hit, the text up to the end of the match is consumed so the same
    /// occurrence is never reported twice.
    pub fn find(&mut self, text: &str, set: &PatternSet) -> Option<Match> {
        if set.is_empty() || self.scanned >= text.len() {
            return None;
        }

        let mut from = self
            .scanned
            .saturating_sub(set.lookback(self.regex_window))
            .max(self.consumed);
        while !text.is_char_boundary(from) {
            from -= 1;
        }

        let mut best: Option<(usize, u32, usize, usize, Vec<Option<String>>)> = None;
        for (index, pattern) in set.iter().enumerate() {
            let Some((start, end, captures)) = pattern.earliest(text, from) else {
                continue;
            };
            let rank = set.effective_rank(index);
            let better = match &best {
                None => true,
                Some((best_end, best_rank, best_index, _, _)) => {
                    (end, rank, index) < (*best_end, *best_rank, *best_index)
                }
            };
            if better {
                best = Some((end, rank, index, start, captures));
            }
        }

        match best {
            Some((end, _, index, start, captures)) => {
                self.consumed = end;
                self.scanned = end;
                Some(Match {
                    index,
                    label: set.patterns[index].label.clone(),
                    start,
                    end,
                    text: text[start..end].to_string(),
                    captures,
                })
            }
            None => {
                self.scanned = text.len();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: Vec<Pattern>) -> PatternSet {
        PatternSet::new(patterns)
    }

    #[test]
    fn test_earliest_end_wins() {
        let patterns = set(vec![
            Pattern::literal("A").with_rank(0),
            Pattern::literal("AB").with_rank(1),
        ]);
        let mut m = Matcher::new();
        let hit = m.find("AB", &patterns).unwrap();
        assert_eq!(hit.label, "A");
        assert_eq!(hit.end, 1);
    }

    #[test]
    fn test_earliest_end_wins_over_rank() {
        let patterns = set(vec![
            Pattern::literal("AB").with_rank(0),
            Pattern::literal("A").with_rank(1),
        ]);
        let mut m = Matcher::new();
        assert_eq!(m.find("AB", &patterns).unwrap().label, "A");
    }

    #[test]
    fn test_simultaneous_end_uses_rank() {
        let patterns = set(vec![
            Pattern::literal("B").with_rank(1),
            Pattern::literal("AB").with_rank(0),
        ]);
        let mut m = Matcher::new();
        let hit = m.find("AB", &patterns).unwrap();
        assert_eq!(hit.label, "AB");
        assert_eq!((hit.start, hit.end), (0, 2));
    }

    #[test]
    fn test_simultaneous_end_defaults_to_declaration_order() {
        let patterns = set(vec![Pattern::literal("$ "), Pattern::regex(r"\S+ ").unwrap()]);
        let mut m = Matcher::new();
        assert_eq!(m.find("$ ", &patterns).unwrap().index, 0);
    }

    #[test]
    fn test_match_spans_chunks() {
        let patterns = set(vec![Pattern::literal("Password:")]);
        let mut m = Matcher::new();
        assert!(m.find("Pass", &patterns).is_none());
        let hit = m.find("Password:", &patterns).unwrap();
        assert_eq!((hit.start, hit.end), (0, 9));
    }

    #[test]
    fn test_match_consumes_text() {
        let patterns = set(vec![Pattern::literal("$ ")]);
        let mut m = Matcher::new();
        let text = "$ DIR\r\n$ ";
        assert_eq!(m.find(text, &patterns).unwrap().end, 2);
        assert_eq!(m.find(text, &patterns).unwrap().start, 7);
        assert!(m.find(text, &patterns).is_none());
    }

    #[test]
    fn test_no_match_is_not_an_error() {
        let patterns = set(vec![Pattern::literal("User:")]);
        let mut m = Matcher::new();
        assert!(m.find("garbage", &patterns).is_none());
        assert_eq!(m.consumed, 0);
    }

    #[test]
    fn test_rescan_window_is_bounded() {
        let patterns = set(vec![Pattern::literal("Ready")]);
        let mut m = Matcher::new();
        let mut text = "x".repeat(10_000);
        assert!(m.find(&text, &patterns).is_none());
        assert_eq!(m.scanned, 10_000);
        text.push_str("Rea");
        assert!(m.find(&text, &patterns).is_none());
        text.push_str("dy");
        let hit = m.find(&text, &patterns).unwrap();
        assert_eq!(hit.start, 10_000);
    }

    #[test]
    fn test_rewatch_searches_unconsumed_text() {
        let first = set(vec![Pattern::literal("User:")]);
        let second = set(vec![Pattern::literal("banner")]);
        let mut m = Matcher::new();
        let text = "banner User:";
        assert_eq!(m.find(text, &first).unwrap().end, 12);
        assert!(m.find(text, &second).is_none());

        let mut m = Matcher::new();
        assert!(m.find("banner", &first).is_none());
        m.rewatch();
        assert!(m.find("banner", &second).is_some());
    }

    #[test]
    fn test_regex_captures() {
        let patterns = set(vec![Pattern::regex(r"Job (\d+) is").unwrap()]);
        let mut m = Matcher::new();
        let hit = m.find("Job 12 is detached", &patterns).unwrap();
        assert_eq!(hit.text, "Job 12 is");
        assert_eq!(hit.captures, vec![Some("12".to_string())]);
    }

    #[test]
    fn test_regex_anchor_sees_full_context() {
        let patterns = set(vec![Pattern::regex(r"(?m)^Ready").unwrap()]);
        let mut m = Matcher::new();
        assert!(m.find("NotReady", &patterns).is_none());
        let hit = m.find("NotReady\nReady", &patterns).unwrap();
        assert_eq!(hit.start, 9);
    }

    #[test]
    fn test_regex_assertion_after_match_end() {
        let patterns = set(vec![Pattern::regex(r"(ab)\B").unwrap()]);
        let mut m = Matcher::new();
        let hit = m.find("xabc", &patterns).unwrap();
        assert_eq!((hit.start, hit.end), (1, 3));
        assert_eq!(hit.text, "ab");
        assert_eq!(hit.captures, vec![Some("ab".to_string())]);
    }

    #[test]
    fn test_regex_reports_shortest_match() {
        let patterns = set(vec![Pattern::regex(r"\d+").unwrap()]);
        let mut m = Matcher::new();
        let hit = m.find("job 123", &patterns).unwrap();
        assert_eq!((hit.start, hit.end), (4, 5));
        assert_eq!(hit.text, "1");
    }

    #[test]
    fn test_multibyte_window_boundary() {
        let patterns = set(vec![Pattern::literal("éé")]);
        let mut m = Matcher::new();
        assert!(m.find("aé", &patterns).is_none());
        assert!(m.find("aéé", &patterns).is_some());
    }
}
