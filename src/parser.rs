//! Parser for action lines and the scalar syntax shared by scripts.
//!
//! Action lines look like `send "User\r"` or `wait 2s`. The entry points are
//! [`parse_actions`] and [`parse_line`].

use crate::action::ScriptAction;
use crate::actions::{KeyPress, SendLine, SendText, Show, TypeText, Wait};
use anyhow::{Context as _, Result, anyhow};
use std::collections::BTreeMap;
use std::time::Duration;

/// Parse a list of action lines, substituting `${name}` variables first.
///
/// Empty lines and `#` comments are skipped. Inline comments (` # …`) are
/// stripped while preserving `#` characters inside quoted strings.
///
/// # Errors
///
/// Returns an error naming the offending line if it contains an unknown
/// action, an undefined variable, a malformed argument, or an unclosed quote.
///
/// # Example
///
/// ```
/// use scriptcon::parser::parse_actions;
/// use std::collections::BTreeMap;
///
/// let lines = vec!["wait 500ms".to_string(), r#"send "DIR\r""#.to_string()];
/// let actions = parse_actions(&lines, &BTreeMap::new()).unwrap();
/// assert_eq!(actions.len(), 2);
/// ```
pub fn parse_actions(
    lines: &[String],
    vars: &BTreeMap<String, String>,
) -> Result<Vec<Box<dyn ScriptAction>>> {
    let mut actions = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = strip_inline_comment(line);
        let expanded = substitute(line, vars, escape_quoted)
            .with_context(|| format!("Failed to parse action: {}", line))?;
        let action =
            parse_line(&expanded).with_context(|| format!("Failed to parse action: {}", line))?;
        actions.push(action);
    }
    Ok(actions)
}

type ParseFn = fn(&str) -> Result<Box<dyn ScriptAction>>;

static REGISTRY: &[(&str, ParseFn)] = &[
    (SendText::NAME, SendText::parse_boxed),
    (SendLine::NAME, SendLine::parse_boxed),
    (TypeText::NAME, TypeText::parse_boxed),
    (KeyPress::NAME, KeyPress::parse_boxed),
    (Wait::NAME, Wait::parse_boxed),
    (Show::NAME, Show::parse_boxed),
];

/// Dispatch a single action line to the matching action's parser.
///
/// To add a new action, add one entry to [`REGISTRY`] using the action's
/// `NAME` constant and `parse_boxed` function pointer.
pub fn parse_line(line: &str) -> Result<Box<dyn ScriptAction>> {
    let (name, args) = line.split_once(' ').unwrap_or((line, ""));
    REGISTRY
        .iter()
        .find(|(action_name, _)| *action_name == name)
        .map(|(_, parse)| parse(args))
        .unwrap_or_else(|| Err(anyhow!("Unknown action: {}", line)))
}

/// Strip inline comments from a line, preserving `#` inside quoted strings.
fn strip_inline_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == '"' {
            in_quotes = !in_quotes;
            continue;
        }
        if ch == '#' && !in_quotes {
            return line[..i].trim();
        }
    }
    line
}

/// Replace `${name}` references with values from `vars`.
///
/// Each value goes through `quote` first so it cannot break the syntax it is
/// spliced into. A bare `$` is left alone; console prompts use it.
pub(crate) fn substitute(
    text: &str,
    vars: &BTreeMap<String, String>,
    quote: impl Fn(&str) -> String,
) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow!("Unclosed variable reference in: {}", text))?;
        let name = &after[..end];
        let value = vars
            .get(name)
            .ok_or_else(|| anyhow!("Undefined variable: {}", name))?;
        out.push_str(&quote(value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Escape a value for splicing into a double-quoted action argument.
pub(crate) fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parse a duration string: `1s`, `500ms`, `1.5s`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(ms_str) = s.strip_suffix("ms") {
        let ms: u64 = ms_str
            .trim()
            .parse()
            .context("Invalid milliseconds value")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(s_str) = s.strip_suffix('s') {
        let secs: f64 = s_str.trim().parse().context("Invalid seconds value")?;
        Duration::try_from_secs_f64(secs).context("Invalid seconds value")
    } else {
        Err(anyhow!("Duration must end with 's' or 'ms', got: {}", s))
    }
}

/// Split `args` into a leading double-quoted string and whatever follows it.
pub(crate) fn split_quoted(args: &str) -> Result<(&str, &str)> {
    let args = args.trim();
    if !args.starts_with('"') {
        return Err(anyhow!("Expected string to start with '\"'"));
    }

    // Locate the closing quote, respecting backslash escapes.
    let mut escaped = false;
    for (i, ch) in args.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == '"' {
            return Ok((&args[..=i], args[i + 1..].trim()));
        }
    }
    Err(anyhow!("Expected string to end with '\"'"))
}

/// Parse a double-quoted string into raw bytes.
///
/// Supports `\r`, `\n`, `\t`, `\0`, `\e` (escape), `\"`, `\\` and `\xHH`.
pub(crate) fn parse_quoted_bytes(s: &str) -> Result<Vec<u8>> {
    let (quoted, rest) = split_quoted(s)?;
    if !rest.is_empty() {
        return Err(anyhow!("Unexpected text after string: {}", rest));
    }
    unescape(&quoted[1..quoted.len() - 1])
}

/// Parse a double-quoted string that must decode to valid UTF-8.
pub(crate) fn parse_quoted_string(s: &str) -> Result<String> {
    String::from_utf8(parse_quoted_bytes(s)?).context("String escapes produce invalid UTF-8")
}

fn unescape(body: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('e') => out.push(0x1b),
            Some('"') => out.push(b'"'),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 2)
                    .ok_or_else(|| anyhow!("Invalid \\x escape: \\x{}", hex))?;
                out.push(byte);
            }
            Some(other) => return Err(anyhow!("Unknown escape: \\{}", other)),
            None => return Err(anyhow!("Trailing backslash")),
        }
    }
    Ok(out)
}

/// Serde support for durations written as `"10s"`, `"500ms"` or a number of
/// seconds.
pub(crate) mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use std::time::Duration;

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"10s\" or \"500ms\", or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(|e| E::custom(format!("{e:#}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(DurationVisitor)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super")] Duration);

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<Wrapper>::deserialize(d)?.map(|Wrapper(d)| d))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(src: &[&str]) -> Vec<String> {
        src.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(
            parse_duration("1.5s").unwrap(),
            Duration::from_secs_f64(1.5)
        );
        assert!(parse_duration("5minutes").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_quoted_string() {
        assert_eq!(parse_quoted_string("\"hello\"").unwrap(), "hello");
        assert_eq!(
            parse_quoted_string("\"hello world\"").unwrap(),
            "hello world"
        );
        assert_eq!(
            parse_quoted_string("\"hello\\nworld\"").unwrap(),
            "hello\nworld"
        );
        assert_eq!(parse_quoted_string(r#""a\\nb""#).unwrap(), "a\\nb");
    }

    #[test]
    fn test_parse_quoted_bytes() {
        assert_eq!(parse_quoted_bytes(r#""[1,2]\r""#).unwrap(), b"[1,2]\r");
        assert_eq!(parse_quoted_bytes(r#""\x05""#).unwrap(), vec![0x05]);
        assert_eq!(parse_quoted_bytes(r#""\xff""#).unwrap(), vec![0xff]);
        assert!(parse_quoted_bytes(r#""\xg1""#).is_err());
        assert!(parse_quoted_bytes(r#""\q""#).is_err());
        assert!(parse_quoted_bytes(r#""unclosed"#).is_err());
        assert!(parse_quoted_bytes(r#""a" trailing"#).is_err());
    }

    #[test]
    fn test_split_quoted() {
        assert_eq!(
            split_quoted(r#""say \"hi\"" 2s"#).unwrap(),
            (r#""say \"hi\"""#, "2s")
        );
        assert_eq!(split_quoted(r#""é" x"#).unwrap(), (r#""é""#, "x"));
        assert!(split_quoted("no_quotes").is_err());
    }

    #[test]
    fn test_parse_all_actions() {
        let actions = parse_actions(
            &lines(&[
                "wait 500ms",
                r#"type "cmd""#,
                r#"send "instant\r""#,
                r#"sendline "DIR""#,
                r#"show "note""#,
                "key Ctrl+Z",
            ]),
            &BTreeMap::new(),
        )
        .unwrap();
        let names: Vec<_> = actions.iter().map(|a| a.name()).collect();
        assert_eq!(names, ["wait", "type", "send", "sendline", "show", "key"]);
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let actions = parse_actions(
            &lines(&["# c1", "", "wait 1s # settle", r##"send "#hashtag""##]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_parse_unknown_action() {
        let err = parse_actions(&lines(&["expect \"x\""]), &BTreeMap::new())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("Unknown action"), "got: {err:#}");
    }

    #[test]
    fn test_strip_inline_comments() {
        assert_eq!(strip_inline_comment("wait 1s # comment"), "wait 1s");
        assert_eq!(
            strip_inline_comment("type \"test\" # inline"),
            "type \"test\""
        );
        assert_eq!(
            strip_inline_comment("type \"#hashtag\""),
            "type \"#hashtag\""
        );
        assert_eq!(
            strip_inline_comment("type \"test#1\" # comment"),
            "type \"test#1\""
        );
    }

    #[test]
    fn test_substitute() {
        let mut vars = BTreeMap::new();
        vars.insert("user".to_string(), "[1,2]".to_string());
        vars.insert("odd".to_string(), r#"a"b\c"#.to_string());

        assert_eq!(
            substitute("send \"${user}\\r\"", &vars, escape_quoted).unwrap(),
            "send \"[1,2]\\r\""
        );
        assert_eq!(substitute("$ ", &vars, escape_quoted).unwrap(), "$ ");
        assert!(substitute("${missing}", &vars, escape_quoted).is_err());
        assert!(substitute("${user", &vars, escape_quoted).is_err());

        let spliced = substitute("send \"${odd}\"", &vars, escape_quoted).unwrap();
        assert_eq!(parse_quoted_bytes(&spliced[5..]).unwrap(), br#"a"b\c"#);
    }

    #[test]
    fn test_deserialize_durations() {
        #[derive(serde::Deserialize)]
        struct T {
            #[serde(with = "duration")]
            a: Duration,
            #[serde(with = "duration")]
            b: Duration,
            #[serde(default, with = "duration::option")]
            c: Option<Duration>,
            #[serde(default, with = "duration::option")]
            d: Option<Duration>,
        }
        let t: T = toml::from_str("a = \"250ms\"\nb = 3\nc = 1.5").unwrap();
        assert_eq!(t.a, Duration::from_millis(250));
        assert_eq!(t.b, Duration::from_secs(3));
        assert_eq!(t.c, Some(Duration::from_millis(1500)));
        assert_eq!(t.d, None);
    }
}
