//! Framing and decoding of the emulator's JSON log stream.
//!
//! Output arrives in arbitrary chunks. A chunk may hold several lines or end in the
//! middle of one, so incomplete trailing bytes are carried over to the next chunk.
//! Every complete, non-empty line becomes exactly one [`LogRecord`]. Lines that fail
//! to decode become fallback records instead of errors, so a reader loop never stops
//! on bad input.

use serde::Deserialize;
use serde_json::error::Category;
use serde_json::{Map, Value};

use crate::logs::{Level, LogLevel, LogRecord};

const USER_LOG_PREFIX: &str = "\u{1b}[1;34mLOG\u{1b}[0m \u{1b}[2m[";
const USER_LOG_ID_SUFFIX: &str = "]\u{1b}[0m ";
const USER_LOG_ID_LEN: usize = 6;

#[derive(Deserialize)]
struct WireRecord {
    level: String,
    #[serde(default)]
    msg: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// One decoded line.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    /// The record, always present
    pub record: LogRecord,
    /// Unwrapped text of a user `log()` call, when the record carried one
    pub user_log: Option<String>,
}

/// Incremental parser for one output stream.
#[derive(Debug, Default)]
pub struct LogStreamParser {
    pending: Vec<u8>,
}

impl LogStreamParser {
    /// Creates a parser with an empty carry-over buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw chunk and returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedLine> {
        // pending never holds a newline between calls, only the new bytes need scanning
        let scanned = self.pending.len();
        self.pending.extend_from_slice(chunk);
        let Some(offset) = self.pending[scanned..].iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let last_newline = scanned + offset;

        let complete: Vec<u8> = self.pending.drain(..=last_newline).collect();
        parse_block(&complete)
    }

    /// Flushes a trailing line without newline and clears the buffer. Call on stream close.
    pub fn finish(&mut self) -> Vec<ParsedLine> {
        let rest = std::mem::take(&mut self.pending);
        parse_block(&rest)
    }

    /// Bytes waiting for the rest of their line.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

fn parse_block(bytes: &[u8]) -> Vec<ParsedLine> {
    String::from_utf8_lossy(bytes)
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

/// Decodes a single line.
pub fn parse_line(line: &str) -> ParsedLine {
    let wire = match serde_json::from_str::<WireRecord>(line) {
        Ok(wire) => wire,
        Err(e) => {
            let looks_like_json = line.trim_start().starts_with(['{', '[']);
            let level = match e.classify() {
                Category::Syntax | Category::Eof if looks_like_json => Level::JsonError,
                _ => Level::Parser,
            };
            return fallback(level, line);
        }
    };

    let Ok(level) = wire.level.parse::<LogLevel>() else {
        return fallback(Level::Parser, line);
    };

    let user_log = match level {
        LogLevel::Debug => unwrap_user_log(&wire.msg),
        _ => None,
    };

    ParsedLine {
        record: LogRecord {
            level: Level::Severity(level),
            message: wire.msg,
            fields: wire.fields,
        },
        user_log,
    }
}

fn fallback(level: Level, line: &str) -> ParsedLine {
    ParsedLine {
        record: LogRecord::new(level, line),
        user_log: None,
    }
}

/// Extracts the text of a user `log()` call from its colored debug marker.
///
/// The marker is `ESC[1;34mLOG ESC[0m ESC[2m[<6 hex>]ESC[0m <text>`. A text written as a
/// string literal has its outer quotes stripped and inner `\"` unescaped.
pub fn unwrap_user_log(message: &str) -> Option<String> {
    let rest = message.strip_prefix(USER_LOG_PREFIX)?;
    let id = rest.get(..USER_LOG_ID_LEN)?;
    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let inner = rest[USER_LOG_ID_LEN..].strip_prefix(USER_LOG_ID_SUFFIX)?;

    let text = match inner
        .strip_prefix('"')
        .and_then(|quoted| quoted.strip_suffix('"'))
    {
        Some(unquoted) => unquoted.replace("\\\"", "\""),
        None => inner.to_string(),
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const HELLO: &str = "{\"level\":\"info\",\"msg\":\"hello\"}\n";

    fn user_log_line(inner: &str) -> String {
        let msg = format!("{}a1b2c3{}{}", USER_LOG_PREFIX, USER_LOG_ID_SUFFIX, inner);
        format!("{}\n", json!({ "level": "debug", "msg": msg }))
    }

    fn levels_and_messages(lines: &[ParsedLine]) -> Vec<(Level, String)> {
        lines
            .iter()
            .map(|line| (line.record.level, line.record.message.clone()))
            .collect()
    }

    #[test]
    fn split_object_across_chunks() {
        let mut parser = LogStreamParser::new();
        let mut lines = parser.push(HELLO.as_bytes());
        lines.extend(parser.push(br#"{"level":"error","ms"#));
        lines.extend(parser.push(b"g\":\"boom\"}\n"));

        assert_eq!(
            levels_and_messages(&lines),
            vec![
                (Level::Severity(LogLevel::Info), "hello".to_string()),
                (Level::Severity(LogLevel::Error), "boom".to_string()),
            ]
        );
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn framing_invariance() {
        let input = concat!(
            "{\"level\":\"info\",\"msg\":\"one\",\"time\":\"2024-01-01T00:00:00Z\"}\n",
            "{\"level\":\"warn\",\"msg\":\"two ✓\"}\n",
            "\n",
            "{\"level\":\"debug\",\"msg\":\"three\",\"height\":3}\r\n",
        )
        .as_bytes();

        let mut whole = LogStreamParser::new();
        let expected = whole.push(input);
        assert_eq!(expected.len(), 3);

        for chunk_size in [1, 2, 3, 7, 16] {
            let mut parser = LogStreamParser::new();
            let lines: Vec<_> = input
                .chunks(chunk_size)
                .flat_map(|chunk| parser.push(chunk))
                .collect();
            assert_eq!(lines, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn extra_fields_kept() {
        let line = parse_line(r#"{"time":"2024-01-01T00:00:00Z","level":"info","msg":"x","port":8888}"#);
        assert_eq!(line.record.fields.get("port"), Some(&json!(8888)));
        assert_eq!(
            line.record.fields.get("time"),
            Some(&json!("2024-01-01T00:00:00Z"))
        );
        assert!(!line.record.fields.contains_key("level"));
        assert!(!line.record.fields.contains_key("msg"));
    }

    #[test]
    fn malformed_line_does_not_stop_parsing() {
        let mut parser = LogStreamParser::new();
        let lines = parser.push(b"plain text\n{\"level\":\"info\",\"msg\":\"after\"}\n");

        assert_eq!(
            levels_and_messages(&lines),
            vec![
                (Level::Parser, "plain text".to_string()),
                (Level::Severity(LogLevel::Info), "after".to_string()),
            ]
        );
    }

    #[test]
    fn fallback_levels() {
        assert_eq!(parse_line(r#"{"level":"info","msg":"#).record.level, Level::JsonError);
        assert_eq!(parse_line("goroutine 1 [running]:").record.level, Level::Parser);
        assert_eq!(parse_line("42").record.level, Level::Parser);
        assert_eq!(parse_line(r#"{"msg":"no level"}"#).record.level, Level::Parser);

        assert_eq!(parse_line(r#"{"level":"warning","msg":"x"}"#).record.level, Level::Parser);

        let unknown = parse_line(r#"{"level":"loud","msg":"x"}"#);
        assert_eq!(unknown.record.level, Level::Parser);
        assert_eq!(unknown.record.message, r#"{"level":"loud","msg":"x"}"#);
    }

    #[test]
    fn user_log_unwrapped() {
        let mut parser = LogStreamParser::new();
        let lines = parser.push(user_log_line("\"say \\\"hi\\\"\"").as_bytes());

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].record.level, Level::Severity(LogLevel::Debug));
        assert!(lines[0].record.message.starts_with(USER_LOG_PREFIX));
        assert_eq!(lines[0].user_log.as_deref(), Some("say \"hi\""));
    }

    #[test]
    fn user_log_unquoted() {
        let line = parse_line(user_log_line("42").trim_end());
        assert_eq!(line.user_log.as_deref(), Some("42"));
    }

    #[test]
    fn user_log_requires_debug_and_exact_marker() {
        let info = user_log_line("x").replace("\"debug\"", "\"info\"");
        assert_eq!(parse_line(info.trim_end()).user_log, None);

        assert_eq!(unwrap_user_log("LOG [a1b2c3] x"), None);
        let bad_id = format!("{}zzzzzz{}x", USER_LOG_PREFIX, USER_LOG_ID_SUFFIX);
        assert_eq!(unwrap_user_log(&bad_id), None);
    }

    #[test]
    fn finish_flushes_and_clears() {
        let mut parser = LogStreamParser::new();
        assert!(parser.push(br#"{"level":"warn","msg":"tail"}"#).is_empty());

        let lines = parser.finish();
        assert_eq!(
            levels_and_messages(&lines),
            vec![(Level::Severity(LogLevel::Warn), "tail".to_string())]
        );
        assert!(parser.pending().is_empty());
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn long_line_in_small_chunks() {
        let msg = "x".repeat(64 * 1024);
        let line = format!("{}\n", json!({ "level": "info", "msg": msg }));

        let mut parser = LogStreamParser::new();
        let mut lines = Vec::new();
        for chunk in line.as_bytes().chunks(3) {
            lines.extend(parser.push(chunk));
            assert!(!parser.pending().contains(&b'\n'));
        }

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].record.message, msg);
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn multibyte_split() {
        let line = "{\"level\":\"info\",\"msg\":\"🌱 up\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xF0).unwrap() + 2;

        let mut parser = LogStreamParser::new();
        assert!(parser.push(&line[..split]).is_empty());
        let lines = parser.push(&line[split..]);
        assert_eq!(lines[0].record.message, "🌱 up");
    }
}
