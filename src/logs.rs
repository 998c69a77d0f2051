//! Log records, console echo and the stream reader tasks that feed them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use portpicker::Port;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{EmulatorEvent, EventChannel};
use crate::parser::{LogStreamParser, ParsedLine};

const READ_BUFFER_SIZE: usize = 4096;

/// Pseudo-level name used to filter unwrapped user logs.
pub const USER_LOG_LEVEL: &str = "log";

/// Emulator log severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum LogLevel {
    /// trace
    Trace = -1,
    /// debug
    Debug = 0,
    /// info
    Info = 1,
    /// warn
    Warn = 2,
    /// error
    Error = 3,
    /// fatal
    Fatal = 4,
    /// panic
    Panic = 5,
}

impl LogLevel {
    /// Numeric severity.
    pub fn severity(self) -> i8 {
        self as i8
    }

    /// Lowercase name as written on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Panic => "panic",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a level string is not one of the known severities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown log level \"{0}\"")]
pub struct UnknownLevel(
    /// Rejected level name
    pub String,
);

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "panic" => Ok(Self::Panic),
            other => Err(UnknownLevel(other.to_string())),
        }
    }
}

/// Level attached to a [`LogRecord`].
///
/// Lines that could not be decoded carry one of the fallback levels instead of a severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    /// A severity reported by the emulator
    Severity(LogLevel),
    /// Fallback for lines that are not a log object
    Parser,
    /// Fallback for lines that looked like JSON but failed to parse
    JsonError,
}

impl Level {
    /// Name used for display and filtering.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Severity(level) => level.as_str(),
            Self::Parser => "parser",
            Self::JsonError => "JSON Error",
        }
    }

    /// `true` for `error` and anything more severe.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Severity(level) if *level >= LogLevel::Error)
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        Self::Severity(level)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed unit of emulator output.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    /// Record level
    pub level: Level,
    /// Message text
    pub message: String,
    /// Every other field of the wire object, including `time`
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Creates a record without auxiliary fields.
    pub fn new(level: impl Into<Level>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            fields: Map::new(),
        }
    }
}

/// Output stream a record was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stream = match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        };
        write!(f, "{}", stream)
    }
}

/// Allow-list of level names echoed to the console. Empty means everything passes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSet {
    levels: BTreeSet<String>,
}

impl FilterSet {
    /// Adds a level name.
    pub fn insert(&mut self, level: &str) {
        self.levels.insert(level.to_string());
    }

    /// Removes a level name.
    pub fn remove(&mut self, level: &str) {
        self.levels.remove(level);
    }

    /// Removes every level name.
    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Whether records named `level` should be echoed.
    pub fn allows(&self, level: &str) -> bool {
        self.levels.is_empty() || self.levels.contains(level)
    }
}

/// Destination for echoed emulator output.
pub trait ConsoleSink: Send + Sync {
    /// Writes one line.
    fn write_line(&self, line: &str);
}

/// Prints echoed lines to stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("{}", line);
    }
}

/// Console echo state shared by the supervisor and its reader tasks.
pub(crate) struct Console {
    logging: AtomicBool,
    filters: Mutex<FilterSet>,
    announced: AtomicBool,
    sink: Arc<dyn ConsoleSink>,
}

impl Console {
    pub(crate) fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            logging: AtomicBool::new(false),
            filters: Mutex::new(FilterSet::default()),
            announced: AtomicBool::new(false),
            sink,
        }
    }

    pub(crate) fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn logging(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    /// Arms the one-time "up" notice for a new start.
    pub(crate) fn reset_announcement(&self) {
        self.announced.store(false, Ordering::Relaxed);
    }

    pub(crate) fn update_filters(&self, update: impl FnOnce(&mut FilterSet)) {
        let mut filters = self.filters.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut *filters);
    }

    pub(crate) fn filters(&self) -> FilterSet {
        self.filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn allows(&self, level: &str) -> bool {
        self.logging()
            && self
                .filters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .allows(level)
    }

    /// Echoes a parsed line according to the logging flag and filters.
    pub(crate) fn echo(&self, line: &ParsedLine, fatal: bool, rest_port: Port) {
        if !self.logging() {
            return;
        }

        let record = &line.record;
        match &line.user_log {
            Some(text) if self.allows(USER_LOG_LEVEL) => {
                self.sink.write_line(&format!("LOG: {}", text));
            }
            Some(_) => {}
            None if self.allows(record.level.name()) => {
                if fatal {
                    self.sink
                        .write_line(&format!("EMULATOR ERROR: {}", record.message));
                } else {
                    self.sink
                        .write_line(&format!("{}: {}", record.level, record.message));
                }
            }
            None => {}
        }

        if announces_listening(record, rest_port)
            && !self.announced.swap(true, Ordering::Relaxed)
        {
            self.sink.write_line(&format!(
                "EMULATOR IS UP! Listening on port {}",
                rest_port
            ));
        }
    }
}

/// Whether `record` reports that the REST API is listening on `rest_port`.
pub(crate) fn announces_listening(record: &LogRecord, rest_port: Port) -> bool {
    if !record.message.contains("Start") {
        return false;
    }
    let port_field = record.fields.get("port").and_then(Value::as_u64);
    port_field == Some(u64::from(rest_port)) || record.message.contains(&rest_port.to_string())
}

/// Spawns a task that parses `stream` and publishes every record.
///
/// Error-level records read from stderr are also published as [`EmulatorEvent::Error`] and
/// sent to `startup`, which stops listening once the start has settled.
pub(crate) fn spawn_stream_reader(
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    stream: Stream,
    rest_port: Port,
    console: Arc<Console>,
    events: EventChannel,
    startup: mpsc::UnboundedSender<EmulatorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut parser = LogStreamParser::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let lines = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => parser.push(&buf[..n]),
                Err(e) => {
                    tracing::debug!(%stream, error = %e, "log stream reader exiting due to read error");
                    break;
                }
            };
            for line in lines {
                dispatch(line, stream, rest_port, &console, &events, &startup);
            }
        }

        for line in parser.finish() {
            dispatch(line, stream, rest_port, &console, &events, &startup);
        }
        tracing::debug!(%stream, "log stream reader task exiting");
    })
}

fn dispatch(
    line: ParsedLine,
    stream: Stream,
    rest_port: Port,
    console: &Console,
    events: &EventChannel,
    startup: &mpsc::UnboundedSender<EmulatorEvent>,
) {
    let fatal = stream == Stream::Stderr && line.record.level.is_error();
    tracing::trace!(%stream, level = %line.record.level, "{}", line.record.message);
    console.echo(&line, fatal, rest_port);

    if fatal {
        let error = EmulatorEvent::Error {
            record: line.record.clone(),
        };
        // closed once the start has settled
        let _ = startup.send(error.clone());
        events.publish(error);
    }
    if let Some(text) = line.user_log {
        events.publish(EmulatorEvent::Log { stream, text });
    }
    events.publish(EmulatorEvent::Message {
        stream,
        record: line.record,
    });
}
