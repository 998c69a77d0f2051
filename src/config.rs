//! Emulator settings and invocation arguments

use std::path::PathBuf;
use std::time::Duration;

use crate::events::DEFAULT_CAPACITY;
use crate::network::{EmulatorPorts, PortOverrides};

pub(crate) const DEFAULT_BIN: &str = "flow";
pub(crate) const DEFAULT_SUBCOMMAND: &str = "emulator";

/// Emulator supervisor configuration
///
/// Use `emulator_bin` to specify the path to the binary.
/// If it is in $PATH, `None` can be specified to run "flow".
///
/// Use `readiness_timeout` to bound how long `start` polls. `None` polls until the process
/// succeeds or fails.
#[derive(Clone, Debug)]
pub struct EmulatorConfig {
    /// Emulator binary location
    pub emulator_bin: Option<PathBuf>,
    /// Arguments placed before the generated ones
    pub subcommand: Vec<String>,
    /// Working directory of the child, the caller's by default
    pub working_dir: Option<PathBuf>,
    /// Delay between readiness probes
    pub probe_interval: Duration,
    /// Overall readiness deadline
    pub readiness_timeout: Option<Duration>,
    /// Time allowed between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            emulator_bin: None,
            subcommand: vec![DEFAULT_SUBCOMMAND.to_string()],
            working_dir: None,
            probe_interval: Duration::from_millis(100),
            readiness_timeout: Some(Duration::from_secs(60)),
            stop_grace: Duration::from_secs(2),
            event_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl EmulatorConfig {
    /// Binary to launch.
    pub fn bin(&self) -> PathBuf {
        self.emulator_bin
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BIN))
    }
}

/// Options for a single `start`.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Extra emulator flags, whitespace separated
    pub flags: String,
    /// Echo emulator output to the console
    pub logging: bool,
    /// Fixed ports
    pub ports: PortOverrides,
}

/// Builds the full emulator argument list.
pub(crate) fn emulator_args(
    subcommand: &[String],
    ports: &EmulatorPorts,
    flags: &str,
) -> Vec<String> {
    let mut args = subcommand.to_vec();
    args.extend([
        "-v".to_string(),
        "--log-format=JSON".to_string(),
        format!("--rest-port={}", ports.rest()),
        format!("--admin-port={}", ports.admin()),
        format!("--port={}", ports.grpc()),
    ]);
    args.extend(flags.split_ascii_whitespace().map(str::to_string));
    args
}
