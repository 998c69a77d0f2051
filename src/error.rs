use std::time::Duration;

use portpicker::Port;

use crate::{emulator::LifecycleState, logs::LogRecord};

/// Errors associated with launching the emulator
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    /// No free ports could be obtained from the OS
    #[error("Failed to allocate {count} free ports: {source}")]
    Allocation {
        /// Number of ports requested
        count: usize,
        /// Bind error
        #[source]
        source: std::io::Error,
    },
    /// A fixed port override is already bound by another process
    #[error("Fixed port {port} is not free!")]
    PortInUse {
        /// Requested port
        port: Port,
    },
    /// The emulator binary could not be launched
    #[error("Failed to spawn {bin}: {source}")]
    Spawn {
        /// Binary that was invoked
        bin: String,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },
    /// The emulator reported a fatal error on stderr before it became ready
    #[error("Emulator failed during launch.\nStderr record: {} {}", .record.level, .record.message)]
    FatalStream {
        /// The record that signalled the failure
        record: LogRecord,
    },
    /// The emulator exited before it became ready
    #[error("Emulator exited during launch.\nExit code: {code:?}")]
    UnexpectedExit {
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
    },
    /// The readiness probe never succeeded within the configured timeout
    #[error("Emulator was not ready after {timeout:?} ({attempts} probe attempts)")]
    ReadinessTimeout {
        /// Configured readiness timeout
        timeout: Duration,
        /// Number of probes made before giving up
        attempts: u32,
    },
    /// `start` was called while a previous cycle is still live
    #[error("Emulator is already {state}")]
    AlreadyRunning {
        /// Current lifecycle state
        state: LifecycleState,
    },
}
