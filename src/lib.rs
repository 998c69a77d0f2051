#![warn(missing_docs)]
//! Flow Localnet
//!
//! Launches a local Flow emulator for tests and supervises it until it is stopped.
//!
//! An [`Emulator`] owns exactly one child process per start. [`Emulator::start`] reserves
//! ports, spawns the emulator, parses its JSON log output and resolves once the REST API
//! answers. Emulator output is published on an [`EventChannel`] and can be echoed to the
//! console through level filters.
//!
//! ```ignore (requires the flow cli)
//! let mut emulator = Emulator::default();
//! emulator
//!     .start(StartOptions {
//!         logging: true,
//!         ..Default::default()
//!     })
//!     .await?;
//! emulator.add_filter("info");
//! emulator.stop().await;
//! ```

pub mod config;
pub mod emulator;
pub mod error;
pub mod events;
pub(crate) mod launch;
pub mod logs;
pub mod network;
pub mod parser;
pub mod probe;

pub use config::{EmulatorConfig, StartOptions};
pub use emulator::{Emulator, LifecycleState, ProcessHandle};
pub use error::LaunchError;
pub use events::{EmulatorEvent, EventChannel, EventKind, Subscription};
pub use logs::{ConsoleSink, FilterSet, Level, LogLevel, LogRecord, StdoutSink, Stream};
pub use network::{EmulatorPorts, Port, PortOverrides};
pub use parser::{LogStreamParser, ParsedLine};
pub use probe::{LivenessProbe, RestProbe};
