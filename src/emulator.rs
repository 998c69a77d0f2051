//! Module for the struct that represents and manages the emulator process.

use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use getset::{CopyGetters, Getters};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{self, EmulatorConfig, StartOptions};
use crate::error::LaunchError;
use crate::events::{EmulatorEvent, EventChannel, EventKind, Subscription};
use crate::launch;
use crate::logs::{self, Console, ConsoleSink, FilterSet, StdoutSink, Stream};
use crate::network::{self, EmulatorPorts};
use crate::probe::{LivenessProbe, RestProbe};

/// Lifecycle of one emulator cycle.
///
/// `Stopped -> Starting -> Running -> Stopped`, or `Starting -> Failed`.
/// A new `start` is allowed from `Stopped` and `Failed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No process
    #[default]
    Stopped,
    /// Spawned, waiting for readiness
    Starting,
    /// Ready and serving
    Running,
    /// Startup failed
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        write!(f, "{}", state)
    }
}

#[derive(Clone, Debug, Default)]
struct SharedState(Arc<Mutex<LifecycleState>>);

impl SharedState {
    fn get(&self) -> LifecycleState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: LifecycleState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves to `to` only when currently in `from`.
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Records an exit nobody asked for. A cycle that is still live becomes `Stopped`.
    fn exited(&self) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, LifecycleState::Starting | LifecycleState::Running) {
            *state = LifecycleState::Stopped;
            true
        } else {
            false
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self.get(),
            LifecycleState::Starting | LifecycleState::Running
        )
    }
}

/// The live child process and the tasks attached to it.
#[derive(CopyGetters)]
pub struct ProcessHandle {
    /// OS process id
    #[getset(get_copy = "pub")]
    pid: Option<u32>,
    /// Ports the process was launched with
    #[getset(get_copy = "pub")]
    ports: EmulatorPorts,
    stop_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<Option<i32>>,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl ProcessHandle {
    /// Whether the process has exited.
    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished()
    }

    /// Terminates the process and waits for its readers to drain. Returns the exit code.
    async fn shutdown(mut self) -> Option<i32> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }

        let code = match (&mut self.watcher).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("emulator watcher cannot be awaited: {e}");
                None
            }
        };

        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(self.grace, &mut reader).await.is_err() {
                tracing::warn!("log reader still open after shutdown, aborting");
                reader.abort();
            }
        }

        code
    }
}

/// This struct is used to represent and manage one emulator process.
///
/// Dropping a running `Emulator` terminates its process. Use [`Emulator::stop`] to also
/// wait for the shutdown to finish.
#[derive(Getters)]
pub struct Emulator {
    /// Supervisor configuration
    #[getset(get = "pub")]
    config: EmulatorConfig,
    /// Event channel shared with the stream readers
    #[getset(get = "pub")]
    events: EventChannel,
    handle: Option<ProcessHandle>,
    state: SharedState,
    console: Arc<Console>,
    probe: Arc<dyn LivenessProbe>,
}

impl Emulator {
    /// Creates a stopped supervisor probing the REST API for readiness.
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            events: EventChannel::new(config.event_capacity),
            config,
            handle: None,
            state: SharedState::default(),
            console: Arc::new(Console::new(Arc::new(StdoutSink))),
            probe: Arc::new(RestProbe::default()),
        }
    }

    /// Replaces the readiness probe.
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces where echoed output is written. Resets logging and filters.
    pub fn with_console_sink(mut self, sink: Arc<dyn ConsoleSink>) -> Self {
        self.console = Arc::new(Console::new(sink));
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Handle of the current process. `None` once it has stopped or exited on its own.
    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref().filter(|_| self.state.is_live())
    }

    /// Ports of the current process.
    pub fn ports(&self) -> Option<EmulatorPorts> {
        self.handle().map(ProcessHandle::ports)
    }

    /// Launches the emulator and waits until the readiness probe succeeds.
    ///
    /// Fails if the process reports an error on stderr, exits, or the readiness timeout
    /// elapses first. The process is terminated before the error is returned.
    pub async fn start(&mut self, options: StartOptions) -> Result<(), LaunchError> {
        let state = self.state.get();
        if matches!(state, LifecycleState::Starting | LifecycleState::Running) {
            return Err(LaunchError::AlreadyRunning { state });
        }
        if let Some(stale) = self.handle.take() {
            stale.shutdown().await;
        }

        self.console.set_logging(options.logging);
        self.console.reset_announcement();
        self.state.set(LifecycleState::Starting);

        match self.launch(&options).await {
            Ok(ports) => {
                self.events.publish(EmulatorEvent::Ready { ports });
                tracing::info!(
                    rest = ports.rest(),
                    admin = ports.admin(),
                    grpc = ports.grpc(),
                    "emulator is ready"
                );
                Ok(())
            }
            Err(e) => {
                if let Some(handle) = self.handle.take() {
                    handle.shutdown().await;
                }
                self.state.set(LifecycleState::Failed);
                tracing::error!("emulator failed to start: {e}");
                Err(e)
            }
        }
    }

    async fn launch(&mut self, options: &StartOptions) -> Result<EmulatorPorts, LaunchError> {
        let ports = network::resolve_ports(&options.ports)?;
        let bin = self.config.bin();
        let args = config::emulator_args(&self.config.subcommand, &ports, &options.flags);

        let mut command = Command::new(&bin);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        // created before spawning so no early failure is missed
        let (startup, mut signals) = mpsc::unbounded_channel();

        tracing::debug!(bin = %bin.display(), ?args, "spawning emulator");
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            bin: bin.display().to_string(),
            source,
        })?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(logs::spawn_stream_reader(
                stdout,
                Stream::Stdout,
                ports.rest(),
                self.console.clone(),
                self.events.clone(),
                startup.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(logs::spawn_stream_reader(
                stderr,
                Stream::Stderr,
                ports.rest(),
                self.console.clone(),
                self.events.clone(),
                startup.clone(),
            ));
        }

        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = spawn_exit_watcher(
            child,
            stop_rx,
            self.config.stop_grace,
            self.state.clone(),
            self.events.clone(),
            startup,
        );
        self.handle = Some(ProcessHandle {
            pid,
            ports,
            stop_tx: Some(stop_tx),
            watcher,
            readers,
            grace: self.config.stop_grace,
        });

        let attempts = launch::wait_for_ready(
            self.probe.as_ref(),
            &ports,
            self.config.probe_interval,
            self.config.readiness_timeout,
            &mut signals,
        )
        .await?;
        tracing::debug!(attempts, "readiness probe succeeded");

        if !self
            .state
            .transition(LifecycleState::Starting, LifecycleState::Running)
        {
            // the watcher saw the process die after the last probe
            while let Some(event) = signals.recv().await {
                if let EmulatorEvent::Exited { code, .. } = event {
                    return Err(LaunchError::UnexpectedExit { code });
                }
            }
            return Err(LaunchError::UnexpectedExit { code: None });
        }

        Ok(ports)
    }

    /// Terminates the process. Calling it on a stopped emulator does nothing.
    pub async fn stop(&mut self) {
        match self.handle.take() {
            Some(handle) => {
                let code = handle.shutdown().await;
                tracing::info!(?code, "emulator successfully shut down");
            }
            None => tracing::debug!("emulator is not running"),
        }
        self.state.set(LifecycleState::Stopped);
    }

    /// Turns console echo on or off. Events are published either way.
    pub fn set_logging(&self, enabled: bool) {
        self.console.set_logging(enabled);
    }

    /// Whether console echo is on.
    pub fn logging(&self) -> bool {
        self.console.logging()
    }

    /// Allows records of `level` through to the console.
    pub fn add_filter(&self, level: &str) {
        self.console.update_filters(|filters| filters.insert(level));
    }

    /// Stops allowing records of `level` through to the console.
    pub fn remove_filter(&self, level: &str) {
        self.console.update_filters(|filters| filters.remove(level));
    }

    /// Echoes every level again.
    pub fn clear_filters(&self) {
        self.console.update_filters(FilterSet::clear);
    }

    /// Current console filters.
    pub fn filters(&self) -> FilterSet {
        self.console.filters()
    }

    /// Subscribes to the given event kinds. An empty slice subscribes to everything.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.events.subscribe(kinds)
    }

    /// Subscribes to every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.events.subscribe_all()
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Emulator::new(EmulatorConfig::default())
    }
}

/// Owns the child until it exits, either on its own or after a stop request.
/// Dropping the stop sender counts as a request.
fn spawn_exit_watcher(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    state: SharedState,
    events: EventChannel,
    startup: mpsc::UnboundedSender<EmulatorEvent>,
) -> JoinHandle<Option<i32>> {
    tokio::spawn(async move {
        let (status, requested) = tokio::select! {
            status = child.wait() => (status, false),
            _ = &mut stop_rx => (launch::terminate(&mut child, grace).await, true),
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!("emulator cannot be awaited: {e}");
                None
            }
        };
        if !requested {
            tracing::warn!(?code, "emulator exited unexpectedly");
            state.exited();
        }

        let exited = EmulatorEvent::Exited { code, requested };
        let _ = startup.send(exited.clone());
        events.publish(exited);
        code
    })
}
