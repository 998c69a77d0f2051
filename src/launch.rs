//! Readiness detection and termination of the emulator process.

use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::LaunchError;
use crate::events::EmulatorEvent;
use crate::network::EmulatorPorts;
use crate::probe::LivenessProbe;

/// Failure signals of one start. The readers and the exit watcher send `Error` and `Exited`
/// events here as well as to the shared event channel, so none is lost to a lagging buffer.
pub(crate) type StartSignals = mpsc::UnboundedReceiver<EmulatorEvent>;

/// Polls `probe` every `interval` until it succeeds, racing it against the fatal
/// `Error` and `Exited` events delivered on `signals`.
///
/// The first probe runs one full interval after the call. Returns the number of probes made.
/// The ticker is owned by this future, so every return path cancels it exactly once.
pub(crate) async fn wait_for_ready(
    probe: &dyn LivenessProbe,
    ports: &EmulatorPorts,
    interval: Duration,
    timeout: Option<Duration>,
    signals: &mut StartSignals,
) -> Result<u32, LaunchError> {
    let attempts = AtomicU32::new(0);
    let race = poll(probe, ports, interval, signals, &attempts);

    match timeout {
        Some(limit) => match tokio::time::timeout(limit, race).await {
            Ok(result) => result,
            Err(_) => Err(LaunchError::ReadinessTimeout {
                timeout: limit,
                attempts: attempts.load(Ordering::Relaxed),
            }),
        },
        None => race.await,
    }
}

async fn poll(
    probe: &dyn LivenessProbe,
    ports: &EmulatorPorts,
    interval: Duration,
    signals: &mut StartSignals,
    attempts: &AtomicU32,
) -> Result<u32, LaunchError> {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(event) = signals.recv() => fatal(event)?,
            _ = ticker.tick() => {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if probe.ping(ports).await {
                    // a failure seen while the probe was in flight still wins
                    while let Ok(event) = signals.try_recv() {
                        fatal(event)?;
                    }
                    return Ok(attempt);
                }
                tracing::debug!(attempt, "emulator not ready yet");
            }
        }
    }
}

fn fatal(event: EmulatorEvent) -> Result<(), LaunchError> {
    match event {
        EmulatorEvent::Error { record } => Err(LaunchError::FatalStream { record }),
        EmulatorEvent::Exited { code, .. } => Err(LaunchError::UnexpectedExit { code }),
        _ => Ok(()),
    }
}

/// Sends SIGTERM, waits up to `grace` and escalates to SIGKILL. An already exited child is
/// only reaped.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                    return status;
                }
                tracing::warn!(pid, "emulator ignored SIGTERM, sending SIGKILL");
            }
            Err(Errno::ESRCH) => return child.wait().await,
            Err(e) => tracing::warn!(pid, "SIGTERM failed: {e}"),
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    child.kill().await?;
    child.wait().await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::process::Command;

    use super::*;
    use crate::logs::{LogLevel, LogRecord};

    struct SucceedsOn(u32, AtomicU32);

    #[async_trait]
    impl LivenessProbe for SucceedsOn {
        async fn ping(&self, _: &EmulatorPorts) -> bool {
            self.1.fetch_add(1, Ordering::SeqCst) + 1 >= self.0
        }
    }

    fn ports() -> EmulatorPorts {
        EmulatorPorts::new(1, 2, 3)
    }

    fn signals() -> (mpsc::UnboundedSender<EmulatorEvent>, StartSignals) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn ready_after_n_intervals() {
        let (_tx, mut rx) = signals();
        let probe = SucceedsOn(3, AtomicU32::new(0));
        let interval = Duration::from_millis(20);

        let started = Instant::now();
        let attempts = wait_for_ready(&probe, &ports(), interval, None, &mut rx)
            .await
            .unwrap();

        assert_eq!(attempts, 3);
        assert!(started.elapsed() >= interval * 3);
    }

    #[tokio::test]
    async fn error_record_wins() {
        let (tx, mut signals) = signals();
        tx.send(EmulatorEvent::Error {
            record: LogRecord::new(LogLevel::Error, "boom"),
        })
        .unwrap();

        let probe = SucceedsOn(u32::MAX, AtomicU32::new(0));
        let result =
            wait_for_ready(&probe, &ports(), Duration::from_millis(10), None, &mut signals).await;
        assert!(matches!(
            result,
            Err(LaunchError::FatalStream { record }) if record.message == "boom"
        ));
    }

    #[tokio::test]
    async fn exit_wins_over_late_success() {
        let (tx, mut signals) = signals();
        tx.send(EmulatorEvent::Exited {
            code: Some(1),
            requested: false,
        })
        .unwrap();

        let probe = SucceedsOn(1, AtomicU32::new(0));
        let result =
            wait_for_ready(&probe, &ports(), Duration::from_millis(10), None, &mut signals).await;
        assert!(matches!(
            result,
            Err(LaunchError::UnexpectedExit { code: Some(1) })
        ));
    }

    #[tokio::test]
    async fn times_out() {
        let (_tx, mut rx) = signals();
        let probe = SucceedsOn(u32::MAX, AtomicU32::new(0));

        let result = wait_for_ready(
            &probe,
            &ports(),
            Duration::from_millis(10),
            Some(Duration::from_millis(100)),
            &mut rx,
        )
        .await;
        assert!(matches!(
            result,
            Err(LaunchError::ReadinessTimeout { attempts, .. }) if attempts > 0
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn terminate_sleeping_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_exited_child() {
        let mut child = Command::new("echo").arg("test").spawn().unwrap();
        child.wait().await.unwrap();

        let status = terminate(&mut child, Duration::from_secs(1)).await.unwrap();
        assert!(status.success());
    }
}
