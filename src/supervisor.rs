// src/supervisor.rs
//
// =============================================================================
// RELAXRUN: PROCESS SUPERVISOR
// =============================================================================
//
// Runs one child to completion or kills it.
//
// The poll loop watches three things besides liveness:
// - the primary output file must appear within 3 poll intervals;
// - its mtime must not predate the launch (a stale file from a previous run);
// - the global walltime deadline, with a 5-poll safety margin to leave time
//   for checkpointing and file moves.

use crate::errors::ComputeError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Child;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Child exited by itself; code -1 if killed by a signal.
    Finished(i32),
    /// Deadline margin reached; child was terminated.
    WalltimeExpired,
    /// Output file exists but predates this launch.
    StaleOutput,
    /// No output file appeared within 3 poll intervals.
    OutputMissing,
    /// External interrupt; treated exactly like a walltime kill.
    Cancelled,
}

/// What came back from one supervised child.
#[derive(Debug)]
pub struct SupervisedRun {
    pub state: ExitState,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SupervisedRun {
    pub fn finished_cleanly(&self) -> bool {
        matches!(self.state, ExitState::Finished(0))
    }
}

#[derive(Clone)]
pub struct Supervisor {
    polltime: Duration,
    max_walltime: Option<Duration>,
    start_time: Option<Instant>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        polltime: Duration,
        max_walltime: Option<Duration>,
        start_time: Option<Instant>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            polltime,
            max_walltime,
            start_time,
            shutdown,
        }
    }

    /// Poll the child until it exits or a deadline fires. On any non-Finished
    /// state the child is terminated and reaped before returning, so the
    /// filesystem is safe to clean up afterwards.
    pub async fn supervise(
        &self,
        mut child: Child,
        output_file: &Path,
        seed: &str,
    ) -> Result<SupervisedRun, ComputeError> {
        let launched_at = Instant::now();
        let launched_wall = SystemTime::now();
        log::info!(target: seed, "polling process every {:?}", self.polltime);

        loop {
            sleep(self.polltime).await;

            if self.shutdown.load(Ordering::SeqCst) {
                log::warn!(target: seed, "interrupt received, terminating child");
                return self.terminate(child, ExitState::Cancelled).await;
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    let output = child.wait_with_output().await.map_err(|e| {
                        ComputeError::StructureFailed(format!("failed to drain child: {e}"))
                    })?;
                    let code = status.code().unwrap_or(-1);
                    log::debug!(target: seed, "process returned {code}");
                    return Ok(SupervisedRun {
                        state: ExitState::Finished(code),
                        exit_code: Some(code),
                        stdout: output.stdout,
                        stderr: output.stderr,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ComputeError::StructureFailed(format!(
                        "lost track of child process: {e}"
                    )))
                }
            }

            if launched_at.elapsed() > 3 * self.polltime {
                if !output_file.exists() {
                    log::error!(
                        target: seed,
                        "output file {} was never created; check the executable",
                        output_file.display()
                    );
                    return self.terminate(child, ExitState::OutputMissing).await;
                }
                let stale = std::fs::metadata(output_file)
                    .and_then(|m| m.modified())
                    .map(|mtime| mtime < launched_wall)
                    .unwrap_or(false);
                if stale {
                    log::error!(
                        target: seed,
                        "output file {} is older than this process; check the executable",
                        output_file.display()
                    );
                    return self.terminate(child, ExitState::StaleOutput).await;
                }
            }

            if let (Some(walltime), Some(start)) = (self.max_walltime, self.start_time) {
                let elapsed = start.elapsed();
                let margin = 5 * self.polltime;
                log::debug!(
                    target: seed,
                    "{:?} of walltime remaining",
                    walltime.saturating_sub(elapsed)
                );
                if elapsed + margin > walltime {
                    log::info!(target: seed, "about to run out of walltime, killing early");
                    return self.terminate(child, ExitState::WalltimeExpired).await;
                }
            }
        }
    }

    /// Kill, reap and report. Termination must leave the child fully gone so
    /// lock removal and file copies that follow see a quiescent directory.
    async fn terminate(
        &self,
        mut child: Child,
        state: ExitState,
    ) -> Result<SupervisedRun, ComputeError> {
        // The child may have exited between the poll and the kill.
        let _ = child.start_kill();
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ComputeError::StructureFailed(format!("failed to reap child: {e}")))?;

        Ok(SupervisedRun {
            state,
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn quick_supervisor(
        poll_ms: u64,
        walltime_ms: Option<u64>,
        shutdown: Arc<AtomicBool>,
    ) -> Supervisor {
        Supervisor::new(
            Duration::from_millis(poll_ms),
            walltime_ms.map(Duration::from_millis),
            walltime_ms.map(|_| Instant::now()),
            shutdown,
        )
    }

    fn spawn_sleep(seconds: &str) -> Child {
        tokio::process::Command::new("sleep")
            .arg(seconds)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("sleep must be spawnable")
    }

    #[tokio::test]
    async fn short_child_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seed.castep");
        std::fs::File::create(&out).unwrap().write_all(b"x").unwrap();

        let sup = quick_supervisor(20, None, Arc::new(AtomicBool::new(false)));
        let run = sup
            .supervise(spawn_sleep("0.05"), &out, "seed")
            .await
            .unwrap();
        assert_eq!(run.state, ExitState::Finished(0));
        assert!(run.finished_cleanly());
    }

    #[tokio::test]
    async fn missing_output_is_detected_after_three_polls() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seed.castep");

        let sup = quick_supervisor(20, None, Arc::new(AtomicBool::new(false)));
        let run = sup.supervise(spawn_sleep("5"), &out, "seed").await.unwrap();
        assert_eq!(run.state, ExitState::OutputMissing);
    }

    /// Child that keeps refreshing the output file, like a busy simulator.
    fn spawn_toucher(path: &std::path::Path) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!(
                "for i in $(seq 1 1000); do touch '{}'; sleep 0.01; done",
                path.display()
            ))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("sh must be spawnable")
    }

    #[tokio::test]
    async fn walltime_margin_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seed.castep");
        let started = Instant::now();

        let sup = quick_supervisor(20, Some(500), Arc::new(AtomicBool::new(false)));
        let run = sup
            .supervise(spawn_toucher(&out), &out, "seed")
            .await
            .unwrap();
        assert_eq!(run.state, ExitState::WalltimeExpired);
        // Fired at deadline minus margin, long before the child would end.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stale_output_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seed.castep");
        std::fs::File::create(&out).unwrap().write_all(b"old").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let sup = quick_supervisor(20, None, Arc::new(AtomicBool::new(false)));
        let run = sup.supervise(spawn_sleep("5"), &out, "seed").await.unwrap();
        assert_eq!(run.state, ExitState::StaleOutput);
    }

    #[tokio::test]
    async fn interrupt_is_treated_like_walltime() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seed.castep");
        std::fs::File::create(&out).unwrap().write_all(b"x").unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        shutdown.store(true, Ordering::SeqCst);
        let sup = quick_supervisor(20, None, shutdown);
        let run = sup.supervise(spawn_sleep("5"), &out, "seed").await.unwrap();
        assert_eq!(run.state, ExitState::Cancelled);
    }
}
