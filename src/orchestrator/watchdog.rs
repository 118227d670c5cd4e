//! Background watchdog for resource limits and pause requests.
//!
//! The watchdog never stops work itself. It cancels a shared token; the
//! control loop and the role agents observe it at safe points (between tool
//! calls, between model retries, between steps) and the loop then pauses.

use crate::phase::PauseReason;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Limits that pause a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_iterations: u32,
    /// Wall-clock budget of one run (start or resume).
    pub max_runtime: Option<Duration>,
    pub max_commits: u32,
}

impl Limits {
    /// The first limit reached, if any. Iterations and commits are session
    /// totals.
    pub fn breach(&self, iterations: u32, commits: u32, runtime: Duration) -> Option<PauseReason> {
        if iterations >= self.max_iterations {
            Some(PauseReason::MaxIterations)
        } else if commits >= self.max_commits {
            Some(PauseReason::MaxCommits)
        } else if self.max_runtime.is_some_and(|max| runtime >= max) {
            Some(PauseReason::MaxRuntime)
        } else {
            None
        }
    }
}

/// Shared view of the watchdog, cheap to clone.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<PauseReason>>>,
    iterations: Arc<AtomicU32>,
    commits: Arc<AtomicU32>,
    started: Instant,
}

impl WatchdogHandle {
    pub fn new(iterations: u32, commits: u32) -> Self {
        Self {
            cancel: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            iterations: Arc::new(AtomicU32::new(iterations)),
            commits: Arc::new(AtomicU32::new(commits)),
            started: Instant::now(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_tripped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the watchdog tripped. The first reason wins.
    pub fn reason(&self) -> Option<PauseReason> {
        self.reason.lock().map(|r| *r).unwrap_or(Some(PauseReason::Requested))
    }

    /// Request a pause at the next safe point.
    pub fn trip(&self, reason: PauseReason) {
        if let Ok(mut slot) = self.reason.lock()
            && slot.is_none()
        {
            *slot = Some(reason);
            tracing::warn!(%reason, "Pausing at the next safe point");
        }
        self.cancel.cancel();
    }

    /// Publish the loop's counters to the watchdog.
    pub fn record_progress(&self, iterations: u32, commits: u32) {
        self.iterations.store(iterations, Ordering::SeqCst);
        self.commits.store(commits, Ordering::SeqCst);
    }

    /// Wall-clock time since this run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Trip if any limit is reached; returns the reason.
    pub fn check(&self, limits: &Limits) -> Option<PauseReason> {
        let breach = limits.breach(
            self.iterations.load(Ordering::SeqCst),
            self.commits.load(Ordering::SeqCst),
            self.elapsed(),
        );
        if let Some(reason) = breach {
            self.trip(reason);
        }
        breach
    }
}

/// The background task. Dropping or stopping it leaves the handle usable.
pub struct Watchdog {
    handle: WatchdogHandle,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Spawn the watchdog. It polls the limits and `pause_file` every
    /// `poll`, and trips on Ctrl-C.
    pub fn spawn(handle: WatchdogHandle, limits: Limits, pause_file: Option<PathBuf>, poll: Duration) -> Self {
        let watched = handle.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            let mut listen_ctrl_c = true;
            loop {
                tokio::select! {
                    _ = watched.cancel.cancelled() => break,
                    signal = tokio::signal::ctrl_c(), if listen_ctrl_c => match signal {
                        Ok(()) => {
                            watched.trip(PauseReason::Requested);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!("Ctrl-C handler unavailable: {}", e);
                            listen_ctrl_c = false;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Some(path) = &pause_file
                            && path.exists()
                        {
                            tracing::info!(path = %path.display(), "Pause requested");
                            watched.trip(PauseReason::Requested);
                            break;
                        }
                        if watched.check(&limits).is_some() {
                            break;
                        }
                    }
                }
            }
        });
        Self { handle, task }
    }

    pub fn handle(&self) -> &WatchdogHandle {
        &self.handle
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
