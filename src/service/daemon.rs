//! Auto-commit scheduler.
//!
//! Three independent timers drive the service:
//!
//! - **check**: commit when enough inserts are pending
//! - **limit**: commit and save regardless, bounding staleness
//! - **save**: persist whatever was committed
//!
//! Each action runs on the blocking pool and is awaited, so a commit that has
//! started always completes even if the loop is cancelled meanwhile.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::IndexService;
use crate::error::{AgentError, Result};

const ERROR_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Action {
    Check,
    CreateAndSave,
    Save,
}

/// Running auto-commit loop. Dropping the handle does not stop the loop;
/// call [`AutoCommit::stop`] or cancel the token given to `start`.
pub struct AutoCommit {
    token: CancellationToken,
    task: JoinHandle<()>,
    errors: mpsc::Receiver<AgentError>,
}

impl AutoCommit {
    /// Next error reported by the loop; `None` once the loop has exited.
    pub async fn next_error(&mut self) -> Option<AgentError> {
        self.errors.recv().await
    }

    pub fn try_next_error(&mut self) -> Option<AgentError> {
        self.errors.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for it, including any action in flight.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!("auto-commit task ended abnormally: {err}");
        }
    }
}

fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

impl IndexService {
    /// Start the auto-commit loop on the current tokio runtime.
    ///
    /// Returns `None` when auto-commit is disabled by configuration.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> Option<AutoCommit> {
        if !self.config.auto_commit_enabled() {
            tracing::info!("auto-commit disabled");
            return None;
        }

        let (tx, rx) = mpsc::channel(ERROR_BUFFER);
        let task = tokio::spawn(run(Arc::clone(self), token.clone(), tx));
        Some(AutoCommit {
            token,
            task,
            errors: rx,
        })
    }

    fn run_action(&self, action: Action) -> Result<()> {
        let pool_size = self.config.default_pool_size;
        match action {
            Action::Check => {
                if self.pending_insert_count() >= self.config.auto_index_length {
                    self.create_index(pool_size)
                } else {
                    Ok(())
                }
            }
            Action::CreateAndSave => self.create_and_save_index(pool_size),
            Action::Save => self.save_index(),
        }
    }
}

async fn run(service: Arc<IndexService>, token: CancellationToken, errors: mpsc::Sender<AgentError>) {
    let delay = service.config.initial_delay();
    if !delay.is_zero() {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut check = ticker(service.config.auto_index_check_duration());
    let mut limit = ticker(service.config.auto_index_duration_limit());
    let mut save = ticker(service.config.auto_save_index_duration());
    tracing::info!("auto-commit started");

    loop {
        let action = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tick(&mut limit) => Action::CreateAndSave,
            _ = tick(&mut check) => Action::Check,
            _ = tick(&mut save) => Action::Save,
        };

        let svc = Arc::clone(&service);
        let result = match tokio::task::spawn_blocking(move || svc.run_action(action)).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!("auto-commit {action:?} panicked: {err}");
                continue;
            }
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_uncommitted_index_not_found() => {}
            Err(err) => {
                tracing::warn!("auto-commit {action:?} failed: {err}");
                if errors.try_send(err).is_err() {
                    tracing::debug!("auto-commit error dropped: receiver full or gone");
                }
            }
        }
    }

    tracing::info!("auto-commit stopped");
}
