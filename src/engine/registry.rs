//! Process-wide table of the run currently streaming on each channel.
//!
//! Control requests (stop buttons, model switches, the reaper) arrive without
//! a reference to the owning session and go through here. The registry never
//! closes a connection itself: hard stops fire the run's cancellation token
//! and the owner tears the connection down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionControl;

pub struct ActiveRun {
    control: Arc<dyn ConnectionControl>,
    cancellation: CancellationToken,
    started_at: Instant,
    interrupted: AtomicBool,
}

impl ActiveRun {
    pub fn new(control: Arc<dyn ConnectionControl>, cancellation: CancellationToken) -> Self {
        Self {
            control,
            cancellation,
            started_at: Instant::now(),
            interrupted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_started_at(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn control(&self) -> &Arc<dyn ConnectionControl> {
        &self.control
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ActiveRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRun")
            .field("started_at", &self.started_at)
            .field("interrupted", &self.is_interrupted())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ActiveRunRegistry {
    runs: Mutex<HashMap<String, Arc<ActiveRun>>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `run` as the channel's active run, replacing any previous one.
    pub fn register(&self, channel_id: &str, run: ActiveRun) -> Arc<ActiveRun> {
        let run = Arc::new(run);
        self.runs
            .lock()
            .insert(channel_id.to_string(), Arc::clone(&run));
        tracing::debug!(channel = channel_id, "Registered active run");
        run
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        self.runs.lock().contains_key(channel_id)
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<ActiveRun>> {
        self.runs.lock().get(channel_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the channel's entry. With `expected`, only when that exact
    /// instance is still the stored one, so a late completion cannot clear a
    /// newer run's registration.
    pub fn clear(&self, channel_id: &str, expected: Option<&Arc<ActiveRun>>) -> bool {
        let mut runs = self.runs.lock();
        let matches = match (runs.get(channel_id), expected) {
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            runs.remove(channel_id);
        }
        matches
    }

    /// Soft stop: ask the agent to end the current turn.
    pub async fn interrupt(&self, channel_id: &str) -> bool {
        let Some(run) = self.get(channel_id) else {
            return false;
        };
        run.interrupted.store(true, Ordering::SeqCst);
        match run.control.interrupt().await {
            Ok(()) => {
                tracing::info!(channel = channel_id, "Interrupted active run");
                true
            }
            Err(e) => {
                run.interrupted.store(false, Ordering::SeqCst);
                tracing::warn!(channel = channel_id, "Interrupt failed: {e}");
                false
            }
        }
    }

    /// Hard stop: fire the run's cancellation token and drop the entry.
    pub fn abort(&self, channel_id: &str) -> bool {
        let Some(run) = self.runs.lock().remove(channel_id) else {
            return false;
        };
        run.cancellation.cancel();
        tracing::info!(channel = channel_id, "Aborted active run");
        true
    }

    pub fn abort_all(&self) -> Vec<String> {
        let drained: Vec<(String, Arc<ActiveRun>)> = self.runs.lock().drain().collect();
        let mut channels = Vec::with_capacity(drained.len());
        for (channel_id, run) in drained {
            run.cancellation.cancel();
            channels.push(channel_id);
        }
        channels.sort();
        if !channels.is_empty() {
            tracing::info!(count = channels.len(), "Aborted all active runs");
        }
        channels
    }

    /// Abort every run that started more than `max_age` before `now`.
    pub fn abort_older_than(&self, max_age: Duration, now: Instant) -> Vec<String> {
        let stale: Vec<(String, Arc<ActiveRun>)> = {
            let mut runs = self.runs.lock();
            let ids: Vec<String> = runs
                .iter()
                .filter(|(_, run)| now.saturating_duration_since(run.started_at) > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| runs.remove(&id).map(|run| (id, run)))
                .collect()
        };

        let mut reaped = Vec::with_capacity(stale.len());
        for (channel_id, run) in stale {
            run.cancellation.cancel();
            tracing::warn!(
                channel = %channel_id,
                age_secs = now.saturating_duration_since(run.started_at).as_secs(),
                "Reaped run with no terminal event"
            );
            reaped.push(channel_id);
        }
        reaped.sort();
        reaped
    }

    pub async fn set_model(&self, channel_id: &str, model: &str) -> bool {
        let Some(run) = self.get(channel_id) else {
            return false;
        };
        match run.control.set_model(model).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = channel_id, model, "Model switch failed: {e}");
                false
            }
        }
    }

    pub async fn stop_task(&self, channel_id: &str, task_id: &str) -> bool {
        let Some(run) = self.get(channel_id) else {
            return false;
        };
        match run.control.stop_task(task_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = channel_id, task_id, "Stop task failed: {e}");
                false
            }
        }
    }
}
