use std::{collections::HashMap, future::Future, sync::Mutex, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Named background jobs on the tokio runtime. A job body always runs to
/// completion; cancellation only lands between runs.
#[derive(Default)]
pub struct Scheduler {
    cancel: CancellationToken,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|_, h| !h.is_finished());
        jobs
    }

    pub fn has_scheduled(&self, name: &str) -> bool {
        self.jobs().contains_key(name)
    }

    /// Runs `job` once after `delay`. Returns `false` if a job with this name
    /// is still pending or the scheduler is shut down.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, name: impl Into<String>, job: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut jobs = self.jobs();
        if self.cancel.is_cancelled() || jobs.contains_key(&name) {
            tracing::debug!(job = %name, "job already scheduled; skipping");
            return false;
        }

        let cancel = self.cancel.clone();
        let job_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(job = %job_name, "pending job cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            tracing::debug!(job = %job_name, "running job");
            job().await;
        });
        jobs.insert(name, handle);
        true
    }

    /// Runs `job` every `interval`, first run immediately.
    pub fn schedule_recurring<F, Fut>(
        &self,
        interval: Duration,
        name: impl Into<String>,
        job: F,
    ) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut jobs = self.jobs();
        if self.cancel.is_cancelled() || jobs.contains_key(&name) {
            tracing::debug!(job = %name, "job already scheduled; skipping");
            return false;
        }

        let cancel = self.cancel.clone();
        let job_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                job().await;
            }
            tracing::debug!(job = %job_name, "recurring job stopped");
        });
        jobs.insert(name, handle);
        true
    }

    /// Cancels pending runs and waits for in-flight ones to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.drain().collect()
        };
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(job = %name, error = %e, "job ended abnormally");
            }
        }
    }
}
