use std::sync::Arc;

use hive_process::Status;

use crate::process_handle::ProcessHandle;
use crate::query::HealthProber;
use crate::supervisor::Supervisor;

/// What one reconcile pass did to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Autorestart off, operator-stopped, not published, or gone.
    Skipped,
    /// Another operation held the instance lock.
    Busy,
    /// Observed and left alone.
    Healthy(Status),
    Restarted(Status),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub restarted: usize,
    pub busy: usize,
    pub failed: usize,
}

/// Restarts instances that were running at the previous observation and are
/// not running now.
pub struct Reconciler<H, P> {
    supervisor: Arc<Supervisor<H, P>>,
}

impl<H, P> Clone for Reconciler<H, P> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<H: ProcessHandle, P: HealthProber> Reconciler<H, P> {
    pub fn new(supervisor: Arc<Supervisor<H, P>>) -> Self {
        Self { supervisor }
    }

    /// One sweep over every instance. Each instance is handled to completion
    /// before the next one is looked at.
    pub async fn tick(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let ids = match self.supervisor.list() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "reconcile: listing records failed");
                return report;
            }
        };

        for id in ids {
            match self.supervisor.reconcile_one(&id).await {
                Ok(Outcome::Skipped) => {}
                Ok(Outcome::Busy) => {
                    report.busy += 1;
                    tracing::debug!(instance_id = %id, "reconcile: instance busy; skipping");
                }
                Ok(Outcome::Healthy(_)) => report.checked += 1,
                Ok(Outcome::Restarted(status)) => {
                    report.checked += 1;
                    report.restarted += 1;
                    tracing::info!(instance_id = %id, status = %status, "instance restarted");
                }
                Err(e) => {
                    report.checked += 1;
                    report.failed += 1;
                    tracing::error!(instance_id = %id, error = %e, "reconcile failed");
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            restarted = report.restarted,
            busy = report.busy,
            failed = report.failed,
            "reconcile tick"
        );
        report
    }
}
