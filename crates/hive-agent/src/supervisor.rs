use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
};

use chrono::Utc;
use hive_process::{InstanceId, InstanceSnapshot, Status};
use tokio::sync::Mutex;

use crate::config::{AgentConfig, SlugFormat};
use crate::error::{HiveError, HiveResult};
use crate::installer::Installer;
use crate::logs::{self, LogPage, PageRequest};
use crate::port_alloc::PortAllocator;
use crate::process_handle::{LOG_FILE, LockFile, ProcessHandle};
use crate::query::HealthProber;
use crate::reconcile::Outcome;
use crate::records::{InstallStatus, InstanceRecord, RecordField, RecordState, RecordStore};

fn default_true() -> bool {
    true
}

/// Request body for creating an instance record.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewInstance {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub autorestart: bool,
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,
}

/// Lower-case ASCII, runs of anything else collapsed into `-`.
fn slugify(title: &str) -> Option<String> {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-').to_string();
    (!out.is_empty()).then_some(out)
}

/// Lifecycle owner for every instance. Operations on one instance are
/// serialized; different instances proceed concurrently.
pub struct Supervisor<H, P> {
    config: AgentConfig,
    instances_dir: PathBuf,
    store: Arc<dyn RecordStore>,
    allocator: PortAllocator,
    installer: Installer,
    host: H,
    prober: P,
    locks: std::sync::Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl<H: ProcessHandle, P: HealthProber> Supervisor<H, P> {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn RecordStore>,
        installer: Installer,
        host: H,
        prober: P,
    ) -> Self {
        let allocator = PortAllocator::new(
            config.port_ranges.clone(),
            config.port_assignment,
            store.clone(),
        );
        Self {
            instances_dir: config.instances_dir(),
            config,
            store,
            allocator,
            installer,
            host,
            prober,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    fn lock_for(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record(&self, id: &InstanceId) -> HiveResult<Option<InstanceRecord>> {
        self.store.get(id).map_err(HiveError::Store)
    }

    fn require(&self, id: &InstanceId) -> HiveResult<InstanceRecord> {
        self.record(id)?
            .ok_or_else(|| HiveError::NotFound(id.clone()))
    }

    fn set(&self, id: &InstanceId, field: RecordField) -> HiveResult<()> {
        self.store.set(id, field).map_err(HiveError::Store)?;
        Ok(())
    }

    fn persist(&self, id: &InstanceId, status: Status) -> HiveResult<()> {
        self.set(id, RecordField::LastState(status, Utc::now()))
    }

    pub fn instance_dir(&self, record: &InstanceRecord) -> PathBuf {
        self.instances_dir.join(&record.slug)
    }

    async fn probe_status(&self, record: &InstanceRecord) -> Status {
        let probed = match record.port_v4 {
            Some(port) => self
                .prober
                .probe(&self.config.probe_host, port)
                .await
                .map_err(|e| e.to_string()),
            None => Err("no port assigned".to_string()),
        };
        match probed {
            Ok(_) => Status::Running,
            Err(reason) => {
                tracing::debug!(instance_id = %record.id, %reason, "probe failed; checking lock");
                if LockFile::in_dir(&self.instance_dir(record)).exists() {
                    Status::Unavailable
                } else {
                    Status::Stopped
                }
            }
        }
    }

    /// Derives the current status and records it as the last known state.
    async fn observe(&self, record: &InstanceRecord) -> HiveResult<Status> {
        let status = match record.install {
            InstallStatus::Pending => Status::Found,
            InstallStatus::Installing => Status::Installing,
            InstallStatus::Failed => Status::Error,
            InstallStatus::Installed => self.probe_status(record).await,
        };
        self.persist(&record.id, status)?;
        Ok(status)
    }

    /// Never takes the instance lock, so it stays answerable during installs.
    pub async fn status(&self, id: &InstanceId) -> HiveResult<Status> {
        match self.record(id)? {
            None => Ok(Status::NotFound),
            Some(record) => self.observe(&record).await,
        }
    }

    pub async fn snapshot(&self, id: &InstanceId) -> HiveResult<InstanceSnapshot> {
        let status = self.status(id).await?;
        Ok(self.require(id)?.snapshot(status))
    }

    pub async fn start(&self, id: &InstanceId) -> HiveResult<Status> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: &InstanceId) -> HiveResult<Status> {
        let record = self.require(id)?;
        if record.state == RecordState::Trashed {
            tracing::warn!(instance_id = %id, "refusing to start trashed instance");
            self.persist(id, Status::Unavailable)?;
            return Ok(Status::Unavailable);
        }
        if self.observe(&record).await?.is_running() {
            return Ok(Status::Running);
        }

        let dir = self.instance_dir(&record);
        if let Err(e) = self.host.start(id, &dir, &self.config.start_script).await {
            tracing::error!(instance_id = %id, error = %e, output = %e.output, "start failed");
            self.persist(id, Status::Error)?;
            return Err(e.into());
        }
        self.set(id, RecordField::OperatorStopped(false))?;
        tracing::info!(instance_id = %id, "instance started");
        self.status(id).await
    }

    pub async fn stop(&self, id: &InstanceId) -> HiveResult<Status> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &InstanceId) -> HiveResult<Status> {
        let record = self.require(id)?;
        let current = self.observe(&record).await?;
        // UNAVAILABLE still holds the lock; the process may be booting.
        if !matches!(current, Status::Running | Status::Unavailable) {
            return Ok(current);
        }

        if let Err(e) = self.host.stop(id).await {
            tracing::error!(instance_id = %id, error = %e, output = %e.output, "stop failed; removing lock artifact");
            let lock = LockFile::in_dir(&self.instance_dir(&record));
            if let Err(err) = lock.remove() {
                tracing::warn!(instance_id = %id, path = %lock.path().display(), error = %err, "failed to remove lock artifact");
            }
        }
        self.set(id, RecordField::OperatorStopped(true))?;
        tracing::info!(instance_id = %id, "stop requested");
        self.status(id).await
    }

    pub async fn stop_wait(&self, id: &InstanceId) -> HiveResult<Status> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_wait_locked(id).await
    }

    /// Stops, then polls until the instance is neither running nor holding
    /// its lock. Escalates to a forced kill at `stop_timeout`.
    async fn stop_wait_locked(&self, id: &InstanceId) -> HiveResult<Status> {
        let timeout = self.config.stop_timeout();
        let poll = self.config.stop_poll_interval();
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;

        let mut status = self.stop_locked(id).await?;
        loop {
            if !matches!(status, Status::Running | Status::Unavailable) {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(poll).await;
            status = self.status(id).await?;
        }

        let record = self.require(id)?;
        let lock = LockFile::in_dir(&self.instance_dir(&record));
        match lock.pid() {
            Some(pid) => {
                tracing::warn!(instance_id = %id, pid, waited = ?started.elapsed(), "stop timed out; killing");
                if let Err(e) = self.host.force_terminate(pid) {
                    tracing::error!(instance_id = %id, pid, error = %e, "forced termination failed");
                }
            }
            None => {
                tracing::warn!(instance_id = %id, "stop timed out; no pid in lock artifact");
            }
        }
        if let Err(e) = lock.remove() {
            tracing::warn!(instance_id = %id, error = %e, "failed to remove lock artifact");
        }
        self.persist(id, Status::Error)?;
        Err(HiveError::TimedOut {
            id: id.clone(),
            waited: timeout,
        })
    }

    pub async fn restart(&self, id: &InstanceId) -> HiveResult<Status> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_wait_locked(id).await?;
        self.start_locked(id).await
    }

    /// Runs the install pipeline, then starts the instance. Nothing is rolled
    /// back on failure; ports assigned so far stay claimed.
    pub async fn install(&self, id: &InstanceId) -> HiveResult<Status> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.require(id)?;
        self.set(id, RecordField::Install(InstallStatus::Installing, None))?;
        self.persist(id, Status::Installing)?;
        tracing::info!(instance_id = %id, slug = %record.slug, "install started");

        let dir = self.instance_dir(&record);
        match self
            .installer
            .run(&record, &dir, &self.allocator, self.store.as_ref())
            .await
        {
            Ok((v4, v6)) => {
                self.set(id, RecordField::Install(InstallStatus::Installed, None))?;
                tracing::info!(instance_id = %id, port_v4 = v4, port_v6 = v6, "install finished");
                self.start_locked(id).await
            }
            Err(e) => {
                tracing::error!(instance_id = %id, error = %e, "install failed");
                self.set(
                    id,
                    RecordField::Install(InstallStatus::Failed, Some(e.to_string())),
                )?;
                self.persist(id, Status::Error)?;
                Err(e)
            }
        }
    }

    /// Restarts `id` if it was running at the previous observation and is not
    /// running now. The record is re-read under the instance lock, so an
    /// operator stop that lands first always wins. An instance busy with
    /// another operation is left for the next sweep.
    pub async fn reconcile_one(&self, id: &InstanceId) -> HiveResult<Outcome> {
        let lock = self.lock_for(id);
        let Ok(_guard) = lock.try_lock() else {
            return Ok(Outcome::Busy);
        };

        let Some(record) = self.record(id)? else {
            return Ok(Outcome::Skipped);
        };
        if !record.autorestart
            || record.operator_stopped
            || record.state != RecordState::Published
        {
            return Ok(Outcome::Skipped);
        }

        // Read before observe() overwrites it.
        let last = record.last_state;
        let observed = self.observe(&record).await?;
        if last != Some(Status::Running)
            || observed.is_running()
            || observed == Status::Installing
        {
            return Ok(Outcome::Healthy(observed));
        }

        tracing::warn!(instance_id = %id, observed = %observed, "instance went down; restarting");
        self.start_locked(id).await.map(Outcome::Restarted)
    }

    pub fn create(&self, req: NewInstance) -> HiveResult<InstanceRecord> {
        let id = InstanceId::parse(&req.id)?;
        if self.record(&id)?.is_some() {
            return Err(HiveError::AlreadyExists(id));
        }

        let mut record = InstanceRecord::new(id.clone(), self.slug_for(&id, &req.title)?);
        record.title = req.title.trim().to_string();
        record.autorestart = req.autorestart;
        record.ipv6_enabled = req.ipv6_enabled;
        if !self
            .store
            .insert(record.clone())
            .map_err(HiveError::Store)?
        {
            return Err(HiveError::AlreadyExists(id));
        }
        tracing::info!(instance_id = %id, slug = %record.slug, "instance created");
        Ok(record)
    }

    fn slug_for(&self, id: &InstanceId, title: &str) -> HiveResult<String> {
        let base = match self.config.slug_format {
            SlugFormat::Id => id.to_string(),
            SlugFormat::Uuid => return Ok(uuid::Uuid::new_v4().to_string()),
            SlugFormat::Title => slugify(title).unwrap_or_else(|| id.to_string()),
        };
        let taken: BTreeSet<String> = self
            .records()?
            .into_iter()
            .map(|r| r.slug)
            .collect();
        if taken.contains(&base) || self.instances_dir.join(&base).exists() {
            return Ok(format!("{base}-{id}"));
        }
        Ok(base)
    }

    pub fn records(&self) -> HiveResult<Vec<InstanceRecord>> {
        self.store.list().map_err(HiveError::Store)
    }

    pub fn list(&self) -> HiveResult<Vec<InstanceId>> {
        Ok(self.records()?.into_iter().map(|r| r.id).collect())
    }

    pub async fn log_page(&self, id: &InstanceId, req: PageRequest) -> HiveResult<LogPage> {
        let record = self.require(id)?;
        let path = self.instance_dir(&record).join(LOG_FILE);
        logs::read_page(&path, req)
            .await
            .map_err(HiveError::Internal)
    }
}
