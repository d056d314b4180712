use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use hive_process::{InstanceId, InstanceSnapshot, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Draft,
    #[default]
    Published,
    Trashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    #[default]
    Pending,
    Installing,
    Installed,
    Failed,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: RecordState,
    #[serde(default)]
    pub autorestart: bool,
    #[serde(default)]
    pub port_v4: Option<u16>,
    #[serde(default)]
    pub port_v6: Option<u16>,
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,
    #[serde(default)]
    pub install: InstallStatus,
    #[serde(default)]
    pub install_error: Option<String>,
    #[serde(default)]
    pub last_state: Option<Status>,
    #[serde(default)]
    pub last_state_at: Option<DateTime<Utc>>,
    /// Set by an explicit stop, cleared by start.
    #[serde(default)]
    pub operator_stopped: bool,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(id: InstanceId, slug: impl Into<String>) -> Self {
        Self {
            id,
            slug: slug.into(),
            title: String::new(),
            state: RecordState::Published,
            autorestart: false,
            port_v4: None,
            port_v6: None,
            ipv6_enabled: true,
            install: InstallStatus::Pending,
            install_error: None,
            last_state: None,
            last_state_at: None,
            operator_stopped: false,
            created_at: Utc::now(),
        }
    }

    /// Ports this record holds in the shared allocation space.
    pub fn claimed_ports(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(2);
        if let Some(p) = self.port_v4 {
            out.push(p);
        }
        if self.ipv6_enabled
            && let Some(p) = self.port_v6
        {
            out.push(p);
        }
        out
    }

    pub fn snapshot(&self, status: Status) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            slug: self.slug.clone(),
            status,
            autorestart: self.autorestart,
            port_v4: self.port_v4,
            port_v6: self.port_v6,
            ipv6_enabled: self.ipv6_enabled,
            observed_at: self.last_state_at,
        }
    }
}

/// One keyed update, the typed form of `set(instance_id, key, value)`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordField {
    Autorestart(bool),
    Ipv6Enabled(bool),
    PortV4(u16),
    PortV6(u16),
    State(RecordState),
    Install(InstallStatus, Option<String>),
    LastState(Status, DateTime<Utc>),
    OperatorStopped(bool),
}

impl RecordField {
    fn apply(self, r: &mut InstanceRecord) {
        match self {
            RecordField::Autorestart(v) => r.autorestart = v,
            RecordField::Ipv6Enabled(v) => r.ipv6_enabled = v,
            RecordField::PortV4(p) => r.port_v4 = Some(p),
            RecordField::PortV6(p) => r.port_v6 = Some(p),
            RecordField::State(s) => r.state = s,
            RecordField::Install(s, err) => {
                r.install = s;
                r.install_error = err;
            }
            RecordField::LastState(s, at) => {
                r.last_state = Some(s);
                r.last_state_at = Some(at);
            }
            RecordField::OperatorStopped(v) => r.operator_stopped = v,
        }
    }
}

/// Instance metadata storage. Absence of a record is `Ok(None)`, never an error.
pub trait RecordStore: Send + Sync + 'static {
    fn get(&self, id: &InstanceId) -> anyhow::Result<Option<InstanceRecord>>;

    /// Returns `false` when no record exists for `id`.
    fn set(&self, id: &InstanceId, field: RecordField) -> anyhow::Result<bool>;

    /// Returns `false` when a record with the same id already exists.
    fn insert(&self, record: InstanceRecord) -> anyhow::Result<bool>;

    fn list(&self) -> anyhow::Result<Vec<InstanceRecord>>;
}

/// One pretty-printed JSON file per record.
#[derive(Debug)]
pub struct FileRecordStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create records dir {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read(path: &Path) -> anyhow::Result<Option<InstanceRecord>> {
        let raw = match std::fs::read(path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let record = serde_json::from_slice::<InstanceRecord>(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }

    fn write(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        let path = self.path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).context("serialize record")?;
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("write {}", tmp.display()))?;
        f.flush().ok();
        std::fs::rename(&tmp, &path).with_context(|| format!("persist {}", path.display()))?;
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for FileRecordStore {
    fn get(&self, id: &InstanceId) -> anyhow::Result<Option<InstanceRecord>> {
        Self::read(&self.path(id))
    }

    fn set(&self, id: &InstanceId, field: RecordField) -> anyhow::Result<bool> {
        let _g = self.guard();
        let Some(mut record) = Self::read(&self.path(id))? else {
            return Ok(false);
        };
        field.apply(&mut record);
        self.write(&record)?;
        Ok(true)
    }

    fn insert(&self, record: InstanceRecord) -> anyhow::Result<bool> {
        let _g = self.guard();
        if self.path(&record.id).exists() {
            return Ok(false);
        }
        self.write(&record)?;
        Ok(true)
    }

    fn list(&self) -> anyhow::Result<Vec<InstanceRecord>> {
        let rd = std::fs::read_dir(&self.dir)
            .with_context(|| format!("list {}", self.dir.display()))?;
        let mut out = Vec::new();
        for e in rd.flatten() {
            let path = e.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(Some(r)) => out.push(r),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable record");
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<InstanceId, InstanceRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<InstanceId, InstanceRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, id: &InstanceId) -> anyhow::Result<Option<InstanceRecord>> {
        Ok(self.records().get(id).cloned())
    }

    fn set(&self, id: &InstanceId, field: RecordField) -> anyhow::Result<bool> {
        let mut map = self.records();
        let Some(r) = map.get_mut(id) else {
            return Ok(false);
        };
        field.apply(r);
        Ok(true)
    }

    fn insert(&self, record: InstanceRecord) -> anyhow::Result<bool> {
        let mut map = self.records();
        if map.contains_key(&record.id) {
            return Ok(false);
        }
        map.insert(record.id.clone(), record);
        Ok(true)
    }

    fn list(&self) -> anyhow::Result<Vec<InstanceRecord>> {
        Ok(self.records().values().cloned().collect())
    }
}
