use std::{collections::BTreeMap, fmt};

/// Stable, externally assigned instance identifier.
///
/// Used verbatim as the detached session name and as the record file name, so
/// only `[A-Za-z0-9._-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceIdError {
    #[error("instance_id must be non-empty")]
    Empty,
    #[error("invalid instance_id: {0}")]
    Invalid(String),
}

impl InstanceId {
    pub fn parse(raw: &str) -> Result<Self, InstanceIdError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(InstanceIdError::Empty);
        }
        if id == "." || id == ".." {
            return Err(InstanceIdError::Invalid(id.to_string()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(InstanceIdError::Invalid(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = InstanceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InstanceId> for String {
    fn from(value: InstanceId) -> Self {
        value.0
    }
}

/// Observed lifecycle state of one instance.
///
/// Always derived from the record, the health probe and the lock artifact.
/// The last derived value is persisted for drift detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotFound,
    Found,
    Installing,
    Running,
    Stopped,
    /// Probe failed while the lock artifact is present.
    Unavailable,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotFound => "NOT_FOUND",
            Status::Found => "FOUND",
            Status::Installing => "INSTALLING",
            Status::Running => "RUNNING",
            Status::Stopped => "STOPPED",
            Status::Unavailable => "UNAVAILABLE",
            Status::Error => "ERROR",
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata returned by a successful health probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerInfo {
    pub players: Option<u32>,
    pub max_players: Option<u32>,
    /// Raw advertisement fields; keys are lower case.
    pub fields: BTreeMap<String, String>,
}

impl ServerInfo {
    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        let fields: BTreeMap<String, String> = fields
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let players = fields.get("players").and_then(|v| v.trim().parse().ok());
        let max_players = fields
            .get("maxplayers")
            .and_then(|v| v.trim().parse().ok());
        Self {
            players,
            max_players,
            fields,
        }
    }
}

/// Point-in-time view of one instance, as handed to the boundary layer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub slug: String,
    pub status: Status,
    pub autorestart: bool,
    pub port_v4: Option<u16>,
    pub port_v6: Option<u16>,
    pub ipv6_enabled: bool,
    pub observed_at: Option<chrono::DateTime<chrono::Utc>>,
}
