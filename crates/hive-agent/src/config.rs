use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

use crate::port_alloc::{PortAssignment, PortRange};
use crate::process_handle::HostKind;

const DEFAULT_INSTALLER_URL: &str = "https://get.pmmp.io";
const DEFAULT_START_SCRIPT: &str = "start.sh";

/// How a newly created instance gets its on-disk directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlugFormat {
    #[default]
    Id,
    Uuid,
    Title,
}

impl std::str::FromStr for SlugFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => Ok(SlugFormat::Id),
            "uuid" => Ok(SlugFormat::Uuid),
            "title" | "post_title" => Ok(SlugFormat::Title),
            other => anyhow::bail!("unknown slug format: {other}"),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub listen_addr: SocketAddr,
    /// Address the health probe targets; instances bind on this host.
    pub probe_host: String,
    pub port_ranges: Vec<PortRange>,
    pub port_assignment: PortAssignment,
    pub host_kind: HostKind,
    /// `http(s)://` URL, `file://` URL or local path of the bootstrap script.
    pub installer_url: String,
    pub installer_delay_secs: u64,
    pub start_script: String,
    pub reconcile_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub stop_poll_ms: u64,
    pub probe_timeout_ms: u64,
    pub slug_format: SlugFormat,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            probe_host: "127.0.0.1".to_string(),
            port_ranges: vec![PortRange {
                start: 19132,
                end: 19232,
            }],
            port_assignment: PortAssignment::Sequential,
            host_kind: HostKind::Screen,
            installer_url: DEFAULT_INSTALLER_URL.to_string(),
            installer_delay_secs: 0,
            start_script: DEFAULT_START_SCRIPT.to_string(),
            reconcile_interval_secs: 60,
            stop_timeout_secs: 60,
            stop_poll_ms: 250,
            probe_timeout_ms: 1000,
            slug_format: SlugFormat::Id,
        }
    }
}

fn parse_u64(raw: Option<String>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parses `19132-19232,20000-20010`. Single ports (`25565`) are one-port ranges.
pub fn parse_port_ranges(raw: &str) -> anyhow::Result<Vec<PortRange>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let (start, end) = match p.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (p, p),
        };
        let start = start
            .parse::<u32>()
            .with_context(|| format!("invalid port range start: {p}"))?;
        let end = end
            .parse::<u32>()
            .with_context(|| format!("invalid port range end: {p}"))?;
        out.push(PortRange { start, end });
    }
    Ok(out)
}

impl AgentConfig {
    /// Defaults, then the TOML file named by `HIVE_CONFIG`, then `HIVE_*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("HIVE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        cfg.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(v) = non_empty(lookup("HIVE_DATA_ROOT")) {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("HIVE_LISTEN_ADDR")) {
            self.listen_addr = v
                .parse()
                .with_context(|| format!("invalid HIVE_LISTEN_ADDR: {v}"))?;
        }
        if let Some(v) = non_empty(lookup("HIVE_PROBE_HOST")) {
            self.probe_host = v;
        }
        if let Some(v) = non_empty(lookup("HIVE_PORT_RANGES")) {
            self.port_ranges = parse_port_ranges(&v)?;
        }
        if let Some(v) = non_empty(lookup("HIVE_PORT_ASSIGNMENT")) {
            self.port_assignment = v.parse()?;
        }
        if let Some(v) = non_empty(lookup("HIVE_HOST_KIND")) {
            self.host_kind = v.parse()?;
        }
        if let Some(v) = non_empty(lookup("HIVE_INSTALLER_URL")) {
            self.installer_url = v;
        }
        if let Some(v) = non_empty(lookup("HIVE_START_SCRIPT")) {
            self.start_script = v;
        }
        if let Some(v) = non_empty(lookup("HIVE_SLUG_FORMAT")) {
            self.slug_format = v.parse()?;
        }
        if let Some(v) = parse_u64(lookup("HIVE_INSTALLER_DELAY_SECS")) {
            self.installer_delay_secs = v.clamp(0, 24 * 60 * 60);
        }
        if let Some(v) = parse_u64(lookup("HIVE_RECONCILE_INTERVAL_SECS")) {
            self.reconcile_interval_secs = v.clamp(5, 24 * 60 * 60);
        }
        if let Some(v) = parse_u64(lookup("HIVE_STOP_TIMEOUT_SECS")) {
            self.stop_timeout_secs = v.clamp(1, 60 * 60);
        }
        if let Some(v) = parse_u64(lookup("HIVE_STOP_POLL_MS")) {
            self.stop_poll_ms = v.clamp(50, 10_000);
        }
        if let Some(v) = parse_u64(lookup("HIVE_PROBE_TIMEOUT_MS")) {
            self.probe_timeout_ms = v.clamp(100, 10_000);
        }
        Ok(())
    }

    pub fn data_root(&self) -> PathBuf {
        let abs = if self.data_root.is_absolute() {
            self.data_root.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(&self.data_root)
        };
        // Best-effort canonicalization: the directory may not exist yet.
        std::fs::canonicalize(&abs).unwrap_or(abs)
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_root().join("instances")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_root().join("records")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root().join("logs")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn installer_delay(&self) -> Duration {
        Duration::from_secs(self.installer_delay_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs.max(1))
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms.max(10))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn toml_overrides_selected_keys() {
        let cfg = AgentConfig::from_toml_str(
            r#"
            port_assignment = "random"
            stop_timeout_secs = 5
            port_ranges = [{ start = 20000, end = 20010 }, { start = 100, end = 200 }]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port_assignment, PortAssignment::Random);
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.port_ranges.len(), 2);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.stop_poll_ms, 250);
        assert_eq!(cfg.start_script, "start.sh");
    }

    #[test]
    fn env_overrides_are_clamped() {
        let env: HashMap<&str, &str> = [
            ("HIVE_PROBE_TIMEOUT_MS", "5"),
            ("HIVE_RECONCILE_INTERVAL_SECS", "999999"),
            ("HIVE_PORT_RANGES", "19132-19140, 25565"),
            ("HIVE_SLUG_FORMAT", "uuid"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AgentConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.probe_timeout_ms, 100);
        assert_eq!(cfg.reconcile_interval_secs, 24 * 60 * 60);
        assert_eq!(
            cfg.port_ranges,
            vec![
                PortRange {
                    start: 19132,
                    end: 19140
                },
                PortRange {
                    start: 25565,
                    end: 25565
                },
            ]
        );
        assert_eq!(cfg.slug_format, SlugFormat::Uuid);
    }

    #[test]
    fn bad_port_range_is_an_error() {
        assert!(parse_port_ranges("abc-10").is_err());
        let mut cfg = AgentConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "HIVE_PORT_ASSIGNMENT").then(|| "fastest".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("fastest"));
    }
}
