use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::error::{ExecError, ExecFailure, HiveError, HiveResult, PipelineStep};
use crate::port_alloc::PortAllocator;
use crate::records::{InstanceRecord, RecordField, RecordStore};

pub const INSTALL_SCRIPT: &str = "install.sh";
pub const INSTALL_LOG: &str = "install.log";

// Bootstrap scripts are small; anything bigger is not what we asked for.
const MAX_SCRIPT_BYTES: u64 = 16 * 1024 * 1024;

/// Where `install.sh` comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapSource {
    Http(String),
    Local(PathBuf),
}

impl BootstrapSource {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return BootstrapSource::Http(raw.to_string());
        }
        match raw.strip_prefix("file://") {
            Some(path) => BootstrapSource::Local(PathBuf::from(path)),
            None => BootstrapSource::Local(PathBuf::from(raw)),
        }
    }
}

/// Materializes the default configuration files of a fresh instance.
pub trait ConfigWriter: Send + Sync + 'static {
    /// Returns the files written.
    fn write_defaults(&self, dir: &Path, record: &InstanceRecord) -> anyhow::Result<Vec<PathBuf>>;
}

/// PocketMine-MP defaults: `server.properties`, the list files,
/// `plugin_list.yml` and `pocketmine.yml`.
#[derive(Debug, Clone, Default)]
pub struct PocketMineDefaults;

#[derive(Debug, serde::Serialize)]
struct PluginList {
    /// `blacklist`: listed plugins do not load. `whitelist`: only listed ones do.
    mode: &'static str,
    plugins: Vec<String>,
}

/// The parts of `pocketmine.yml` we set explicitly; the server fills in the rest.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct PocketMineYml {
    settings: YmlSettings,
    memory: YmlMemory,
    network: YmlNetwork,
    player: YmlPlayer,
    auto_report: YmlAutoReport,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct YmlSettings {
    force_language: bool,
    shutdown_message: &'static str,
    query_plugins: bool,
    enable_profiling: bool,
    async_workers: &'static str,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct YmlMemory {
    global_limit: u32,
    main_limit: u32,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct YmlNetwork {
    batch_threshold: u32,
    compression_level: u8,
    async_compression: bool,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
struct YmlPlayer {
    save_player_data: bool,
}

#[derive(Debug, serde::Serialize)]
struct YmlAutoReport {
    enabled: bool,
}

fn pocketmine_yml() -> PocketMineYml {
    PocketMineYml {
        settings: YmlSettings {
            force_language: false,
            shutdown_message: "Server closed",
            query_plugins: true,
            enable_profiling: false,
            async_workers: "auto",
        },
        memory: YmlMemory {
            global_limit: 0,
            main_limit: 0,
        },
        network: YmlNetwork {
            batch_threshold: 256,
            compression_level: 6,
            async_compression: false,
        },
        player: YmlPlayer {
            save_player_data: true,
        },
        auto_report: YmlAutoReport { enabled: false },
    }
}

enum PropValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl PropValue {
    fn render(&self) -> String {
        match self {
            PropValue::Bool(true) => "on".to_string(),
            PropValue::Bool(false) => "off".to_string(),
            PropValue::Int(v) => v.to_string(),
            PropValue::Text(v) => v.clone(),
        }
    }
}

fn server_properties(record: &InstanceRecord) -> String {
    let name = if record.title.trim().is_empty() {
        record.slug.clone()
    } else {
        record.title.trim().to_string()
    };
    let props: Vec<(&str, PropValue)> = vec![
        ("language", PropValue::Text("eng".into())),
        ("motd", PropValue::Text(name.clone())),
        ("server-name", PropValue::Text(name)),
        ("enable-ipv6", PropValue::Bool(record.ipv6_enabled)),
        ("server-port", PropValue::Int(record.port_v4.unwrap_or(19132).into())),
        ("server-portv6", PropValue::Int(record.port_v6.unwrap_or(19133).into())),
        ("white-list", PropValue::Bool(false)),
        ("max-players", PropValue::Int(20)),
        ("gamemode", PropValue::Text("survival".into())),
        ("force-gamemode", PropValue::Bool(false)),
        ("hardcore", PropValue::Bool(false)),
        ("pvp", PropValue::Bool(true)),
        ("difficulty", PropValue::Int(2)),
        ("generator-settings", PropValue::Text(String::new())),
        ("level-name", PropValue::Text("world".into())),
        ("level-seed", PropValue::Text(String::new())),
        ("level-type", PropValue::Text("DEFAULT".into())),
        ("enable-query", PropValue::Bool(true)),
        ("auto-save", PropValue::Bool(true)),
        ("view-distance", PropValue::Int(16)),
        ("xbox-auth", PropValue::Bool(true)),
    ];

    let mut out = String::from("#Properties Config file\n");
    out.push_str(&format!(
        "#{}\n",
        chrono::Utc::now().format("%a %b %-d %H:%M:%S UTC %Y")
    ));
    for (k, v) in props {
        out.push_str(&format!("{k}={}\n", v.render()));
    }
    out
}

impl ConfigWriter for PocketMineDefaults {
    fn write_defaults(&self, dir: &Path, record: &InstanceRecord) -> anyhow::Result<Vec<PathBuf>> {
        let plugin_list = serde_yaml::to_string(&PluginList {
            mode: "blacklist",
            plugins: Vec::new(),
        })
        .context("serialize plugin_list.yml")?;
        let pocketmine = serde_yaml::to_string(&pocketmine_yml()).context("serialize pocketmine.yml")?;

        let files = [
            ("server.properties", server_properties(record)),
            ("ops.txt", String::new()),
            ("white-list.txt", String::new()),
            ("banned-ips.txt", String::new()),
            ("banned-players.txt", String::new()),
            ("plugin_list.yml", plugin_list),
            ("pocketmine.yml", pocketmine),
        ];
        let mut written = Vec::with_capacity(files.len());
        for (name, body) in files {
            let path = dir.join(name);
            std::fs::write(&path, body.as_bytes())
                .with_context(|| format!("write {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }
}

/// One-shot install pipeline. Steps run in order with no rollback.
pub struct Installer {
    source: BootstrapSource,
    client: reqwest::Client,
    writer: Arc<dyn ConfigWriter>,
}

impl Installer {
    pub fn new(source: BootstrapSource, writer: Arc<dyn ConfigWriter>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("hive-agent")
            .timeout(Duration::from_secs(5 * 60))
            .build()
            .context("build http client")?;
        Ok(Self {
            source,
            client,
            writer,
        })
    }

    /// Runs every step for `record` inside `dir`. Returns the assigned
    /// `(v4, v6)` ports. A record that already holds both keeps them; otherwise
    /// they are claimed and persisted right after the directory exists.
    pub async fn run(
        &self,
        record: &InstanceRecord,
        dir: &Path,
        allocator: &PortAllocator,
        store: &dyn RecordStore,
    ) -> HiveResult<(u16, u16)> {
        let id = &record.id;

        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))
            .map_err(|e| HiveError::pipeline(PipelineStep::CreateDirectory, e))?;

        // Ports are claimed before anything is downloaded so that a
        // concurrent install cannot take them while this one runs.
        let ports = match (record.port_v4, record.port_v6) {
            (Some(v4), Some(v6)) => (v4, v6),
            _ => self.claim_ports(record, allocator, store).await?,
        };
        tracing::info!(instance_id = %id, port_v4 = ports.0, port_v6 = ports.1, "ports assigned");

        let script = dir.join(INSTALL_SCRIPT);
        self.fetch(&script)
            .await
            .map_err(|e| HiveError::pipeline(PipelineStep::Download, e))?;
        if !script.is_file() {
            return Err(HiveError::pipeline(
                PipelineStep::Download,
                anyhow::anyhow!("{} missing after download", script.display()),
            ));
        }
        tracing::info!(instance_id = %id, script = %script.display(), "bootstrap script fetched");

        run_install_script(dir, &script)
            .await
            .map_err(|e| HiveError::pipeline(PipelineStep::RunInstaller, e))?;
        tracing::info!(instance_id = %id, "bootstrap script finished");

        let mut with_ports = record.clone();
        with_ports.port_v4 = Some(ports.0);
        with_ports.port_v6 = Some(ports.1);
        let written = self
            .writer
            .write_defaults(dir, &with_ports)
            .map_err(|e| HiveError::pipeline(PipelineStep::WriteConfig, e))?;
        tracing::debug!(instance_id = %id, files = written.len(), "default config written");

        Ok(ports)
    }

    /// Takes two ports and persists them before the session, and with it the
    /// allocation lock, is released.
    async fn claim_ports(
        &self,
        record: &InstanceRecord,
        allocator: &PortAllocator,
        store: &dyn RecordStore,
    ) -> HiveResult<(u16, u16)> {
        let id = &record.id;
        let mut session = allocator.session().await?;
        let (v4, v6) = match (session.request_port(), session.request_port()) {
            (Ok(v4), Ok(v6)) => (v4, v6),
            _ => {
                tracing::warn!(instance_id = %id, "port pool exhausted; aborting install");
                return Err(HiveError::ResourceExhausted);
            }
        };
        store
            .set(id, RecordField::PortV4(v4))
            .and_then(|_| store.set(id, RecordField::PortV6(v6)))
            .map_err(|e| HiveError::pipeline(PipelineStep::AssignPorts, e))?;
        Ok((v4, v6))
    }

    async fn fetch(&self, dest: &Path) -> anyhow::Result<()> {
        match &self.source {
            BootstrapSource::Local(path) => {
                tokio::fs::copy(path, dest)
                    .await
                    .with_context(|| format!("copy {}", path.display()))?;
                Ok(())
            }
            BootstrapSource::Http(url) => self.download(url, dest).await,
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url} (status)"))?;

        let tmp = dest.with_extension("tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut total: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("download {url}"))?;
            total = total.saturating_add(chunk.len() as u64);
            if total > MAX_SCRIPT_BYTES {
                let _ = tokio::fs::remove_file(&tmp).await;
                anyhow::bail!("download too large");
            }
            f.write_all(&chunk).await?;
        }
        f.flush().await.ok();
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Runs `bash install.sh` in `dir`, appending everything it prints to `install.log`.
async fn run_install_script(dir: &Path, script: &Path) -> anyhow::Result<()> {
    mark_executable(script).with_context(|| format!("chmod {}", script.display()))?;

    let display = format!("bash {INSTALL_SCRIPT}");
    let out = Command::new("bash")
        .arg(INSTALL_SCRIPT)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExecError::new(display.clone(), ExecFailure::Spawn(e)))?;

    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));

    let log_path = dir.join(INSTALL_LOG);
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .with_context(|| format!("open {}", log_path.display()))?;
    log.write_all(output.as_bytes()).await?;
    log.flush().await.ok();

    if !out.status.success() {
        return Err(
            ExecError::new(display, ExecFailure::ExitStatus(out.status.to_string()))
                .with_output(output)
                .into(),
        );
    }
    Ok(())
}
