use std::{
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};

use hive_process::InstanceId;
use tokio::process::Command;

use crate::error::{ExecError, ExecFailure};

pub const LOCK_FILE: &str = "server.lock";
pub const LOG_FILE: &str = "server.log";

/// Which process host runs instances. New hosts are new variants here and in
/// [`ProcessHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// GNU screen session per instance.
    #[default]
    Screen,
}

impl std::str::FromStr for HostKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screen" => Ok(HostKind::Screen),
            other => anyhow::bail!("unknown host kind: {other}"),
        }
    }
}

/// Marker written by the server on boot, removed on clean exit. Holds the PID.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn in_dir(instance_dir: &Path) -> Self {
        Self {
            path: instance_dir.join(LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        raw.trim().parse::<u32>().ok().filter(|p| *p > 0)
    }

    /// Returns `true` if a file was removed.
    pub fn remove(&self) -> std::io::Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub trait ProcessHandle: Send + Sync + 'static {
    /// Launches a detached session named after `id`.
    fn start(
        &self,
        id: &InstanceId,
        working_dir: &Path,
        start_command: &str,
    ) -> impl Future<Output = Result<(), ExecError>> + Send;

    /// Asks the server to shut down through its console. Never kills.
    fn stop(&self, id: &InstanceId) -> impl Future<Output = Result<(), ExecError>> + Send;

    fn force_terminate(&self, pid: u32) -> Result<(), ExecError>;
}

fn combined_output(out: &std::process::Output) -> String {
    let mut s = String::from_utf8_lossy(&out.stdout).into_owned();
    let err = String::from_utf8_lossy(&out.stderr);
    if !err.trim().is_empty() {
        if !s.is_empty() && !s.ends_with('\n') {
            s.push('\n');
        }
        s.push_str(&err);
    }
    s
}

async fn run(cmd: &mut Command, display: String) -> Result<String, ExecError> {
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExecError::new(display.clone(), ExecFailure::Spawn(e)))?;
    let text = combined_output(&out);
    if !out.status.success() {
        return Err(ExecError::new(display, ExecFailure::ExitStatus(out.status.to_string()))
            .with_output(text));
    }
    Ok(text)
}

#[derive(Debug, Clone)]
pub struct ScreenHandle {
    binary: String,
}

impl Default for ScreenHandle {
    fn default() -> Self {
        Self {
            binary: "screen".to_string(),
        }
    }
}

impl ScreenHandle {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ProcessHandle for ScreenHandle {
    async fn start(
        &self,
        id: &InstanceId,
        working_dir: &Path,
        start_command: &str,
    ) -> Result<(), ExecError> {
        let display = format!("{} -dmS {} bash {}", self.binary, id, start_command);
        if !working_dir.is_dir() {
            return Err(ExecError::new(
                display,
                ExecFailure::MissingDirectory(working_dir.display().to_string()),
            ));
        }
        let script = working_dir.join(start_command);
        if !script.is_file() {
            return Err(ExecError::new(
                display,
                ExecFailure::MissingScript(script.display().to_string()),
            ));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(working_dir)
            .args(["-dmS", id.as_str(), "bash", start_command]);
        run(&mut cmd, display).await?;
        tracing::info!(instance_id = %id, cwd = %working_dir.display(), "started detached session");
        Ok(())
    }

    async fn stop(&self, id: &InstanceId) -> Result<(), ExecError> {
        // `^M` is expanded by screen's `stuff` into a carriage return.
        let display = format!("{} -S {} -p 0 -X stuff stop^M", self.binary, id);
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-S", id.as_str(), "-p", "0", "-X", "stuff", "stop^M"]);
        run(&mut cmd, display).await?;
        tracing::info!(instance_id = %id, "sent stop to session console");
        Ok(())
    }

    fn force_terminate(&self, pid: u32) -> Result<(), ExecError> {
        kill_pid(pid)
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<(), ExecError> {
    let display = format!("kill -KILL {pid}");
    let Ok(raw) = i32::try_from(pid) else {
        return Err(ExecError::new(
            display,
            ExecFailure::ExitStatus("pid out of range".to_string()),
        ));
    };
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(ExecError::new(display, ExecFailure::Spawn(err)));
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> Result<(), ExecError> {
    Err(ExecError::new(
        format!("kill -KILL {pid}"),
        ExecFailure::ExitStatus("forced termination is only supported on unix".to_string()),
    ))
}

/// Host selected from [`HostKind`] at construction.
#[derive(Debug, Clone)]
pub enum ProcessHost {
    Screen(ScreenHandle),
}

impl ProcessHost {
    pub fn new(kind: HostKind) -> Self {
        match kind {
            HostKind::Screen => ProcessHost::Screen(ScreenHandle::default()),
        }
    }
}

impl ProcessHandle for ProcessHost {
    async fn start(
        &self,
        id: &InstanceId,
        working_dir: &Path,
        start_command: &str,
    ) -> Result<(), ExecError> {
        match self {
            ProcessHost::Screen(h) => h.start(id, working_dir, start_command).await,
        }
    }

    async fn stop(&self, id: &InstanceId) -> Result<(), ExecError> {
        match self {
            ProcessHost::Screen(h) => h.stop(id).await,
        }
    }

    fn force_terminate(&self, pid: u32) -> Result<(), ExecError> {
        match self {
            ProcessHost::Screen(h) => h.force_terminate(pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> InstanceId {
        InstanceId::parse("lobby").unwrap()
    }

    #[test]
    fn lock_file_reads_pid_and_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = LockFile::in_dir(tmp.path());
        assert!(!lock.exists());
        assert_eq!(lock.pid(), None);
        assert!(!lock.remove().unwrap());

        std::fs::write(lock.path(), b"4242\n").unwrap();
        assert!(lock.exists());
        assert_eq!(lock.pid(), Some(4242));
        assert!(lock.remove().unwrap());
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn start_requires_directory_and_script() {
        let tmp = tempfile::tempdir().unwrap();
        let h = ScreenHandle::with_binary("true");

        let err = h
            .start(&id(), &tmp.path().join("nope"), "start.sh")
            .await
            .unwrap_err();
        assert!(matches!(err.failure, ExecFailure::MissingDirectory(_)));

        let err = h.start(&id(), tmp.path(), "start.sh").await.unwrap_err();
        assert!(matches!(err.failure, ExecFailure::MissingScript(_)));

        std::fs::write(tmp.path().join("start.sh"), b"#!/bin/bash\n").unwrap();
        h.start(&id(), tmp.path(), "start.sh").await.unwrap();
    }

    #[tokio::test]
    async fn launcher_failure_is_surfaced() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("start.sh"), b"#!/bin/bash\n").unwrap();

        let h = ScreenHandle::with_binary("false");
        let err = h.start(&id(), tmp.path(), "start.sh").await.unwrap_err();
        assert!(matches!(err.failure, ExecFailure::ExitStatus(_)));
        assert!(h.stop(&id()).await.is_err());

        let h = ScreenHandle::with_binary("/definitely/not/a/binary");
        let err = h.stop(&id()).await.unwrap_err();
        assert!(matches!(err.failure, ExecFailure::Spawn(_)));
    }

    #[test]
    fn host_kind_parses() {
        assert_eq!("Screen".parse::<HostKind>().unwrap(), HostKind::Screen);
        assert!("docker".parse::<HostKind>().is_err());
        assert!(matches!(ProcessHost::new(HostKind::Screen), ProcessHost::Screen(_)));
    }
}
