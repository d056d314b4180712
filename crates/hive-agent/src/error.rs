use std::{fmt, time::Duration};

use hive_process::{InstanceId, InstanceIdError};

/// Which installer step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    CreateDirectory,
    Download,
    RunInstaller,
    AssignPorts,
    WriteConfig,
    Finalize,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStep::CreateDirectory => "create_directory",
            PipelineStep::Download => "download",
            PipelineStep::RunInstaller => "run_installer",
            PipelineStep::AssignPorts => "assign_ports",
            PipelineStep::WriteConfig => "write_config",
            PipelineStep::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecFailure {
    #[error("working directory missing: {0}")]
    MissingDirectory(String),
    #[error("start script missing: {0}")]
    MissingScript(String),
    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("exited with status {0}")]
    ExitStatus(String),
}

/// Process control failure, with whatever the command printed.
#[derive(Debug, thiserror::Error)]
#[error("`{command}` failed: {failure}")]
pub struct ExecError {
    pub command: String,
    #[source]
    pub failure: ExecFailure,
    pub output: String,
}

impl ExecError {
    pub fn new(command: impl Into<String>, failure: ExecFailure) -> Self {
        Self {
            command: command.into(),
            failure,
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// Health probe could not reach the server. Expected in normal operation.
#[derive(Debug, thiserror::Error)]
#[error("{host}:{port} unreachable: {reason}")]
pub struct Unreachable {
    pub host: String,
    pub port: u16,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error(transparent)]
    InvalidId(#[from] InstanceIdError),
    #[error("instance already exists: {0}")]
    AlreadyExists(InstanceId),
    #[error("no free ports left in the configured ranges")]
    ResourceExhausted,
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Unreachable(#[from] Unreachable),
    #[error("install failed at step {step}: {source:#}")]
    Pipeline {
        step: PipelineStep,
        #[source]
        source: anyhow::Error,
    },
    #[error("instance {id} did not stop within {waited:?}")]
    TimedOut { id: InstanceId, waited: Duration },
    #[error("record store: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("{0:#}")]
    Internal(#[source] anyhow::Error),
}

impl HiveError {
    pub fn pipeline(step: PipelineStep, source: impl Into<anyhow::Error>) -> Self {
        HiveError::Pipeline {
            step,
            source: source.into(),
        }
    }

    /// Stable machine-readable code for the boundary layer.
    pub fn code(&self) -> &'static str {
        match self {
            HiveError::NotFound(_) => "not_found",
            HiveError::InvalidId(_) => "invalid_param",
            HiveError::AlreadyExists(_) => "already_exists",
            HiveError::ResourceExhausted => "resource_exhausted",
            HiveError::Exec(_) => "exec_failed",
            HiveError::Unreachable(_) => "unreachable",
            HiveError::Pipeline { .. } => "install_failed",
            HiveError::TimedOut { .. } => "timed_out",
            HiveError::Store(_) | HiveError::Internal(_) => "internal",
        }
    }
}

pub type HiveResult<T> = Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_names_step_and_cause() {
        let err = HiveError::pipeline(
            PipelineStep::RunInstaller,
            anyhow::anyhow!("exit 2").context("run install.sh"),
        );
        let msg = err.to_string();
        assert!(msg.contains("run_installer"));
        assert!(msg.contains("run install.sh: exit 2"));
        assert_eq!(err.code(), "install_failed");
    }

    #[test]
    fn exec_error_keeps_output() {
        let err = ExecError::new(
            "screen -dmS a bash start.sh",
            ExecFailure::ExitStatus("1".into()),
        )
        .with_output("No screen session found.");
        assert_eq!(err.output, "No screen session found.");
        assert!(err.to_string().contains("exited with status 1"));
    }
}
