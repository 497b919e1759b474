//! Installed-model listing and provisioning.
//!
//! Provisioning shells out to the daemon's own CLI (`ollama pull <model>`)
//! and never trusts its exit code: success is decided by listing the models
//! again afterwards.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::client::ModelDescriptor;
use crate::supervisor::{DaemonSupervisor, LaunchCommand, SupervisorError};

/// How a pull invocation ended.  Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Exited { code: Option<i32>, stderr_tail: String },
    TimedOut,
    SpawnFailed(String),
}

impl PullOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, PullOutcome::Exited { code: Some(0), .. })
    }
}

pub struct ModelRegistry {
    supervisor: Arc<DaemonSupervisor>,
    /// Pull command; the model name is appended as the last argument.
    pull: LaunchCommand,
    pull_timeout: Duration,
    startup_timeout: Duration,
}

impl ModelRegistry {
    pub fn new(
        supervisor: Arc<DaemonSupervisor>,
        pull: LaunchCommand,
        pull_timeout: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            pull,
            pull_timeout,
            startup_timeout,
        }
    }

    /// Installed models.  The daemon is started first when it is not ready;
    /// a listing failure is logged and yields an empty list.
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>, SupervisorError> {
        if !self.supervisor.is_ready().await {
            info!("starting inference daemon to list models");
            self.supervisor.start(true, self.startup_timeout).await?;
        }

        match self.supervisor.api().list_models().await {
            Ok(models) => {
                debug!(count = models.len(), "listed installed models");
                Ok(models)
            }
            Err(err) => {
                warn!(%err, "failed to list models");
                Ok(Vec::new())
            }
        }
    }

    /// Make sure `name` is installed, pulling it when missing.  Returns
    /// whether the model is present afterwards; only a daemon that cannot
    /// be started is an error.
    pub async fn ensure_model(&self, name: &str) -> Result<bool, SupervisorError> {
        let models = self.list_models().await?;
        if contains_model(&models, name) {
            debug!(model = name, "model already installed");
            return Ok(true);
        }

        info!(model = name, "model not installed, downloading");
        match self.pull(name).await {
            outcome if outcome.succeeded() => info!(model = name, "model pull finished"),
            PullOutcome::Exited { code, stderr_tail } => {
                warn!(model = name, ?code, stderr = %stderr_tail, "model pull failed")
            }
            PullOutcome::TimedOut => warn!(
                model = name,
                timeout = ?self.pull_timeout,
                "model pull timed out; network trouble or a very large model"
            ),
            PullOutcome::SpawnFailed(err) => warn!(model = name, %err, "could not run model pull"),
        }

        let models = self.list_models().await?;
        let present = contains_model(&models, name);
        info!(model = name, present, "model verification");
        Ok(present)
    }

    pub async fn pull(&self, name: &str) -> PullOutcome {
        let child = Command::new(&self.pull.program)
            .args(&self.pull.args)
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(err) => return PullOutcome::SpawnFailed(err.to_string()),
        };

        // Dropping the timed-out future drops the child, which kills it.
        match tokio::time::timeout(self.pull_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => PullOutcome::Exited {
                code: output.status.code(),
                stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), 400),
            },
            Ok(Err(err)) => PullOutcome::SpawnFailed(err.to_string()),
            Err(_) => PullOutcome::TimedOut,
        }
    }
}

/// Exact match, or an untagged name matching its `:latest` tag.
pub fn contains_model(models: &[ModelDescriptor], name: &str) -> bool {
    models.iter().any(|model| {
        model.name == name
            || (!name.contains(':')
                && model
                    .name
                    .strip_suffix(":latest")
                    .is_some_and(|base| base == name))
    })
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
