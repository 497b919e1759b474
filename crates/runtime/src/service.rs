//! Process-level lifecycle: bring the daemon and model up once, answer
//! queries, stop the daemon at shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wayfinder_config::AppConfig;
use wayfinder_llm::{
    ChatModel, DaemonApi, DaemonSupervisor, LaunchCommand, ModelRegistry, OllamaClient,
    StopReport, SupervisorTimings,
};
use wayfinder_tools::SessionSpec;

use crate::error::{QueryError, ServiceError};
use crate::pipeline::{QueryPipeline, QueryResponse};

pub struct LocationService {
    model: String,
    supervisor: Arc<DaemonSupervisor>,
    registry: ModelRegistry,
    pipeline: QueryPipeline,
    manage_daemon: bool,
    startup_timeout: std::time::Duration,
}

impl LocationService {
    /// Wire everything to a real Ollama daemon without starting anything.
    pub fn build(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = Arc::new(
            OllamaClient::new(&config.llm.base_url, &config.llm.model)?
                .with_timeouts(config.llm.chat_timeout(), config.llm.list_timeout()),
        );
        Ok(Self::with_backend(config, client.clone(), client))
    }

    /// Wire everything to the given daemon API and chat model.
    pub fn with_backend(
        config: &AppConfig,
        api: Arc<dyn DaemonApi>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let daemon = &config.daemon;
        let timings = SupervisorTimings {
            poll_interval: daemon.poll_interval(),
            probe_timeout: daemon.probe_timeout(),
            stop_grace: daemon.stop_grace(),
            settle: daemon.settle(),
        };
        let supervisor = Arc::new(if daemon.manage {
            DaemonSupervisor::new(
                api,
                LaunchCommand::new(&daemon.program, &daemon.args),
                &config.llm.base_url,
                timings,
            )
        } else {
            DaemonSupervisor::external(api, &config.llm.base_url, timings)
        });

        let registry = ModelRegistry::new(
            supervisor.clone(),
            LaunchCommand::new(&daemon.program, &daemon.pull_args),
            daemon.pull_timeout(),
            daemon.startup_timeout(),
        );

        if !config.tool.has_credential() {
            warn!(
                variable = %config.tool.credential_env,
                "tool credential is not set; location searches will likely fail"
            );
        }
        let tool = SessionSpec {
            command: config.tool.command.clone(),
            args: config.tool.args.clone(),
            env: config.tool.env.clone(),
            handshake_timeout: config.tool.handshake_timeout(),
            call_timeout: config.tool.call_timeout(),
        };

        let pipeline = QueryPipeline::new(supervisor.clone(), model, tool, &config.query);

        Self {
            model: config.llm.model.clone(),
            supervisor,
            registry,
            pipeline,
            manage_daemon: daemon.manage,
            startup_timeout: daemon.startup_timeout(),
        }
    }

    /// Build, start the daemon and make sure the configured model exists.
    pub async fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let service = Self::build(config)?;
        service.start().await?;
        Ok(service)
    }

    /// Start (or wait for) the daemon, then provision the model.  A daemon
    /// that never becomes ready is fatal; so is a model that cannot be
    /// installed.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.manage_daemon {
            info!(timeout = ?self.startup_timeout, "starting inference daemon");
        }
        self.supervisor.start(true, self.startup_timeout).await?;

        let models = self.registry.list_models().await?;
        info!(
            available = ?models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "installed models"
        );

        if !self.registry.ensure_model(&self.model).await? {
            return Err(ServiceError::ProvisioningFailure {
                model: self.model.clone(),
            });
        }
        info!(model = %self.model, "location service ready");
        Ok(())
    }

    pub async fn answer(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        self.pipeline.run(query, cancel).await
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn supervisor(&self) -> &Arc<DaemonSupervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn tool_spec(&self) -> &SessionSpec {
        self.pipeline.tool_spec()
    }

    /// Stop the daemon if this process launched it.
    pub async fn shutdown(&self) -> StopReport {
        let report = self.supervisor.stop().await;
        if report.was_noop() {
            info!("no owned inference daemon to stop");
        }
        report
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
