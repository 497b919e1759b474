//! One query, end to end: health wait, tool session, reasoning loop,
//! extraction, formatting.
//!
//! The first three stages share one request deadline and one cancellation
//! token.  The tool session is closed before `run` returns on every path
//! that opened it; a session whose `open` future is abandoned is killed on
//! drop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wayfinder_config::QueryConfig;
use wayfinder_llm::{ChatModel, DaemonSupervisor};
use wayfinder_tools::{SessionSpec, ToolSession};

use crate::error::QueryError;
use crate::extract::extract;
use crate::formatter::{ContractReport, FormattingContract, ResponseFormatter};
use crate::tool_loop::{LoopStatus, ReasoningLoop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Answered,
    /// Nothing usable came back from the tool.
    NoResults,
    /// The reasoning loop hit its round cap; the answer covers what was
    /// gathered so far.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub text: String,
    pub status: ResponseStatus,
    pub loop_status: LoopStatus,
    pub rounds: usize,
    pub report: ContractReport,
    pub elapsed: Duration,
}

pub struct QueryPipeline {
    supervisor: Arc<DaemonSupervisor>,
    reasoning: ReasoningLoop,
    formatter: ResponseFormatter,
    tool: SessionSpec,
    request_timeout: Duration,
    format_timeout: Duration,
}

impl QueryPipeline {
    pub fn new(
        supervisor: Arc<DaemonSupervisor>,
        model: Arc<dyn ChatModel>,
        tool: SessionSpec,
        config: &QueryConfig,
    ) -> Self {
        Self {
            supervisor,
            reasoning: ReasoningLoop::new(model.clone(), config.max_tool_rounds),
            formatter: ResponseFormatter::new(model, FormattingContract::new(config.word_limit)),
            tool,
            request_timeout: config.request_timeout(),
            format_timeout: config.format_timeout(),
        }
    }

    pub fn tool_spec(&self) -> &SessionSpec {
        &self.tool
    }

    pub async fn run(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let deadline = started + self.request_timeout;
        info!(query, "handling location query");

        // wait_ready gives up at the deadline by itself.
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            ready = self.supervisor.wait_ready(deadline) => ready,
        };
        if !ready {
            warn!("inference daemon not ready; rejecting query");
            return Err(QueryError::DaemonUnavailable);
        }

        let session = self
            .bounded("tool negotiation", deadline, cancel, ToolSession::open(&self.tool))
            .await??;

        let outcome = self
            .bounded("reasoning", deadline, cancel, self.reasoning.run(&session, query))
            .await;
        session.close().await;
        let outcome = outcome??;

        let payload = extract(&outcome.transcript);
        debug!(
            found = !payload.is_absent(),
            rounds = outcome.rounds,
            transcript = outcome.transcript.len(),
            "payload extraction"
        );

        let formatted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            result = tokio::time::timeout(self.format_timeout, self.formatter.format(query, &payload)) => {
                match result {
                    Ok(formatted) => formatted.map_err(QueryError::Formatter)?,
                    Err(_) => {
                        return Err(QueryError::DeadlineExceeded {
                            stage: "formatting",
                            timeout: self.format_timeout,
                        });
                    }
                }
            }
        };

        let status = match (outcome.status, formatted.no_results) {
            (LoopStatus::Exhausted { .. }, _) => ResponseStatus::Degraded,
            (LoopStatus::Completed, true) => ResponseStatus::NoResults,
            (LoopStatus::Completed, false) => ResponseStatus::Answered,
        };

        let elapsed = started.elapsed();
        info!(
            ?status,
            rounds = outcome.rounds,
            elapsed_ms = elapsed.as_millis() as u64,
            "query answered"
        );

        Ok(QueryResponse {
            text: formatted.text,
            status,
            loop_status: outcome.status,
            rounds: outcome.rounds,
            report: formatted.report,
            elapsed,
        })
    }

    /// Run `fut` unless the request is cancelled or its deadline passes
    /// first.  A losing `fut` is dropped.
    async fn bounded<T>(
        &self,
        stage: &'static str,
        deadline: Instant,
        cancel: &CancellationToken,
        fut: impl Future<Output = T>,
    ) -> Result<T, QueryError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(stage, "query cancelled");
                Err(QueryError::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(stage, timeout = ?self.request_timeout, "query deadline exceeded");
                Err(QueryError::DeadlineExceeded {
                    stage,
                    timeout: self.request_timeout,
                })
            }
            output = fut => Ok(output),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wayfinder_llm::{
        ChatMessage, ChatResponse, DaemonApi, LlmError, ModelDescriptor, Role, SupervisorTimings,
        ToolCall,
    };

    use crate::formatter::{CLOSING_LINE, NO_RESULTS_PAYLOAD};

    const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake-maps","version":"0"}}}"#;
    const LIST_REPLY: &str = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"maps_search_places","description":"Search for places","inputSchema":{"type":"object","properties":{"query":{"type":"string"}}}}]}}"#;
    const PLACES_REPLY: &str = r#"{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"{\"places\":[{\"name\":\"Blue Tokai\",\"formatted_address\":\"HSR Layout, Bengaluru\",\"rating\":4.7,\"place_id\":\"p1\"}]}"}]}}"#;
    const IDLE: &str = "while read l; do :; done";

    /// `sh` tool process that records its pid, completes the handshake and
    /// then runs `after`.  Replies go through `printf %s` so backslashes
    /// survive.
    fn tool_process(pidfile: &Path, after: &str) -> SessionSpec {
        let script = format!(
            "echo $$ > '{pidfile}'; read l; printf '%s\\n' '{INIT_REPLY}'; read l; read l; \
             printf '%s\\n' '{LIST_REPLY}'; {after}",
            pidfile = pidfile.display()
        );
        SessionSpec {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            env: BTreeMap::new(),
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }

    fn answers_search() -> String {
        format!("read l; printf '%s\\n' '{PLACES_REPLY}'; {IDLE}")
    }

    fn recorded_pid(pidfile: &Path) -> u32 {
        std::fs::read_to_string(pidfile).unwrap().trim().parse().unwrap()
    }

    fn process_exists(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    /// Polls until `pid` is gone.  An orphan killed with its group may
    /// linger as a zombie until init reaps it; that counts as gone.
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..40 {
            let zombie = std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
                .unwrap_or(false);
            if !process_exists(pid) || zombie {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    struct FakeDaemon {
        ready: bool,
    }

    #[async_trait]
    impl DaemonApi for FakeDaemon {
        async fn probe(&self, _timeout: Duration) -> bool {
            self.ready
        }

        async fn list_models(&self) -> Result<Vec<ModelDescriptor>, LlmError> {
            Ok(Vec::new())
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        SearchOnce,
        AnswerDirectly,
        AlwaysSearch,
    }

    /// Reasoning turns follow `behaviour`; formatting turns (no tools)
    /// build an answer from the prompt.
    struct GuideModel {
        behaviour: Behaviour,
        format_calls: AtomicUsize,
    }

    impl GuideModel {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                format_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatModel for GuideModel {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            tools: Option<&serde_json::Value>,
        ) -> Result<ChatResponse, LlmError> {
            if tools.is_none() {
                self.format_calls.fetch_add(1, Ordering::SeqCst);
                let prompt = messages[1].content();
                let text = if prompt.contains(NO_RESULTS_PAYLOAD) {
                    format!("I couldn't find any places like that.\n\n{CLOSING_LINE}")
                } else {
                    format!(
                        "Here are some great options:\n\n**Top Rated (4.5+)**\n- **Blue Tokai** (HSR Layout) - 4.7.\n\n{CLOSING_LINE}"
                    )
                };
                return Ok(ChatResponse::text(text));
            }

            let last_is_user = messages.last().map(ChatMessage::role) == Some(Role::User);
            let search = || {
                ChatResponse::calls(vec![ToolCall::new(
                    "call_1",
                    "maps_search_places",
                    serde_json::json!({"query": "coffee"}),
                )])
            };
            Ok(match self.behaviour {
                Behaviour::SearchOnce if last_is_user => search(),
                Behaviour::AlwaysSearch => search(),
                _ => ChatResponse::text("Done."),
            })
        }
    }

    fn query_config(request_timeout_secs: u64) -> QueryConfig {
        QueryConfig {
            request_timeout_secs,
            ..QueryConfig::default()
        }
    }

    fn pipeline(
        ready: bool,
        model: Arc<GuideModel>,
        tool: SessionSpec,
        config: &QueryConfig,
    ) -> QueryPipeline {
        let timings = SupervisorTimings {
            poll_interval: Duration::from_millis(50),
            ..SupervisorTimings::default()
        };
        let supervisor = Arc::new(DaemonSupervisor::external(
            Arc::new(FakeDaemon { ready }),
            "http://127.0.0.1:1",
            timings,
        ));
        QueryPipeline::new(supervisor, model, tool, config)
    }

    // ── outcomes ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn search_result_is_formatted_and_session_closed() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("tool.pid");
        let model = GuideModel::new(Behaviour::SearchOnce);
        let pipeline = pipeline(
            true,
            model.clone(),
            tool_process(&pidfile, &answers_search()),
            &query_config(30),
        );

        let response = pipeline
            .run("coffee in HSR Layout", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, ResponseStatus::Answered);
        assert_eq!(response.loop_status, LoopStatus::Completed);
        assert_eq!(response.rounds, 1);
        assert!(response.text.contains("Blue Tokai"));
        assert!(response.report.is_compliant());
        assert_eq!(model.format_calls.load(Ordering::SeqCst), 1);
        assert!(!process_exists(recorded_pid(&pidfile)));
    }

    #[tokio::test]
    async fn query_without_tool_data_reports_no_results() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("tool.pid");
        let pipeline = pipeline(
            true,
            GuideModel::new(Behaviour::AnswerDirectly),
            tool_process(&pidfile, IDLE),
            &query_config(30),
        );

        let response = pipeline
            .run("find purple unicorn cafes on Mars", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, ResponseStatus::NoResults);
        assert!(response.text.contains("couldn't find"));
        assert!(response.report.has_closing_line);
        assert!(!process_exists(recorded_pid(&pidfile)));
    }

    #[tokio::test]
    async fn exhausted_loop_is_degraded_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("tool.pid");
        let config = QueryConfig {
            max_tool_rounds: 1,
            ..query_config(30)
        };
        let pipeline = pipeline(
            true,
            GuideModel::new(Behaviour::AlwaysSearch),
            tool_process(&pidfile, &answers_search()),
            &config,
        );

        let response = pipeline.run("coffee", &CancellationToken::new()).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Degraded);
        assert_eq!(response.loop_status, LoopStatus::Exhausted { rounds: 1 });
        assert!(response.text.contains("Blue Tokai"));
    }

    // ── failures ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unready_daemon_rejects_query() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("tool.pid");
        let config = query_config(0);
        let pipeline = pipeline(
            false,
            GuideModel::new(Behaviour::SearchOnce),
            tool_process(&pidfile, IDLE),
            &config,
        );

        let err = pipeline.run("coffee", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QueryError::DaemonUnavailable));
        // the tool process is never launched
        assert!(!pidfile.exists());
    }

    #[tokio::test]
    async fn handshake_failure_is_session_error() {
        let mut tool = tool_process(Path::new("/dev/null"), IDLE);
        tool.args = vec!["-c".into(), "exit 1".into()];
        let pipeline = pipeline(true, GuideModel::new(Behaviour::SearchOnce), tool, &query_config(30));

        let err = pipeline.run("coffee", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QueryError::Session(_)));
        assert!(!err.user_message().contains("JSON"));
    }

    // ── cancellation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn deadline_mid_loop_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("tool.pid");
        let pipeline = pipeline(
            true,
            GuideModel::new(Behaviour::SearchOnce),
            tool_process(&pidfile, IDLE),
            &query_config(2),
        );

        let err = pipeline.run("coffee", &CancellationToken::new()).await.unwrap_err();
        assert!(
            matches!(err, QueryError::DeadlineExceeded { stage: "reasoning", .. }),
            "{err:?}"
        );
        assert!(!process_exists(recorded_pid(&pidfile)));
    }

    #[tokio::test]
    async fn cancellation_mid_loop_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("tool.pid");
        let server_pidfile = dir.path().join("server.pid");
        // the tool process backgrounds the real server, as npx does
        let after = format!("sleep 1000 & echo $! > '{}'; {IDLE}", server_pidfile.display());
        let pipeline = pipeline(
            true,
            GuideModel::new(Behaviour::SearchOnce),
            tool_process(&pidfile, &after),
            &query_config(30),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = pidfile.clone();
        tokio::spawn(async move {
            // cancel once the tool process is up and the call is pending
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = pipeline.run("coffee", &cancel).await.unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!process_exists(recorded_pid(&pidfile)));
        assert!(wait_until_gone(recorded_pid(&server_pidfile)).await);
    }
}
