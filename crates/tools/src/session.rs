//! Short-lived stdio session with a tool process.
//!
//! A session is opened for one request and closed when that request ends,
//! whatever the outcome.  Launchers such as `npx` run the real server as a
//! grandchild, so on unix the child leads its own process group and the
//! whole group is killed on close.  An abandoned session does the same from
//! `Drop`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::*;
use crate::{SessionError, ToolChannel, ToolSpec};

/// Variables inherited from the parent; everything else comes from
/// [`SessionSpec::env`].
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM"];

const CLIENT_NAME: &str = "wayfinder";

/// How long `close` waits for the killed process to be reaped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How to launch and talk to a tool process.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct ToolSession {
    program: String,
    pid: Option<u32>,
    next_id: AtomicU64,
    pipes: Mutex<Option<Pipes>>,
    child: Mutex<Option<Child>>,
    tools: Vec<ToolSpec>,
    call_timeout: Duration,
}

impl ToolSession {
    /// Launch the tool process, run the initialize handshake and list its
    /// tools.  On any failure the process is killed before returning.
    pub async fn open(spec: &SessionSpec) -> Result<Self, SessionError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.env_clear();
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&spec.env);

        let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
            program: spec.command.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Transport("tool process stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Transport("tool process stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "wayfinder::tool", pid, "{line}");
                }
            });
        }

        let mut session = Self {
            program: spec.command.clone(),
            pid,
            next_id: AtomicU64::new(1),
            pipes: Mutex::new(Some(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            })),
            child: Mutex::new(Some(child)),
            tools: Vec::new(),
            call_timeout: spec.call_timeout,
        };

        match tokio::time::timeout(spec.handshake_timeout, session.handshake()).await {
            Ok(Ok(tools)) => {
                info!(
                    program = %session.program,
                    pid = ?session.pid,
                    tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
                    "tool session open"
                );
                session.tools = tools;
                Ok(session)
            }
            Ok(Err(err)) => {
                session.close().await;
                Err(SessionError::Handshake(err.to_string()))
            }
            Err(_) => {
                session.close().await;
                Err(SessionError::Handshake(format!(
                    "no answer within {:?}",
                    spec.handshake_timeout
                )))
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn is_open(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Kill the tool process and release its pipes.  Idempotent.
    pub async fn close(&self) {
        // Kill before taking the pipes: an in-flight read then sees EOF and
        // releases the pipe lock.
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Some(pid) = self.pid {
                kill_process_group(pid);
            }
            if let Err(err) = child.start_kill() {
                debug!(pid = ?self.pid, %err, "tool process already gone");
            }
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "tool process exited"),
                Ok(Err(err)) => warn!(pid = ?self.pid, %err, "failed to reap tool process"),
                Err(_) => warn!(pid = ?self.pid, "tool process did not exit after kill"),
            }
            info!(program = %self.program, pid = ?self.pid, "tool session closed");
        }
        self.pipes.lock().await.take();
    }

    async fn handshake(&self) -> Result<Vec<ToolSpec>, SessionError> {
        let params = InitializeParams::for_client(CLIENT_NAME, env!("CARGO_PKG_VERSION"));
        let init = self
            .send_request("initialize", Some(serde_json::to_value(&params)?))
            .await?;
        debug!(
            server = %init.get("serverInfo").cloned().unwrap_or_default(),
            "tool process initialized"
        );

        self.send_notification("notifications/initialized").await?;

        let listed: ToolsListResult =
            serde_json::from_value(self.send_request("tools/list", None).await?)?;
        Ok(listed.tools.into_iter().map(ToolSpec::from).collect())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, SessionError> {
        tokio::time::timeout(timeout, self.send_request(method, params))
            .await
            .map_err(|_| SessionError::Timeout {
                method: method.to_string(),
                timeout,
            })?
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, SessionError> {
        let mut guard = self.pipes.lock().await;
        let pipes = guard.as_mut().ok_or(SessionError::Closed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        line.push('\n');
        pipes.stdin.write_all(line.as_bytes()).await?;
        pipes.stdin.flush().await?;

        read_response(&mut pipes.stdout, id).await?.into_result()
    }

    async fn send_notification(&self, method: &str) -> Result<(), SessionError> {
        let mut guard = self.pipes.lock().await;
        let pipes = guard.as_mut().ok_or(SessionError::Closed)?;

        let mut line = serde_json::to_string(&JsonRpcNotification::new(method))?;
        line.push('\n');
        pipes.stdin.write_all(line.as_bytes()).await?;
        pipes.stdin.flush().await?;
        Ok(())
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        if self.child.get_mut().is_some() {
            if let Some(pid) = self.pid {
                debug!(pid, "tool session dropped without close");
                kill_process_group(pid);
            }
        }
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        debug!(
            pid,
            err = %std::io::Error::last_os_error(),
            "tool process group already gone"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Read lines until a response carrying `expected_id` arrives.  Blank
/// lines, non-JSON output, requests and notifications from the server and
/// other ids are skipped.
async fn read_response(
    stdout: &mut BufReader<ChildStdout>,
    expected_id: u64,
) -> Result<JsonRpcResponse, SessionError> {
    let mut buf = String::new();
    loop {
        buf.clear();
        if stdout.read_line(&mut buf).await? == 0 {
            return Err(SessionError::Transport("tool process closed stdout".into()));
        }
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok(message) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            debug!(line = trimmed, "skipping non-JSON output from tool process");
            continue;
        };
        if let Some(method) = message.get("method") {
            debug!(%method, "skipping server-initiated message");
            continue;
        }

        match serde_json::from_value::<JsonRpcResponse>(message) {
            Ok(response) if response.id == Some(expected_id) => return Ok(response),
            Ok(response) => debug!(id = ?response.id, expected_id, "skipping unrelated message"),
            Err(err) => debug!(%err, "skipping malformed JSON-RPC message"),
        }
    }
}

#[async_trait]
impl ToolChannel for ToolSession {
    fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, SessionError> {
        if !self.has_tool(name) {
            return Err(SessionError::UnknownTool(name.to_string()));
        }

        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        let started = Instant::now();
        let value = self
            .request("tools/call", Some(params), self.call_timeout)
            .await?;
        let result: ToolCallResult = serde_json::from_value(value)?;
        let text = result.text();

        if result.is_error {
            return Err(SessionError::ToolFailed {
                tool: name.to_string(),
                message: text,
            });
        }

        debug!(
            tool = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = text.len(),
            "tool call finished"
        );
        Ok(text)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake-maps","version":"0.0.1"}}}"#;
    const LIST_REPLY: &str = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"maps_search_places","description":"Search for places","inputSchema":{"type":"object","properties":{"query":{"type":"string"}},"required":["query"]}}]}}"#;

    /// A tool process in `sh`: answers initialize (id 1), swallows the
    /// initialized notification, prints some noise, answers tools/list
    /// (id 2), then runs `after`.
    fn fake_server(after: &str) -> String {
        format!(
            "read l; echo '{INIT_REPLY}'; read l; read l; \
             echo 'npx: installed 1 package'; \
             echo '{{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{{}}}}'; \
             echo '{LIST_REPLY}'; {after}"
        )
    }

    const IDLE: &str = "while read l; do :; done";

    fn spec(script: String) -> SessionSpec {
        SessionSpec {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            env: BTreeMap::new(),
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn process_exists(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    /// Like [`process_exists`], but a zombie waiting for its new parent to
    /// reap it counts as gone.
    fn process_running(pid: u32) -> bool {
        if !process_exists(pid) {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    async fn read_pid(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(path)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
            {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..40 {
            if !process_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Tool process that backgrounds a long-lived grandchild, the way `npx`
    /// runs the real server.
    fn spawning_server(pidfile: &Path) -> SessionSpec {
        spec(fake_server(&format!(
            "sleep 1000 & echo $! > '{}'; {IDLE}",
            pidfile.display()
        )))
    }

    // ── open ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn open_negotiates_tools() {
        let session = ToolSession::open(&spec(fake_server(IDLE))).await.unwrap();
        assert_eq!(session.tools().len(), 1);
        assert_eq!(session.tools()[0].name, "maps_search_places");
        assert_eq!(session.tools()[0].parameters["required"][0], "query");
        assert!(session.has_tool("maps_search_places"));
        assert!(session.is_open().await);
        session.close().await;
    }

    #[tokio::test]
    async fn early_exit_is_handshake_error() {
        let err = ToolSession::open(&spec("exit 0".into())).await.err().unwrap();
        assert!(matches!(err, SessionError::Handshake(_)), "{err:?}");
    }

    #[tokio::test]
    async fn silent_process_times_out_handshake() {
        let mut spec = spec(IDLE.into());
        spec.handshake_timeout = Duration::from_millis(300);
        let err = ToolSession::open(&spec).await.err().unwrap();
        assert!(matches!(err, SessionError::Handshake(ref m) if m.contains("no answer")));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let mut spec = spec(String::new());
        spec.command = "wayfinder-no-such-tool".into();
        let err = ToolSession::open(&spec).await.err().unwrap();
        assert!(matches!(err, SessionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn environment_is_cleared_except_configured() {
        let reply = r#"printf '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"%s|%s"}]}}\n' "$MAPS_KEY" "${CARGO_MANIFEST_DIR:-unset}""#;
        let mut spec = spec(fake_server(&format!("read l; {reply}; {IDLE}")));
        spec.env.insert("MAPS_KEY".into(), "secret".into());

        let session = ToolSession::open(&spec).await.unwrap();
        let text = session
            .call_tool("maps_search_places", json!({"query": "tea"}))
            .await
            .unwrap();
        assert_eq!(text, "secret|unset");
        session.close().await;
    }

    // ── call_tool ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn call_skips_other_ids_and_joins_text() {
        let after = format!(
            "read l; echo '{{\"jsonrpc\":\"2.0\",\"id\":99,\"result\":{{}}}}'; \
             echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"Pizza Place\"}},{{\"type\":\"text\",\"text\":\"4.6\"}}]}}}}'; {IDLE}"
        );
        let session = ToolSession::open(&spec(fake_server(&after))).await.unwrap();
        let text = session
            .call_tool("maps_search_places", json!({"query": "pizza"}))
            .await
            .unwrap();
        assert_eq!(text, "Pizza Place\n4.6");
        session.close().await;
    }

    #[tokio::test]
    async fn server_request_reusing_id_is_not_a_response() {
        let after = format!(
            "read l; echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}}'; \
             echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"Cafe\"}}]}}}}'; {IDLE}"
        );
        let session = ToolSession::open(&spec(fake_server(&after))).await.unwrap();
        let text = session
            .call_tool("maps_search_places", json!({"query": "cafe"}))
            .await
            .unwrap();
        assert_eq!(text, "Cafe");
        session.close().await;
    }

    #[tokio::test]
    async fn is_error_result_is_tool_failure() {
        let after = format!(
            "read l; echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"REQUEST_DENIED\"}}],\"isError\":true}}}}'; {IDLE}"
        );
        let session = ToolSession::open(&spec(fake_server(&after))).await.unwrap();
        let err = session
            .call_tool("maps_search_places", json!({"query": "pizza"}))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SessionError::ToolFailed { ref message, .. } if message == "REQUEST_DENIED")
        );
        session.close().await;
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_locally() {
        let session = ToolSession::open(&spec(fake_server(IDLE))).await.unwrap();
        let err = session.call_tool("maps_teleport", json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownTool(ref name) if name == "maps_teleport"));
        session.close().await;
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let mut spec = spec(fake_server(IDLE));
        spec.call_timeout = Duration::from_millis(200);
        let session = ToolSession::open(&spec).await.unwrap();
        let err = session
            .call_tool("maps_search_places", json!({"query": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { ref method, .. } if method == "tools/call"));
        session.close().await;
    }

    // ── close ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn close_terminates_process_and_is_idempotent() {
        let session = ToolSession::open(&spec(fake_server(IDLE))).await.unwrap();
        let pid = session.pid().unwrap();
        assert!(process_exists(pid));

        session.close().await;
        assert!(!session.is_open().await);
        assert!(!process_exists(pid));

        session.close().await;
        let err = session
            .call_tool("maps_search_places", json!({"query": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn close_kills_background_children() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("server.pid");
        let session = ToolSession::open(&spawning_server(&pidfile)).await.unwrap();
        let grandchild = read_pid(&pidfile).await;
        assert!(process_running(grandchild));

        session.close().await;
        assert!(wait_until_gone(grandchild).await, "grandchild {grandchild} survived close");
    }

    #[tokio::test]
    async fn dropped_session_kills_its_process_group() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("server.pid");
        let session = ToolSession::open(&spawning_server(&pidfile)).await.unwrap();
        let grandchild = read_pid(&pidfile).await;

        drop(session);
        assert!(wait_until_gone(grandchild).await, "grandchild {grandchild} survived drop");
    }
}
