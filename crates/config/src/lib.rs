use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model tag served by the local daemon (e.g. `llama3.3:70b`).
    pub model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Upper bound for a single non-streaming chat call.
    pub chat_timeout_secs: u64,
    /// Upper bound for the model listing call.
    pub list_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "llama3.3:70b".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_timeout_secs: 300,
            list_timeout_secs: 10,
        }
    }
}

impl LlmConfig {
    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }
}

// ── Inference daemon ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// When `false` the daemon is assumed to be run by someone else: it is
    /// never launched or signalled, only probed.
    pub manage: bool,
    pub program: String,
    pub args: Vec<String>,
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// How long each stop escalation step waits for the process to exit.
    pub stop_grace_secs: u64,
    /// Delay between signalling the daemon and re-probing its endpoint.
    pub settle_ms: u64,
    /// Arguments passed to `program` to provision a model; the model name
    /// is appended.
    pub pull_args: Vec<String>,
    /// Large models take a while; keep this generous.
    pub pull_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            manage: true,
            program: "ollama".to_string(),
            args: vec!["serve".to_string()],
            startup_timeout_secs: 30,
            poll_interval_ms: 1000,
            probe_timeout_ms: 2000,
            stop_grace_secs: 5,
            settle_ms: 1000,
            pull_args: vec!["pull".to_string()],
            pull_timeout_secs: 600,
        }
    }
}

impl DaemonConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

// ── Tool process ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for the tool process.  The child does not inherit
    /// the parent environment beyond a handful of system variables.
    pub env: BTreeMap<String, String>,
    /// Name of the environment variable carrying the provider credential.
    /// When set in the parent environment it is copied into `env`.
    pub credential_env: String,
    pub handshake_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-google-maps".to_string(),
            ],
            env: BTreeMap::new(),
            credential_env: "GOOGLE_MAPS_API_KEY".to_string(),
            handshake_timeout_secs: 30,
            call_timeout_secs: 30,
        }
    }
}

impl ToolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn has_credential(&self) -> bool {
        self.env
            .get(&self.credential_env)
            .is_some_and(|value| !value.trim().is_empty())
    }
}

// ── Query pipeline ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Maximum number of model → tool → model rounds per request.
    pub max_tool_rounds: usize,
    /// Deadline covering the health wait, tool negotiation and the
    /// reasoning loop.
    pub request_timeout_secs: u64,
    pub format_timeout_secs: u64,
    /// Word ceiling the formatter asks the model to respect.
    pub word_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            request_timeout_secs: 120,
            format_timeout_secs: 120,
            word_limit: 200,
        }
    }
}

impl QueryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn format_timeout(&self) -> Duration {
        Duration::from_secs(self.format_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub daemon: DaemonConfig,
    pub tool: ToolConfig,
    pub query: QueryConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// A missing file yields defaults; any other read failure is an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config {}", path.display()));
            }
        };

        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Environment values take precedence over the config file.  Empty
    /// values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = lookup("OLLAMA_BASE_URL") {
            self.llm.base_url = value;
        }

        if let Some(value) = lookup("WAYFINDER_MODEL") {
            self.llm.model = value;
        }

        if !self.tool.credential_env.is_empty() {
            if let Some(key) = lookup(&self.tool.credential_env) {
                self.tool.env.insert(self.tool.credential_env.clone(), key);
            }
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Defaults ───────────────────────────────────────────────────────────

    #[test]
    fn defaults_match_local_ollama_setup() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.model, "llama3.3:70b");
        assert_eq!(cfg.llm.base_url, "http://localhost:11434");
        assert_eq!(cfg.daemon.program, "ollama");
        assert_eq!(cfg.daemon.args, vec!["serve".to_string()]);
        assert_eq!(cfg.daemon.pull_args, vec!["pull".to_string()]);
        assert!(cfg.daemon.manage);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    #[test]
    fn timing_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.daemon.startup_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.daemon.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.daemon.probe_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.daemon.stop_grace(), Duration::from_secs(5));
        assert_eq!(cfg.daemon.pull_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.llm.list_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn query_defaults() {
        let q = QueryConfig::default();
        assert_eq!(q.max_tool_rounds, 5);
        assert_eq!(q.word_limit, 200);
        assert_eq!(q.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn tool_defaults_launch_maps_server() {
        let tool = ToolConfig::default();
        assert_eq!(tool.command, "npx");
        assert!(tool.args.iter().any(|a| a.contains("server-google-maps")));
        assert_eq!(tool.credential_env, "GOOGLE_MAPS_API_KEY");
        assert!(!tool.has_credential());
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.daemon.program, "ollama");
        assert_eq!(cfg.query.max_tool_rounds, 5);
    }

    #[test]
    fn load_from_unreadable_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = AppConfig::load_from(dir.path()).unwrap_err();
        assert!(err.to_string().contains("failed to read config"), "{err:#}");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[daemon]
startup_timeout_secs = 90
args = ["serve", "--verbose"]

[query]
max_tool_rounds = 3
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.daemon.startup_timeout_secs, 90);
        assert_eq!(cfg.daemon.args, vec!["serve", "--verbose"]);
        assert_eq!(cfg.query.max_tool_rounds, 3);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.daemon.program, "ollama");
        assert_eq!(cfg.query.word_limit, 200);
        assert_eq!(cfg.tool.command, "npx");
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn tool_env_table_parses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tool.toml");
        fs::write(
            &path,
            r#"
[tool]
command = "node"
args = ["server.js"]
credential_env = "WAYFINDER_TEST_UNSET_KEY"

[tool.env]
REGION = "eu"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.tool.command, "node");
        assert_eq!(cfg.tool.env.get("REGION").map(String::as_str), Some("eu"));
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.llm.model = "qwen2.5:7b".to_string();
        cfg.daemon.manage = false;
        cfg.tool.credential_env = "WAYFINDER_TEST_UNSET_KEY".to_string();
        cfg.query.word_limit = 120;

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.model, "qwen2.5:7b");
        assert!(!loaded.daemon.manage);
        assert_eq!(loaded.query.word_limit, 120);
    }

    // ── Env overrides ──────────────────────────────────────────────────────

    #[test]
    fn env_overrides_base_url_and_model() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(lookup_from(&[
            ("OLLAMA_BASE_URL", "http://gpu-box:11434"),
            ("WAYFINDER_MODEL", "llama3.1:8b"),
        ]));
        assert_eq!(cfg.llm.base_url, "http://gpu-box:11434");
        assert_eq!(cfg.llm.model, "llama3.1:8b");
    }

    #[test]
    fn env_credential_copied_into_tool_env() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(lookup_from(&[("GOOGLE_MAPS_API_KEY", "secret")]));
        assert_eq!(
            cfg.tool.env.get("GOOGLE_MAPS_API_KEY").map(String::as_str),
            Some("secret")
        );
        assert!(cfg.tool.has_credential());
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(lookup_from(&[
            ("OLLAMA_BASE_URL", ""),
            ("GOOGLE_MAPS_API_KEY", "   "),
        ]));
        assert_eq!(cfg.llm.base_url, "http://localhost:11434");
        assert!(cfg.tool.env.is_empty());
    }
}
