//! Configuration management for overseer.
//!
//! Configuration can be set via environment variables:
//! - `VCS_BASE_URL` - Required. Base URL of the version-control host API.
//! - `VCS_TOKEN` - Optional. Bearer token for the version-control host.
//! - `BACKLOG_DB_PATH` - Optional. Path to the backlog database. Defaults to `backlog.db`.
//! - `WORKSPACE_ROOT` - Optional. Directory for session workspaces. Defaults to `./workspaces`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `MAX_CONCURRENT_SESSIONS` - Optional. Concurrency ceiling. Defaults to `3`.
//! - `MAX_ATTEMPTS_PER_SESSION` - Optional. Attempt cap per session. Defaults to `3`.
//! - `MAX_COST_PER_SESSION_CENTS` - Optional. Cost cap per session. Defaults to `500`.
//! - `MAX_TIME_PER_SESSION_SECS` - Optional. Wall-clock cap per session. Defaults to `14400` (4h).
//! - `CONSECUTIVE_FAILURE_CIRCUIT_BREAK` - Optional. Failures before the breaker trips. Defaults to `3`.
//! - `POLL_INTERVAL_SECS` - Optional. Backlog polling cadence. Defaults to `30`.
//! - `AGENT_CMD` - Optional. Command invoking the code-generation agent. Defaults to `opencode run`.
//! - `AGENT_TIMEOUT_SECS` - Optional. Timeout for one agent invocation. Defaults to `900`.
//! - `TEST_COMMAND` - Optional. Test-suite command run inside a workspace. Defaults to `cargo test`.
//! - `DOCS_ROOT` - Optional. Documentation root the sync gate checks. Defaults to `docs`.
//! - `ESCALATION_LABEL` - Optional. Label routing a task to a human. Defaults to `needs-human`.
//! - `REVIEW_POLL_INTERVAL_SECS` - Optional. Review-decision polling cadence. Defaults to `30`.
//! - `REVIEW_TIMEOUT_SECS` - Optional. Cap on waiting for a review decision. Unbounded by default.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Base URL of the version-control host API
    pub vcs_base_url: String,

    /// Bearer token for the version-control host
    pub vcs_token: Option<String>,

    /// Path to the backlog database
    pub backlog_db_path: PathBuf,

    /// Root directory under which session workspaces are created
    pub workspace_root: PathBuf,

    /// Maximum sessions concurrently holding a workspace
    pub max_concurrent_sessions: usize,

    /// Maximum code-generation attempts per session
    pub max_attempts_per_session: u32,

    /// Per-session cost ceiling, in cents
    pub max_cost_per_session_cents: u64,

    /// Per-session wall-clock ceiling
    pub max_time_per_session: Duration,

    /// Consecutive failed sessions before the circuit breaker trips
    pub consecutive_failure_circuit_break: u32,

    /// Backlog polling cadence
    pub poll_interval: Duration,

    /// Command used to invoke the external code-generation agent
    pub agent_command: String,

    /// Timeout for a single agent invocation
    pub agent_timeout: Duration,

    /// Test-suite command run inside a workspace
    pub test_command: String,

    /// Documentation root checked by the sync gate
    pub docs_root: String,

    /// Label that routes a task to human escalation
    pub escalation_label: String,

    /// Review-decision polling cadence
    pub review_poll_interval: Duration,

    /// Optional cap on waiting for a review decision
    pub review_timeout: Option<Duration>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `VCS_BASE_URL` is not set, or
    /// `ConfigError::InvalidValue` for unparsable numeric options.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vcs_base_url = std::env::var("VCS_BASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("VCS_BASE_URL".to_string()))?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3000u16)?;

        let backlog_db_path = std::env::var("BACKLOG_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("backlog.db"));

        let workspace_root = std::env::var("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("workspaces"));

        Ok(Self {
            host,
            port,
            vcs_base_url,
            vcs_token: std::env::var("VCS_TOKEN").ok(),
            backlog_db_path,
            workspace_root,
            max_concurrent_sessions: env_parse("MAX_CONCURRENT_SESSIONS", 3usize)?,
            max_attempts_per_session: env_parse("MAX_ATTEMPTS_PER_SESSION", 3u32)?,
            max_cost_per_session_cents: env_parse("MAX_COST_PER_SESSION_CENTS", 500u64)?,
            max_time_per_session: Duration::from_secs(env_parse(
                "MAX_TIME_PER_SESSION_SECS",
                14_400u64,
            )?),
            consecutive_failure_circuit_break: env_parse("CONSECUTIVE_FAILURE_CIRCUIT_BREAK", 3u32)?,
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", 30u64)?),
            agent_command: std::env::var("AGENT_CMD").unwrap_or_else(|_| "opencode run".to_string()),
            agent_timeout: Duration::from_secs(env_parse("AGENT_TIMEOUT_SECS", 900u64)?),
            test_command: std::env::var("TEST_COMMAND").unwrap_or_else(|_| "cargo test".to_string()),
            docs_root: std::env::var("DOCS_ROOT").unwrap_or_else(|_| "docs".to_string()),
            escalation_label: std::env::var("ESCALATION_LABEL")
                .unwrap_or_else(|_| "needs-human".to_string()),
            review_poll_interval: Duration::from_secs(env_parse("REVIEW_POLL_INTERVAL_SECS", 30u64)?),
            review_timeout: match std::env::var("REVIEW_TIMEOUT_SECS") {
                Ok(raw) => Some(Duration::from_secs(raw.parse().map_err(|e| {
                    ConfigError::InvalidValue("REVIEW_TIMEOUT_SECS".to_string(), format!("{}", e))
                })?)),
                Err(_) => None,
            },
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            vcs_base_url: "http://127.0.0.1:8080".to_string(),
            vcs_token: None,
            backlog_db_path: PathBuf::from("backlog.db"),
            workspace_root,
            max_concurrent_sessions: 3,
            max_attempts_per_session: 3,
            max_cost_per_session_cents: 500,
            max_time_per_session: Duration::from_secs(14_400),
            consecutive_failure_circuit_break: 3,
            poll_interval: Duration::from_millis(50),
            agent_command: "opencode run".to_string(),
            agent_timeout: Duration::from_secs(900),
            test_command: "cargo test".to_string(),
            docs_root: "docs".to_string(),
            escalation_label: "needs-human".to_string(),
            review_poll_interval: Duration::from_millis(10),
            review_timeout: None,
        }
    }
}
