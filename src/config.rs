//! Environment-driven configuration.
//!
//! Every recognized variable has a default so a bare `switchboard` run
//! comes up with sane behavior; deployments override through env.

use std::time::Duration;

/// Runtime settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path.
    pub db_path: String,
    /// HTTP/WS listen port.
    pub port: u16,

    /// Secret used to validate WS bearer tokens (HS256).
    pub jwt_secret: String,
    /// Key used to seal model API keys at rest.
    pub secret_encryption_key: String,

    /// Chat-shell transport mode: `http`, `bridge`, or `legacy`.
    pub chat_shell_mode: ChatShellMode,
    /// Base URL of the chat-shell service (http mode).
    pub chat_shell_url: String,
    /// Bearer token for chat-shell requests.
    pub chat_shell_token: Option<String>,
    /// Upper bound on tool iterations within one stream.
    pub chat_tool_max_requests: u32,
    /// Whether MCP servers are offered to the chat shell.
    pub chat_mcp_enabled: bool,
    /// Extra MCP servers (JSON object) merged into every stream.
    pub chat_mcp_servers: serde_json::Value,

    /// Web-search tool toggle and default result count.
    pub web_search_enabled: bool,
    pub web_search_default_max_results: u32,

    /// Long-term memory recall service.
    pub memory_enabled: bool,
    pub memory_base_url: String,
    pub memory_max_results: u32,
    pub memory_user_id_prefix: String,

    /// Executor service base URL.
    pub executor_url: String,

    /// Dispatcher quotas and cadence.
    pub max_concurrent_tasks: usize,
    pub max_offline_concurrent_tasks: usize,
    pub task_fetch_interval: Duration,
    /// Offline tasks only dispatch between evening and morning (local hours).
    pub offline_task_evening_hours: u32,
    pub offline_task_morning_hours: u32,

    /// Trigger scheduler staleness windows and retry policy.
    pub flow_stale_pending_hours: i64,
    pub flow_stale_running_hours: i64,
    pub flow_default_retry_count: u32,
    pub flow_default_timeout_seconds: u64,

    /// Per-process cap on concurrent in-process streams.
    pub max_concurrent_streams: usize,
    /// How long shutdown waits for in-flight streams before cancelling.
    pub graceful_shutdown_timeout: Duration,

    /// Telemetry knobs.
    pub otel_enabled: bool,
    pub otel_exporter_endpoint: Option<String>,
    pub otel_sampler_ratio: f64,
    pub otel_excluded_urls: Vec<String>,
    pub otel_disable_send_receive_spans: bool,
}

/// How the streaming engine reaches its chat backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatShellMode {
    /// Out-of-process chat shell over HTTP SSE.
    Http,
    /// In-process event bridge.
    Bridge,
    /// Compatibility mode for pre-bridge deployments; treated as http.
    Legacy,
}

impl ChatShellMode {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "bridge" => ChatShellMode::Bridge,
            "legacy" => ChatShellMode::Legacy,
            _ => ChatShellMode::Http,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let db_path = env_str("SWITCHBOARD_DB_PATH").unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.switchboard/switchboard.db")
        });

        Self {
            db_path,
            port: env_parse("SWITCHBOARD_PORT", 8000),
            jwt_secret: env_str("JWT_SECRET").unwrap_or_else(|| "switchboard-dev-secret".into()),
            secret_encryption_key: env_str("SECRET_ENCRYPTION_KEY")
                .unwrap_or_else(|| "switchboard-dev-sealing-key".into()),
            chat_shell_mode: ChatShellMode::parse(
                &env_str("CHAT_SHELL_MODE").unwrap_or_else(|| "http".into()),
            ),
            chat_shell_url: env_str("CHAT_SHELL_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8100".into()),
            chat_shell_token: env_str("CHAT_SHELL_TOKEN"),
            chat_tool_max_requests: env_parse("CHAT_TOOL_MAX_REQUESTS", 25),
            chat_mcp_enabled: env_parse("CHAT_MCP_ENABLED", false),
            chat_mcp_servers: env_str("CHAT_MCP_SERVERS")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            web_search_enabled: env_parse("WEB_SEARCH_ENABLED", false),
            web_search_default_max_results: env_parse("WEB_SEARCH_DEFAULT_MAX_RESULTS", 5),
            memory_enabled: env_parse("MEMORY_ENABLED", false),
            memory_base_url: env_str("MEMORY_BASE_URL").unwrap_or_default(),
            memory_max_results: env_parse("MEMORY_MAX_RESULTS", 5),
            memory_user_id_prefix: env_str("MEMORY_USER_ID_PREFIX").unwrap_or_default(),
            executor_url: env_str("EXECUTOR_URL").unwrap_or_else(|| "http://127.0.0.1:8200".into()),
            max_concurrent_tasks: env_parse("MAX_CONCURRENT_TASKS", 30),
            max_offline_concurrent_tasks: env_parse("MAX_OFFLINE_CONCURRENT_TASKS", 10),
            task_fetch_interval: Duration::from_secs(env_parse("TASK_FETCH_INTERVAL", 5)),
            offline_task_evening_hours: env_parse("OFFLINE_TASK_EVENING_HOURS", 22),
            offline_task_morning_hours: env_parse("OFFLINE_TASK_MORNING_HOURS", 7),
            flow_stale_pending_hours: env_parse("FLOW_STALE_PENDING_HOURS", 1),
            flow_stale_running_hours: env_parse("FLOW_STALE_RUNNING_HOURS", 3),
            flow_default_retry_count: env_parse("FLOW_DEFAULT_RETRY_COUNT", 3),
            flow_default_timeout_seconds: env_parse("FLOW_DEFAULT_TIMEOUT_SECONDS", 600),
            max_concurrent_streams: env_parse("MAX_CONCURRENT_STREAMS", 64),
            graceful_shutdown_timeout: Duration::from_secs(env_parse(
                "GRACEFUL_SHUTDOWN_TIMEOUT",
                30,
            )),
            otel_enabled: env_parse("OTEL_ENABLED", false),
            otel_exporter_endpoint: env_str("OTEL_EXPORTER_OTLP_ENDPOINT"),
            otel_sampler_ratio: env_parse("OTEL_TRACES_SAMPLER_ARG", 1.0),
            otel_excluded_urls: env_str("OTEL_EXCLUDED_URLS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            otel_disable_send_receive_spans: env_parse("OTEL_DISABLE_SEND_RECEIVE_SPANS", true),
        }
    }

    /// Whether the given local hour falls inside the offline dispatch window.
    ///
    /// The window wraps midnight: evening 22 / morning 7 means 22:00..=23:59
    /// and 00:00..<07:00.
    pub fn offline_window_open(&self, hour: u32) -> bool {
        if self.offline_task_evening_hours <= self.offline_task_morning_hours {
            hour >= self.offline_task_evening_hours && hour < self.offline_task_morning_hours
        } else {
            hour >= self.offline_task_evening_hours || hour < self.offline_task_morning_hours
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_window_wraps_midnight() {
        let mut settings = Settings::from_env();
        settings.offline_task_evening_hours = 22;
        settings.offline_task_morning_hours = 7;

        assert!(settings.offline_window_open(23));
        assert!(settings.offline_window_open(3));
        assert!(!settings.offline_window_open(12));
        assert!(!settings.offline_window_open(7));
    }

    #[test]
    fn chat_shell_mode_parses_known_values() {
        assert_eq!(ChatShellMode::parse("bridge"), ChatShellMode::Bridge);
        assert_eq!(ChatShellMode::parse("HTTP"), ChatShellMode::Http);
        assert_eq!(ChatShellMode::parse("anything"), ChatShellMode::Http);
    }
}
