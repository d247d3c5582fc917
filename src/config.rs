use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration loaded from environment variables.
pub struct Config {
    pub workspace: PathBuf,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("REQFLOW_WORKSPACE").ok().as_deref(),
            std::env::var("REQFLOW_HTTP_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("REQFLOW_CONNECT_TIMEOUT_SECS").ok().as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        workspace: Option<&str>,
        http_timeout: Option<&str>,
        connect_timeout: Option<&str>,
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
    ) -> Self {
        let workspace = workspace
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_workspace);

        let http_timeout = parse_secs(http_timeout, DEFAULT_HTTP_TIMEOUT_SECS);
        let connect_timeout = parse_secs(connect_timeout, DEFAULT_CONNECT_TIMEOUT_SECS);

        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        Config {
            workspace,
            http_timeout,
            connect_timeout,
            sentry_dsn,
            environment,
        }
    }
}

fn parse_secs(raw: Option<&str>, default: u64) -> Duration {
    let secs = raw
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn default_workspace() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".reqflow")
        .join("workspace.json")
}
