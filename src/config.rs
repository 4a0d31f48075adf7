//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Invalid numeric values fall back to
//! their defaults; an unparsable listen address, kernel command or
//! readiness criterion is an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::kernel::HeartbeatSettings;
use crate::service::{KernelTemplate, SessionSettings};
use crate::supervisor::{ReadinessPolicy, RestartPolicy, RetryPolicy};

/// Default kernel command line.
pub const DEFAULT_KERNEL_COMMAND: &str = "python3 -m ipykernel_launcher -f {connection_file}";

/// Configuration that could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `LISTEN_ADDR` is not a socket address.
    #[error("invalid LISTEN_ADDR {value:?}: {source}")]
    ListenAddr {
        /// Offending value.
        value: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },
    /// `KERNEL_COMMAND` is empty.
    #[error("KERNEL_COMMAND must name a program")]
    EmptyCommand,
    /// `KERNEL_READINESS` is not a known criterion.
    #[error("invalid KERNEL_READINESS: {0}")]
    Readiness(String),
    /// `KERNEL_ENV` contains an entry without `=`.
    #[error("invalid KERNEL_ENV entry {0:?}, expected KEY=VALUE")]
    EnvEntry(String),
}

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:3000`).
    pub listen_addr: SocketAddr,

    /// Kernel executable and arguments; `{connection_file}` is substituted.
    pub kernel_command: Vec<String>,

    /// Working directory of kernel processes.
    pub kernel_working_dir: PathBuf,

    /// Directory where kernel connection files are written.
    pub kernel_runtime_dir: PathBuf,

    /// Extra environment for kernel processes.
    pub kernel_env: Vec<(String, String)>,

    /// How kernel readiness is detected.
    pub readiness: ReadinessPolicy,

    /// Readiness poll interval.
    pub readiness_interval: Duration,

    /// Readiness poll budget.
    pub readiness_max_attempts: u32,

    /// Heartbeat period.
    pub heartbeat_interval: Duration,

    /// Missed heartbeats before a kernel is unresponsive.
    pub heartbeat_max_misses: u32,

    /// A kernel dying younger than this counts as a crash-loop strike.
    pub restart_min_uptime: Duration,

    /// Minimum spacing between restarts.
    pub restart_min_interval: Duration,

    /// Consecutive strikes before a session fails.
    pub restart_max_strikes: u32,

    /// Wait between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,

    /// Interrupt grace period when closing a busy session.
    pub close_grace: Duration,

    /// Idle eviction timeout; `None` disables it.
    pub session_idle_timeout: Option<Duration>,

    /// Per-connection output queue depth.
    pub subscriber_buffer: usize,

    /// Per-session command queue depth.
    pub session_command_buffer: usize,

    /// Queued execute requests per session.
    pub max_pending_executions: usize,
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `LISTEN_ADDR`, `KERNEL_COMMAND`,
    /// `KERNEL_READINESS` or `KERNEL_ENV` cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`GatewayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let listen = env.string("LISTEN_ADDR", "0.0.0.0:3000");
        let listen_addr = listen
            .parse()
            .map_err(|source| ConfigError::ListenAddr {
                value: listen.clone(),
                source,
            })?;

        let kernel_command: Vec<String> = env
            .string("KERNEL_COMMAND", DEFAULT_KERNEL_COMMAND)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if kernel_command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        let readiness = env
            .string("KERNEL_READINESS", "connection_file")
            .parse()
            .map_err(|e: crate::error::GatewayError| ConfigError::Readiness(e.to_string()))?;

        let kernel_env = parse_env_pairs(&env.string("KERNEL_ENV", ""))?;

        let idle_secs: u64 = env.parse("SESSION_IDLE_TIMEOUT_SECS", 0);

        Ok(Self {
            listen_addr,
            kernel_command,
            kernel_working_dir: PathBuf::from(env.string("KERNEL_WORKING_DIR", ".")),
            kernel_runtime_dir: lookup("KERNEL_RUNTIME_DIR")
                .map_or_else(std::env::temp_dir, PathBuf::from),
            kernel_env,
            readiness,
            readiness_interval: env.millis("READINESS_INTERVAL_MS", 1000),
            readiness_max_attempts: env.parse("READINESS_MAX_ATTEMPTS", 10),
            heartbeat_interval: env.millis("HEARTBEAT_INTERVAL_MS", 3000),
            heartbeat_max_misses: env.parse("HEARTBEAT_MAX_MISSES", 3),
            restart_min_uptime: env.millis("RESTART_MIN_UPTIME_MS", 1000),
            restart_min_interval: env.millis("RESTART_MIN_INTERVAL_MS", 1000),
            restart_max_strikes: env.parse("RESTART_MAX_STRIKES", 2),
            stop_timeout: env.millis("STOP_TIMEOUT_MS", 5000),
            close_grace: env.millis("CLOSE_GRACE_MS", 2000),
            session_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            subscriber_buffer: env.parse("SUBSCRIBER_BUFFER", 1024),
            session_command_buffer: env.parse("SESSION_COMMAND_BUFFER", 256),
            max_pending_executions: env.parse("MAX_PENDING_EXECUTIONS", 1024),
        })
    }

    /// Readiness polling budget.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: self.readiness_interval,
            max_attempts: self.readiness_max_attempts.max(1),
        }
    }

    /// Crash-loop bounds.
    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            min_uptime: self.restart_min_uptime,
            min_restart_interval: self.restart_min_interval,
            max_strikes: self.restart_max_strikes.max(1),
        }
    }

    /// Heartbeat probing.
    #[must_use]
    pub fn heartbeat(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: self.heartbeat_interval,
            max_misses: self.heartbeat_max_misses.max(1),
        }
    }

    /// Launch template for kernel processes.
    #[must_use]
    pub fn kernel_template(&self) -> KernelTemplate {
        let (program, args) = match self.kernel_command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        KernelTemplate {
            program,
            args,
            working_dir: self.kernel_working_dir.clone(),
            env: self.kernel_env.clone(),
            readiness: self.readiness.clone(),
            runtime_dir: self.kernel_runtime_dir.clone(),
        }
    }

    /// Session worker tunables.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.session_idle_timeout,
            close_grace: self.close_grace,
            max_pending: self.max_pending_executions,
            command_buffer: self.session_command_buffer.max(1),
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    /// Parses a variable as `T`, returning `default` on missing or invalid
    /// values.
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: u64) -> Duration {
        Duration::from_millis(self.parse(key, default))
    }
}

/// Parses `KEY=VALUE` pairs separated by `;`.
fn parse_env_pairs(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(ConfigError::EnvEntry(entry.to_string())),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let Ok(config) = load(&[]) else {
            panic!("defaults should load");
        };
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.kernel_command.first().map(String::as_str), Some("python3"));
        assert_eq!(config.readiness, ReadinessPolicy::ConnectionFile);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.restart_policy(), RestartPolicy::default());
        assert_eq!(config.heartbeat(), HeartbeatSettings::default());
        assert_eq!(config.session_settings(), SessionSettings::default());
        assert_eq!(config.subscriber_buffer, 1024);
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let Ok(config) = load(&[
            ("READINESS_MAX_ATTEMPTS", "many"),
            ("HEARTBEAT_INTERVAL_MS", "-5"),
        ]) else {
            panic!("should load");
        };
        assert_eq!(config.readiness_max_attempts, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(3000));
    }

    #[test]
    fn bad_listen_addr_is_an_error() {
        assert!(matches!(
            load(&[("LISTEN_ADDR", "localhost")]),
            Err(ConfigError::ListenAddr { .. })
        ));
    }

    #[test]
    fn bad_readiness_is_an_error() {
        assert!(matches!(
            load(&[("KERNEL_READINESS", "ftp://x")]),
            Err(ConfigError::Readiness(_))
        ));
        assert!(matches!(
            load(&[("KERNEL_COMMAND", "   ")]),
            Err(ConfigError::EmptyCommand)
        ));
    }

    #[test]
    fn kernel_template_splits_command_and_env() {
        let Ok(config) = load(&[
            ("KERNEL_COMMAND", "ipython kernel -f {connection_file}"),
            ("KERNEL_ENV", "A=1; B=x=y ;"),
            ("KERNEL_READINESS", "grace:500"),
            ("SESSION_IDLE_TIMEOUT_SECS", "90"),
        ]) else {
            panic!("should load");
        };
        let template = config.kernel_template();
        assert_eq!(template.program, "ipython");
        assert_eq!(template.args, vec!["kernel", "-f", "{connection_file}"]);
        assert_eq!(
            template.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert_eq!(
            template.readiness,
            ReadinessPolicy::Grace(Duration::from_millis(500))
        );
        assert_eq!(
            config.session_settings().idle_timeout,
            Some(Duration::from_secs(90))
        );
    }

    #[test]
    fn env_entry_without_equals_is_rejected() {
        assert!(matches!(
            load(&[("KERNEL_ENV", "JUSTAKEY")]),
            Err(ConfigError::EnvEntry(_))
        ));
    }
}
