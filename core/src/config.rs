/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:7070";
const DEFAULT_SOCKET_URL: &str = "ws://127.0.0.1:7071";

/// Sync layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the updates feed (`GET /updates`, `POST /messages`)
    pub server_url: String,

    /// Base URL of the socket endpoint (`/ws/<conversation>`)
    pub socket_url: String,

    /// Try the socket channel before falling back to polling
    pub enable_socket: bool,

    /// Fast poll for message-level updates
    pub message_poll_interval: Duration,

    /// Slow poll for chat summaries on the "all conversations" scope
    pub summary_poll_interval: Duration,

    /// How long the socket may take to open before polling starts
    pub socket_grace: Duration,

    /// First reconnect delay; doubles each attempt
    pub reconnect_base_delay: Duration,

    /// Upper bound for a single reconnect delay
    pub reconnect_max_delay: Duration,

    /// Reconnect attempts before the selector reports disconnected
    pub max_reconnect_attempts: u32,

    /// Timeout of one poll request
    pub request_timeout: Duration,

    /// Pending/confirmed merge window
    pub merge_tolerance: Duration,

    /// Confirmed/confirmed duplicate window
    pub duplicate_tolerance: Duration,

    /// Number of reconciliation anomalies kept for inspection
    pub anomaly_log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            enable_socket: true,
            message_poll_interval: Duration::from_secs(3),
            summary_poll_interval: Duration::from_secs(10),
            socket_grace: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            request_timeout: Duration::from_secs(10),
            merge_tolerance: Duration::from_secs(5),
            duplicate_tolerance: Duration::from_secs(3),
            anomaly_log_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Parse flags out of `args`, returning the config and the remaining
    /// positional arguments.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--server" => {
                    config.server_url = flag_value(args, i, "--server")?.to_string();
                    i += 2;
                }
                "--socket" => {
                    config.socket_url = flag_value(args, i, "--socket")?.to_string();
                    i += 2;
                }
                "--poll-ms" => {
                    config.message_poll_interval = flag_millis(args, i, "--poll-ms")?;
                    i += 2;
                }
                "--grace-ms" => {
                    config.socket_grace = flag_millis(args, i, "--grace-ms")?;
                    i += 2;
                }
                "--no-socket" => {
                    config.enable_socket = false;
                    i += 1;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATSYNC_SERVER") {
            config.server_url = url;
        }
        if let Ok(url) = std::env::var("CHATSYNC_SOCKET") {
            config.socket_url = url;
        }
        if std::env::var("CHATSYNC_NO_SOCKET").is_ok() {
            config.enable_socket = false;
        }

        config.validate()?;
        Ok((config, positional))
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("message_poll_interval", self.message_poll_interval),
            ("summary_poll_interval", self.summary_poll_interval),
            ("socket_grace", self.socket_grace),
            ("reconnect_base_delay", self.reconnect_base_delay),
            ("request_timeout", self.request_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(SyncError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(SyncError::Config(
                "reconnect_base_delay must not exceed reconnect_max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| SyncError::Config(format!("{} requires an argument", flag)))
}

fn flag_millis(args: &[String], i: usize, flag: &str) -> Result<Duration> {
    let ms = flag_value(args, i, flag)?
        .parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{} must be a number of milliseconds", flag)))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_flags_and_positionals() {
        let (config, rest) = SyncConfig::from_args(&args(&[
            "watch",
            "--server",
            "http://example:1",
            "--poll-ms",
            "500",
            "c1",
        ]))
        .unwrap();
        assert_eq!(config.server_url, "http://example:1");
        assert_eq!(config.message_poll_interval, Duration::from_millis(500));
        assert_eq!(rest, vec!["watch".to_string(), "c1".to_string()]);
    }

    #[test]
    fn test_missing_flag_value() {
        assert!(SyncConfig::from_args(&args(&["--server"])).is_err());
        assert!(SyncConfig::from_args(&args(&["--poll-ms", "soon"])).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = SyncConfig {
            message_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let config = SyncConfig {
            reconnect_base_delay: Duration::from_secs(60),
            reconnect_max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
