//! Logging options

/// How log output is filtered and formatted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `info` or `smsc=debug,smsc_sigtran=trace`
    pub log_level: String,
    /// One JSON object per line instead of human-readable text
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new("info", true)
    }
}

impl TelemetryConfig {
    pub fn new(log_level: impl Into<String>, json_logs: bool) -> Self {
        Self {
            log_level: log_level.into(),
            json_logs,
        }
    }

    /// `RUST_LOG` and `JSON_LOGS`, for processes without a config file
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            json_logs: match std::env::var("JSON_LOGS") {
                Ok(v) => matches!(v.as_str(), "1" | "true"),
                Err(_) => defaults.json_logs,
            },
        }
    }
}
