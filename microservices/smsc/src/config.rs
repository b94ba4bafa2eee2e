//! Gateway configuration
//!
//! Layered with the `config` crate: an optional file (TOML, YAML or JSON by
//! extension) under environment variables such as
//! `SMSC__SMPP__PORT=2776` or `SMSC__ROUTING__MAX_RETRIES=5`.

use ::config::{Config, Environment, File};
use serde::Deserialize;
use smsc_core::{OperatorId, OperatorRecord, RoutingRule, ServiceConfig, SmscError, TransportBinding};
use smsc_sigtran::SigtranConfig;
use smsc_store::PoolConfig;
use smsc_telemetry::TelemetryConfig;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::queue::DeliveryConfig;
use crate::smpp::client::SmppClientConfig;
use crate::smpp::pdu::DEFAULT_MAX_PDU_SIZE;
use crate::smpp::SessionConfig;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SmscConfig {
    pub smpp: SmppConfig,
    /// Defaults for outbound SMPP client connections; durations in ms
    pub client: SmppClientConfig,
    pub sigtran: SigtranConfig,
    pub routing: RoutingConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmppConfig {
    pub host: String,
    pub port: u16,
    /// Accepted for compatibility; a TLS listener is not provided
    pub tls_port: u16,
    pub system_id: String,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub max_bind_attempts: u32,
    pub max_pdu_size: usize,
    pub max_payload_octets: usize,
    /// ESME system id to password
    pub credentials: HashMap<String, String>,
}

impl Default for SmppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2775,
            tls_port: 0,
            system_id: "smsc".to_string(),
            max_connections: 1000,
            idle_timeout_secs: 60,
            response_timeout_secs: 30,
            max_bind_attempts: 3,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            max_payload_octets: 4096,
            credentials: HashMap::new(),
        }
    }
}

impl SmppConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            system_id: self.system_id.clone(),
            max_bind_attempts: self.max_bind_attempts,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            max_payload_octets: self.max_payload_octets,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Operator used for a catch-all rule when the table has none
    pub default_route: Option<String>,
    pub max_retries: u32,
    /// Base retry backoff
    pub retry_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub operators: Vec<OperatorRecord>,
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_route: None,
            max_retries: 3,
            retry_interval_ms: 1_000,
            max_backoff_ms: 300_000,
            operators: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl RoutingConfig {
    pub fn default_route(&self) -> Option<OperatorId> {
        self.default_route.as_deref().map(OperatorId::new)
    }
}

/// Defaults for operator token buckets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Rate for operators configured with `max_tps = 0`
    pub requests_per_second: u32,
    /// Bucket capacity, never above the operator's rate; 0 means the full rate
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_depth: usize,
    pub expiry_sweep_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
            expiry_sweep_interval_ms: 1_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Use PostgreSQL; the in-memory store otherwise
    pub enabled: bool,
    pub url: String,
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            enabled: false,
            url: pool.url,
            pool_size: pool.max_size,
        }
    }
}

impl DatabaseConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            url: self.url.clone(),
            max_size: self.pool_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl SmscConfig {
    /// Load from an optional file, then `SMSC__`-prefixed environment
    /// variables, and validate
    pub fn load(path: Option<&Path>) -> Result<Self, SmscError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("SMSC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: SmscConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SmscError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rate given to operators without their own `max_tps`
    pub fn default_tps(&self) -> u32 {
        if self.rate_limit.enabled {
            self.rate_limit.requests_per_second
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), SmscError> {
        let invalid = |msg: String| Err(SmscError::Config(msg));

        if self.smpp.port == 0 {
            return invalid("smpp.port must not be 0".to_string());
        }
        if self.smpp.max_pdu_size < crate::smpp::pdu::HEADER_LEN {
            return invalid("smpp.max_pdu_size is smaller than a PDU header".to_string());
        }
        if self.queue.max_queue_depth == 0 {
            return invalid("queue.max_queue_depth must not be 0".to_string());
        }
        if self.queue.expiry_sweep_interval_ms == 0 {
            return invalid("queue.expiry_sweep_interval_ms must not be 0".to_string());
        }
        if self.sigtran.enabled {
            if self.sigtran.local.sctp_port == 0 {
                return invalid("sigtran.local.sctp_port must not be 0".to_string());
            }
            self.sigtran
                .validate()
                .map_err(|e| SmscError::Config(e.to_string()))?;
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for operator in &self.routing.operators {
            if !ids.insert(&operator.id) {
                return invalid(format!("duplicate operator id {}", operator.id));
            }
            if !names.insert(operator.name.as_str()) {
                return invalid(format!("duplicate operator name {}", operator.name));
            }
            if operator.max_tps == 0 && self.default_tps() == 0 {
                return invalid(format!(
                    "operator {} has max_tps 0 and no rate_limit default",
                    operator.id
                ));
            }
            match &operator.transport {
                TransportBinding::Smpp { port: 0, .. } => {
                    return invalid(format!("operator {} has SMPP port 0", operator.id));
                }
                TransportBinding::Sigtran { remote } if self.sigtran.enabled => {
                    if !self.sigtran.remotes.iter().any(|r| &r.name == remote) {
                        return invalid(format!(
                            "operator {} uses unknown SIGTRAN remote {}",
                            operator.id, remote
                        ));
                    }
                }
                _ => {}
            }
        }

        for rule in &self.routing.rules {
            if !ids.contains(&rule.operator_id) {
                return invalid(format!(
                    "rule {} references unknown operator {}",
                    rule.id, rule.operator_id
                ));
            }
        }
        if let Some(default) = self.routing.default_route() {
            if !ids.contains(&default) {
                return invalid(format!("default_route {} is not a configured operator", default));
            }
        }
        Ok(())
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_queue_depth: self.queue.max_queue_depth,
            max_retries: self.routing.max_retries,
            retry_base: Duration::from_millis(self.routing.retry_interval_ms),
            retry_cap: Duration::from_millis(self.routing.max_backoff_ms),
            sweep_interval: Duration::from_millis(self.queue.expiry_sweep_interval_ms),
            rate_limit: self.rate_limit.enabled,
            burst: self.rate_limit.burst,
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            service_name: "smsc".to_string(),
            shutdown_grace_secs: self.queue.shutdown_grace_ms.div_ceil(1000),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.queue.shutdown_grace_ms)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig::new(self.logging.level.clone(), self.logging.json)
    }
}
