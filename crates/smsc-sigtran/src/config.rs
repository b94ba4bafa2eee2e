//! SIGTRAN configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_ITU_POINT_CODE: u32 = 0x3FFF;

/// Complete SIGTRAN configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SigtranConfig {
    pub enabled: bool,
    /// Our own signaling point
    pub local: LocalConfig,
    /// Adjacent signaling points, one association each
    pub remotes: Vec<RemoteConfig>,
}

/// Local signaling point
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Address to accept inbound associations on; none when empty
    pub listen_address: Option<String>,
    /// SCTP port carried in the common header
    pub sctp_port: u16,
    pub point_code: u32,
    /// Network indicator (2 = national)
    pub network_indicator: u8,
    /// Global title of this SMSC, also used as the MAP service centre address
    pub global_title: String,
    pub ssn: u8,
    pub translation_type: u8,
    /// Number of streams offered to peers
    pub streams: u16,
    pub heartbeat_interval_ms: u64,
    pub max_retrans: u32,
    /// Time to wait for a MAP result before failing the attempt
    pub operation_timeout_ms: u64,
    /// Time to wait for handshake and ASP acknowledgements
    pub ack_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
}

/// Which side opens the association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// We dial the peer and act as the M3UA ASP
    Client,
    /// The peer dials our listener; we answer as the SGP side
    Server,
}

impl Default for RemoteMode {
    fn default() -> Self {
        Self::Client
    }
}

/// Adjacent signaling point reached over one association
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub name: String,
    pub mode: RemoteMode,
    /// `host:port` of the peer; for server mode only the host is matched
    pub address: String,
    pub point_code: u32,
    pub global_title: String,
    pub ssn: u8,
    pub routing_context: Option<u32>,
    pub network_appearance: Option<u32>,
    pub streams: u16,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            sctp_port: crate::DEFAULT_M3UA_PORT,
            point_code: 1001,
            network_indicator: 2,
            global_title: String::new(),
            ssn: crate::ssn::SMSC,
            translation_type: 0,
            streams: 2,
            heartbeat_interval_ms: 30_000,
            max_retrans: 10,
            operation_timeout_ms: 30_000,
            ack_timeout_ms: 5_000,
            reconnect_interval_ms: 5_000,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mode: RemoteMode::Client,
            address: format!("127.0.0.1:{}", crate::DEFAULT_M3UA_PORT),
            point_code: 2001,
            global_title: String::new(),
            ssn: crate::ssn::MSC,
            routing_context: None,
            network_appearance: None,
            streams: 2,
        }
    }
}

impl LocalConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl SigtranConfig {
    /// Reject configurations the stack cannot run with
    pub fn validate(&self) -> Result<(), crate::SigtranError> {
        if self.local.streams == 0 {
            return Err(crate::SigtranError::Config(
                "local.streams must be at least 1".to_string(),
            ));
        }
        if self.local.point_code > MAX_ITU_POINT_CODE {
            return Err(crate::SigtranError::Config(format!(
                "local point code {} exceeds 14 bits",
                self.local.point_code
            )));
        }
        let mut names = std::collections::HashSet::new();
        for remote in &self.remotes {
            if remote.name.is_empty() {
                return Err(crate::SigtranError::Config(
                    "remote name must not be empty".to_string(),
                ));
            }
            if !names.insert(remote.name.as_str()) {
                return Err(crate::SigtranError::Config(format!(
                    "duplicate remote {}",
                    remote.name
                )));
            }
            if remote.point_code > MAX_ITU_POINT_CODE {
                return Err(crate::SigtranError::Config(format!(
                    "remote {} point code exceeds 14 bits",
                    remote.name
                )));
            }
            if remote.mode == RemoteMode::Server && self.local.listen_address.is_none() {
                return Err(crate::SigtranError::Config(format!(
                    "remote {} is server mode but local.listen_address is unset",
                    remote.name
                )));
            }
            if remote.streams == 0 {
                return Err(crate::SigtranError::Config(format!(
                    "remote {} must have at least one stream",
                    remote.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize_from_empty() {
        let config: SigtranConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.local.sctp_port, 2905);
        assert_eq!(config.local.ssn, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_remote_rejected() {
        let remote = RemoteConfig {
            name: "stp".to_string(),
            ..Default::default()
        };
        let config = SigtranConfig {
            remotes: vec![remote.clone(), remote],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_mode_needs_listener() {
        let mut config: SigtranConfig = serde_json::from_str(
            r#"{"remotes":[{"name":"msc","mode":"server","address":"10.0.0.5"}]}"#,
        )
        .unwrap();
        assert_eq!(config.remotes[0].mode, RemoteMode::Server);
        assert!(config.validate().is_err());

        config.local.listen_address = Some("0.0.0.0:2905".to_string());
        assert!(config.validate().is_ok());

        config.remotes[0].point_code = 0x4000;
        assert!(config.validate().is_err());
    }
}
