use serde::Deserialize;
use std::time::Duration;

/// What the process runtime needs, independent of any one service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_name: String,
    /// Budget for draining in-flight work once a stop is requested
    pub shutdown_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "smsc".to_string(),
            shutdown_grace_secs: 30,
        }
    }
}

impl ServiceConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
