//! Types every SMSC crate shares: messages, operators and routing rules,
//! the common error, and the two-phase service lifecycle.

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::ServiceConfig;
pub use domain::*;
pub use error::{Result, SmscError};
pub use service::{
    DependencyStatus, GatewayService, HealthStatus, MicroserviceRuntime, ReadinessStatus,
};
