//! SMSC - SMS Center Microservice
//!
//! Accepts short messages from ESMEs over SMPP and from the mobile network
//! over SIGTRAN, routes each destination to an operator by prefix, and
//! delivers through per-operator rate-limited queues with retry, failover
//! and expiry.

pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod service;
pub mod smpp;

pub use admin::Admin;
pub use config::SmscConfig;
pub use dispatcher::{Dispatcher, SubmitOutcome, Transport, TransportFactory};
pub use gateway::Gateway;
pub use queue::{DeliveryConfig, DeliveryQueue, QueueStats};
pub use registry::{OperatorLoad, OperatorRegistry};
pub use routing::Router;
pub use service::SmscService;
pub use smpp::{SmppClient, SmppServer};
