//! The lifecycle contract and the process loop that drives it

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;

/// Liveness answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Ready only when every dependency is available
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
}

/// Lifecycle every top-level gateway service implements.
///
/// Stopping is two-phase: `stop_accepting` closes listeners so no new
/// sessions or associations arrive, then `shutdown` drains in-flight work
/// for at most `grace` before closing transports.
#[async_trait]
pub trait GatewayService: Send + Sync + 'static {
    fn service_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn health(&self) -> HealthStatus;

    async fn ready(&self) -> ReadinessStatus;

    /// Run listeners and background loops until shut down
    async fn start(&self) -> Result<()>;

    /// Phase one: refuse new sessions and associations
    async fn stop_accepting(&self);

    /// Phase two: drain dispatch within `grace`, then release transports
    async fn shutdown(&self, grace: Duration) -> Result<()>;
}

/// Owns a service for the life of the process
pub struct MicroserviceRuntime {
    config: ServiceConfig,
    start_time: std::time::Instant,
}

impl MicroserviceRuntime {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            start_time: std::time::Instant::now(),
        }
    }

    /// Run a service until SIGINT/SIGTERM, then stop it in two phases
    pub async fn run<S: GatewayService>(&self, service: Arc<S>) -> Result<()> {
        info!(
            service_id = service.service_id(),
            version = service.version(),
            "Starting service"
        );

        let runner = service.clone();
        let mut running = tokio::spawn(async move { runner.start().await });

        tokio::select! {
            _ = Self::wait_for_shutdown() => {}
            joined = &mut running => match joined {
                Ok(Ok(())) => info!("Service returned on its own"),
                Ok(Err(e)) => error!(error = %e, "Service failed"),
                Err(e) => error!(error = %e, "Service task panicked"),
            },
        }

        service.stop_accepting().await;

        let grace = self.config.shutdown_grace();
        // One extra second covers transport close after the drain deadline.
        let deadline = grace + Duration::from_secs(1);
        match tokio::time::timeout(deadline, service.shutdown(grace)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Error during shutdown"),
            Err(_) => warn!(grace_secs = grace.as_secs(), "Shutdown exceeded grace period"),
        }

        running.abort();

        info!(
            uptime_seconds = self.start_time.elapsed().as_secs(),
            "Service stopped"
        );

        Ok(())
    }

    /// Resolves on Ctrl+C, or SIGTERM on unix. A handler that cannot be
    /// installed never fires.
    async fn wait_for_shutdown() {
        let interrupt = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => info!("Interrupted"),
            _ = terminate => info!("Terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Exiting {
        stopped: AtomicBool,
        drained: AtomicBool,
    }

    #[async_trait]
    impl GatewayService for Exiting {
        fn service_id(&self) -> &'static str {
            "exiting"
        }

        async fn health(&self) -> HealthStatus {
            HealthStatus {
                healthy: true,
                service_id: self.service_id().to_string(),
                version: self.version().to_string(),
                uptime_seconds: 0,
            }
        }

        async fn ready(&self) -> ReadinessStatus {
            ReadinessStatus {
                ready: true,
                dependencies: Vec::new(),
            }
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop_accepting(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn shutdown(&self, _grace: Duration) -> Result<()> {
            assert!(self.stopped.load(Ordering::SeqCst));
            self.drained.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runtime_stops_in_two_phases_when_service_exits() {
        let service = Arc::new(Exiting {
            stopped: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        });
        let runtime = MicroserviceRuntime::new(ServiceConfig::default());
        runtime.run(service.clone()).await.unwrap();
        assert!(service.stopped.load(Ordering::SeqCst));
        assert!(service.drained.load(Ordering::SeqCst));
    }
}
