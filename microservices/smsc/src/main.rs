//! SMSC entry point

use anyhow::Context;
use smsc::{SmscConfig, SmscService};
use smsc_core::MicroserviceRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const SERVICE_NAME: &str = "smsc";

/// `--config <path>` wins over `SMSC_CONFIG`
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("SMSC_CONFIG").map(PathBuf::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = SmscConfig::load(path.as_deref()).context("loading configuration")?;

    smsc_telemetry::init_tracing(SERVICE_NAME, &config.telemetry())
        .context("initializing logging")?;
    info!(
        config = ?path,
        smpp = %config.smpp.bind_address(),
        sigtran = config.sigtran.enabled,
        database = config.database.enabled,
        "Starting SMSC"
    );

    let runtime = MicroserviceRuntime::new(config.service_config());
    let service = SmscService::build(config)
        .await
        .context("assembling service")?;
    runtime.run(Arc::new(service)).await?;
    Ok(())
}
