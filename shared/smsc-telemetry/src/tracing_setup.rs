//! Global subscriber installation

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::{TelemetryConfig, TelemetryError};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(json: bool) -> BoxedLayer {
    if json {
        // One object per event; span fields are folded into the event
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer().compact().with_target(true).boxed()
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over
/// `config.log_level`. Fails if a subscriber is already installed.
pub fn init_tracing(service_name: &str, config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| TelemetryError::TracingInit(format!("log level '{}': {}", config.log_level, e)))?,
    };

    tracing_subscriber::registry()
        .with(output_layer(config.json_logs))
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    tracing::info!(
        service = service_name,
        level = %config.log_level,
        json = config.json_logs,
        "Logging ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_is_reported() {
        std::env::remove_var("RUST_LOG");
        let err = init_tracing("smsc", &TelemetryConfig::new("smsc=loud", false)).unwrap_err();
        assert!(err.to_string().contains("smsc=loud"));
    }
}
