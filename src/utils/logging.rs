//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry from a [`LoggingConfig`]: an
//! env-filter (honouring `RUST_LOG` when set, the configured level otherwise),
//! a console formatter (plain or JSON), and an optional non-blocking file
//! writer. The returned guard must be kept alive for file output to flush.

use crate::config::LoggingConfig;
use crate::error::{LinkError, Result};
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`
///
/// Fails if the configuration is invalid or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(LinkError::ConfigError(errors.join("; ")));
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.log_to_console {
        if config.json_format {
            layers.push(fmt::layer().json().with_current_span(true).boxed());
        } else {
            layers.push(fmt::layer().with_target(true).boxed());
        }
    }

    if config.log_to_file {
        if let Some(path) = config.log_file_path.as_deref() {
            let path = Path::new(path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| LinkError::ConfigError("log_file_path has no file name".into()))?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);

            let file_layer = fmt::layer().with_ansi(false).with_writer(writer);
            if config.json_format {
                layers.push(file_layer.json().boxed());
            } else {
                layers.push(file_layer.boxed());
            }
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LinkError::ConfigError(format!("Failed to install subscriber: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_config_without_outputs() {
        let config = LoggingConfig {
            log_to_console: false,
            log_to_file: false,
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(LinkError::ConfigError(_))
        ));
    }
}
