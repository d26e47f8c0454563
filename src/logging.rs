use crate::config::{LoggingConfig, Rotation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
///
/// With a log directory, a non-blocking file writer is added and its guard
/// returned; keep it alive for the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    // Provider HTTP internals are noisy at debug
    let filter_str = format!("{},hyper=warn,reqwest=warn", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));
    let registry = tracing_subscriber::registry().with(filter);

    let Some(dir) = config.dir.as_deref() else {
        if config.json {
            registry.with(fmt::layer().json().with_target(true)).init();
        } else {
            registry.with(fmt::layer().with_target(false)).init();
        }
        return None;
    };

    let file_appender = match config.rotation {
        Rotation::Hourly => rolling::hourly(dir, &config.file),
        Rotation::Daily => rolling::daily(dir, &config.file),
        Rotation::Never => rolling::never(dir, &config.file),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    if config.json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    Some(guard)
}
