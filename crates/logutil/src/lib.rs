//! Utilities for logging.

use tracing::subscriber;
use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// Output format for the global logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Compact,
    Json,
}

/// Configure the global logger.
///
/// `RUST_LOG` takes precedence over `default_level` when set.
///
/// Subsequent calls are no-ops, the first subscriber wins.
pub fn configure_global_logger(default_level: Level, format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let builder = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    let _ = match format {
        LogFormat::HumanReadable => subscriber::set_global_default(builder.finish()),
        LogFormat::Compact => subscriber::set_global_default(builder.compact().finish()),
        LogFormat::Json => subscriber::set_global_default(builder.json().finish()),
    };
}

/// Logger for tests. Output goes through the test writer so it's captured
/// per test.
pub fn init_test() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::DEBUG.into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_test_writer()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .finish();

    let _ = subscriber::set_global_default(subscriber);
}
