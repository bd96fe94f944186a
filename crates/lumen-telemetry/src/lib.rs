mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive (e.g. `info`, `lumen_engine=debug`). `RUST_LOG` wins.
    pub level: String,
    /// JSON lines on stdout; otherwise human-readable.
    pub json: bool,
    /// Where to persist warn+ records. `None` disables the sink.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            log_db_path: None,
        }
    }
}

/// Handle returned by [`init_telemetry`]. Keep it alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted records.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the global subscriber. Call once at startup; later calls leave
/// the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let log_sink = config
        .log_db_path
        .as_deref()
        .and_then(|path| match SqliteLogSink::open(path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("lumen-telemetry: failed to open log DB {}: {e}", path.display());
                None
            }
        });
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("lumen-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard { log_sink }
}
