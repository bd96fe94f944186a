use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use lumen_backend::{HttpBackend, HttpBackendConfig};
use lumen_engine::tools::create_default_registry;
use lumen_engine::{Orchestrator, TurnDriver};
use lumen_server::{AppState, HeaderAuthenticator, ServerConfig};
use lumen_settings::{expand_home, load_settings, load_settings_from_path, LumenSettings};
use lumen_store::{ConversationRepo, Database, UsageRepo};
use lumen_telemetry::{LogQuery, SqliteLogSink, TelemetryConfig};

#[derive(Parser)]
#[command(name = "lumen", version, about = "Chat tool-orchestration server")]
struct Cli {
    /// Settings file (defaults to ~/.lumen/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective settings as JSON
    Settings,
    /// Print persisted warnings and errors as JSON lines
    Logs {
        #[arg(long)]
        conversation: Option<i64>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings).await
        }
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Logs {
            conversation,
            level,
            limit,
        } => {
            let sink = SqliteLogSink::open(&expand_home(&settings.logging.log_db_path))
                .context("failed to open log database")?;
            let records = sink.query(&LogQuery {
                level,
                conversation_id: conversation,
                limit: Some(limit),
            })?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

async fn serve(settings: LumenSettings) -> anyhow::Result<()> {
    let _telemetry = lumen_telemetry::init_telemetry(TelemetryConfig {
        level: settings.logging.level.clone(),
        json: settings.logging.json,
        log_db_path: settings
            .logging
            .persist_warnings
            .then(|| expand_home(&settings.logging.log_db_path)),
    });
    info!(version = env!("CARGO_PKG_VERSION"), "starting lumen");

    let db = Database::open(&expand_home(&settings.database.path)).context("failed to open database")?;
    let conversations = Arc::new(ConversationRepo::new(db.clone()));
    let usage = Arc::new(UsageRepo::new(db.clone()));
    let registry = Arc::new(create_default_registry(conversations.clone()));
    info!(tools = ?registry.names(), "tool registry ready");

    let mut backend_config = HttpBackendConfig::new(settings.backend.base_url.clone());
    backend_config.timeout = std::time::Duration::from_secs(settings.backend.timeout_secs);
    backend_config.connect_timeout = std::time::Duration::from_secs(settings.backend.connect_timeout_secs);
    backend_config.idle_timeout = std::time::Duration::from_secs(settings.backend.idle_timeout_secs);
    if let Some(key) = settings.backend.api_key.clone() {
        backend_config = backend_config.with_api_key(key);
    }
    let backend = Arc::new(HttpBackend::new(backend_config).context("failed to build backend client")?);
    info!(url = %backend.base_url(), "reasoning backend configured");

    let driver = TurnDriver::new(
        backend,
        Orchestrator::new(registry, conversations.clone()),
        conversations,
        usage,
    );
    let auth = HeaderAuthenticator::new(&settings.server.user_header, &settings.server.tenant_header)
        .context("invalid identity header name")?;
    let state = AppState::new(Arc::new(driver), db, Arc::new(auth));

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        request_timeout_secs: settings.server.request_timeout_secs,
    };
    let handle = lumen_server::start(config, state)
        .await
        .context("failed to start server")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
