use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use engram::api::{self, AppState};
use engram::config::Config;
use engram::embedding::build_embedder;
use engram::error::Result;
use engram::maintenance::{MaintenanceRunner, RetentionPolicy, spawn_scheduler};
use engram::storage::{LanceStore, TtlCache};

#[derive(Parser)]
#[command(name = "engramd", about = "Tiered associative memory store", version)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,engram=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.storage.data_dir)?;

    let mut store = LanceStore::connect(&config.storage.data_dir, config.embedding.dimension).await?;
    store.ensure_tables().await?;
    store.create_vector_index().await?;
    let store = Arc::new(store);

    let embedder = build_embedder(&config.embedding)?;
    info!(
        provider = embedder.name(),
        dimension = embedder.dimension(),
        "Embedder ready"
    );

    let policy = RetentionPolicy::from_config(&config.retention);
    let runner = Arc::new(MaintenanceRunner::new(Arc::clone(&store), policy));
    let guard = Arc::new(Mutex::new(()));

    spawn_scheduler(
        Arc::clone(&runner),
        Arc::clone(&guard),
        Duration::from_secs(config.retention.interval_secs),
        config.retention.record_summary,
    );

    let state = AppState {
        store,
        embedder,
        cache: Arc::new(TtlCache::new(Duration::from_secs(config.storage.cache_ttl_secs))),
        runner,
        maintenance_guard: guard,
        auth_token: config.server.auth_token.clone(),
        embed_timeout: Duration::from_millis(config.embedding.timeout_ms),
        brief: config.brief.clone(),
        record_summary: config.retention.record_summary,
    };

    let router = api::create_router(
        state,
        Duration::from_secs(config.server.request_timeout_secs),
    );
    api::serve(router, &config.server.listen_addr).await
}
