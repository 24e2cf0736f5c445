//! Recollect daemon - background consolidation over a persisted memory graph

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use recollect::config::{Config, RetrievalStrategy};
use recollect::context::OptimizeOptions;
use recollect::error::Result;
use recollect::ports::{FastEmbedder, FilePersistence, RemoteGenerator, SystemClock};
use recollect::semantic::{FactQuery, SemanticGraphStore};
use recollect::{Collaborators, MemoryError, MemoryManager};

/// Recollect - long-term memory and context engineering for LLM agents
#[derive(Parser)]
#[command(name = "recollect")]
#[command(about = "Long-term memory and context engineering for LLM agents")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the consolidation daemon until interrupted (default command)
    #[command(name = "serve")]
    Serve,

    /// Build an optimized context for a query and print it
    Optimize {
        /// The query to build context for
        query: String,
        /// Token budget for the assembled context
        #[arg(long, short = 'b', default_value_t = 2000)]
        budget: usize,
        /// Print pipeline metadata as JSON after the context
        #[arg(long)]
        metadata: bool,
        /// Memory sources to draw on: episodic, semantic or hybrid
        #[arg(long, short = 's')]
        strategy: Option<RetrievalStrategy>,
        /// Restrict episodic retrieval to one session
        #[arg(long)]
        session: Option<String>,
    },

    /// Print the current facts about an entity as JSON
    Facts {
        entity: String,
        /// Include superseded and deleted versions
        #[arg(long)]
        history: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Optimize {
            query,
            budget,
            metadata,
            strategy,
            session,
        }) => optimize(config, &query, budget, metadata, strategy, session.as_deref()).await,
        Some(Command::Facts { entity, history }) => facts(config, &entity, history).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,recollect=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn read_config(path: &PathBuf) -> Result<Config> {
    tracing::info!("Loading config from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| {
        MemoryError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml_str(&content)
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        return read_config(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".recollect").join("config.toml")),
        dirs::config_dir().map(|c| c.join("recollect").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];
    for path in default_paths.iter().flatten() {
        if path.exists() {
            return read_config(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

async fn build_manager(config: Config) -> Result<MemoryManager> {
    let data_dir = config.storage.data_dir.clone();
    std::fs::create_dir_all(&data_dir).map_err(|e| {
        MemoryError::Storage(format!(
            "Failed to create data directory {}: {}",
            data_dir.display(),
            e
        ))
    })?;

    tracing::info!("Initializing embedding model (this may take a moment on first run)...");
    let embedder = tokio::task::spawn_blocking(FastEmbedder::new)
        .await
        .map_err(|e| MemoryError::ModelLoad(e.to_string()))??;

    let generator = RemoteGenerator::new(&config.generation)?;
    let persistence = FilePersistence::new(&data_dir);

    let manager = MemoryManager::new(
        config,
        Collaborators::new(Arc::new(embedder), Arc::new(generator), Arc::new(persistence)),
    )?;
    if manager.restore_snapshot().await? {
        tracing::info!("Restored memory from {}", data_dir.display());
    }
    Ok(manager)
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting Recollect daemon");
    tracing::debug!("Config loaded: {:?}", config);

    let enabled = config.consolidation.enabled;
    let manager = build_manager(config).await?;

    if enabled {
        manager.start_daemon()?;
    } else {
        tracing::info!("Consolidation disabled, daemon not started");
    }

    shutdown_signal().await;
    tracing::info!("Shutdown requested");

    manager.stop_daemon().await;
    let metrics = manager.daemon_metrics();
    tracing::info!(
        "Daemon processed {} entries in {} passes ({} failures)",
        metrics.entries_processed,
        metrics.passes,
        metrics.failures
    );
    manager.save_snapshot().await?;

    tracing::info!("Recollect daemon stopped");
    Ok(())
}

async fn optimize(
    config: Config,
    query: &str,
    budget: usize,
    metadata: bool,
    strategy: Option<RetrievalStrategy>,
    session: Option<&str>,
) -> Result<()> {
    let manager = build_manager(config).await?;
    let mut options = OptimizeOptions {
        deadline: manager
            .config()
            .pipeline
            .deadline_ms
            .map(std::time::Duration::from_millis),
        retrieval: None,
    };
    if let Some(strategy) = strategy {
        options = options.strategy(strategy, &manager.config().retrieval);
    }
    let optimized = manager.optimize_with(query, session, budget, &options).await?;

    println!("{}", optimized.context);
    if metadata {
        println!("{}", serde_json::to_string_pretty(&optimized.metadata)?);
    }

    // Rule reinforcement from this run
    manager.save_snapshot().await?;
    Ok(())
}

/// Reads the snapshot directly; no models are loaded
async fn facts(config: Config, entity: &str, history: bool) -> Result<()> {
    let persistence = FilePersistence::new(&config.storage.data_dir);
    let graph = SemanticGraphStore::new(Arc::new(SystemClock));
    if !graph
        .restore(&persistence, &config.storage.snapshot_key)
        .await?
    {
        tracing::warn!(
            "No snapshot found in {}",
            config.storage.data_dir.display()
        );
    }

    let query = FactQuery {
        entity: Some(entity.to_string()),
        include_history: history,
        ..Default::default()
    };
    let facts = graph.query_facts(&query).await;
    println!("{}", serde_json::to_string_pretty(&facts)?);
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
