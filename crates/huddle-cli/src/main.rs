mod config;
mod serve_cmd;
mod status_cmd;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use huddle_core::ConsensusEngine;
use huddle_core::store::{MemorySessionStore, PgSessionStore, SessionStore};
use huddle_db::config::DbConfig;
use huddle_db::pool;

use config::HuddleConfig;

#[derive(Parser)]
#[command(name = "huddle", about = "Group consensus engine for planning gatherings")]
struct Cli {
    /// Database URL (overrides HUDDLE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a huddle config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Number of ranked candidates returned per session
        #[arg(long, default_value_t = huddle_core::ranker::DEFAULT_MAX_CANDIDATES)]
        max_candidates: usize,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the huddle database and apply migrations
    DbInit,
    /// Serve the session HTTP API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 3000)]
        port: u16,
        /// Keep sessions in memory instead of PostgreSQL
        #[arg(long)]
        memory: bool,
        /// Override the number of ranked candidates
        #[arg(long)]
        max_candidates: Option<usize>,
    },
    /// Show session status (omit session_id to list all sessions)
    Status {
        /// Session ID to show status for
        session_id: Option<String>,
    },
    /// Show the ranked result of a session
    Result {
        /// Session ID
        session_id: String,
    },
}

/// Execute the `huddle init` command: write config file.
fn cmd_init(db_url: &str, max_candidates: usize, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    if max_candidates == 0 {
        anyhow::bail!("--max-candidates must be at least 1");
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        engine: config::EngineSection { max_candidates },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  engine.max_candidates = {max_candidates}");
    println!();
    println!("Next: run `huddle db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `huddle db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = HuddleConfig::resolve(cli_db_url, None)?;

    println!("Initializing huddle database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("huddle db-init complete.");
    Ok(())
}

/// Execute the `huddle serve` command.
async fn cmd_serve(
    cli_db_url: Option<&str>,
    bind: &str,
    port: u16,
    memory: bool,
    max_candidates: Option<usize>,
) -> anyhow::Result<()> {
    let resolved = HuddleConfig::resolve(cli_db_url, max_candidates)?;

    if memory {
        tracing::warn!("using in-memory session store; sessions are lost on exit");
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let engine = Arc::new(ConsensusEngine::new(store, resolved.engine));
        return serve_cmd::run_serve(engine, bind, port).await;
    }

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(db_pool.clone()));
    let engine = Arc::new(ConsensusEngine::new(store, resolved.engine));
    let result = serve_cmd::run_serve(engine, bind, port).await;
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            max_candidates,
            force,
        } => {
            cmd_init(&db_url, max_candidates, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            port,
            memory,
            max_candidates,
        } => {
            cmd_serve(
                cli.database_url.as_deref(),
                &bind,
                port,
                memory,
                max_candidates,
            )
            .await?;
        }
        Commands::Status { session_id } => {
            let resolved = HuddleConfig::resolve(cli.database_url.as_deref(), None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, session_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Result { session_id } => {
            let resolved = HuddleConfig::resolve(cli.database_url.as_deref(), None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_result(&db_pool, &session_id).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
