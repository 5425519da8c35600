mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use tradebot_brokers_crypto::BybitTickerClient;
use tradebot_core::TickerSource;
use tradebot_data::Stores;
use tradebot_engine::TraderRegistry;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "tradebot")]
#[command(about = "Signal provider and subscription platform: API server and admin tools")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Path to a TOML config file
    #[arg(short, long, env = "TRADEBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (overrides the config file)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Server {
        /// Bind address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List registered accounts
    Users,

    /// Fetch and print the current exchange ticker
    Ticker,

    /// Run database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.log_json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if cli.database_url.is_some() {
        config.database.url = cli.database_url;
    }

    match cli.command {
        Commands::Server { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            run_server(config).await?;
        }
        Commands::Users => list_users(&config).await?,
        Commands::Ticker => {
            let client = BybitTickerClient::new(config.exchange.clone())?;
            let ticker = client.ticker().await?;
            println!("{}", serde_json::to_string_pretty(&ticker)?);
        }
        Commands::Migrate => {
            let pool = connect(&config)
                .await?
                .context("No database configured; set DATABASE_URL or [database].url")?;
            tradebot_data::db::run_migrations(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
            println!("Migrations applied");
        }
    }

    Ok(())
}

/// Open a pool when a database URL is configured.
async fn connect(config: &Config) -> Result<Option<sqlx::PgPool>> {
    let Some(url) = config.database.url.as_deref() else {
        return Ok(None);
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    Ok(Some(pool))
}

async fn open_stores(config: &Config) -> Result<Stores> {
    match connect(config).await? {
        Some(pool) => {
            tradebot_data::db::run_migrations(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
            tracing::info!("Using PostgreSQL stores");
            Ok(Stores::postgres(pool))
        }
        None => {
            tracing::warn!("No database configured, using in-memory stores");
            Ok(Stores::memory())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let stores = open_stores(&config).await?;

    // Trader state lives in memory; rebuild it from the event log.
    let traders = Arc::new(TraderRegistry::new());
    let events = stores.events.list_all().await?;
    traders.replay(&events).await;

    tracing::info!(
        symbol = %config.exchange.symbol,
        category = %config.exchange.category,
        "Using Bybit ticker"
    );
    let ticker: Arc<dyn TickerSource> = Arc::new(BybitTickerClient::new(config.exchange.clone())?);

    let actions = tradebot_api::Actions::new(stores, ticker, traders);
    tradebot_api::start_server(actions, &config.server.bind).await
}

async fn list_users(config: &Config) -> Result<()> {
    let stores = open_stores(config).await?;
    let users = stores.users.list_sorted().await?;

    if users.is_empty() {
        println!("No accounts registered");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<9} {}", "ID", "USERNAME", "TYPE", "CREATED");
    for user in users {
        println!(
            "{:<38} {:<24} {:<9} {}",
            user.id,
            user.username,
            user.kind.as_str(),
            user.created.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
