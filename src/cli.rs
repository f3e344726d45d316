use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::Config;
use crate::ports::LedgerStore;
use crate::startup;

#[derive(Parser)]
#[command(name = "wallet-core")]
#[command(about = "Wallet Core - balances, deposits and scheduled withdrawals", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and the withdrawal scheduler (default)
    Serve,

    /// Transaction commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Run one scheduler pass and wait for the dispatched withdrawals
    ProcessDue,

    /// Print a transaction as JSON
    Show {
        /// Transaction UUID
        #[arg(value_name = "TX_ID")]
        tx_id: Uuid,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_tx_process_due(config: &Config) -> anyhow::Result<()> {
    let components = startup::build(config).await?;
    let handles = components.scheduler.tick().await?;
    let dispatched = handles.len();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!("Withdrawal worker panicked: {}", e);
        }
    }

    println!("✓ Dispatched {} withdrawal(s)", dispatched);
    Ok(())
}

pub async fn handle_tx_show(config: &Config, tx_id: Uuid) -> anyhow::Result<()> {
    let components = startup::build(config).await?;
    match components.store.get_transaction(tx_id).await? {
        Some(tx) => {
            println!("{}", serde_json::to_string_pretty(&tx)?);
            Ok(())
        }
        None => anyhow::bail!("Transaction {} not found", tx_id),
    }
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub fn handle_config_show(config: &Config) -> anyhow::Result<()> {
    let retry = config.retry_policy();
    let scheduler = config.scheduler();

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Settlement URL: {}", config.settlement_url);
    println!("  Settlement Timeout: {}s", config.settlement_timeout_secs);
    println!("  Poll Interval: {:?}", scheduler.poll_interval);
    println!("  Worker Concurrency: {}", scheduler.worker_concurrency);
    println!(
        "  Retries: {} (backoff {:?} .. {:?})",
        retry.max_retries, retry.base_delay, retry.max_delay
    );
    println!("  Wallet Lock Timeout: {}ms", config.wallet_lock_timeout_ms);

    println!("✓ Configuration is valid");
    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
