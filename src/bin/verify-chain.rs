use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use audit_ledger::audit::verify::{ChainVerificationResult, ChainVerifier};
use audit_ledger::crypto::{KeyManager, Verifier};
use audit_ledger::database::Database;
use audit_ledger::store::{ChainStore, SqliteChainStore};

#[derive(Parser)]
#[command(name = "verify-chain")]
#[command(about = "Verify audit ledger chain integrity offline")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database URL
    #[arg(long, default_value = "sqlite://audit-ledger.db")]
    database_url: String,

    /// Keyring file holding the verification keys
    #[arg(long, default_value = "keys/keyring.json")]
    keyring: PathBuf,

    /// Partition to verify (all partitions when omitted)
    #[arg(short, long)]
    partition: Option<String>,

    /// Blocks fetched per page
    #[arg(long, default_value_t = 500)]
    page_size: usize,

    /// Print the reports as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Suppress output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match verify(&cli).await {
        Ok(true) => {
            if !cli.quiet && !cli.json {
                println!("✓ Chain verification completed successfully");
            }
            Ok(())
        }
        Ok(false) => {
            error!("Chain verification found integrity problems");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Chain verification failed: {}", e);
            std::process::exit(2);
        }
    }
}

async fn verify(cli: &Cli) -> Result<bool> {
    if !cli.keyring.exists() {
        return Err(anyhow!("Keyring not found: {}", cli.keyring.display()));
    }
    let keys = Arc::new(KeyManager::load(&cli.keyring)?);

    // the audited store is only read, never created or migrated
    let database = Database::open_existing(&cli.database_url, 4)
        .await
        .map_err(|e| anyhow!("Cannot open ledger database {}: {}", cli.database_url, e))?;
    if !database.has_schema().await? {
        database.close().await;
        return Err(anyhow!(
            "{} does not contain an audit ledger",
            cli.database_url
        ));
    }
    let store: Arc<dyn ChainStore> = Arc::new(SqliteChainStore::new(database.pool().clone()));

    let verifier = ChainVerifier::new(store.clone(), Verifier::new(keys)).with_page_size(cli.page_size);

    let partitions = match &cli.partition {
        Some(partition) => {
            if store.tip(partition).await?.is_none() {
                database.close().await;
                return Err(anyhow!("Partition {} has no blocks", partition));
            }
            vec![partition.clone()]
        }
        None => store
            .partitions()
            .await?
            .into_iter()
            .map(|summary| summary.partition)
            .collect(),
    };
    if partitions.is_empty() && !cli.quiet {
        println!("No partitions to verify");
    }

    let cancel = CancellationToken::new();
    let mut all_verified = true;
    let mut reports = Vec::new();
    for partition in &partitions {
        info!("Verifying partition {}", partition);
        let result = verifier.verify_chain(partition, &cancel).await?;
        all_verified &= result.verified;
        if !cli.json && !cli.quiet {
            print_report(&result);
        }
        reports.push(result);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    database.close().await;
    Ok(all_verified)
}

fn print_report(result: &ChainVerificationResult) {
    let mark = if result.verified { "✓" } else { "✗" };
    println!("{} Partition {}", mark, result.partition);
    println!(
        "  Blocks: {} verified of {} ({} checked)",
        result.verified_blocks, result.total_blocks, result.blocks_checked
    );
    if let Some(tip) = result.tip_position {
        println!("  Tip position: {}", tip);
    }
    if !result.missing_blocks.is_empty() {
        println!("  Missing blocks: {:?}", result.missing_blocks);
    }
    if !result.invalid_signatures.is_empty() {
        println!("  Invalid signatures: {:?}", result.invalid_signatures);
    }
    if !result.broken_chains.is_empty() {
        println!("  Broken links: {:?}", result.broken_chains);
    }
    if !result.complete {
        println!("  Verification did not reach the tip");
    }
}
