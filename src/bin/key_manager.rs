//! Key Management CLI Tool
//!
//! Manages the signing keyring used by the audit ledger

use anyhow::{anyhow, Result};
use audit_ledger::crypto::{KeyManager, KeyMetadata, KeyStatus};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "key-manager")]
#[command(about = "Audit ledger signing key management tool")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Keyring file
    #[arg(long, default_value = "keys/keyring.json")]
    keyring: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a keyring with one active key
    Init {
        /// Overwrite an existing keyring
        #[arg(long)]
        force: bool,
    },

    /// List keys
    List {
        /// Filter by status (active, retired, revoked)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Get key details
    Get {
        /// Key ID
        key_id: String,
    },

    /// Activate a new key and retire the current one
    Rotate,

    /// Stop signing with a key; it keeps verifying old blocks
    Retire {
        /// Key ID to retire
        key_id: String,
    },

    /// Revoke a key; blocks it signed stop verifying
    Revoke {
        /// Key ID to revoke
        key_id: String,

        /// Revocation reason
        #[arg(short, long)]
        reason: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            if cli.keyring.exists() && !force {
                return Err(anyhow!(
                    "Keyring {} already exists (use --force to replace it)",
                    cli.keyring.display()
                ));
            }
            let manager = KeyManager::generate();
            manager.save(&cli.keyring)?;

            println!("Keyring created at {}", cli.keyring.display());
            for key in manager.list() {
                print_key_details(&key);
            }
        }

        Commands::List { status } => {
            let manager = KeyManager::load(&cli.keyring)?;
            let status = status
                .as_deref()
                .map(|s| s.parse::<KeyStatus>())
                .transpose()
                .map_err(|e| anyhow!(e))?;

            let keys: Vec<KeyMetadata> = manager
                .list()
                .into_iter()
                .filter(|k| status.map_or(true, |s| k.status == s))
                .collect();
            print_keys(&keys);
        }

        Commands::Get { key_id } => {
            let manager = KeyManager::load(&cli.keyring)?;
            match manager.get_key_metadata(&key_id) {
                Some(key) => print_key_details(&key),
                None => return Err(anyhow!("Key not found: {}", key_id)),
            }
        }

        Commands::Rotate => {
            let manager = KeyManager::load(&cli.keyring)?;
            let new_key = manager.rotate();
            manager.save(&cli.keyring)?;

            println!("Key rotated successfully:");
            println!("  New Key ID: {}", new_key.key_id);
            println!("  Public Key: {}", new_key.public_key);
        }

        Commands::Retire { key_id } => {
            let manager = KeyManager::load(&cli.keyring)?;
            manager.retire(&key_id)?;
            manager.save(&cli.keyring)?;
            println!("Key retired: {}", key_id);
        }

        Commands::Revoke { key_id, reason } => {
            let manager = KeyManager::load(&cli.keyring)?;
            manager.revoke(&key_id, &reason)?;
            manager.save(&cli.keyring)?;
            println!("Key revoked successfully: {}", key_id);
            println!("Blocks signed by this key will no longer verify.");
        }
    }

    Ok(())
}

fn print_keys(keys: &[KeyMetadata]) {
    if keys.is_empty() {
        println!("No keys found");
        return;
    }

    println!("{:<36} {:<10} {:<20} {:<20}", "Key ID", "Status", "Created", "Retired");
    println!("{}", "-".repeat(88));

    for key in keys {
        println!(
            "{:<36} {:<10} {:<20} {:<20}",
            key.key_id,
            key.status.as_str(),
            key.created_at.format("%Y-%m-%d %H:%M:%S"),
            key.retired_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn print_key_details(key: &KeyMetadata) {
    println!("Key Details:");
    println!("  Key ID: {}", key.key_id);
    println!("  Public Key: {}", key.public_key);
    println!("  Status: {}", key.status.as_str());
    println!("  Created: {}", key.created_at);
    if let Some(retired_at) = key.retired_at {
        println!("  Retired: {}", retired_at);
    }
    if let Some(reason) = &key.revocation_reason {
        println!("  Revocation Reason: {}", reason);
    }
}
