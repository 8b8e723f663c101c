//! `memvault` operator CLI.
//!
//! Offline tooling around a vault: master key generation, credential hashing
//! for the identity registry, policy document sealing and verification, and
//! audit chain verification. Vault configuration comes from the `MEMVAULT_*`
//! environment variables.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use memvault_core::crypto::sha256_hex;
use memvault_core::{ChainStatus, EncryptionKey, PolicyDocument, SealedPolicy, VaultConfig, open_vault};
use tracing::info;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";

/// Exit code for a corrupted audit chain.
const EXIT_CORRUPTED: u8 = 2;

#[derive(Parser)]
#[command(
    name = "memvault",
    version,
    about = "memvault CLI: keys, credentials, policy documents and audit verification",
    long_about = None,
    after_help = "Environment variables:\n  \
         MEMVAULT_STORAGE        memory | redb | rocksdb (default: memory)\n  \
         MEMVAULT_STORAGE_PATH   database path (default: ./data/memvault.redb)\n  \
         MEMVAULT_KEY_ENV        variable holding the master key (default: MEMVAULT_MASTER_KEY)\n  \
         MEMVAULT_AUDIT_FILE     JSON-lines audit log\n  \
         MEMVAULT_POLICY_FILE    sealed policy document\n  \
         MEMVAULT_LOG_LEVEL      log filter (default: warn)",
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random base64 master key.
    Keygen,
    /// Print the hex SHA-256 of a credential secret, for `secret_hash`.
    HashSecret {
        /// The secret. Read from stdin when omitted.
        secret: Option<String>,
    },
    /// Seal or verify policy documents.
    Policy {
        #[command(subcommand)]
        action: PolicyCommands,
    },
    /// Inspect the audit trail.
    Audit {
        #[command(subcommand)]
        action: AuditCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Validate a policy document and write it out with its checksum.
    Seal {
        /// Unsealed policy document (JSON).
        input: PathBuf,
        /// Where to write the sealed document.
        output: PathBuf,
    },
    /// Check a sealed policy document's checksum and contents.
    Verify {
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Open the vault from `MEMVAULT_*` and verify every link of the chain.
    Verify,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MEMVAULT_LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{RED}{BOLD}error:{RESET} {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cmd: Commands) -> Result<ExitCode> {
    match cmd {
        Commands::Keygen => {
            println!("{}", EncryptionKey::generate().to_base64().as_str());
        }
        Commands::HashSecret { secret } => {
            let secret = match secret {
                Some(secret) => secret,
                None => read_secret()?,
            };
            println!("{}", sha256_hex(secret.as_bytes()));
        }
        Commands::Policy { action } => match action {
            PolicyCommands::Seal { input, output } => cmd_policy_seal(&input, &output)?,
            PolicyCommands::Verify { file } => cmd_policy_verify(&file)?,
        },
        Commands::Audit {
            action: AuditCommands::Verify,
        } => return cmd_audit_verify().await,
    }
    Ok(ExitCode::SUCCESS)
}

fn read_secret() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read secret from stdin")?;
    let secret = line.trim_end_matches(['\r', '\n']).to_owned();
    if secret.is_empty() {
        bail!("no secret given");
    }
    Ok(secret)
}

fn cmd_policy_seal(input: &Path, output: &Path) -> Result<()> {
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let document: PolicyDocument = serde_json::from_str(&json)
        .with_context(|| format!("{} is not a policy document", input.display()))?;
    let checked = document.clone().validate().context("policy document is invalid")?;

    let sealed = document.seal()?;
    std::fs::write(output, sealed.to_json()?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(version = checked.version(), path = %output.display(), "policy sealed");
    println!(
        "{GREEN}✓{RESET} sealed policy version {} ({} identities) to {}",
        checked.version(),
        checked.identity_count(),
        output.display()
    );
    Ok(())
}

fn cmd_policy_verify(file: &Path) -> Result<()> {
    let checked = SealedPolicy::load(file)?
        .open()
        .context("checksum does not match the document")?
        .validate()
        .context("policy document is invalid")?;
    println!(
        "{GREEN}✓{RESET} policy version {} ({} identities) verified",
        checked.version(),
        checked.identity_count()
    );
    Ok(())
}

async fn cmd_audit_verify() -> Result<ExitCode> {
    // Open even when the chain is broken, so the break can be reported.
    let config = VaultConfig::from_env().with_verify_audit_on_open(false);
    let vault = open_vault(config).await.context("failed to open vault")?;
    let status = vault.verify_audit_chain().await?;

    let report = match &status {
        ChainStatus::Ok { records } => serde_json::json!({ "status": "ok", "records": records }),
        ChainStatus::Corrupted { at_sequence, reason } => serde_json::json!({
            "status": "corrupted",
            "at_sequence": at_sequence,
            "reason": reason,
        }),
    };
    println!("{report}");
    Ok(if status.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_CORRUPTED)
    })
}
