use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use embed_updater::{
    Embedder, EmbedderConfig, Host, LocalFileStore, Notifier, Prompter, Secp256k1Recovery,
    Sha256Digester,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Check for, verify and install the latest wallet embed", long_about = None)]
struct Cli {
    /// Path to the JSON engine configuration
    config: PathBuf,

    /// Directory holding the embed cache
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,
}

/// Asks yes/no questions on the controlling terminal.
struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn prompt(&self, title: &str, message: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        let question = format!("\n{title}\n{message}\n[y/N] ");
        if stdout.write_all(question.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return false;
        }

        let mut answer = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut answer).await {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read answer");
                false
            }
        }
    }
}

struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, title: &str, message: &str) {
        eprintln!("\n{title}\n{message}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,embed_updater=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = EmbedderConfig::from_json_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let host = Host::builder()
        .files(LocalFileStore::new(cli.data_dir))
        .digester(Sha256Digester)
        .signer_recovery(Secp256k1Recovery)
        .notifier(Arc::new(TerminalNotifier))
        .prompter(Arc::new(TerminalPrompter))
        .build()?;

    let embedder = Embedder::new(config, host)?;
    if embedder.check().await {
        tracing::info!(files = embedder.local_files().await.len(), "embed bundle ready");
        Ok(())
    } else {
        tracing::error!("no verified embed bundle available");
        std::process::exit(1);
    }
}
