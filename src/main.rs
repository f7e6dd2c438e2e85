//! Recall CLI: run the indexer daemon, or talk to a running one.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use recall::client;
use recall::config::{default_config_dir, SOCKET_FILE};
use recall::daemon::{launch, DaemonOptions};

#[derive(Parser)]
#[command(
    name = "recall",
    about = "Recall — a local-first indexer daemon and search engine for AI-assistant session transcripts",
    version
)]
struct Cli {
    /// Configuration directory (default: ~/.recall)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexer daemon
    Run {
        /// Disable the filesystem watcher
        #[arg(long)]
        no_watch: bool,
    },

    /// Show the running daemon's state
    Status,

    /// Trigger a sync and stream its progress
    Sync {
        /// Ignore sync watermarks, re-ingest everything
        #[arg(long)]
        force: bool,
    },

    /// Literal search over indexed sessions
    Search {
        /// Search query
        query: String,

        /// Filter by project name substring
        #[arg(long)]
        project: Option<String>,

        /// Filter by source tag
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of matches
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Match case-sensitively
        #[arg(long)]
        case_sensitive: bool,

        /// Treat the query as a regular expression
        #[arg(long)]
        regex: bool,
    },

    /// Semantic search over embedded sessions
    Semantic {
        /// Search query
        query: String,

        /// Filter by project name substring
        #[arg(long)]
        project: Option<String>,

        /// Filter by source tag
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Exclude results at or beyond this cosine distance
        #[arg(long, default_value_t = 0.0)]
        max_distance: f64,

        /// Rerank for session diversity
        #[arg(long)]
        diversity: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RECALL_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let socket_path = config_dir.join(SOCKET_FILE);

    match cli.command {
        Commands::Run { no_watch } => {
            let mut options = DaemonOptions::new(config_dir);
            options.watch = !no_watch;
            let handle = launch(options).await?;

            wait_for_signal().await;
            handle.shutdown().await;
        }

        Commands::Status => {
            let data = client::call(&socket_path, "status", json!({}), |_| {}).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }

        Commands::Sync { force } => {
            let data = client::call(&socket_path, "sync", json!({ "force": force }), |progress| {
                if let Some(message) = progress.get("message").and_then(|m| m.as_str()) {
                    eprintln!("sync  {}", message);
                }
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }

        Commands::Search {
            query,
            project,
            source,
            limit,
            case_sensitive,
            regex,
        } => {
            let params = json!({
                "query": query,
                "filter_project": project,
                "filter_source": source,
                "limit": limit,
                "case_sensitive": case_sensitive,
                "use_regex": regex,
            });
            let data = client::call(&socket_path, "search", params, |_| {}).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }

        Commands::Semantic {
            query,
            project,
            source,
            limit,
            max_distance,
            diversity,
        } => {
            let params = json!({
                "query": query,
                "filter_project": project,
                "filter_source": source,
                "limit": limit,
                "max_distance": max_distance,
                "diversity": diversity,
            });
            let data = client::call(&socket_path, "semantic_search", params, |_| {}).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }

    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
