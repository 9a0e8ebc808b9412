//! cqd - commit queue daemon
//!
//! Watches a review service for changes flagged for commit, verifies them
//! in a local checkout and commits the ones that pass.
//!
//! ## Commands
//!
//! - `run`: main loop until SIGINT/SIGTERM (or one round with `--once`)
//! - `status`: print the persisted queue
//! - `validate-config`: parse the configuration and build every verifier

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use cq_core::{
    init_tracing, Checkout, Context, NullStatusSink, PendingManager, QueueSnapshot, ReviewClient,
    ShutdownCoordinator, StatusSink, Verified,
};
use cq_integrations::{
    GitCheckout, HttpReviewClient, HttpStatusSink, ReadOnlyCheckout, ReadOnlyReviewClient,
};
use cq_state::{FileSnapshotStore, SnapshotStore};
use cq_verifiers::{build_registry, HttpTreeStatusSource};
use serde::Serialize;
use tracing::{error, info, Level};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "cqd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Commit queue daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "CQ_CONFIG",
        default_value = "commit-queue.toml"
    )]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the commit queue until a termination signal
    Run {
        /// Verify for real but never commit, comment or close issues
        #[arg(long)]
        dry_run: bool,

        /// Run a single round and exit
        #[arg(long)]
        once: bool,
    },

    /// Show the persisted queue
    Status,

    /// Check the configuration and exit
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Run { dry_run, once } => cmd_run(&cli.config, dry_run, once).await,
        Commands::Status => cmd_status(&cli.config, cli.json).await,
        Commands::ValidateConfig => cmd_validate_config(&cli.config),
    };
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "cqd failed");
    }
    result
}

fn load_config(path: &Path) -> Result<DaemonConfig> {
    DaemonConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Production collaborators, wrapped read-only for dry runs.
async fn build_context(config: &DaemonConfig, dry_run: bool) -> Result<Arc<Context>> {
    let review: Arc<dyn ReviewClient> = Arc::new(
        HttpReviewClient::new(config.review.clone()).context("Failed to build review client")?,
    );
    let checkout: Arc<dyn Checkout> = Arc::new(
        GitCheckout::open(config.checkout.clone())
            .await
            .with_context(|| format!("Failed to open {}", config.checkout.path.display()))?,
    );
    let (review, checkout): (Arc<dyn ReviewClient>, Arc<dyn Checkout>) = if dry_run {
        info!("Dry run: nothing will be committed");
        (
            Arc::new(ReadOnlyReviewClient::new(review)),
            Arc::new(ReadOnlyCheckout::new(checkout)),
        )
    } else {
        (review, checkout)
    };
    let status: Arc<dyn StatusSink> = match &config.status {
        Some(section) => Arc::new(
            HttpStatusSink::new(&section.url, Duration::from_secs(section.timeout_secs))
                .context("Failed to build status sink")?,
        ),
        None => Arc::new(NullStatusSink),
    };
    Ok(Context::new(
        review,
        checkout,
        status,
        config.checkout.server_hooks_missing,
    ))
}

async fn cmd_run(config_path: &Path, dry_run: bool, once: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let context = build_context(&config, dry_run).await?;
    let tree_source = Arc::new(HttpTreeStatusSource::new(Duration::from_secs(
        config.manager.http_timeout_secs,
    ))?);
    let registry = build_registry(&config.verifiers, &context, tree_source)?;
    let store = Arc::new(FileSnapshotStore::new(&config.state.path));

    let mut manager = PendingManager::new(
        context,
        registry,
        store,
        config.manager_config(once.then_some(1)),
    );
    manager
        .load()
        .await
        .context("Failed to restore the queue snapshot")?;

    let shutdown =
        ShutdownCoordinator::install_default().context("Failed to install signal handlers")?;
    info!(
        verifiers = ?manager.verifiers().names(),
        queued = manager.queue().len(),
        state = %config.state.path.display(),
        "Commit queue started"
    );

    let result = manager.run(&shutdown).await;
    manager.close().await;
    result?;
    info!("Commit queue stopped");
    Ok(())
}

/// One line of `cqd status`.
#[derive(Debug, Serialize)]
struct StatusRow {
    issue: u64,
    patchset: u64,
    owner: String,
    state: &'static str,
    postponed: bool,
    why_not: String,
}

fn status_rows(snapshot: &QueueSnapshot) -> Vec<StatusRow> {
    snapshot
        .pending
        .iter()
        .map(|pending| StatusRow {
            issue: pending.issue(),
            patchset: pending.patchset(),
            owner: pending.info.owner.clone(),
            state: pending.get_state().as_str(),
            postponed: pending.postpone(),
            why_not: {
                let error = pending.error_message();
                if error.is_empty() {
                    pending.why_not()
                } else {
                    error
                }
            },
        })
        .collect()
}

fn render_rows(rows: &[StatusRow]) -> String {
    let mut out = format!(
        "{:<10} {:<9} {:<11} {:<30} {}\n",
        "ISSUE", "PATCHSET", "STATE", "OWNER", "WHY NOT"
    );
    for row in rows {
        let state = if row.postponed {
            format!("{}*", row.state)
        } else {
            row.state.to_string()
        };
        let why_not = row.why_not.lines().next().unwrap_or_default();
        out.push_str(&format!(
            "{:<10} {:<9} {:<11} {:<30} {}\n",
            row.issue, row.patchset, state, row.owner, why_not
        ));
    }
    out
}

async fn read_snapshot(path: &Path) -> Result<QueueSnapshot> {
    let store = FileSnapshotStore::new(path);
    match store.load().await? {
        Some(payload) => serde_json::from_str(&payload)
            .with_context(|| format!("Queue snapshot {} is not decodable", path.display())),
        None => Ok(QueueSnapshot::default()),
    }
}

async fn cmd_status(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let snapshot = read_snapshot(&config.state.path).await?;
    let rows = status_rows(&snapshot);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("Queue is empty (round {})", snapshot.round);
    } else {
        print!("{}", render_rows(&rows));
        println!("\n{} queued, round {}", rows.len(), snapshot.round);
    }
    Ok(())
}

/// Build every verifier against unopened collaborators; nothing touches the
/// network or the checkout.
fn cmd_validate_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let context = Context::new(
        Arc::new(HttpReviewClient::new(config.review.clone())?),
        Arc::new(GitCheckout::new(config.checkout.clone())),
        Arc::new(NullStatusSink),
        config.checkout.server_hooks_missing,
    );
    let tree_source = Arc::new(HttpTreeStatusSource::new(Duration::from_secs(
        config.manager.http_timeout_secs,
    ))?);
    let registry = build_registry(&config.verifiers, &context, tree_source)?;
    println!(
        "{}: OK ({} verifiers: {})",
        config_path.display(),
        registry.len(),
        registry.names().join(", ")
    );
    Ok(())
}
