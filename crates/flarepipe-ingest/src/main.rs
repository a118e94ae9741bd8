//! flarepipe-ingest - pull public HTTP APIs into a document store

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use flarepipe_common::logging::{init_logging, LogConfig, LogLevel};
use flarepipe_ingest::config::PipelineConfig;
use flarepipe_ingest::connectors::{build_pipelines, COLLECTIONS};
use flarepipe_ingest::http::ReqwestHttpClient;
use flarepipe_ingest::loader::Loader;
use flarepipe_ingest::orchestrator::{Orchestrator, SourceStatus};
use flarepipe_ingest::store::{MemoryStore, PgConnector, StoreConnector};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SOURCE_TAGS: &[&str] = &["trace", "dns", "speed", "nvd"];

#[derive(Parser, Debug)]
#[command(name = "flarepipe-ingest")]
#[command(author, version, about = "Pull public HTTP APIs into a document store")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every enabled source once
    Run(SourceArgs),

    /// Connect to the store and hit every enabled endpoint without loading
    Check(SourceArgs),

    /// Print document counts per collection
    Stats,
}

#[derive(Args, Debug, Clone)]
struct SourceArgs {
    /// Only run these sources (trace, dns, speed, nvd)
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,

    /// Skip these sources
    #[arg(long, value_delimiter = ',')]
    skip: Vec<String>,

    /// Domains to resolve, replacing DNS_DOMAINS
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// Number of speed samples, replacing SPEED_ITERATIONS
    #[arg(long)]
    speed_iterations: Option<u32>,

    /// Use an in-memory store instead of PostgreSQL
    #[arg(long)]
    dry_run: bool,
}

impl SourceArgs {
    fn apply(&self, config: &mut PipelineConfig) -> Result<()> {
        for tag in self.only.iter().chain(&self.skip) {
            if !SOURCE_TAGS.contains(&tag.as_str()) {
                bail!("Unknown source '{}' (expected one of: {})", tag, SOURCE_TAGS.join(", "));
            }
        }

        if !self.only.is_empty() {
            for tag in SOURCE_TAGS {
                set_enabled(config, tag, self.only.iter().any(|t| t == tag));
            }
        }
        for tag in &self.skip {
            set_enabled(config, tag, false);
        }
        if !self.domains.is_empty() {
            config.dns.domains = self.domains.clone();
        }
        if let Some(iterations) = self.speed_iterations {
            config.speed.iterations = iterations;
        }

        config.validate().context("Invalid configuration after CLI overrides")?;
        Ok(())
    }

    fn connector(&self, config: &PipelineConfig) -> Arc<dyn StoreConnector> {
        if self.dry_run {
            info!("Dry run: loading into an in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(PgConnector::new(config.database.clone()))
        }
    }
}

fn set_enabled(config: &mut PipelineConfig, tag: &str, enabled: bool) {
    match tag {
        "trace" => config.trace.enabled = enabled,
        "dns" => config.dns.enabled = enabled,
        "speed" => config.speed.enabled = enabled,
        "nvd" => config.nvd.enabled = enabled,
        _ => {},
    }
}

fn build_orchestrator(config: &PipelineConfig) -> Result<Orchestrator> {
    let http = ReqwestHttpClient::new(&config.http.user_agent)
        .context("Failed to build HTTP client")?;
    let pipelines = build_pipelines(config, Utc::now());
    Ok(Orchestrator::new(config, Arc::new(http), pipelines))
}

/// Cancel `token` on Ctrl-C so the run stops before the next source
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current source");
            token.cancel();
        }
    });
}

async fn run(config: &PipelineConfig, args: &SourceArgs) -> Result<()> {
    let mut loader = Loader::connect(args.connector(config))
        .await
        .context("Failed to connect to document store")?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let orchestrator = build_orchestrator(config)?.with_cancellation(cancel);
    let result = orchestrator.run(&mut loader).await;

    if !result.any_succeeded() {
        bail!("No source completed successfully (run {})", result.run_id);
    }
    Ok(())
}

async fn check(config: &PipelineConfig, args: &SourceArgs) -> Result<()> {
    Loader::connect(args.connector(config))
        .await
        .context("Failed to connect to document store")?;
    println!("✓ document store reachable");

    let reports = build_orchestrator(config)?.check().await;
    let mut failed = 0;
    for report in &reports {
        match report.status {
            SourceStatus::Failed => {
                failed += 1;
                println!("✗ {:<6} failed", report.source);
                for error in &report.errors {
                    println!("    {error}");
                }
            },
            status => println!(
                "✓ {:<6} {} ({}/{} items, {} ms)",
                report.source, status, report.extracted, report.attempted, report.duration_ms
            ),
        }
    }

    if failed > 0 {
        bail!("{failed} of {} sources failed the check", reports.len());
    }
    Ok(())
}

async fn stats(config: &PipelineConfig) -> Result<()> {
    let connector: Arc<dyn StoreConnector> = Arc::new(PgConnector::new(config.database.clone()));
    let mut loader = Loader::connect(connector)
        .await
        .context("Failed to connect to document store")?;

    for collection in COLLECTIONS {
        let count = loader
            .count(collection, &json!({}))
            .await
            .with_context(|| format!("Failed to count {collection}"))?;
        println!("{collection:<24} {count}");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env()
        .unwrap_or_else(|_| LogConfig::builder().log_file_prefix("flarepipe-ingest").build());
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config)?;
            run(&config, &args).await?;
        },
        Command::Check(args) => {
            args.apply(&mut config)?;
            check(&config, &args).await?;
        },
        Command::Stats => stats(&config).await?,
    }

    Ok(())
}
