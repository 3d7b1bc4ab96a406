// ABOUTME: botyard operator binary: run, check and reconcile bot bundles
// ABOUTME: Loads configuration from the environment and drives the engine against Docker

use anyhow::{bail, Context, Result};
use botyard_cli::config::Config;
use botyard_sandbox::{
    BotManager, BundleId, DockerProvider, EngineError, EntryPointResolver, LogLine, LogSource,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "botyard")]
#[command(about = "Botyard - run uploaded bot bundles in isolated sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a bundle and follow its log until it exits or Ctrl-C
    Run {
        /// Bundle identifier (directory name under the bundles root)
        bundle: String,
        #[arg(long, help = "Print log lines as JSON")]
        json: bool,
    },
    /// Resolve a bundle's entry point without starting it
    Check {
        /// Bundle identifier (directory name under the bundles root)
        bundle: String,
    },
    /// Remove sandbox containers left behind by a previous process
    Reconcile {
        #[arg(long, help = "Only list orphaned containers")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    match command {
        Commands::Run { bundle, json } => run_command(config, &bundle, json).await,
        Commands::Check { bundle } => check_command(&config, &bundle),
        Commands::Reconcile { dry_run } => reconcile_command(&config, dry_run).await,
    }
}

fn check_command(config: &Config, bundle: &str) -> Result<()> {
    let bundle_id = BundleId::new(bundle)?;
    let root = config.engine.bundles_root.join(bundle_id.as_str());
    if !root.is_dir() {
        return Err(EngineError::NotFound(bundle_id.to_string()))
            .with_context(|| format!("No bundle directory at {}", root.display()));
    }

    let resolver = EntryPointResolver::from_settings(&config.engine);
    let Some(entry) = resolver.resolve(&root) else {
        return Err(EngineError::NoEntryPoint {
            bundle_id: bundle_id.to_string(),
            reason: resolver.describe_search(),
        }
        .into());
    };

    println!("{} {}", "Bundle:".bold(), bundle_id);
    println!("{} {}", "Entry point:".bold(), entry.path.display());
    println!(
        "{} {}",
        "Command:".bold(),
        resolver.command(&entry).join(" ").green()
    );
    Ok(())
}

async fn docker_manager(config: &Config) -> Result<BotManager> {
    let provider = DockerProvider::with_pull_timeout(config.image_pull_timeout)
        .context("Failed to configure Docker client")?;
    let manager = BotManager::new(Arc::new(provider), config.engine.clone());

    if !manager.runtime_available().await {
        bail!("Docker daemon is not reachable. Is Docker running?");
    }
    Ok(manager)
}

async fn run_command(config: Config, bundle: &str, json: bool) -> Result<()> {
    let bundle_id = BundleId::new(bundle)?;
    let manager = docker_manager(&config).await?;

    if config.reconcile_on_startup {
        if let Err(e) = manager.reconcile_orphans(false).await {
            warn!("Orphan reconcile failed: {}", e);
        }
    }

    let mut subscription = manager.subscribe_logs(&bundle_id).await?;
    for line in subscription.take_replay() {
        print_line(&line, json)?;
    }

    let handle = manager
        .start(&bundle_id)
        .await
        .with_context(|| format!("Failed to start bundle {}", bundle_id))?;
    info!(
        "Bundle {} running in container {}",
        bundle_id, handle.container_id
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = subscription.recv() => {
                let Some(line) = line else { break };
                print_line(&line, json)?;
                if line.source == LogSource::System && line.message.starts_with("sandbox exited") {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping bundle {}", bundle_id);
                break;
            }
        }
    }

    let stopped = manager.stop(&bundle_id).await;
    manager.shutdown().await;
    stopped.with_context(|| format!("Failed to stop bundle {}", bundle_id))?;
    Ok(())
}

async fn reconcile_command(config: &Config, dry_run: bool) -> Result<()> {
    let manager = docker_manager(config).await?;
    let report = manager.reconcile_orphans(dry_run).await?;

    if report.orphaned.is_empty() {
        println!("{}", "No orphaned containers found".green());
        return Ok(());
    }

    for id in &report.orphaned {
        let marker = if report.removed.contains(id) {
            "removed".green()
        } else if dry_run {
            "orphaned".yellow()
        } else {
            "failed".red()
        };
        println!("{} {}", marker, id);
    }
    for error in &report.errors {
        eprintln!("{} {}", "Warning:".yellow().bold(), error);
    }
    Ok(())
}

fn print_line(line: &LogLine, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(line)?);
        return Ok(());
    }

    let tag = match line.source {
        LogSource::Stdout => line.source.as_str().normal(),
        LogSource::Stderr => line.source.as_str().red(),
        LogSource::System => line.source.as_str().cyan().bold(),
    };
    println!(
        "{} [{}] {}",
        line.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        tag,
        line.message
    );
    Ok(())
}
