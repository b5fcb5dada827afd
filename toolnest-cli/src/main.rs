//! Toolnest CLI
//!
//! Installs a catalog of developer tools in parallel and registers them on
//! the user search path.

mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use toolnest_core::installer::{
    builtin_catalog, event_channel, format_size, load_catalog_from, load_manifest_from,
    paths::manifest_path, scan_existing_archives, select_tools, InstallOrchestrator, ToolSpec,
};
use toolnest_core::{PathStoreKind, Settings};

use report::{completion_notice, ConsoleReporter};

#[derive(Debug, Parser)]
#[command(name = "toolnest", version, about = "Parallel developer-tool installer")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download, unpack and register tools
    Install {
        /// Install directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Catalog JSON file (defaults to the built-in catalog)
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Only install these tools (comma separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Register on an in-memory search path instead of the real one
        #[arg(long)]
        dry_run: bool,
    },
    /// Show catalog tools and their install state
    List {
        /// Install directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Catalog JSON file (defaults to the built-in catalog)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref())?;

    tracing::info!("Starting Toolnest v{}", toolnest_core::VERSION);

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };

    match cli.command {
        Command::Install {
            dir,
            catalog,
            only,
            dry_run,
        } => {
            apply_overrides(&mut settings, dir, catalog);
            if dry_run {
                settings.path_store = PathStoreKind::Memory;
            }
            install(&settings, &only).await
        }
        Command::List { dir, catalog } => {
            apply_overrides(&mut settings, dir, catalog);
            list(&settings)
        }
    }
}

/// Logs to stderr and, when requested, to a plain log file.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("toolnest=debug".parse()?)
        .add_directive(tracing::Level::INFO.into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn apply_overrides(settings: &mut Settings, dir: Option<PathBuf>, catalog: Option<PathBuf>) {
    if dir.is_some() {
        settings.target_root = dir;
    }
    if catalog.is_some() {
        settings.catalog_path = catalog;
    }
}

fn load_catalog(settings: &Settings) -> Result<Vec<ToolSpec>> {
    match &settings.catalog_path {
        Some(path) => load_catalog_from(path),
        None => Ok(builtin_catalog()),
    }
}

async fn install(settings: &Settings, only: &[String]) -> Result<()> {
    let tools = select_tools(&load_catalog(settings)?, only)?;
    if tools.is_empty() {
        println!("Nothing to install.");
        return Ok(());
    }

    let target_root = settings.target_root();
    println!("Installing into {}", target_root.display());

    let existing = scan_existing_archives(&tools, &target_root);
    if !existing.is_empty() {
        println!("Reusing {} downloaded archive(s):", existing.len());
        for archive in &existing {
            println!("  {} ({})", archive.tool, format_size(archive.size_bytes));
        }
    }

    let (tx, mut rx) = event_channel();
    let orchestrator = Arc::new(
        InstallOrchestrator::from_settings(settings, tx)
            .context("Failed to set up the installer")?,
    );

    orchestrator.start_all(&tools, &target_root);

    let on_interrupt = Arc::clone(&orchestrator);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            on_interrupt.cancel_all();
        }
    });

    let summary = ConsoleReporter::new().run(&mut rx).await;
    orchestrator.wait().await;
    interrupt.abort();

    let summary = summary.unwrap_or_else(|| orchestrator.summary());
    println!("{}", completion_notice(&summary));

    if settings.path_store == PathStoreKind::Memory {
        println!("Dry run: the search path was not changed.");
    }

    if summary.failed > 0 {
        anyhow::bail!("{} tool(s) failed to install", summary.failed);
    }
    Ok(())
}

fn list(settings: &Settings) -> Result<()> {
    let tools = load_catalog(settings)?;
    let target_root = settings.target_root();
    let manifest = load_manifest_from(&manifest_path(&target_root))?;
    let downloaded = scan_existing_archives(&tools, &target_root);

    println!("Install directory: {}", target_root.display());
    for tool in &tools {
        let state = match manifest.get_tool(&tool.name) {
            Some(info) => format!(
                "installed {} ({})",
                info.version,
                info.installed_at.format("%Y-%m-%d %H:%M")
            ),
            None if downloaded.iter().any(|a| a.tool == tool.name) => {
                "downloaded".to_string()
            }
            None => "not installed".to_string(),
        };
        println!("  {:<10} {:<12} {}", tool.name, tool.version, state);
    }
    Ok(())
}
