use anyhow::{Context, Result};
use clap::Parser;
use commit_searcher::config::Config;
use commit_searcher::index::NoIndex;
use commit_searcher::metrics::Metrics;
use commit_searcher::source::GitCliSource;
use commit_searcher::telemetry::{init_telemetry, shutdown_telemetry};
use commit_searcher::{web, SearchContext, Service};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

/// Commit Searcher - per-commit code search over cached archives
#[derive(Parser, Debug)]
#[command(name = "commit_searcher")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server listen address (overrides config file)
    #[arg(short, long, value_name = "ADDR")]
    address: Option<String>,

    /// Archive cache directory (overrides config file)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory of bare git repositories (overrides config file)
    #[arg(long, value_name = "DIR")]
    repos_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Generate a template configuration file and exit
    #[arg(long, value_name = "FILE")]
    init: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --init flag: generate template config and exit
    if let Some(init_path) = args.init {
        let path = if init_path.as_os_str().is_empty() {
            PathBuf::from("commit_searcher.toml")
        } else {
            init_path
        };
        if path.exists() {
            anyhow::bail!(
                "Config file already exists: {}\nRemove it first or choose a different path.",
                path.display()
            );
        }
        Config::write_template(&path)?;
        println!("Generated config file: {}", path.display());
        println!("\nStart the server with:");
        println!("  commit_searcher_server --config {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;
    let trace_export = config.tracing.clone().with_env_overrides();
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_telemetry(
        trace_export.export_enabled(),
        &trace_export.otlp_endpoint,
        &trace_export.service_name,
        log_level,
    )?;

    info!(
        address = %config.server.address,
        cache_dir = %config.store.cache_dir.display(),
        repos_dir = %config.source.repos_dir.display(),
        "Configuration loaded"
    );

    let metrics = Metrics::new();
    let source = Arc::new(GitCliSource::new(
        config.source.repos_dir.clone(),
        config.source.git_path.clone(),
    ));
    let service = Arc::new(
        Service::new(config.clone(), source, Arc::new(NoIndex), metrics)
            .context("Failed to initialise the archive store")?,
    );

    // Eviction and limiter refresh stop with this context
    let lifetime = SearchContext::background();
    let maintenance = service.store().start_maintenance(lifetime.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.address))?;
    info!(address = %config.server.address, "Commit Searcher ready");
    info!("Press Ctrl+C to stop");

    web::serve(listener, service, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutting down...");
    })
    .await
    .context("HTTP server failed")?;

    lifetime.cancel();
    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "Maintenance task ended abnormally");
    }
    shutdown_telemetry();
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let base_config = if let Some(ref config_path) = args.config {
        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nUse --init {} to generate a template.",
                config_path.display(),
                config_path.display()
            );
        }
        Config::from_file(config_path)?
    } else {
        Config::from_default_locations()?
            .map(|(config, _)| config)
            .unwrap_or_default()
    };

    Ok(base_config.with_overrides(
        args.address.clone(),
        args.cache_dir.clone(),
        args.repos_dir.clone(),
    ))
}
