mod app;
mod config;
mod models;
mod providers;
mod services;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use app::App;
use config::AppConfig;
use providers::Backend;
use services::ChatOptions;
use ui::repl::Repl;

/// Terminal chat client for a streaming chat API.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Path to the config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Base URL of the API, e.g. http://localhost:8000/api
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Model to request
    #[arg(short, long)]
    model: Option<String>,

    /// Provider to request
    #[arg(short, long)]
    provider: Option<String>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("parley=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if cli.model.is_some() {
        config.model = cli.model;
    }
    if cli.provider.is_some() {
        config.provider = cli.provider;
    }

    let backend = Backend::new(&config.api_base_url, config.connect_timeout())
        .with_context(|| format!("Invalid API URL {}", config.api_base_url))?;

    match backend.health().await {
        Ok(status) => tracing::info!("API at {} is {}", backend.base_url(), status),
        Err(e) => tracing::warn!("Health check against {} failed: {:#}", backend.base_url(), e),
    }

    if config.model.is_none() || config.provider.is_none() {
        match backend.default_config().await {
            Ok(defaults) => {
                config.model = config.model.or(Some(defaults.model));
                config.provider = config.provider.or(Some(defaults.provider));
            }
            Err(e) => tracing::warn!("Could not fetch server defaults: {:#}", e),
        }
    }

    let backend = Arc::new(
        backend
            .with_model(config.model.clone(), config.provider.clone())
            .with_list_limit(config.list_limit),
    );

    let options = ChatOptions {
        model: config.model.clone(),
        provider: config.provider.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    };

    let (app, events) = App::new(
        backend.clone(),
        backend.clone(),
        options,
        config.save_debounce(),
    );

    tracing::info!(
        "Starting parley against {} (model: {})",
        backend.base_url(),
        config.model.as_deref().unwrap_or("server default")
    );
    println!("parley: type a message, or /help for commands.");

    let mut repl = Repl::new(app, events, std::io::stdout())
        .with_backend(backend)
        .with_list_refresh(config.list_refresh_interval());
    repl.run(BufReader::new(tokio::io::stdin())).await
}
