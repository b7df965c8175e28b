use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eibc_config::{ConfigLoader, EibcConfig};
use std::{path::PathBuf, sync::Arc};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod service;

#[derive(Parser)]
#[command(name = "eibc-service")]
#[command(about = "eIBC settlement hub", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", env = "EIBC_CONFIG", default_value = "config/eibc.toml")]
	config: PathBuf,

	/// Overrides the configured log level; `RUST_LOG` wins over both
	#[arg(long, env = "EIBC_LOG")]
	log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the hub and its API
	Start,
	/// Validate the configuration file
	Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config = ConfigLoader::from_file(&cli.config)
		.with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

	let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
	setup_tracing(level, config.logging.json);

	match cli.command {
		Some(Commands::Start) | None => start_service(config).await,
		Some(Commands::Validate) => validate_config(&config),
	}
}

async fn start_service(config: EibcConfig) -> Result<()> {
	info!("Starting eIBC service");
	info!("Hub: {} ({})", config.hub.chain_id, config.hub.denom);
	for (chain_id, rollapp) in &config.rollapps {
		info!(
			"Rollapp: {} on {} (dispute period {} blocks)",
			chain_id, rollapp.hub_channel, rollapp.dispute_period_in_blocks
		);
	}

	let (host, port) = (config.api.host.clone(), config.api.port);
	let service = Arc::new(service::EibcService::new(config));
	let tasks = service.start().await.context("Failed to start service")?;

	let http_service = service.clone();
	let http_handle = tokio::spawn(async move {
		if let Err(e) = api::start_http_server(http_service, host, port).await {
			error!("API server stopped: {:#}", e);
		}
	});

	info!("eIBC service started");
	shutdown_signal().await;
	info!("Shutdown signal received, stopping services...");

	service.shutdown().await.context("Failed to stop service")?;
	for task in tasks {
		if let Err(e) = task.await {
			error!("Background task ended abnormally: {}", e);
		}
	}
	http_handle.abort();

	info!("eIBC service stopped");
	Ok(())
}

fn validate_config(config: &EibcConfig) -> Result<()> {
	info!("Configuration is valid");
	info!("Hub: {}", config.hub.chain_id);
	for (chain_id, rollapp) in &config.rollapps {
		info!("  Rollapp: {} via {}", chain_id, rollapp.hub_channel);
	}
	for (chain_id, counterparty) in &config.counterparties {
		info!("  Counterparty: {} via {}", chain_id, counterparty.hub_channel);
	}
	Ok(())
}

fn setup_tracing(level: &str, json: bool) {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

	let registry = tracing_subscriber::registry().with(env_filter);
	if json {
		registry
			.with(tracing_subscriber::fmt::layer().json().with_current_span(true))
			.init();
	} else {
		registry.with(tracing_subscriber::fmt::layer()).init();
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				error!("Failed to install SIGTERM handler: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
