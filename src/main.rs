//! llm-bridge - OpenAI-compatible routing across multiple LLM providers
//!
//! A local gateway that exposes configured provider models under stable
//! public names, gates failing providers, and meters usage.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_bridge::config::{Config, KeySource};
use llm_bridge::registry::{endpoint, RegistrySnapshot};

#[derive(Parser)]
#[command(name = "llm-bridge")]
#[command(about = "OpenAI-compatible router for multiple LLM providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router on every configured endpoint
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show routable models and where they are exposed
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(default_level: &str) {
    let fallback = format!("llm_bridge={},tower_http=info", default_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn report_key_sources(key_sources: &[(String, KeySource)]) {
    for (provider, source) in key_sources {
        tracing::info!(provider = %provider, key_source = %source, "API key source");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config: path } => {
            let (config, key_sources) = match Config::from_file_with_env(&path) {
                Ok(loaded) => loaded,
                Err(e) => {
                    init_tracing("info");
                    tracing::error!(config = %path, error = %e, "Failed to load configuration");
                    return Err(e.into());
                }
            };
            init_tracing(&config.logging.level);

            tracing::info!(
                config = %path,
                endpoints = config.server.endpoints.len(),
                providers = config.providers.len(),
                "Starting llm-bridge"
            );
            report_key_sources(&key_sources);

            llm_bridge::proxy::run_server(config, path).await
        }

        Commands::Check { config: path } => {
            init_tracing("info");
            let (config, key_sources) = Config::from_file_with_env(&path)?;
            report_key_sources(&key_sources);

            let snapshot = RegistrySnapshot::build(config.enabled_providers());
            println!(
                "Configuration OK: {} endpoint(s), {} provider(s), {} routable model(s)",
                config.server.endpoints.len(),
                config.providers.len(),
                snapshot.len()
            );
            Ok(())
        }

        Commands::Providers { config: path } => {
            init_tracing("warn");
            let (config, key_sources) = Config::from_file_with_env(&path)?;
            let snapshot = RegistrySnapshot::build(config.enabled_providers());

            println!(
                "{:<28} {:<18} {:<32} {:<20} KEY",
                "MODEL", "KIND", "UPSTREAM MODEL", "ENDPOINTS"
            );
            for provider in snapshot.iter() {
                let endpoints: Vec<&str> = config
                    .server
                    .endpoints
                    .iter()
                    .map(|e| e.id.as_str())
                    .filter(|id| endpoint::is_available(&provider.config, id))
                    .collect();
                let key = key_sources
                    .iter()
                    .find(|(id, _)| *id == provider.config.id)
                    .map(|(_, source)| source.to_string())
                    .unwrap_or_else(|| "none".to_string());

                println!(
                    "{:<28} {:<18} {:<32} {:<20} {}",
                    provider.public_name(),
                    provider.kind().as_str(),
                    provider.upstream.model,
                    endpoints.join(","),
                    key
                );
            }
            Ok(())
        }
    }
}
