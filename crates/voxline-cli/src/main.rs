mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use voxline_core::config::{Config, GatewayConfig};
use voxline_gateway::AppState;

#[derive(Parser)]
#[command(
    name = "voxline",
    about = "Real-time voice assistant gateway: speech in, speech out, interruptible",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration, or one value by dotted path
    Show { path: Option<String> },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let mut config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose)?;
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve { port, bind } => {
            if bind.is_some() {
                let gateway = config.gateway.get_or_insert_with(|| GatewayConfig {
                    port: 8000,
                    bind: None,
                    public_url: None,
                });
                gateway.bind = bind;
            }
            let port = port.unwrap_or_else(|| config.gateway_port());

            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!("{e}");
                }
                anyhow::bail!("invalid configuration ({} errors)", errors.len());
            }

            let state = AppState::from_config(Arc::new(config));
            #[cfg(feature = "metrics")]
            let state = state.with_prometheus(voxline_gateway::metrics::install_prometheus_recorder()?);

            tracing::info!("Starting Voxline gateway on port {port}");
            voxline_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { path: None } => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Show { path: Some(path) } => match config.get_path(&path) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{path}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("configuration has {} error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Voxline v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {}", config.gateway_port());
            let providers: Vec<&str> = config
                .providers
                .iter()
                .flatten()
                .map(|p| p.id.as_str())
                .collect();
            if providers.is_empty() {
                println!("Providers: none configured (using environment keys)");
            } else {
                println!("Providers: {}", providers.join(", "));
            }
            println!("Status: {}", health_check(config.gateway_port()).await);
        }
    }

    Ok(())
}

/// Ask a local gateway for its health.
async fn health_check(port: u16) -> String {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(2)).build() {
        Ok(client) => client,
        Err(e) => return format!("unknown ({e})"),
    };
    let resp = match client.get(format!("http://127.0.0.1:{port}/health")).send().await {
        Ok(resp) => resp,
        Err(_) => return "not running".into(),
    };
    match resp.json::<serde_json::Value>().await {
        Ok(body) => format!(
            "running ({} active sessions)",
            body["active_sessions"].as_u64().unwrap_or(0)
        ),
        Err(e) => format!("unexpected health response ({e})"),
    }
}
