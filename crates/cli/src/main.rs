use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exgate_core::{Platform, ProtocolStyle};
use exgate_gateway::adapters::adapter_for;
use exgate_gateway::GatewayConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "exgate")]
#[command(about = "Exchange WebSocket gateway: one upstream connection per credential set, shared by every browser client")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Path to the TOML config file
    #[arg(short, long, env = "EXGATE_CONFIG", default_value = "exgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Bind address
        #[arg(short, long, env = "EXGATE_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// List supported exchanges and their default endpoints
    Platforms,

    /// Load and validate the config file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    match cli.command {
        Commands::Serve { bind } => {
            let config = load_config(&cli.config)?;
            tracing::info!(
                config = %cli.config.display(),
                tokens = config.tokens.len(),
                credentials = config.credentials.len(),
                "Loaded config"
            );
            if config.tokens.is_empty() {
                tracing::warn!("No access tokens configured; every client will be rejected");
            }
            let gateway = exgate_gateway::gateway_from_config(&config)?;
            exgate_gateway::start_server(gateway, &bind).await?;
        }
        Commands::Platforms => {
            println!("Supported platforms:");
            for platform in Platform::ALL {
                let style = match adapter_for(platform).style() {
                    ProtocolStyle::StatelessReconnect => "stateless-reconnect",
                    ProtocolStyle::PersistentRpc => "persistent-rpc",
                };
                let prod = platform.default_endpoints(false);
                let test = platform.default_endpoints(true);
                println!("  {:<8} {}", platform, style);
                println!("           ws:      {}  (testnet {})", prod.ws_url, test.ws_url);
                println!("           rest:    {}  (testnet {})", prod.rest_url, test.rest_url);
            }
        }
        Commands::CheckConfig => {
            let config = load_config(&cli.config)?;
            let unsupported: Vec<&str> = config
                .credentials
                .iter()
                .filter(|c| c.platform.parse::<Platform>().is_err())
                .map(|c| c.id.as_str())
                .collect();
            let inactive = config.credentials.iter().filter(|c| !c.active).count();

            println!("Config OK: {}", cli.config.display());
            println!("  tokens:            {}", config.tokens.len());
            println!("  credentials:       {} ({} inactive)", config.credentials.len(), inactive);
            println!("  endpoint overrides: {}", config.endpoints.len());
            println!(
                "  client ping:       every {}s, timeout {}s",
                config.gateway.ping_period_secs, config.gateway.pong_wait_secs
            );
            println!("  reconnect:         {} attempts", config.gateway.reconnect_attempts);
            if !unsupported.is_empty() {
                println!(
                    "  warning: credentials on unsupported platforms: {}",
                    unsupported.join(", ")
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<GatewayConfig> {
    GatewayConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}
