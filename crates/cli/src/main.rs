use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};
use tradedesk_brokers_metatrader::{BridgeManager, BridgeOptions, ConfigStore, LocalBridge, Mt5Command};
use tradedesk_core::{BridgeChannel, BridgeConfig};

#[derive(Parser)]
#[command(name = "tradedesk")]
#[command(about = "Trading-operations dashboard backend: MT5 bridge status, accounts and orders")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Path to the bridge connection record
    #[arg(long, env = "TRADEDESK_BRIDGE_CONFIG", default_value = "config/mt5_bridge.json")]
    bridge_config: PathBuf,

    /// Run this bridge script once per command instead of using the remote bridge
    #[arg(long, env = "TRADEDESK_LOCAL_BRIDGE")]
    local_bridge: Option<PathBuf>,

    /// Interpreter for --local-bridge
    #[arg(long, env = "TRADEDESK_PYTHON", default_value = "python")]
    python: PathBuf,

    #[command(flatten)]
    timing: TimingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TimingArgs {
    /// Connection retries after the first failed attempt
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Delay between connection attempts (seconds)
    #[arg(long, default_value = "2")]
    retry_delay_secs: u64,

    /// Timeout for a single connection attempt (seconds)
    #[arg(long, default_value = "15")]
    connect_timeout_secs: u64,

    /// Timeout for a bridge command (seconds)
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,
}

impl From<&TimingArgs> for BridgeOptions {
    fn from(args: &TimingArgs) -> Self {
        Self {
            max_retries: args.max_retries,
            retry_delay: Duration::from_secs(args.retry_delay_secs),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Server {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:3000")]
        bind: String,

        /// Connect to the bridge before accepting requests
        #[arg(long)]
        connect_on_start: bool,
    },

    /// Connect to the bridge and print the connection status
    Status,

    /// Send a raw command to the bridge and print its result
    Call {
        /// Command name (see `tradedesk commands`)
        command: String,

        /// Positional arguments as a JSON array, e.g. '["EURUSD", "H1", 50]'
        #[arg(short, long, default_value = "[]")]
        args: String,
    },

    /// List the commands the bridge understands
    Commands,

    /// Show or change the bridge connection record
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the current record
    Show,
    /// Update fields of the record
    Set {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        enabled: Option<bool>,
    },
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

    let store = ConfigStore::new(&cli.bridge_config);
    let options = BridgeOptions::from(&cli.timing);
    let local = cli
        .local_bridge
        .map(|script| (cli.python, script, options.request_timeout));
    let bridge = |store: ConfigStore| -> Result<Arc<dyn BridgeChannel>> {
        let bridge: Arc<dyn BridgeChannel> = match local.clone() {
            Some((python, script, timeout)) => Arc::new(LocalBridge::new(python, script, timeout)),
            None => Arc::new(BridgeManager::from_store(store, options.clone())?),
        };
        Ok(bridge)
    };

    match cli.command {
        Commands::Server {
            bind,
            connect_on_start,
        } => {
            let bridge = bridge(store)?;
            if connect_on_start && !bridge.connect().await {
                tracing::warn!(
                    endpoint = %bridge.status().endpoint,
                    "Bridge unavailable at startup, will retry on first request"
                );
            }
            tradedesk_api::start_server(bridge, &bind).await?;
        }
        Commands::Status => {
            let bridge = bridge(store)?;
            bridge.connect().await;
            println!("{}", serde_json::to_string_pretty(&bridge.status())?);
        }
        Commands::Call { command, args } => {
            call(bridge(store)?, &command, &args).await?;
        }
        Commands::Commands => {
            println!("Bridge commands:");
            for cmd in Mt5Command::ALL {
                println!("  {:<26} [{}]", cmd.name(), cmd.arg_names().join(", "));
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let config = store.load()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigCommands::Set {
                host,
                port,
                enabled,
            } => {
                let current = store.load()?;
                let config = BridgeConfig {
                    host: host.unwrap_or(current.host),
                    port: port.unwrap_or(current.port),
                    enabled: enabled.unwrap_or(current.enabled),
                };
                config.ws_url()?;
                store.save(&config).await?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}

async fn call(bridge: Arc<dyn BridgeChannel>, command: &str, args: &str) -> Result<()> {
    let command: Mt5Command = command.parse().map_err(anyhow::Error::msg)?;
    let args: Vec<serde_json::Value> =
        serde_json::from_str(args).context("--args must be a JSON array")?;

    tracing::info!(command = %command, endpoint = %bridge.status().endpoint, "Calling bridge");

    let result = bridge.call(command.name(), args).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    bridge.disconnect().await;
    Ok(())
}
