use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use satellite_core::config::{expand_path, Config, LoggingConfig};
use satellite_core::keep_alive::{KeepAlive, LogKeepAlive, WebhookKeepAlive};
use satellite_core::matcher::TemplateMatcher;
use satellite_core::pipeline::LoopbackPipeline;
use satellite_core::timer::LocalTimerService;
use satellite_gateway::GatewayState;
use satellite_session::{Collaborators, SessionRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "voice-satellite",
    about = "Bridge between voice satellite devices and a voice assistant pipeline",
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
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show gateway status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value by dotted path
    Get { key: String },
    /// Check the configuration for errors
    Validate,
}

/// Build the log filter: `RUST_LOG` wins, then the config file, then `--verbose`.
fn env_filter(logging: Option<&LoggingConfig>, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = logging
        .and_then(|l| l.level.clone())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
    let mut directives = vec![level];
    if let Some(logging) = logging {
        directives.extend(logging.filters.iter().cloned());
    }
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let filter = env_filter(logging, verbose);
    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

fn collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let keep_alive: Arc<dyn KeepAlive> = match config.keep_alive_webhook() {
        Some(url) => {
            tracing::info!(url, "Keep-alive via webhook");
            Arc::new(WebhookKeepAlive::new(url)?)
        }
        None => Arc::new(LogKeepAlive),
    };

    Ok(Collaborators {
        executor: Arc::new(LoopbackPipeline),
        matcher: Arc::new(TemplateMatcher),
        keep_alive,
        timers: Some(Arc::new(LocalTimerService::new())),
        timings: config.timings(),
    })
}

async fn run_gateway(config: Config, port: u16) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration: {}", errors.join("; "));
    }

    let registry = Arc::new(SessionRegistry::new(collaborators(&config)?));
    for satellite in &config.satellites {
        let name = satellite.name.clone().unwrap_or_else(|| satellite.id.clone());
        registry
            .pair(
                satellite.id.as_str().into(),
                name,
                satellite.keep_alive_target.clone(),
            )
            .await?;
    }

    #[allow(unused_mut)]
    let mut state = GatewayState::new(Arc::new(config), registry);

    #[cfg(feature = "metrics")]
    {
        state.prometheus = Some(satellite_gateway::metrics::install_prometheus_recorder()?);
    }

    tracing::info!("Starting voice satellite gateway on port {port}");
    satellite_gateway::start_gateway(Arc::new(state), port).await
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::default_path);

    let config = Config::load(&config_path)?;
    init_logging(config.logging.as_ref(), cli.verbose);

    // Every session transition runs on one event loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(cli.command, config, config_path))
}

async fn run(command: Commands, config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    match command {
        Commands::Gateway { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            run_gateway(config, port).await?;
        }
        Commands::Status => {
            let port = config.gateway_port();
            println!("voice-satellite v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {port}");
            println!("Configured satellites: {}", config.satellites.len());

            match reqwest::get(format!("http://127.0.0.1:{port}/health")).await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Status: running");
                    println!("Connections: {}", body["connections"]);
                    println!("Paired satellites: {}", body["satellites"]);
                }
                _ => println!("Status: not running"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at {key}"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Configuration OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}
