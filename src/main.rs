//! Comet - Real-time WebSocket message gateway
//!
//! Usage:
//!   comet [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:8080)
//!   --cache-max <N>        Topic match cache size (default: 1024)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use comet::config::Config;
use comet::gateway::Gateway;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Comet - Real-time WebSocket message gateway
#[derive(Parser, Debug)]
#[command(name = "comet")]
#[command(author = "Comet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Real-time WebSocket message gateway")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Topic match cache size
    #[arg(long)]
    cache_max: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Without a file, defaults plus COMET__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(cache_max) = args.cache_max {
        config.topic.cache_max = cache_max;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    // RUST_LOG, when set, takes precedence for per-module filtering
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_tracing_level().as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting Comet gateway");
    info!("  Bind address: {}", config.server.bind);
    info!("  Client path: {}", config.server.client_path);
    info!("  Worker path: {}", config.server.worker_path);
    info!("  Max connections: {}", config.server.max_connections);
    info!("  Topic cache: {} entries", config.topic.cache_max);
    info!(
        "  Session: read_timeout={:?}, write_timeout={:?}, ping_interval={:?}",
        config.session.read_timeout, config.session.write_timeout, config.session.ping_interval
    );
    info!("  Services: {} configured", config.services.len());
    for service in &config.services {
        let auth = if service.tokens.is_empty() {
            "open".to_string()
        } else {
            format!("{} tokens", service.tokens.len())
        };
        info!("    - {} (queue={}, auth={})", service.name, service.queue, auth);
    }

    let gateway = Arc::new(Gateway::from_config(&config));

    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down");
                    gateway.shutdown();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    gateway.run().await?;

    Ok(())
}
