//! TrellisMQ - MQTT broker core
//!
//! Usage:
//!   trellismq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -d, --data-dir <DIR>   Persistence directory (fjall backend)
//!   --max-qos <N>          Maximum QoS level (0, 1, or 2)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Starts the core (storage, retained cache, trie maintenance) and runs
//! until Ctrl+C. Transports attach through the library API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use trellismq::broker::{Broker, BrokerConfig};
use trellismq::config::{BackendType, Config};
use trellismq::persistence::{FjallBackend, MemoryBackend, PersistenceManager, StorageBackend};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
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
}

/// TrellisMQ - MQTT broker core
#[derive(Parser, Debug)]
#[command(name = "trellismq")]
#[command(author = "TrellisMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "MQTT broker core with durable QoS delivery")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persistence directory for the fjall backend
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise env overrides and defaults
    let loaded = match &args.config {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(dir) = args.data_dir {
        file_config.persistence.path = dir;
    }
    if let Some(max_qos) = args.max_qos {
        file_config.mqtt.max_qos = max_qos;
    }
    if let Err(e) = file_config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let backend: Arc<dyn StorageBackend> = match file_config.persistence.effective_backend() {
        BackendType::Fjall => Arc::new(FjallBackend::open(&file_config.persistence.path)?),
        BackendType::Memory => Arc::new(MemoryBackend::new()),
    };
    let persistence = Arc::new(PersistenceManager::new(
        backend,
        file_config.persistence.flush_interval,
        file_config.persistence.max_batch_size,
    ));

    let broker_config = BrokerConfig::from(&file_config);

    info!("Starting TrellisMQ broker core");
    info!("  Service id: {}", broker_config.service_id);
    match file_config.persistence.effective_backend() {
        BackendType::Fjall => info!("  Persistence: fjall ({:?})", file_config.persistence.path),
        BackendType::Memory => info!("  Persistence: memory"),
    }
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!("  Max in-flight per client: {}", broker_config.session.max_inflight);
    info!("  Retry interval: {:?}", broker_config.session.retry_interval);
    info!("  Shared strategy: {:?}", broker_config.shared_strategy);
    info!("  Trie compaction every {:?}", broker_config.compaction_interval);

    let broker = Arc::new(Broker::builder(broker_config).persistence(persistence).build());
    broker.start().await?;
    info!("  Retained messages: {}", broker.retained_count());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    broker.shutdown().await;

    Ok(())
}
