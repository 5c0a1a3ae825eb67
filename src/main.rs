//! psched - recurring measurement jobs for a probe fleet.
//!
//! Usage:
//!   psched serve [--config FILE]      Run the scheduler and HTTP API
//!   psched schedule <EXPR> [-n N]     Print the first N fire times of a schedule
//!   psched validate <CONFIG>          Validate a configuration file

use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use probe_scheduler::{
    ApiConfig, Clock, ConfigLoader, EventBus, InMemoryStorage, ProbeRecord, ScheduleSpec,
    Scheduler, ServiceConfig, SqliteStorage, Storage, StorageConfig, SystemClock, TaskLifecycle,
    TracingHandler, create_api_state, start_server,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// psched - recurring measurement jobs for a probe fleet
#[derive(Parser)]
#[command(name = "psched")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP API
    Serve {
        /// Path to the YAML configuration file (defaults apply when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Override the listen host
        #[arg(long)]
        host: Option<String>,

        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the upcoming fire times of a schedule expression
    Schedule {
        /// Schedule expression, e.g. `now/PT1H/3`
        #[arg(value_name = "EXPR")]
        expression: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// Delay in seconds added to every firing
        #[arg(short, long, default_value = "0")]
        delay: i64,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = ConfigLoader::load_or_default(config.as_deref())?;
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            run_service(config).await?;
        }
        Commands::Schedule {
            expression,
            count,
            delay,
        } => {
            print_schedule(&expression, count, delay)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
    }

    Ok(())
}

/// Open the configured storage backend and run the service on it.
async fn run_service(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage (jobs are lost on exit)");
            serve(Arc::new(InMemoryStorage::new()), &config).await
        }
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let storage = SqliteStorage::new(path).await?;
            serve(Arc::new(storage), &config).await
        }
    }
}

async fn serve<S: Storage + 'static>(
    storage: Arc<S>,
    config: &ServiceConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    for probe in &config.probes {
        storage
            .register_probe(ProbeRecord::new(
                probe.id.as_str(),
                &probe.country,
                &probe.platform,
                clock.now(),
            ))
            .await?;
    }
    if !config.probes.is_empty() {
        info!("Registered {} probe(s) from configuration", config.probes.len());
    }

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(TracingHandler)).await;

    let scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_clock(Arc::clone(&clock))
        .with_event_bus(Arc::clone(&event_bus))
        .with_shutdown_timeout(config.shutdown_timeout());

    let (handle, scheduler_task) = scheduler.start().await?;
    let lifecycle = TaskLifecycle::new(storage, clock, event_bus);

    let state = create_api_state(handle.clone(), lifecycle);
    let (_, server_task) = start_server(ApiConfig::from(&config.api), state).await?;

    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            server_task.abort();
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
            server_task.abort();
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// Print the first fire times of a schedule.
fn print_schedule(
    expression: &str,
    count: usize,
    delay: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = ScheduleSpec::parse(expression, &SystemClock)?;
    let delay = TimeDelta::try_seconds(delay).ok_or("delay out of range")?;

    println!("Schedule: {}", spec);
    println!("Repeats: {}", spec.repeat_count());
    println!();

    let times = spec.upcoming(delay, count);
    if times.is_empty() {
        println!("No firings.");
    }
    for (i, at) in times.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, at.to_rfc3339());
    }

    Ok(())
}

/// Validate a configuration file without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match ConfigLoader::load(&path) {
        Ok(config) => {
            let storage = match &config.storage {
                StorageConfig::Memory => "memory".to_string(),
                StorageConfig::Sqlite { path } => format!("sqlite ({})", path),
            };
            info!("Configuration is valid:");
            info!("  storage: {}", storage);
            info!("  api: {}:{}", config.api.host, config.api.port);
            info!("  shutdown timeout: {}s", config.shutdown_timeout_secs);
            info!("  seed probes: {}", config.probes.len());
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}
