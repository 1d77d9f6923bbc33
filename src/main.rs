//! Mirror Coordinator
//!
//! Command line entry point. `validate` checks a configuration file;
//! `demo` runs a full enable, failover, failback and delete cycle against
//! two in-memory arrays built from the configuration.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mirror_coordinator::{
    ArrayConfig, ArrayGateway, ArrayVariant, ErrorAction, InMemoryArray, InMemoryLeaseManager,
    PortPair, ReplicationConfig, ReplicationCoordinator, Volume,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Mirror Coordinator - remote-mirror replication between two storage arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Replication configuration (YAML)
    #[arg(long, env = "MIRROR_CONFIG", default_value = "replication.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate the configuration, then print it
    Validate,

    /// Run a replication cycle against simulated arrays
    Demo {
        /// Number of volumes to mirror
        #[arg(long, default_value = "3")]
        volumes: usize,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Mirror Coordinator");
    info!("  Version: {}", mirror_coordinator::VERSION);
    info!("  Config: {}", args.config.display());

    let config = ReplicationConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    match args.command {
        Command::Validate => {
            info!(
                primary = %config.primary.backend_id,
                secondary = %config.secondary.backend_id,
                "Configuration is valid"
            );
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Demo { volumes } => run_demo(config, volumes).await?,
    }

    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Demo
// =============================================================================

/// Build a simulated array with one pool and two containers of the
/// configured volume type
fn simulated_array(config: &ArrayConfig, pool: &str, containers: [&str; 2]) -> Arc<InMemoryArray> {
    let array = Arc::new(InMemoryArray::new(config.identity()));
    let volume_type = config.connection_type.variant(&config.device_mapping).volume_type();
    array.add_pool(pool, volume_type, 10_000);
    for container in containers {
        array.add_container(container, pool, 0);
    }
    array
}

async fn run_demo(config: ReplicationConfig, count: usize) -> anyhow::Result<()> {
    let primary = simulated_array(&config.primary, "P0", ["00", "01"]);
    let secondary = simulated_array(&config.secondary, "P1", ["10", "11"]);

    let mut links = config.configured_port_pairs()?;
    if links.is_empty() {
        links = vec![PortPair::new("I0001", "I0101"), PortPair::new("I0002", "I0102")];
    }
    let reverse: Vec<PortPair> = links.iter().map(PortPair::reversed).collect();
    primary.add_links(&secondary.identity().storage_wwnn, &links);
    secondary.add_links(&primary.identity().storage_wwnn, &reverse);

    let secondary_id = config.secondary.backend_id.clone();
    let leases = Arc::new(InMemoryLeaseManager::new(config.leases.wait()));
    let coordinator =
        ReplicationCoordinator::new(config, primary.clone(), secondary.clone(), leases)?;
    coordinator
        .initialize()
        .await
        .context("coordinator initialization failed")?;

    let mut volumes = Vec::with_capacity(count);
    for i in 0..count {
        let volume_type = coordinator.session().primary().variant.volume_type();
        let mut volume = Volume::new(format!("demo-{}", i), 10, volume_type);
        if let Err(e) = coordinator.create_replicated_volume(&mut volume).await {
            match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    warn!(volume = %volume.id, error = %e, "Mirroring failed, retrying once");
                    coordinator.create_replicated_volume(&mut volume).await?;
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!(volume = %volume.id, error = %e, ?delay, "Mirroring deferred, skipping volume");
                    continue;
                }
                ErrorAction::NoRequeue => {
                    return Err(e).context(format!("mirroring {} needs intervention", volume.id));
                }
            }
        }
        info!(
            volume = %volume.id,
            device = ?volume.device_id,
            status = %volume.replication_status,
            "Volume mirrored"
        );
        volumes.push(volume);
    }

    coordinator.failover_host(&mut volumes, &secondary_id).await?;
    info!(primary = %coordinator.session().primary().name(), "Failed over");

    coordinator.failback(&mut volumes, &secondary_id).await?;
    info!(primary = %coordinator.session().primary().name(), "Failed back");

    for volume in volumes.iter_mut() {
        if let Err(e) = coordinator.delete_replica(volume).await {
            warn!(volume = %volume.id, error = %e, action = ?e.action(), "Replica teardown failed");
            if e.is_retryable() {
                coordinator.delete_replica(volume).await?;
            }
        }
    }

    info!(
        primary_volumes = primary.volume_total(),
        secondary_volumes = secondary.volume_total(),
        pairs = primary.pair_count(),
        "Demo complete"
    );
    Ok(())
}
