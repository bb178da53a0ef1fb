//! nmid-registry - Service Discovery Registry node
//!
//! Resolves configuration, sets up logging, bootstraps the cluster
//! coordination layer and serves the administrative API until a signal
//! arrives.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::{EnvFilter, LevelFilter, Targets};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use nmid_registry::api::HttpServer;
use nmid_registry::cluster::Cluster;
use nmid_registry::config::{ConfigOverrides, RegistryConfig};
use nmid_registry::error::{Error, Result};
use nmid_registry::store::backend_for;

/// Target of the lease manager's events, mirrored into lease.log
const LEASE_LOG_TARGET: &str = "nmid_registry::cluster::lease";

/// nmid-registry - Service Discovery Registry
#[derive(Parser)]
#[command(name = "nmid-registry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry node
    Start(StartArgs),

    /// Validate configuration
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "nmid-registry.toml")]
        output: PathBuf,

        /// Member name
        #[arg(long, default_value = "registry-1")]
        name: String,
    },
}

#[derive(Args, Default)]
struct StartArgs {
    /// Member name
    #[arg(long)]
    name: Option<String>,

    /// Cluster name
    #[arg(long)]
    cluster_name: Option<String>,

    /// Cluster role (host or client)
    #[arg(long)]
    role: Option<String>,

    /// Store request timeout, e.g. "10s"
    #[arg(long)]
    request_timeout: Option<String>,

    /// Home directory
    #[arg(long)]
    home_dir: Option<PathBuf>,

    /// API bind address
    #[arg(long)]
    api_addr: Option<String>,

    /// Store backend (etcd or memory)
    #[arg(long)]
    backend: Option<String>,

    /// Store client endpoint, repeatable
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Peer URL of a cluster to join, repeatable
    #[arg(long = "join")]
    join_urls: Vec<String>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

impl StartArgs {
    fn overrides(self) -> Result<ConfigOverrides> {
        Ok(ConfigOverrides {
            name: self.name,
            cluster_name: self.cluster_name,
            role: self.role.map(|r| r.parse()).transpose()?,
            request_timeout: self.request_timeout,
            home_dir: self.home_dir,
            api_address: self.api_addr,
            backend: self.backend.map(|b| b.parse()).transpose()?,
            endpoints: self.endpoints,
            join_urls: self.join_urls,
            debug: self.debug,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(cli.config.as_deref(), args).await,
        Commands::Validate => run_validate(cli.config.as_deref()),
        Commands::Init { output, name } => run_init(output, name),
    }
}

fn resolve_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<RegistryConfig> {
    let env: HashMap<String, String> = std::env::vars().collect();
    RegistryConfig::resolve(path, &env, overrides)
}

/// Initialize logging: stdout plus the dedicated lease log
fn init_logging(config: &RegistryConfig) -> Result<()> {
    let level = if config.cluster.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    let stdout = match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt::layer().json().boxed(),
        _ => tracing_subscriber::fmt::layer().boxed(),
    };

    let lease_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.lease_log_file())?;
    let lease_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(lease_file))
        .with_filter(Targets::new().with_target(LEASE_LOG_TARGET, LevelFilter::TRACE));

    let file_log = match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(lease_log)
        .with(file_log)
        .init();
    Ok(())
}

/// First SIGINT/SIGTERM cancels `shutdown`, a second one exits at once
async fn handle_signals(shutdown: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = interrupt.recv() => tracing::info!("received SIGINT, shutting down"),
    }
    shutdown.cancel();

    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
    tracing::warn!("received second signal, exiting immediately");
    std::process::exit(255);
}

/// Start the registry node
async fn run_start(config_path: Option<&Path>, args: StartArgs) -> Result<()> {
    let overrides = args.overrides()?;
    let config = match resolve_config(config_path, &overrides) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    config.create_dirs()?;
    init_logging(&config)?;

    let config = Arc::new(config);
    tracing::info!(
        "Starting nmid-registry member {} ({}) of cluster {}",
        config.name(),
        config.cluster.role,
        config.cluster.name
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = handle_signals(shutdown).await {
                tracing::error!("signal handler failed: {}", e);
            }
        }
    });

    let cluster = Cluster::new(Arc::clone(&config), backend_for(&config))?;

    let api = HttpServer::new(config.api.clone(), Arc::clone(&cluster));
    let api_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = api.start(shutdown).await {
                tracing::error!("HTTP API failed: {}", e);
            }
        }
    });

    let bootstrap = tokio::select! {
        res = cluster.run() => res,
        _ = shutdown.cancelled() => Err(Error::ShuttingDown),
    };
    let outcome = match bootstrap {
        Ok(()) => {
            tracing::info!("member {} is ready", config.name());
            shutdown.cancelled().await;
            Ok(())
        }
        Err(Error::ShuttingDown) => Ok(()),
        Err(e) => {
            tracing::error!("cluster bootstrap failed: {}", e);
            shutdown.cancel();
            Err(e)
        }
    };

    cluster.close().await;
    if let Err(e) = api_task.await {
        tracing::warn!("HTTP API task ended abnormally: {}", e);
    }
    tracing::info!("member {} stopped", config.name());
    outcome
}

/// Validate configuration
fn run_validate(config_path: Option<&Path>) -> Result<()> {
    match resolve_config(config_path, &ConfigOverrides::default()) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Member:           {}", config.name());
            println!("  Cluster:          {}", config.cluster.name);
            println!("  Role:             {}", config.cluster.role);
            println!("  Request Timeout:  {}", config.cluster.request_timeout);
            println!("  Store Endpoints:  {}", config.static_endpoints().join(","));
            if config.uses_initial_cluster() {
                println!("  Initial Cluster:  {}", config.initial_cluster_string());
            }
            println!("  Data Directory:   {}", config.node.data_dir.display());
            println!("  API:              {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    let config_content = format!(
        r#"# nmid-registry Configuration
# Generated configuration file

[node]
name = "{name}"
home_dir = "/var/lib/nmid-registry/{name}"
data_dir = "data"
log_dir = "log"
member_dir = "member"

[cluster]
name = "nmid-cluster-default-name"
# host runs a store instance, client only connects to one
role = "host"
request_timeout = "10s"
heartbeat_interval_ms = 5000
listen_client_urls = ["http://localhost:2379"]
advertise_client_urls = ["http://localhost:2379"]
listen_peer_urls = ["http://localhost:2380"]
initial_advertise_peer_urls = ["http://localhost:2380"]
# join_urls = ["http://registry-0.example.com:2380"]
# endpoints = ["http://registry-0.example.com:2379"]

# [cluster.initial_cluster]
# registry-0 = "http://registry-0.example.com:2380"
# registry-1 = "http://registry-1.example.com:2380"

[store]
backend = "etcd"
etcd_binary = "etcd"
startup_timeout_secs = 600

[api]
enabled = true
bind_address = "localhost:2381"
write_only = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Created configuration file: {:?}", output);
    println!("\nEdit the file to configure your cluster, then run:");
    println!("  nmid-registry --config {:?} start", output);

    Ok(())
}
