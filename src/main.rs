//! inspection-sync: local sync daemon and operator CLI
//!
//! `run` starts the sync service and its loopback control API. The other
//! subcommands open the same store, do one thing and exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use inspection_sync::api::create_router;
use inspection_sync::config::Config;
use inspection_sync::evidence::CaptureMetadata;
use inspection_sync::remote::http::HttpRemote;
use inspection_sync::remote::{ReachabilityProbe, Remote};
use inspection_sync::sync::MutationId;
use inspection_sync::SyncService;

#[derive(Parser)]
#[command(name = "inspection-sync")]
#[command(about = "Offline-first sync engine for field inspection audits")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "inspection-sync.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "INSPECTION_DATA_DIR")]
    data_dir: Option<String>,

    /// Base URL of the remote system of record
    #[arg(long, env = "INSPECTION_REMOTE_URL")]
    remote_url: Option<String>,

    /// API key sent to the remote
    #[arg(long, env = "INSPECTION_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Control API port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync service and control API (default)
    Run,
    /// Pull a project's remote state into the local mirror
    Hydrate { project_id: String },
    /// Drain the mutation queue once
    Sync,
    /// Show connectivity and queue counts
    Status,
    /// Inspect or resolve dead mutations
    Dead {
        #[command(subcommand)]
        action: DeadCommands,
    },
    /// Store a photo as evidence for an audit result
    Capture {
        #[arg(long)]
        result: String,
        #[arg(long)]
        project: String,
        file: PathBuf,
    },
    /// Write the effective configuration to a file
    InitConfig { path: PathBuf },
}

#[derive(Subcommand)]
enum DeadCommands {
    List,
    Retry { id: i64 },
    Discard { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("inspection_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        Config::load(&cli.config).with_context(|| format!("Failed to load {}", cli.config))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.store.data_dir = PathBuf::from(data_dir);
    }
    if let Some(remote_url) = cli.remote_url {
        config.remote.base_url = remote_url;
    }
    if let Some(api_key) = cli.api_key {
        config.remote.api_key = Some(api_key);
    }
    if let Some(port) = cli.port {
        config.api.http_port = port;
    }

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::InitConfig { path } = &command {
        config.save(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    info!("Data dir: {}", config.store.data_dir.display());
    info!("Remote: {}", config.remote.base_url);

    let http = Arc::new(HttpRemote::new(&config.remote, config.sync.request_timeout())?);
    let probe: Arc<dyn ReachabilityProbe> = http.clone();
    let service = SyncService::open(config.clone(), Remote::from_backend(http), Some(probe))?;

    match command {
        Commands::Run => run(service, config.api.http_port).await?,
        Commands::Hydrate { project_id } => {
            let stats = service.hydrate_project(&project_id).await?;
            print_json(&stats)?;
        }
        Commands::Sync => {
            let report = service.sync_now().await;
            print_json(&report)?;
        }
        Commands::Status => {
            service.sync_now().await;
            print_json(&serde_json::json!({
                "online": service.is_online(),
                "queue": service.queue_counts()?,
            }))?;
        }
        Commands::Dead { action } => match action {
            DeadCommands::List => print_json(&service.dead_mutations()?)?,
            DeadCommands::Retry { id } => print_json(&service.retry_dead(MutationId(id))?)?,
            DeadCommands::Discard { id } => print_json(&service.discard_dead(MutationId(id))?)?,
        },
        Commands::Capture { result, project, file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let evidence = service
                .capture(&result, bytes, CaptureMetadata::for_project(project))
                .await?;
            print_json(&evidence)?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

async fn run(service: Arc<SyncService>, port: u16) -> anyhow::Result<()> {
    service.init().await?;

    let app = create_router(service.clone());
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Control API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    service.dispose().await;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
