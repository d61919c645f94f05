use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ash::agent::{AgentRepository, AgentService};
use ash::api::{AppState, create_router};
use ash::bridge::ResourceLimits;
use ash::db::Database;
use ash::runner::{
    Coordinator, HeartbeatConfig, LocalBackend, RunnerBackend, RunnerIdentity, RunnerRepository,
    spawn_heartbeat,
};
use ash::sandbox::{PoolConfig, SandboxPool, SandboxRepository};
use ash::session::{SessionRepository, SessionService};
use ash::settings::{Mode, Settings};
use ash::storage::{SnapshotUrl, store_for_url};
use ash::workspace::WorkspaceStore;

const APP_NAME: &str = "ash";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    match cli.command {
        Command::Serve => async_serve(resolve_config_path(&cli.common)),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn async_serve(config_path: Option<PathBuf>) -> Result<()> {
    let settings = Settings::load(config_path.as_deref())?;
    serve(settings).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Ash - session host for long-running AI agents.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server
    Serve,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(opts: &CommonOpts) -> Result<()> {
    let default_directive = if opts.quiet {
        "error"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={default_directive},warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn resolve_config_path(opts: &CommonOpts) -> Option<PathBuf> {
    if let Some(path) = &opts.config {
        return Some(path.clone());
    }
    let default = dirs::config_dir()?.join(APP_NAME).join("config.toml");
    default.is_file().then_some(default)
}

async fn serve(settings: Settings) -> Result<()> {
    let db = match &settings.database_url {
        Some(url) => Database::from_url(url).await?,
        None => Database::new(&settings.database_path()).await?,
    };

    let (object_store, snapshot_url) = match &settings.snapshot_url {
        Some(url) => {
            let parsed = SnapshotUrl::parse(url).context("parsing SNAPSHOT_URL")?;
            let store = store_for_url(&parsed).context("building snapshot store")?;
            info!(scheme = %parsed.scheme, bucket = %parsed.bucket, "snapshot mirror enabled");
            (Some(store), Some(parsed))
        }
        None => (None, None),
    };
    let workspace = WorkspaceStore::new(&settings.data_dir, object_store, snapshot_url);

    let sandbox_repo = SandboxRepository::new(db.pool().clone());
    let pool = Arc::new(SandboxPool::new(
        sandbox_repo.clone(),
        workspace.clone(),
        PoolConfig {
            max_capacity: settings.max_sandboxes,
            idle_timeout: settings.idle_timeout(),
            cold_ttl: settings.cold_cleanup_ttl(),
            bridge_argv: settings.bridge_argv(),
            ready_timeout: settings.bridge_ready_timeout(),
            limits: ResourceLimits::default(),
            data_dir: settings.data_dir.clone(),
        },
    ));
    pool.recover().await.context("pool restart recovery")?;

    let agents = AgentService::new(AgentRepository::new(db.pool().clone()));
    let local: Arc<dyn RunnerBackend> = Arc::new(LocalBackend::new(
        Arc::clone(&pool),
        workspace.clone(),
        agents.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        RunnerRepository::new(db.pool().clone()),
        settings.mode,
        Arc::clone(&local),
        settings.liveness_timeout(),
        settings.internal_secret.clone(),
    ));
    let sessions = Arc::new(SessionService::new(
        SessionRepository::new(db.pool().clone()),
        sandbox_repo,
        agents.clone(),
        Arc::clone(&pool),
        workspace,
        Arc::clone(&coordinator),
        settings.sse_write_timeout(),
    ));
    pool.set_evict_hook(Arc::clone(&sessions) as Arc<dyn ash::sandbox::EvictHook>);

    let cancel = CancellationToken::new();
    pool.spawn_sweeps(cancel.clone());
    if settings.mode == Mode::Coordinator {
        coordinator.spawn_sweep(cancel.clone());
    }
    if let Some(coordinator_url) = &settings.coordinator_url {
        spawn_heartbeat(
            Arc::clone(&pool),
            HeartbeatConfig {
                coordinator_url: coordinator_url.clone(),
                identity: RunnerIdentity {
                    id: settings.runner_id.clone(),
                    host: settings.advertised_host().to_string(),
                    port: settings.port,
                    max_sandboxes: settings.max_sandboxes,
                },
                interval: settings.heartbeat_interval(),
                internal_secret: settings.internal_secret.clone(),
            },
            cancel.clone(),
        );
    }

    let state = AppState {
        sessions,
        agents: Arc::new(agents),
        pool,
        coordinator,
        local,
        internal_secret: settings.internal_secret.clone(),
        sse_write_timeout: settings.sse_write_timeout(),
    };
    let router = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("parsing bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, mode = ?settings.mode, "ash listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = ?e, "shutdown signal listener failed");
    }
    info!("shutting down");
    cancel.cancel();
}
