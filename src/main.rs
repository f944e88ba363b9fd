use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use s0d::channel::Registry;
use s0d::config::Config;
use s0d::engine::Engine;
use s0d::gpio::SysfsSource;
use s0d::pidfile::PidLock;

/// S0/impulse pulse collector daemon for volkszaehler middleware.
#[derive(Parser)]
#[command(name = "s0d", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// PID lock file, overriding the config value.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!("{} ({}/{})", RELEASE, target_os(), target_arch())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("s0d {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main daemon run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let pid_file = cli.pid_file.unwrap_or_else(|| cfg.pid_file.clone());

    info!(
        version = version::RELEASE,
        server = %cfg.server.host,
        port = cfg.server.port,
        "starting s0d",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, pid_file).await })
}

async fn run(cfg: Config, pid_file: PathBuf) -> Result<()> {
    // Single-instance guard, released on every exit path below.
    let _pid_lock = PidLock::acquire(&pid_file)?;

    let registry = Registry::from_config(&cfg);

    let source = SysfsSource::open(&registry)?;
    info!(
        configured = registry.len(),
        active = source.active(),
        "opened GPIO inputs",
    );

    // Set up signal handling.
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .expect("failed to register SIGHUP handler");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT, shutting down");
                        break;
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down");
                        break;
                    }
                    _ = sighup.recv() => {
                        warn!("received SIGHUP, ignoring");
                    }
                }
            }

            cancel.cancel();
        });
    }

    // Start edge capture and run the engine until shutdown.
    let edges = source.start(cancel.child_token());
    let engine = Engine::new(&cfg, registry, edges, cancel.child_token())?;

    engine.run().await?;

    info!("s0d stopped");

    Ok(())
}
