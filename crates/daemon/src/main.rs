//! webterm daemon
//!
//! Serves interactive shell sessions over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use webterm_daemon::config::{default_config_path, Config};
use webterm_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};

/// webterm daemon - interactive shell sessions over HTTP.
#[derive(Parser, Debug)]
#[command(name = "webterm-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving terminal sessions
    Start {
        /// Port to listen on (overrides config and environment)
        #[arg(long, short)]
        port: Option<u16>,

        /// Address to bind to (overrides config)
        #[arg(long, short)]
        bind: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start { port, bind } => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!("webterm daemon starting...");
            tracing::debug!("Using config file: {:?}", config_path);

            config.validate()?;
            run_daemon(config).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            let mut config = Config::load(&config_path)?;
            config.apply_env_overrides();
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Initializes logging to stderr, plus daily log files when `log_dir` is set.
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// must be held for as long as file logging should keep flushing.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "webterm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

/// Runs the daemon until SIGTERM or SIGINT.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(DaemonOrchestrator::new(config)?);
    let listener = orchestrator.bind().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening(addr) => {
                    tracing::info!("Accepting terminal sessions on http://{}", addr);
                }
                OrchestratorEvent::SessionsTerminated(count) => {
                    tracing::info!("Terminated {} session(s) on shutdown", count);
                }
            }
        }
    });

    let stopper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "Signal handling failed, shutting down"),
        }
        if let Err(e) = stopper.stop().await {
            tracing::warn!(error = %e, "Failed to stop orchestrator");
        }
    });

    orchestrator.run(listener).await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
