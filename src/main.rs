//! Lodestar CLI: control-plane and runner entry points.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info, LevelFilter};
use tokio::net::TcpListener;

use lodestar::control::{create_router, AppState, Controller};
use lodestar::runner::RunnerHost;
use lodestar::settings::Settings;
use lodestar::store::{Database, SqliteSessionStore};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    cli.common.init_logging()?;

    let settings = Settings::load(cli.common.config.as_deref())
        .context("loading configuration")?;
    debug!("resolved settings: {:#?}", settings);

    match cli.command {
        Command::Control(cmd) => run_control(settings, cmd),
        Command::Runner(cmd) => run_runner(settings, cmd),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Lodestar - inference-runner control plane for LLM serving.",
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
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

impl CommonOpts {
    fn effective_log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Off;
        }
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        if self.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("lodestar={level},tower_http={level}")));

        if self.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .ok();
        }

        Ok(())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler-side control plane
    Control(ControlCommand),
    /// Run a runner host supervising local inference servers
    Runner(RunnerCommand),
}

#[derive(Debug, Args)]
struct ControlCommand {
    /// Override the listen address
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
}

#[derive(Debug, Args)]
struct RunnerCommand {
    /// Override the control-plane URL
    #[arg(long, value_name = "URL")]
    control_url: Option<String>,
    /// Model to host (repeatable; overrides configured models)
    #[arg(long = "model", value_name = "NAME")]
    models: Vec<String>,
}

#[tokio::main]
async fn run_control(settings: Settings, cmd: ControlCommand) -> Result<()> {
    let bind_addr = cmd.bind.unwrap_or(settings.control.bind_addr);

    let db = Database::new(&settings.control.database_path)
        .await
        .context("opening session database")?;
    let store = Arc::new(SqliteSessionStore::new(&db));

    let controller = Arc::new(Controller::new(store));
    // Recovery must finish before the listener accepts work polls.
    controller.start().await?;

    let router = create_router(AppState {
        controller: controller.clone(),
    });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("control plane listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving control plane")?;

    Ok(())
}

#[tokio::main]
async fn run_runner(settings: Settings, cmd: RunnerCommand) -> Result<()> {
    let mut config = settings.runner.runner_config();
    if let Some(control_url) = cmd.control_url {
        config.control_url = control_url;
    }
    if !cmd.models.is_empty() {
        config.models = cmd.models;
    }
    if config.models.is_empty() {
        anyhow::bail!("no models configured; pass --model or set runner.models");
    }

    let host = RunnerHost::start(config).await?;
    info!("runner host started with {} instances", host.instances().len());

    shutdown_signal().await;
    info!("shutting down runner host");
    host.shutdown();
    host.wait_finished().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
