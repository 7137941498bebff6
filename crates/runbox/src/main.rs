use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info, warn};
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use runbox::api::{self, AppState};
use runbox::container::ContainerRuntime;
use runbox::exec::ExecutionController;
use runbox::languages::LanguageRegistry;
use runbox::reaper::Reaper;
use runbox::relay::RelayHub;
use runbox::sandbox::{ContainerProvisioner, Provisioner, ProvisionerConfig};
use runbox::session::SessionManager;
use runbox::settings::Settings;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let settings =
        Settings::load(cli.common.config.as_deref()).context("loading configuration")?;

    let runtime = tokio::runtime::Runtime::new().context("initializing async runtime")?;
    match cli.command {
        Command::Serve(cmd) => runtime.block_on(handle_serve(settings, cmd)),
        Command::Languages => handle_languages(&settings),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Runbox - sandboxed code execution server.",
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
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// List the configured languages
    Languages,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.quiet {
        LevelFilter::Error
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    // tracing for tower-http request spans, env_logger for log-crate users.
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("runbox={level},tower_http={level}")));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
        .try_init()
        .ok();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

async fn handle_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    info!("Starting runbox server...");

    let runtime = match settings.container.runtime {
        Some(rt) => ContainerRuntime::with_type(rt),
        None => ContainerRuntime::new(),
    };
    match runtime.health_check().await {
        Ok(_) => info!("Container runtime ({}) is available", runtime.runtime_type()),
        Err(e) => warn!(
            "Container runtime health check failed: {:?}. Sandbox operations may fail.",
            e
        ),
    }

    let registry = Arc::new(
        LanguageRegistry::builtin_with_overrides(&settings.languages)
            .context("building language registry")?,
    );
    info!("Supported languages: {}", registry.language_ids().join(", "));

    let provisioner: Arc<dyn Provisioner> = Arc::new(ContainerProvisioner::new(
        Arc::new(runtime),
        ProvisionerConfig {
            limits: settings.container.limits.clone(),
            compile_timeout: settings.sessions.compile_timeout(),
        },
    ));
    let sessions = Arc::new(SessionManager::new(provisioner.clone()));
    let relay = Arc::new(RelayHub::new());
    let controller = Arc::new(ExecutionController::new(
        registry.clone(),
        sessions.clone(),
        provisioner.clone(),
        relay.clone(),
    ));

    let reaper = Reaper::new(
        sessions.clone(),
        registry.clone(),
        provisioner,
        settings.sessions.idle_timeout(),
        settings.sessions.sweep_interval(),
    )
    .spawn();

    let state = AppState {
        registry,
        sessions: sessions.clone(),
        controller,
        relay,
    };
    let app = api::create_router(state, &settings.server.cors_origins);

    let host = cmd.host.unwrap_or(settings.server.host);
    let port = cmd.port.unwrap_or(settings.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
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

        info!("Shutdown signal received, tearing down sessions...");
        reaper.abort();
        sessions.end_all().await;
        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

fn handle_languages(settings: &Settings) -> Result<()> {
    let registry = LanguageRegistry::builtin_with_overrides(&settings.languages)
        .context("building language registry")?;
    for id in registry.language_ids() {
        let Some(config) = registry.resolve(id) else {
            continue;
        };
        println!(
            "{:<12} {:<24} timeout {}s{}",
            id,
            config.runtime_image,
            config.execution_timeout.as_secs(),
            if config.compile_command.is_some() {
                " (compiled)"
            } else {
                ""
            }
        );
    }
    Ok(())
}
