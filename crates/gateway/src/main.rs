use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fg_devices::adb;
use fg_devices::reaper::ZombieReaper;
use fg_devices::scanner::PortScanner;
use fg_devices::{DeviceRegistry, PortAllocator};
use fg_domain::config::{mask_secret, Config, ConfigSeverity};
use fg_gateway::events::EventBus;
use fg_gateway::rendezvous::AnswerWaiters;
use fg_gateway::scheduler::Scheduler;
use fg_gateway::state::AppState;
use fg_gateway::store::TaskStore;
use fg_gateway::ws::DeviceSockets;
use fg_providers::OpenAiCompatProvider;
use fg_screenshots::ScreenshotStore;

#[derive(Parser)]
#[command(name = "fleetgate", about = "Remote-device fleet control plane")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "fleetgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control-plane server (default).
    Serve,
    /// Validate the configuration and exit.
    ConfigValidate,
    /// Print the effective configuration (secrets masked).
    ConfigShow,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::ConfigValidate) => {
            let config = Config::load(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::ConfigShow) => {
            let config = Config::load(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!(
                "# llm.api_key = {}",
                if config.llm.api_key.is_empty() {
                    "<unset>".to_owned()
                } else {
                    mask_secret(&config.llm.api_key)
                }
            );
            Ok(())
        }
        Some(Command::Version) => {
            println!("fleetgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the server process.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fg_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fleetgate starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }

    // ── Core services ────────────────────────────────────────────────
    let store = Arc::new(
        TaskStore::open(&config.storage.data_dir.join("fleetgate.db"))
            .context("open task store")?,
    );
    let screenshots = Arc::new(
        ScreenshotStore::new(&config.storage.screenshots_dir).context("open screenshot store")?,
    );
    let registry = Arc::new(DeviceRegistry::new(config.tasks.heartbeat_interval_secs));
    let allocator = Arc::new(PortAllocator::new());
    let events = Arc::new(EventBus::new());
    let waiters = Arc::new(AnswerWaiters::new());
    let sockets = Arc::new(DeviceSockets::new());

    let provider =
        Arc::new(OpenAiCompatProvider::from_config(&config.llm).context("build LLM provider")?);

    let scheduler = Scheduler::new(
        config.clone(),
        store.clone(),
        registry.clone(),
        screenshots.clone(),
        provider,
        waiters,
        events.clone(),
    );

    // ── Startup cleanup ──────────────────────────────────────────────
    // Drop stale ADB attachments from a previous run, then start from an
    // empty allocation table; the scanner rebuilds it within one sweep.
    adb::disconnect_range(config.ports.phone_start..=config.ports.phone_end).await;
    allocator.clear_all();

    // ── Background loops ─────────────────────────────────────────────
    let scanner = Arc::new(PortScanner::new(
        config.ports.clone(),
        registry.clone(),
        allocator.clone(),
    ));
    scanner.spawn();

    let reaper = Arc::new(ZombieReaper::new(
        config.ports.clone(),
        registry.clone(),
        allocator.clone(),
    ));
    reaper.spawn();

    // Staleness backstop: the per-connection ping loop enforces the pong
    // deadline; this sweep catches sockets that died without a close frame.
    registry.spawn_health_loop(Duration::from_secs(
        config.tasks.heartbeat_interval_secs.max(1),
    ));
    {
        // Stale-binding sweep: ports idle for an hour go back to the pool.
        let allocator = allocator.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(600)).await;
                allocator.sweep_stale(chrono::Duration::hours(1));
            }
        });
    }

    // ── HTTP + WebSocket surface ─────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        store,
        registry,
        allocator,
        screenshots,
        scheduler,
        events,
        sockets,
    };
    let app = fg_gateway::api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await.context("server")?;
    Ok(())
}
