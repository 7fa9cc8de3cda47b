//! Binary entry point: settings, server startup per AUDIO_MODE, and
//! graceful shutdown.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voxbridge::media::{self, MediaServerState};
use voxbridge::services::Services;
use voxbridge::session::manager::SessionManager;
use voxbridge::store::MemoryStore;
use voxbridge::{esl, Settings};

#[derive(Parser, Debug)]
#[command(name = "voxbridge", about = "Realtime voice-AI bridge for FreeSWITCH")]
struct Args {
    /// Media WebSocket bind host (overrides REALTIME_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Media WebSocket port (overrides REALTIME_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Audio mode: websocket, rtp, esl or dual (overrides AUDIO_MODE).
    #[arg(long)]
    mode: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(host) = args.host {
        settings.realtime_host = host;
    }
    if let Some(port) = args.port {
        settings.realtime_port = port;
    }
    if let Some(mode) = args.mode {
        match mode.parse() {
            Ok(mode) => settings.audio_mode = mode,
            Err(e) => {
                tracing::error!(error = %e, "invalid --mode");
                return ExitCode::FAILURE;
            }
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    tracing::info!(
        mode = %settings.audio_mode,
        ws = format!("{}:{}", settings.realtime_host, settings.realtime_port),
        esl_server = format!("{}:{}", settings.esl_server_host, settings.esl_server_port),
        "voxbridge starting"
    );

    // The relational config/history backends are external; the process
    // boots against the in-memory store and the deployment wires real
    // implementations of the same traits.
    let store = Arc::new(MemoryStore::new());
    let services = Services::new(settings.clone(), store.clone(), store)?;
    let manager = SessionManager::new(Arc::clone(&services));

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let mut tasks = Vec::new();

    if settings.audio_mode.uses_websocket() {
        let listener = tokio::net::TcpListener::bind(format!(
            "{}:{}",
            settings.realtime_host, settings.realtime_port
        ))
        .await?;
        let state = MediaServerState {
            manager: Arc::clone(&manager),
            services: Arc::clone(&services),
        };
        let notify = Arc::clone(&shutdown);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = media::serve(listener, state, async move {
                notify.notified().await;
            })
            .await
            {
                tracing::error!(error = %e, "media server failed");
            }
        }));
    }

    if settings.audio_mode.uses_esl_server() {
        let listener = tokio::net::TcpListener::bind(format!(
            "{}:{}",
            settings.esl_server_host, settings.esl_server_port
        ))
        .await?;
        let relay_manager = Arc::clone(&manager);
        let relay_services = Arc::clone(&services);
        let notify = Arc::clone(&shutdown);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = esl::relay::serve(listener, relay_manager, relay_services, async move {
                notify.notified().await;
            })
            .await
            {
                tracing::error!(error = %e, "esl outbound server failed");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    // Stop accepting, then drain every live session.
    shutdown.notify_waiters();
    let stopped = manager.stop_all("shutdown").await;
    tracing::info!(stopped, "sessions stopped");

    services.esl_client.disconnect().await;
    for task in tasks {
        task.abort();
    }
    tracing::info!("voxbridge stopped");
    Ok(())
}
