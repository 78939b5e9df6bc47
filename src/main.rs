use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use basaa_omni::api;
use basaa_omni::core::{AppConfig, AppState, ServerConfig, APP_VERSION, SERVICE_NAME};

fn setup_logging() {
    let filter = std::env::var("OMNI_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let config = AppConfig::from_env();
    info!("Starting {SERVICE_NAME} {APP_VERSION}");
    info!(
        "Persistent root: {} (dataset {})",
        config.persist_dir().display(),
        config.dataset
    );

    let state = AppState::new(config);
    if !state.chat.is_configured() {
        warn!("No chat backend configured; /chat/qwen will answer 503");
    }

    let app = api::create_router(state.clone());

    let server = ServerConfig::from_env();
    let addr = server.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }

    let running = state.jobs.running_jobs();
    if !running.is_empty() {
        warn!("Abandoning running jobs: {}", running.join(", "));
    }
}
