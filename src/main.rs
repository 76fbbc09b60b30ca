use clap::Parser;
use dotenvy::dotenv;
use rust_image_optimizer::config::OptimizerConfig;
use rust_image_optimizer::infrastructure::storage;
use rust_image_optimizer::{AppState, create_app};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rust-image-optimizer")]
#[command(about = "Resize and re-encode uploaded images", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on (falls back to $PORT, then 5000)
    #[arg(long)]
    port: Option<u16>,
}

const DEFAULT_PORT: u16 = 5000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_image_optimizer=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Rust Image Optimizer...");

    let config = OptimizerConfig::from_env();
    config.validate()?;
    info!(
        "🖼️  Optimizer Config: Max Size={}MB, Max Width={}px, Types={}, Transcode Slots={}",
        config.max_file_size / 1024 / 1024,
        config.max_width,
        config.allowed_mime_types.join(","),
        config.max_concurrent_transcodes
    );
    info!(
        "🧹 Cleanup: {} attempts, {:?} backoff, {:?} delay",
        config.cleanup_max_attempts, config.cleanup_backoff, config.cleanup_delay
    );

    let temp_storage = storage::setup_storage(&config).await?;

    // Setup Shutdown Channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (state, worker) = AppState::new(config, temp_storage, shutdown_rx);
    let optimizer = state.optimizer.clone();
    let worker_handle = tokio::spawn(worker.run());

    let app = create_app(state);

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::new(args.host, port);
    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No new transcodes; finish the cleanup queue before exiting
    optimizer.pool().close();
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(30), worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Cleanup worker panicked: {}", e),
        Err(_) => warn!("⏱️  Cleanup worker did not finish within 30s, temp files may remain"),
    }

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
