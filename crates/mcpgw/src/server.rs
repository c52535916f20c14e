use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use gateway_api_server::config::GatewayConfig;
use gateway_api_server::factory::create_api_service;
use gateway_api_server::router::initiate_api_router;
use gateway_api_server::subsystems::start_subsystems;
use shared::error::CommonError;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn serve(config: GatewayConfig) -> Result<(), CommonError> {
    let api_service = create_api_service(&config).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = start_subsystems(&api_service, &config, &shutdown_tx);

    let router = initiate_api_router(api_service);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting work, then give in-flight subsystems the drain window.
    info!("shutting down, draining subsystems");
    let _ = shutdown_tx.send(());
    let drain = async {
        for handle in handles {
            handle.wait_for_shutdown().await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("subsystems did not drain within {DRAIN_TIMEOUT:?}");
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("cannot listen for SIGINT, relying on SIGTERM only");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
