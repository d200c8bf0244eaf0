//! Gateway daemon: WebSocket fan-out plus the REST surface.

use broker::Broker;
use common::error::EXIT_CONFIG;
use common::{Config, Supervisor};
use gateway::{rest_router, ApiState, ClientRegistry, Router, WsState};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .map_err(|e| anyhow::anyhow!("prometheus exporter: {e}"))?;
    info!(port = config.metrics_port, "metrics exporter started");

    let broker = Broker::connect_with_retry(&config.broker_url).await;
    info!("connected to broker");

    let registry = Arc::new(ClientRegistry::new());

    // The router is supervised: a dropped pub/sub connection restarts it
    // with backoff while client sockets stay up.
    let mut supervisor = Supervisor::new();
    {
        let registry = registry.clone();
        let broker = broker.clone();
        supervisor.spawn("gateway:router", move |shutdown| {
            let router = Router {
                registry: registry.clone(),
                broker: broker.clone(),
            };
            Box::pin(router.run(shutdown))
        });
    }

    let ws_state = WsState {
        registry: registry.clone(),
        broker: broker.clone(),
    };
    let api_state = ApiState {
        broker,
        registry: registry.clone(),
    };
    let app = rest_router(api_state)
        .route(
            "/ws",
            axum::routing::get(gateway::ws_handler).with_state(ws_state),
        )
        .layer(CorsLayer::permissive());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.gateway_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down router");
    supervisor.shutdown_and_wait().await;
    info!("gatewayd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
