//! Hot store daemon: one stream-consumer task per configured instrument.

use broker::Broker;
use common::error::EXIT_CONFIG;
use common::supervisor::HealthHandle;
use common::{Config, Supervisor};
use hotstore::{HotStore, HotStoreService};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
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

    let broker = Broker::connect_with_retry(&config.broker_url).await;
    info!("connected to broker");

    let store = HotStore::new();
    let mut supervisor = Supervisor::new();
    for instrument in config.instruments() {
        let name = format!("hotstore:{instrument}");
        let broker = broker.clone();
        let store = store.clone();
        supervisor.spawn(name, move |shutdown| {
            let service = HotStoreService {
                broker: broker.clone(),
                store: store.clone(),
                instrument: instrument.clone(),
            };
            Box::pin(service.run(shutdown))
        });
    }

    serve_health(supervisor.health_handle(), config.health_port).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    supervisor.shutdown_and_wait().await;
    info!("hotstored stopped");
    Ok(())
}

async fn serve_health(handle: HealthHandle, port: u16) -> anyhow::Result<()> {
    use axum::routing::get;

    let app = axum::Router::new().route(
        "/health",
        get(move || {
            let tasks = handle.snapshot();
            async move { axum::Json(serde_json::json!({"status": "ok", "tasks": tasks})) }
        }),
    );
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
