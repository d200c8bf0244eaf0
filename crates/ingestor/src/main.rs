//! Ingestor daemon: one book-sync task per configured (exchange, symbol).

use adapters::{BinanceAdapter, BybitAdapter, ExchangeAdapter, OkxAdapter};
use broker::Broker;
use common::error::EXIT_CONFIG;
use common::schema::{Exchange, Instrument};
use common::supervisor::HealthHandle;
use common::{Config, Supervisor};
use ingestor::{run_instrument, IngestorContext};
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
    info!(port = config.metrics_port, "metrics exporter started");

    let broker = Broker::connect_with_retry(&config.broker_url).await;
    info!("connected to broker");

    let mut supervisor = Supervisor::new();
    for instrument in config.instruments() {
        spawn_instrument(&mut supervisor, instrument, broker.clone(), config.clone());
    }

    serve_health(supervisor.health_handle(), config.health_port).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    supervisor.shutdown_and_wait().await;
    info!("ingestord stopped");
    Ok(())
}

fn spawn_instrument(
    supervisor: &mut Supervisor,
    instrument: Instrument,
    broker: Broker,
    config: Arc<Config>,
) {
    let name = format!("ingestor:{instrument}");
    match instrument.exchange {
        Exchange::Bybit => spawn_typed(supervisor, name, BybitAdapter, instrument, broker, config),
        Exchange::Binance => {
            spawn_typed(supervisor, name, BinanceAdapter, instrument, broker, config)
        }
        Exchange::Okx => spawn_typed(supervisor, name, OkxAdapter, instrument, broker, config),
    }
}

fn spawn_typed<A: ExchangeAdapter>(
    supervisor: &mut Supervisor,
    name: String,
    adapter: A,
    instrument: Instrument,
    broker: Broker,
    config: Arc<Config>,
) {
    let ctx = IngestorContext {
        adapter: Arc::new(adapter),
        instrument,
        broker,
        config,
    };
    supervisor.spawn(name, move |shutdown| {
        let ctx = ctx.clone();
        Box::pin(run_instrument(ctx, shutdown))
    });
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
