//! Analytics daemon: one worker task per (worker kind, exchange, symbol).

use analytics::{
    run_worker, FootprintWorker, HeatmapWorker, IcebergWorker, TapeWorker, TrendWorker,
    WallSpoofWorker, Worker, WorkerCtx,
};
use broker::Broker;
use common::error::EXIT_CONFIG;
use common::schema::Instrument;
use common::supervisor::HealthHandle;
use common::{Config, Supervisor};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing::{error, info, warn};
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

    let ctx = WorkerCtx {
        broker,
        config: config.clone(),
    };

    let mut supervisor = Supervisor::new();
    for instrument in config.instruments() {
        for kind in &config.workers {
            match make_worker(kind, &instrument) {
                Some(factory) => {
                    let name = format!("{kind}:{instrument}");
                    let ctx = ctx.clone();
                    supervisor.spawn(name, move |shutdown| {
                        Box::pin(run_worker(ctx.clone(), factory(), shutdown))
                    });
                }
                None => warn!(kind, "unknown worker kind, skipping"),
            }
        }
    }

    serve_health(supervisor.health_handle(), config.health_port).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    supervisor.shutdown_and_wait().await;
    info!("analyticsd stopped");
    Ok(())
}

type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

fn make_worker(kind: &str, instrument: &Instrument) -> Option<WorkerFactory> {
    let instrument = instrument.clone();
    let factory: WorkerFactory = match kind {
        "tape" => Arc::new(move || Box::new(TapeWorker::new(instrument.clone()))),
        "heatmap" => Arc::new(move || Box::new(HeatmapWorker::new(instrument.clone()))),
        "footprint" => Arc::new(move || Box::new(FootprintWorker::new(instrument.clone()))),
        "iceberg" => Arc::new(move || Box::new(IcebergWorker::new(instrument.clone()))),
        "wallspoof" => Arc::new(move || Box::new(WallSpoofWorker::new(instrument.clone()))),
        "trend" => Arc::new(move || Box::new(TrendWorker::new(instrument.clone()))),
        _ => return None,
    };
    Some(factory)
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
