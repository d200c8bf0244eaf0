//! Ingestor runner: owns the connection lifecycle around [`BookSync`].
//!
//! One session = one socket. Inside a session the runner races a REST
//! snapshot against a venue-pushed one, buffers deltas until either lands,
//! then applies live. Gaps, crossed books and disconnects end the session;
//! the outer loop reconnects with full-jitter backoff. Non-book events are
//! appended to their streams regardless of book state.

use crate::sync::{BookSync, SyncError};
use adapters::{AdapterError, ExchangeAdapter, Feed, VenueConnection};
use broker::Broker;
use common::schema::{BookSnapshot, CanonicalEvent, Instrument};
use common::supervisor::Shutdown;
use common::{now_ms, streams, Backoff, Config};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// REST snapshot request deadline.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for a venue-pushed snapshot before REST is used.
const WS_SNAPSHOT_GRACE: Duration = Duration::from_secs(1);
/// Snapshot attempts before the task escalates to the supervisor.
const SNAPSHOT_ATTEMPTS: u32 = 5;
/// Consecutive malformed frames tolerated before tearing the socket down.
const PROTOCOL_ERROR_LIMIT: u32 = 20;
/// Resyncs per minute that trip the venue-instability flag.
const RESYNC_PER_MINUTE_LIMIT: usize = 5;

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("broker append failed: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("snapshot failed after {SNAPSHOT_ATTEMPTS} attempts")]
    SnapshotExhausted,

    #[error("protocol error rate exceeded")]
    ProtocolStorm,
}

/// Everything one instrument task needs, threaded explicitly.
pub struct IngestorContext<A> {
    pub adapter: Arc<A>,
    pub instrument: Instrument,
    pub broker: Broker,
    pub config: Arc<Config>,
}

impl<A> Clone for IngestorContext<A> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            instrument: self.instrument.clone(),
            broker: self.broker.clone(),
            config: self.config.clone(),
        }
    }
}

/// Tracks resync frequency for the venue-instability flag.
struct ResyncTracker {
    timestamps: Vec<i64>,
    label: String,
}

impl ResyncTracker {
    fn new(label: String) -> Self {
        Self {
            timestamps: Vec::new(),
            label,
        }
    }

    fn record(&mut self) {
        let now = now_ms();
        self.timestamps.push(now);
        self.timestamps.retain(|ts| now - ts <= 60_000);
        metrics::counter!("ingestor_resyncs_total", "instrument" => self.label.clone())
            .increment(1);
        let unstable = self.timestamps.len() > RESYNC_PER_MINUTE_LIMIT;
        metrics::gauge!("ingestor_venue_unstable", "instrument" => self.label.clone())
            .set(if unstable { 1.0 } else { 0.0 });
        if unstable {
            warn!(instrument = %self.label, resyncs = self.timestamps.len(),
                "venue unstable: resync rate over limit");
        }
    }
}

/// Run one instrument until shutdown. Returns `Err` only when the session
/// hit an unrecoverable condition (snapshot exhaustion) so the supervisor
/// restarts the whole task with backoff.
pub async fn run_instrument<A: ExchangeAdapter>(
    ctx: IngestorContext<A>,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    let http = reqwest::Client::builder()
        .timeout(SNAPSHOT_TIMEOUT)
        .build()?;
    let label = ctx.instrument.to_string();
    let mut backoff = Backoff::standard();
    let mut resyncs = ResyncTracker::new(label.clone());

    loop {
        if shutdown.is_shutdown() {
            return Ok(());
        }

        match session(&ctx, &http, &mut shutdown, &mut resyncs).await {
            Ok(()) => {
                info!(instrument = %label, "ingestor session closed on shutdown");
                return Ok(());
            }
            Err(SessionError::SnapshotExhausted) => {
                // Escalate: let the supervisor park and restart the task.
                return Err(anyhow::anyhow!(
                    "{label}: snapshot failed after {SNAPSHOT_ATTEMPTS} attempts"
                ));
            }
            Err(err) => {
                warn!(instrument = %label, error = %err, "ingestor session ended, reconnecting");
                metrics::counter!("ingestor_disconnects_total", "instrument" => label.clone())
                    .increment(1);
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

async fn session<A: ExchangeAdapter>(
    ctx: &IngestorContext<A>,
    http: &reqwest::Client,
    shutdown: &mut Shutdown,
    resyncs: &mut ResyncTracker,
) -> Result<(), SessionError> {
    let symbol = ctx.instrument.symbol.clone();
    let label = ctx.instrument.to_string();
    let url = ctx.adapter.ws_url(&symbol, &Feed::ALL);
    let frames = ctx.adapter.subscribe_frames(&symbol, &Feed::ALL);
    let mut conn = VenueConnection::open(&url, &frames, ctx.adapter.heartbeat_frame()).await?;
    info!(instrument = %label, "connected and subscribed");

    let mut sync = BookSync::new(ctx.instrument.clone(), ctx.config.dom_depth);
    let mut protocol_errors: u32 = 0;
    let mut last_heartbeat = 0i64;

    // Race a REST snapshot against a venue-pushed one. The fetch task
    // waits out the grace period first so venues that push snapshots
    // rarely see a REST call at all.
    let (snap_tx, mut snap_rx) = oneshot::channel::<Result<BookSnapshot, SessionError>>();
    let snapshot_task = tokio::spawn(fetch_snapshot_with_retry(
        ctx.adapter.clone(),
        http.clone(),
        symbol.clone(),
        ctx.config.dom_depth,
        snap_tx,
    ));
    let mut snapshot_pending = true;

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break Ok(()),

            snap = &mut snap_rx, if snapshot_pending => {
                snapshot_pending = false;
                match snap {
                    Ok(Ok(snapshot)) => {
                        if matches!(sync.state(), crate::sync::SyncState::AwaitingSnapshot) {
                            match sync.on_snapshot(&snapshot) {
                                Ok(dom) => {
                                    if let Err(err) = publish_dom(ctx, dom).await {
                                        break Err(err);
                                    }
                                }
                                Err(err) => {
                                    resyncs.record();
                                    break Err(err.into());
                                }
                            }
                        }
                    }
                    Ok(Err(err)) => break Err(err),
                    Err(_) => {}
                }
            }

            raw = conn.next_raw() => {
                let raw = match raw {
                    Ok(raw) => raw,
                    Err(err) => break Err(err.into()),
                };
                let events = match ctx.adapter.parse(&symbol, &raw) {
                    Ok(events) => {
                        protocol_errors = 0;
                        events
                    }
                    Err(AdapterError::Protocol(reason)) => {
                        protocol_errors += 1;
                        metrics::counter!("ingestor_protocol_errors_total",
                            "instrument" => label.clone()).increment(1);
                        warn!(instrument = %label, reason, "dropping malformed frame");
                        if protocol_errors >= PROTOCOL_ERROR_LIMIT {
                            break Err(SessionError::ProtocolStorm);
                        }
                        continue;
                    }
                    Err(err) => break Err(err.into()),
                };

                let mut failed = None;
                for event in events {
                    if let Err(err) = handle_event(ctx, &mut sync, event).await {
                        failed = Some(err);
                        break;
                    }
                }
                if let Some(err) = failed {
                    if matches!(err, SessionError::Sync(_)) {
                        resyncs.record();
                    }
                    break Err(err);
                }

                let now = now_ms();
                if now - last_heartbeat >= 1_000 {
                    last_heartbeat = now;
                    let hb_key = streams::worker_heartbeat(&format!("ingestor:{label}"));
                    let _ = ctx.broker
                        .kv_set(&hb_key, &now, streams::HEARTBEAT_TTL_SECS)
                        .await;
                }
            }
        }
    };

    snapshot_task.abort();
    conn.close().await;
    result
}

async fn handle_event<A: ExchangeAdapter>(
    ctx: &IngestorContext<A>,
    sync: &mut BookSync,
    event: CanonicalEvent,
) -> Result<(), SessionError> {
    use common::schema::StreamRecord;

    let (ex, sym) = (ctx.instrument.exchange, ctx.instrument.symbol.as_str());
    match event {
        CanonicalEvent::Snapshot(snapshot) => {
            let dom = sync.on_snapshot(&snapshot)?;
            publish_dom(ctx, dom).await?;
        }
        CanonicalEvent::Delta(delta) => {
            if let Some(dom) = sync.on_delta(&delta)? {
                publish_dom(ctx, dom).await?;
            }
        }
        CanonicalEvent::Trade(trade) => {
            ctx.broker
                .stream_append(
                    &streams::trades(ex, sym),
                    &StreamRecord::Trade(trade),
                    streams::TRADES_MAXLEN,
                )
                .await?;
        }
        CanonicalEvent::Kline(kline) => {
            ctx.broker
                .stream_append(
                    &streams::kline(ex, sym),
                    &StreamRecord::Kline(kline),
                    streams::KLINE_MAXLEN,
                )
                .await?;
        }
        CanonicalEvent::OpenInterest(oi) => {
            ctx.broker
                .stream_append(
                    &streams::oi(ex, sym),
                    &StreamRecord::OpenInterest(oi),
                    streams::OI_MAXLEN,
                )
                .await?;
        }
        CanonicalEvent::Liquidation(liq) => {
            ctx.broker
                .stream_append(
                    &streams::liq(ex, sym),
                    &StreamRecord::Liquidation(liq),
                    streams::LIQ_MAXLEN,
                )
                .await?;
        }
    }
    Ok(())
}

async fn publish_dom<A: ExchangeAdapter>(
    ctx: &IngestorContext<A>,
    dom: common::schema::DomSnapshot,
) -> Result<(), SessionError> {
    let stream = streams::dom(ctx.instrument.exchange, &ctx.instrument.symbol);
    ctx.broker
        .stream_append(
            &stream,
            &common::schema::StreamRecord::Dom(dom),
            streams::DOM_MAXLEN,
        )
        .await?;
    Ok(())
}

async fn fetch_snapshot_with_retry<A: ExchangeAdapter>(
    adapter: Arc<A>,
    http: reqwest::Client,
    symbol: String,
    depth: usize,
    tx: oneshot::Sender<Result<BookSnapshot, SessionError>>,
) {
    tokio::time::sleep(WS_SNAPSHOT_GRACE).await;

    let mut backoff = Backoff::standard();
    for attempt in 1..=SNAPSHOT_ATTEMPTS {
        match adapter.fetch_snapshot(&http, &symbol, depth).await {
            Ok(snapshot) => {
                let _ = tx.send(Ok(snapshot));
                return;
            }
            Err(err) => {
                warn!(symbol, attempt, error = %err, "REST snapshot attempt failed");
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
    let _ = tx.send(Err(SessionError::SnapshotExhausted));
}
