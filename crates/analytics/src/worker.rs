//! Shared worker harness.
//!
//! Every analytics worker is single-threaded per (exchange, symbol) and
//! consumes through a consumer group named after the worker kind, so
//! restarts resume at the committed offset and multi-instance deployments
//! partition work. Failure policy: log, count, ack, continue.

use async_trait::async_trait;
use broker::Broker;
use common::schema::{Instrument, StreamRecord};
use common::supervisor::Shutdown;
use common::{now_ms, streams, Config};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const READ_BLOCK_MS: usize = 1_000;
const READ_COUNT: usize = 100;

/// Handles to the outside world, threaded into every worker.
#[derive(Clone)]
pub struct WorkerCtx {
    pub broker: Broker,
    pub config: Arc<Config>,
}

impl WorkerCtx {
    /// Append to a derived stream and mirror on the same-named pub/sub
    /// channel for the gateway.
    pub async fn emit(
        &self,
        stream: &str,
        record: &StreamRecord,
        maxlen: usize,
    ) -> anyhow::Result<()> {
        self.broker.stream_append(stream, record, maxlen).await?;
        self.broker.publish(stream, record).await?;
        Ok(())
    }
}

/// One analytics worker bound to one instrument.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Worker kind; doubles as the consumer-group name.
    fn kind(&self) -> &'static str;

    fn instrument(&self) -> &Instrument;

    /// Streams consumed via the group. May be empty for samplers.
    fn streams(&self) -> Vec<String>;

    /// Periodic wakeup for samplers and time-based closes.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_record(&mut self, ctx: &WorkerCtx, record: &StreamRecord) -> anyhow::Result<()>;

    async fn on_tick(&mut self, _ctx: &WorkerCtx) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Drive one worker until shutdown. Broker failures bubble up so the
/// supervisor restarts the worker; unacked entries are redelivered
/// (at-least-once, consumers idempotent by event primary key).
pub async fn run_worker(
    ctx: WorkerCtx,
    mut worker: Box<dyn Worker>,
    mut shutdown: Shutdown,
) -> anyhow::Result<()> {
    let name = format!("{}:{}", worker.kind(), worker.instrument());
    let group = worker.kind().to_string();
    let names = worker.streams();
    for stream in &names {
        ctx.broker.ensure_group(stream, &group).await?;
    }
    let tick_ms = worker.tick_interval().map(|d| d.as_millis() as i64);
    info!(worker = %name, streams = names.len(), "worker running");

    let mut last_heartbeat = 0i64;
    let mut next_tick = now_ms();
    loop {
        if shutdown.is_shutdown() {
            info!(worker = %name, "worker stopped");
            return Ok(());
        }

        let now = now_ms();
        if now - last_heartbeat >= 1_000 {
            last_heartbeat = now;
            let key = streams::worker_heartbeat(&name);
            let _ = ctx
                .broker
                .kv_set(&key, &now, streams::HEARTBEAT_TTL_SECS)
                .await;
        }

        if let Some(tick_ms) = tick_ms {
            let now = now_ms();
            if now >= next_tick {
                next_tick = now + tick_ms;
                if let Err(err) = worker.on_tick(&ctx).await {
                    warn!(worker = %name, error = %err, "tick failed");
                    metrics::counter!("worker_errors_total", "worker" => name.clone())
                        .increment(1);
                }
            }
        }

        if names.is_empty() {
            // Pure sampler: sleep until the next tick.
            let wait = (next_tick - now_ms()).clamp(10, READ_BLOCK_MS as i64);
            tokio::select! {
                _ = shutdown.recv() => continue,
                _ = tokio::time::sleep(std::time::Duration::from_millis(wait as u64)) => continue,
            }
        }

        // The blocking read is interrupted only by shutdown; a dropped
        // read on exit leaves entries pending for the next incarnation.
        let batch = tokio::select! {
            biased;
            _ = shutdown.recv() => continue,
            batch = ctx.broker.stream_read_group(
                &group, &name, &names, READ_BLOCK_MS, READ_COUNT,
            ) => batch?,
        };

        for message in &batch {
            match &message.record {
                Some(record) => {
                    if let Err(err) = worker.on_record(&ctx, record).await {
                        warn!(worker = %name, error = %err, "record failed");
                        metrics::counter!("worker_errors_total", "worker" => name.clone())
                            .increment(1);
                    }
                }
                None => {
                    metrics::counter!("worker_undecodable_total", "worker" => name.clone())
                        .increment(1);
                }
            }
        }
        for stream in &names {
            let ids: Vec<String> = batch
                .iter()
                .filter(|m| &m.stream == stream)
                .map(|m| m.id.clone())
                .collect();
            if !ids.is_empty() {
                ctx.broker.ack(stream, &group, &ids).await?;
            }
        }
    }
}
