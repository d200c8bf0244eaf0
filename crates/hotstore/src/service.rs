//! Hot store service loop: raw streams in (consumer group), KV DOM +
//! pub/sub mirror out.
//!
//! One task per instrument consumes that instrument's five raw streams.
//! Every message is acked whether or not it was usable (at-least-once with
//! idempotent handling: DOM replaces, trades dedup by id).

use crate::store::HotStore;
use broker::Broker;
use common::schema::{Instrument, StreamRecord};
use common::supervisor::Shutdown;
use common::{now_ms, streams};
use tracing::{info, warn};

const GROUP: &str = "hotstore";
const READ_BLOCK_MS: usize = 1_000;
const READ_COUNT: usize = 100;

pub struct HotStoreService {
    pub broker: Broker,
    pub store: HotStore,
    pub instrument: Instrument,
}

impl HotStoreService {
    /// Run until shutdown. Errors out on broker failures so the supervisor
    /// restarts the task with backoff; unacked entries are redelivered to
    /// the next incarnation.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let names = streams::raw_streams(&self.instrument);
        for name in &names {
            self.broker.ensure_group(name, GROUP).await?;
        }
        let consumer = format!("hotstore-{}", self.instrument);
        let label = self.instrument.to_string();
        info!(instrument = %label, "hot store consuming");

        let mut last_heartbeat = 0i64;
        loop {
            if shutdown.is_shutdown() {
                return Ok(());
            }

            let batch = tokio::select! {
                biased;
                _ = shutdown.recv() => return Ok(()),
                batch = self.broker.stream_read_group(
                    GROUP, &consumer, &names, READ_BLOCK_MS, READ_COUNT,
                ) => batch?,
            };

            for message in &batch {
                match &message.record {
                    Some(record) => {
                        if let Err(err) = self.handle(record).await {
                            warn!(instrument = %label, error = %err, "hot store message failed");
                            metrics::counter!("hotstore_errors_total",
                                "instrument" => label.clone()).increment(1);
                        }
                    }
                    None => {
                        metrics::counter!("hotstore_undecodable_total",
                            "instrument" => label.clone()).increment(1);
                    }
                }
            }

            // Ack per stream, poison entries included.
            for name in &names {
                let ids: Vec<String> = batch
                    .iter()
                    .filter(|m| &m.stream == name)
                    .map(|m| m.id.clone())
                    .collect();
                if !ids.is_empty() {
                    self.broker.ack(name, GROUP, &ids).await?;
                }
            }

            let now = now_ms();
            if now - last_heartbeat >= 1_000 {
                last_heartbeat = now;
                let key = streams::worker_heartbeat(&format!("hotstore:{label}"));
                let _ = self
                    .broker
                    .kv_set(&key, &now, streams::HEARTBEAT_TTL_SECS)
                    .await;
            }
        }
    }

    async fn handle(&self, record: &StreamRecord) -> anyhow::Result<()> {
        let (ex, sym) = (self.instrument.exchange, self.instrument.symbol.as_str());
        match record {
            StreamRecord::Dom(dom) => {
                self.store.apply_dom(self.instrument.clone(), dom.clone());
                let key = streams::dom(ex, sym);
                self.broker
                    .kv_set(&key, dom, streams::DOM_TTL_SECS)
                    .await?;
                self.broker.publish(&key, record).await?;
                metrics::counter!("hotstore_dom_updates_total").increment(1);
            }
            StreamRecord::Trade(trade) => {
                // Drop redelivered trade ids so downstream sees each id at
                // most once.
                if self.store.apply_trade(self.instrument.clone(), trade.clone()) {
                    self.broker
                        .publish(&streams::trades(ex, sym), record)
                        .await?;
                } else {
                    metrics::counter!("hotstore_duplicate_trades_total").increment(1);
                }
            }
            StreamRecord::Kline(_) => {
                self.broker.publish(&streams::kline(ex, sym), record).await?;
            }
            StreamRecord::OpenInterest(_) => {
                self.broker.publish(&streams::oi(ex, sym), record).await?;
            }
            StreamRecord::Liquidation(_) => {
                self.broker.publish(&streams::liq(ex, sym), record).await?;
            }
            other => {
                // Raw streams never carry derived records.
                warn!(instrument = %self.instrument, kind = ?std::mem::discriminant(other),
                    "unexpected record on raw stream");
            }
        }
        Ok(())
    }
}
