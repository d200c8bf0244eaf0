//! Broker pub/sub → WebSocket fan-out.
//!
//! One pattern subscription per channel family covers every instrument;
//! messages are serialized once and pushed onto each subscriber's bounded
//! queue. DOM messages carry their update id into the queue so the seam
//! logic and supersession can order them.

use crate::client::ClientRegistry;
use crate::protocol::Envelope;
use broker::Broker;
use common::supervisor::Shutdown;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Channel-family patterns the router tails.
const PATTERNS: [&str; 12] = [
    "dom:*",
    "trades:*",
    "kline:*",
    "oi:*",
    "liq:*",
    "heatmap:*",
    "footprint:*",
    "events:*",
    "scores.trend:*",
    "scores.exhaustion:*",
    "signals.rule_reversal:*",
    "ai_response:*",
];

pub struct Router {
    pub registry: Arc<ClientRegistry>,
    pub broker: Broker,
}

impl Router {
    /// Tail the broker until shutdown. Returns `Err` when the subscription
    /// drops so the caller can restart it.
    pub async fn run(self, mut shutdown: Shutdown) -> anyhow::Result<()> {
        let patterns: Vec<String> = PATTERNS.iter().map(|p| p.to_string()).collect();
        let mut subscription = self.broker.psubscribe(&patterns).await?;
        info!("gateway router subscribed to {} patterns", patterns.len());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => return Ok(()),

                msg = subscription.next() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => anyhow::bail!("pub/sub subscription ended"),
                    };
                    self.route(&msg.channel, &msg.payload);
                }
            }
        }
    }

    fn route(&self, channel: &str, payload: &str) {
        let clients = self.registry.subscribers(channel);
        if clients.is_empty() {
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(channel, error = %err, "undecodable pub/sub payload");
                metrics::counter!("gateway_undecodable_messages_total").increment(1);
                return;
            }
        };

        // Serialize the envelope once for every subscriber.
        let envelope = Envelope {
            stream: channel,
            data: &value,
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(channel, error = %err, "envelope serialization failed");
                return;
            }
        };

        let dom_update_id = channel
            .starts_with("dom:")
            .then(|| value.get("update_id").and_then(|v| v.as_u64()))
            .flatten();

        debug!(channel, clients = clients.len(), "routing message");
        for client in clients {
            match dom_update_id {
                Some(update_id) => client.push_dom(update_id, text.clone()),
                None => client.push_data(text.clone()),
            }
        }
        metrics::counter!("gateway_messages_routed_total").increment(1);
    }
}
