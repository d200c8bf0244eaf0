//! WebSocket endpoint: `/ws?exchange=&symbol=&channels=`.
//!
//! Connection contract: unknown channels close with 4400; when the
//! order-book channel is subscribed the first frame is the latest DOM from
//! KV (subscription is registered before the snapshot read, duplicates on
//! the seam are dropped by update id); afterwards every broker pub/sub
//! message is forwarded in `{stream, data}` envelopes. The server pings
//! every 20 s and closes with 1011 after two missed pongs.

use crate::client::{ClientRegistry, ClientState};
use crate::protocol::{Channel, DomFrame, CLOSE_UNKNOWN_CHANNEL, CLOSE_UNRESPONSIVE};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use broker::Broker;
use common::schema::{DomSnapshot, Exchange, Instrument};
use common::streams;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-client bounded queue size.
pub const SEND_QUEUE_CAPACITY: usize = 1024;
const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<ClientRegistry>,
    pub broker: Broker,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_channels")]
    pub channels: String,
}

fn default_exchange() -> String {
    "bybit".to_string()
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_channels() -> String {
    "orderbook_realtime,trades_realtime".to_string()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(mut socket: WebSocket, query: WsQuery, state: WsState) {
    let exchange = match Exchange::from_str(&query.exchange) {
        Ok(exchange) => exchange,
        Err(_) => {
            close_with(&mut socket, CLOSE_UNKNOWN_CHANNEL, "unknown exchange").await;
            return;
        }
    };
    let channels = match Channel::parse_set(&query.channels) {
        Ok(channels) if !channels.is_empty() => channels,
        Ok(_) => {
            close_with(&mut socket, CLOSE_UNKNOWN_CHANNEL, "no channels").await;
            return;
        }
        Err(unknown) => {
            close_with(
                &mut socket,
                CLOSE_UNKNOWN_CHANNEL,
                &format!("unknown channel: {unknown}"),
            )
            .await;
            return;
        }
    };

    let instrument = Instrument::new(exchange, query.symbol.to_ascii_uppercase());
    let wants_dom = channels.contains(&Channel::OrderbookRealtime);
    let client = Arc::new(ClientState::new(
        instrument.clone(),
        channels,
        SEND_QUEUE_CAPACITY,
    ));
    let client_id = client.id;

    // Register (i.e. start the subscription) before reading the snapshot
    // so nothing between the two is lost; the seam check drops overlap.
    state.registry.register(client.clone());
    info!(client = %client_id, instrument = %instrument, "client connected");
    metrics::counter!("gateway_connections_total").increment(1);

    if wants_dom {
        match state
            .broker
            .kv_get::<DomSnapshot>(&streams::dom(instrument.exchange, &instrument.symbol))
            .await
        {
            Ok(Some(dom)) => {
                client.set_snapshot_update_id(dom.update_id);
                match serde_json::to_string(&DomFrame::new(&dom)) {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            state.registry.unregister(&client_id);
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "dom frame serialization failed"),
                }
            }
            Ok(None) => debug!(instrument = %instrument, "no dom snapshot yet"),
            Err(err) => warn!(error = %err, "dom bootstrap read failed"),
        }
    }

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset();

    loop {
        tokio::select! {
            frame = client.queue.pop() => {
                match frame {
                    Some(frame) => {
                        if socket
                            .send(Message::Text(frame.text().to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => client.touch_pong(),
                    Some(Ok(Message::Ping(data))) => {
                        client.touch_pong();
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Inbound text is ignored; subscriptions are fixed at
                    // connect time.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(client = %client_id, error = %err, "socket error");
                        break;
                    }
                }
            }

            _ = ping_timer.tick() => {
                let silent_for = common::now_ms() - client.last_pong_ms();
                if silent_for > 2 * PING_INTERVAL.as_millis() as i64 {
                    warn!(client = %client_id, "missed two pongs, closing");
                    close_with(&mut socket, CLOSE_UNRESPONSIVE, "unresponsive").await;
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&client_id);
    metrics::counter!("gateway_disconnections_total").increment(1);
    info!(client = %client_id, "client disconnected");
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
