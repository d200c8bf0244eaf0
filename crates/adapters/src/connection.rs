//! WebSocket connection wrapper shared by all venue adapters.
//!
//! Handles the handshake, subscribe frames, protocol and application-level
//! heartbeats, and the idle read deadline. Reconnection policy lives in
//! the ingestor.

use crate::{AdapterError, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Idle read deadline: a healthy venue always sends something (data or
/// heartbeat) within this window.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Application heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// An open, subscribed venue socket yielding raw text frames.
pub struct VenueConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    heartbeat: Option<String>,
    heartbeat_timer: tokio::time::Interval,
}

impl VenueConnection {
    /// Connect, then send the subscribe frames.
    pub async fn open(url: &str, frames: &[String], heartbeat: Option<String>) -> Result<Self> {
        debug!(url, "connecting venue websocket");
        let (mut ws, response) = connect_async(url).await?;
        debug!(status = %response.status(), "websocket handshake complete");

        for frame in frames {
            ws.send(Message::Text(frame.clone().into())).await?;
        }

        let mut heartbeat_timer = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat_timer.reset();

        Ok(Self {
            ws,
            heartbeat,
            heartbeat_timer,
        })
    }

    /// Next raw text frame. Answers protocol pings, sends the venue
    /// heartbeat on a timer, and fails with `Disconnect` on close or when
    /// the idle deadline passes.
    pub async fn next_raw(&mut self) -> Result<String> {
        loop {
            tokio::select! {
                _ = self.heartbeat_timer.tick() => {
                    match &self.heartbeat {
                        Some(frame) => {
                            self.ws.send(Message::Text(frame.clone().into())).await?;
                        }
                        None => {
                            self.ws.send(Message::Ping(Vec::new().into())).await?;
                        }
                    }
                }

                msg = tokio::time::timeout(IDLE_READ_TIMEOUT, self.ws.next()) => {
                    let msg = msg.map_err(|_| {
                        AdapterError::Disconnect("idle read timeout".to_string())
                    })?;
                    match msg {
                        Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                        Some(Ok(Message::Ping(data))) => {
                            self.ws.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_)))
                        | Some(Ok(Message::Binary(_)))
                        | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            return Err(AdapterError::Disconnect(format!(
                                "close frame: {frame:?}"
                            )));
                        }
                        Some(Err(err)) => return Err(err.into()),
                        None => {
                            return Err(AdapterError::Disconnect("stream ended".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Best-effort close.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
