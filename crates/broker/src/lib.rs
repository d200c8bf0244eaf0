//! Redis-backed stream/cache broker facade.
//!
//! One abstraction for everything the pipeline shares across processes:
//! trimmed streams (XADD MAXLEN~), range reads, consumer-group reads with
//! acks, pub/sub, and TTL'd key/value. All failures surface as
//! [`BrokerError::Transport`]; callers retry with backoff.

use common::schema::StreamRecord;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

/// Field name carrying the JSON record inside a stream entry. The record
/// itself is self-describing via its `kind` tag.
const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker unreachable or command failed; retry with backoff.
    #[error("transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Payload did not decode into a known record kind.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A stream entry without the expected payload field.
    #[error("malformed stream entry {id} on {stream}")]
    MalformedEntry { stream: String, id: String },
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One message read from a stream (range or consumer-group read).
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub stream: String,
    pub id: String,
    pub record: StreamRecord,
}

/// One entry delivered to a consumer group. `record` is `None` when the
/// payload did not decode; the id must still be acked so the poison entry
/// is not redelivered forever.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub stream: String,
    pub id: String,
    pub record: Option<StreamRecord>,
}

/// One message received over pub/sub.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

impl PubSubMessage {
    pub fn decode(&self) -> Result<StreamRecord> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Active pub/sub subscription: a stream of messages from the subscribed
/// channels/patterns. Dropping it closes the dedicated connection.
pub struct Subscription {
    inner: Pin<Box<dyn futures::Stream<Item = redis::Msg> + Send>>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        let msg = self.inner.as_mut().next().await?;
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().ok()?;
        Some(PubSubMessage { channel, payload })
    }
}

/// Shared broker client. Cheap to clone; safe for concurrent use.
#[derive(Clone)]
pub struct Broker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl Broker {
    /// Connect to the broker. The managed connection reconnects internally;
    /// individual commands still fail with `Transport` while it is down.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Connect, retrying forever with capped jittered backoff. Used at
    /// daemon startup; an unreachable broker is a transport condition, not
    /// a configuration error.
    pub async fn connect_with_retry(url: &str) -> Self {
        let mut backoff = common::Backoff::standard();
        loop {
            match Self::connect(url).await {
                Ok(broker) => return broker,
                Err(err) => {
                    tracing::warn!(error = %err, "broker unreachable, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Append one record, trimming the stream to approximately
    /// `maxlen_approx` entries. Returns the broker-assigned entry id
    /// (monotonically increasing within the stream).
    pub async fn stream_append(
        &self,
        stream: &str,
        record: &StreamRecord,
        maxlen_approx: usize,
    ) -> Result<String> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(maxlen_approx),
                "*",
                &[(PAYLOAD_FIELD, payload.as_str())],
            )
            .await?;
        Ok(id)
    }

    /// Read a range of entries, oldest first. `from`/`to` follow Redis
    /// stream id syntax (`-`/`+` for the ends).
    pub async fn stream_range(
        &self,
        stream: &str,
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, from, to, limit).await?;
        decode_range(stream, reply)
    }

    /// Newest `limit` entries, newest first. Used by the REST history
    /// endpoints.
    pub async fn stream_tail(&self, stream: &str, limit: usize) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", limit).await?;
        decode_range(stream, reply)
    }

    /// Create the consumer group if it does not exist yet (BUSYGROUP is
    /// fine), starting at new messages.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => {
                debug!(stream, group, "consumer group created");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Consumer-group read across several streams with server-tracked
    /// offsets. Blocks up to `block_ms`. Undecodable entries come back
    /// with `record = None` (counted) so the caller can still ack them.
    pub async fn stream_read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        block_ms: usize,
        count: usize,
    ) -> Result<Vec<GroupMessage>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(block_ms)
            .count(count);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: StreamReadReply = conn.xread_options(streams, &ids, &opts).await?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let record = match decode_fields(&key.key, &entry.id, &entry.map) {
                    Ok(record) => Some(record),
                    Err(_) => {
                        metrics::counter!("broker_undecodable_entries_total").increment(1);
                        None
                    }
                };
                out.push(GroupMessage {
                    stream: key.key.clone(),
                    id: entry.id.clone(),
                    record,
                });
            }
        }
        Ok(out)
    }

    /// Commit processed entry ids for a consumer group.
    pub async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, ids).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publish a record on a channel.
    pub async fn publish(&self, channel: &str, record: &StreamRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        self.publish_raw(channel, &payload).await
    }

    /// Publish a pre-serialized payload on a channel.
    pub async fn publish_raw(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Subscribe to exact channel names. Uses a dedicated connection.
    pub async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        Ok(Subscription {
            inner: Box::pin(pubsub.into_on_message()),
        })
    }

    /// Subscribe to channel patterns (`dom:*`, ...). Uses a dedicated
    /// connection.
    pub async fn psubscribe(&self, patterns: &[String]) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        Ok(Subscription {
            inner: Box::pin(pubsub.into_on_message()),
        })
    }

    // ------------------------------------------------------------------
    // Key/value
    // ------------------------------------------------------------------

    /// Set a JSON value with a TTL. Each key has a single writer by
    /// convention.
    pub async fn kv_set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, json, ttl_secs).await?;
        Ok(())
    }

    pub async fn kv_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Keys matching a glob pattern. Used by the gateway health endpoint to
    /// enumerate worker heartbeats.
    pub async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    /// Remaining TTL of a key in milliseconds; `None` when absent.
    pub async fn kv_ttl_ms(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(ttl))
        }
    }
}

fn decode_range(stream: &str, reply: StreamRangeReply) -> Result<Vec<StreamMessage>> {
    let mut out = Vec::with_capacity(reply.ids.len());
    for entry in reply.ids {
        let record = decode_fields(stream, &entry.id, &entry.map)?;
        out.push(StreamMessage {
            stream: stream.to_string(),
            id: entry.id,
            record,
        });
    }
    Ok(out)
}

fn decode_fields(
    stream: &str,
    id: &str,
    map: &std::collections::HashMap<String, redis::Value>,
) -> Result<StreamRecord> {
    let value = map.get(PAYLOAD_FIELD).ok_or_else(|| BrokerError::MalformedEntry {
        stream: stream.to_string(),
        id: id.to_string(),
    })?;
    let raw: String =
        redis::from_redis_value(value).map_err(|_| BrokerError::MalformedEntry {
            stream: stream.to_string(),
            id: id.to_string(),
        })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::{DomSnapshot, Exchange};
    use redis::Value;
    use std::collections::HashMap;

    fn dom_record() -> StreamRecord {
        StreamRecord::Dom(DomSnapshot {
            exchange: Exchange::Bybit,
            symbol: "BTCUSDT".to_string(),
            ts: 1_700_000_000_000,
            update_id: 10,
            bids: vec![],
            asks: vec![],
        })
    }

    #[test]
    fn test_decode_fields_round_trip() {
        let record = dom_record();
        let json = serde_json::to_string(&record).unwrap();
        let mut map = HashMap::new();
        map.insert(
            PAYLOAD_FIELD.to_string(),
            Value::BulkString(json.into_bytes()),
        );
        let decoded = decode_fields("dom:bybit:BTCUSDT", "1-0", &map).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_fields_missing_payload() {
        let map = HashMap::new();
        let err = decode_fields("dom:bybit:BTCUSDT", "1-0", &map).unwrap_err();
        assert!(matches!(err, BrokerError::MalformedEntry { .. }));
    }

    #[test]
    fn test_decode_fields_unknown_kind() {
        let mut map = HashMap::new();
        map.insert(
            PAYLOAD_FIELD.to_string(),
            Value::BulkString(br#"{"kind":"nope"}"#.to_vec()),
        );
        let err = decode_fields("dom:bybit:BTCUSDT", "1-0", &map).unwrap_err();
        assert!(matches!(err, BrokerError::Decode(_)));
    }
}
