//! Client state and registry.
//!
//! Each client owns a bounded send queue. When it fills, the oldest
//! non-snapshot frames are dropped down to a low-water mark (counted);
//! DOM snapshots are never dropped, the newest supersedes an older queued
//! one. Under sustained pressure the queue therefore stays bounded while
//! the latest book is always retained.

use crate::protocol::Channel;
use common::schema::Instrument;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

pub type ClientId = Uuid;

/// One outbound frame, pre-serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// DOM snapshot; `update_id` orders competing snapshots.
    Dom { update_id: u64, text: String },
    Data { text: String },
}

impl Frame {
    pub fn text(&self) -> &str {
        match self {
            Frame::Dom { text, .. } | Frame::Data { text } => text,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    buf: VecDeque<Frame>,
    closed: bool,
}

/// Bounded send queue with the drop policy above.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    low_water: usize,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity,
            low_water: capacity / 2,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: Frame) {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.closed {
            return;
        }

        // Newest DOM supersedes any queued one.
        if matches!(frame, Frame::Dom { .. }) {
            inner.buf.retain(|f| !matches!(f, Frame::Dom { .. }));
        }

        if inner.buf.len() >= self.capacity {
            let mut dropped = 0u64;
            let mut kept_doms = VecDeque::new();
            while inner.buf.len() + kept_doms.len() > self.low_water {
                match inner.buf.pop_front() {
                    Some(dom @ Frame::Dom { .. }) => kept_doms.push_back(dom),
                    Some(Frame::Data { .. }) => dropped += 1,
                    None => break,
                }
            }
            // Snapshots survive the purge, ahead of whatever remains.
            while let Some(dom) = kept_doms.pop_back() {
                inner.buf.push_front(dom);
            }
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            metrics::counter!("gateway_frames_dropped_total").increment(dropped);
        }

        inner.buf.push_back(frame);
        drop(inner);
        self.notify.notify_one();
    }

    /// Next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock");
                if let Some(frame) = inner.buf.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().expect("queue lock").closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// State for one connected client.
pub struct ClientState {
    pub id: ClientId,
    pub instrument: Instrument,
    pub channels: Vec<Channel>,
    pub queue: SendQueue,
    pub last_pong: AtomicI64,
    /// Update id of the bootstrap snapshot; pub/sub DOM frames at or below
    /// it are seam duplicates and dropped.
    snapshot_update_id: AtomicI64,
}

impl ClientState {
    pub fn new(instrument: Instrument, channels: Vec<Channel>, queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument,
            channels,
            queue: SendQueue::new(queue_capacity),
            last_pong: AtomicI64::new(common::now_ms()),
            snapshot_update_id: AtomicI64::new(-1),
        }
    }

    pub fn set_snapshot_update_id(&self, update_id: u64) {
        self.snapshot_update_id
            .store(update_id as i64, Ordering::Relaxed);
    }

    /// Enqueue a DOM frame unless it is a seam duplicate of the bootstrap
    /// snapshot.
    pub fn push_dom(&self, update_id: u64, text: String) {
        let snapshot = self.snapshot_update_id.load(Ordering::Relaxed);
        if snapshot >= 0 && update_id as i64 <= snapshot {
            return;
        }
        self.queue.push(Frame::Dom { update_id, text });
    }

    pub fn push_data(&self, text: String) {
        self.queue.push(Frame::Data { text });
    }

    pub fn touch_pong(&self) {
        self.last_pong.store(common::now_ms(), Ordering::Relaxed);
    }

    pub fn last_pong_ms(&self) -> i64 {
        self.last_pong.load(Ordering::Relaxed)
    }
}

/// Registry of connected clients with a pub/sub-channel reverse index.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// Broker channel name -> subscribed client ids.
    index: DashMap<String, Vec<ClientId>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: Arc<ClientState>) {
        for channel in &client.channels {
            let name = channel.pubsub_channel(client.instrument.exchange, &client.instrument.symbol);
            self.index.entry(name).or_default().push(client.id);
        }
        self.clients.insert(client.id, client);
        metrics::gauge!("gateway_active_connections").set(self.clients.len() as f64);
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.queue.close();
            for channel in &client.channels {
                let name =
                    channel.pubsub_channel(client.instrument.exchange, &client.instrument.symbol);
                if let Some(mut ids) = self.index.get_mut(&name) {
                    ids.retain(|existing| existing != id);
                }
            }
        }
        metrics::gauge!("gateway_active_connections").set(self.clients.len() as f64);
    }

    /// Clients subscribed to a broker channel.
    pub fn subscribers(&self, channel: &str) -> Vec<Arc<ClientState>> {
        match self.index.get(channel) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.clients.get(id).map(|c| c.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::Exchange;

    fn data(i: usize) -> Frame {
        Frame::Data {
            text: format!("msg-{i}"),
        }
    }

    fn dom(update_id: u64) -> Frame {
        Frame::Dom {
            update_id,
            text: format!("dom-{update_id}"),
        }
    }

    #[test]
    fn test_queue_drops_oldest_data_to_low_water() {
        let queue = SendQueue::new(8);
        for i in 0..8 {
            queue.push(data(i));
        }
        assert_eq!(queue.len(), 8);

        queue.push(data(8));
        // Drained to low water (4) before the push.
        assert_eq!(queue.len(), 5);
        assert!(queue.dropped() >= 4);
    }

    #[test]
    fn test_newest_dom_supersedes_queued_dom() {
        let queue = SendQueue::new(8);
        queue.push(dom(1));
        queue.push(data(0));
        queue.push(dom(2));
        let frames: Vec<Frame> = std::iter::from_fn(|| {
            let mut inner = queue.inner.lock().unwrap();
            inner.buf.pop_front()
        })
        .collect();
        assert_eq!(
            frames,
            vec![data(0), dom(2)],
            "older dom replaced, newest appended"
        );
    }

    #[test]
    fn test_dom_survives_overflow_purge() {
        let queue = SendQueue::new(4);
        queue.push(dom(7));
        for i in 0..3 {
            queue.push(data(i));
        }
        assert_eq!(queue.len(), 4);
        queue.push(data(99));
        let mut inner = queue.inner.lock().unwrap();
        assert!(inner
            .buf
            .iter()
            .any(|f| matches!(f, Frame::Dom { update_id: 7, .. })));
        inner.buf.clear();
    }

    #[tokio::test]
    async fn test_pop_after_close_drains_then_ends() {
        let queue = SendQueue::new(4);
        queue.push(data(1));
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn test_seam_duplicate_dropped() {
        let client = ClientState::new(
            Instrument::new(Exchange::Bybit, "BTCUSDT"),
            vec![Channel::OrderbookRealtime],
            16,
        );
        client.set_snapshot_update_id(10);
        client.push_dom(9, "old".to_string());
        client.push_dom(10, "same".to_string());
        assert!(client.queue.is_empty());
        client.push_dom(11, "new".to_string());
        assert_eq!(client.queue.len(), 1);
    }

    #[test]
    fn test_registry_routing() {
        let registry = ClientRegistry::new();
        let client = Arc::new(ClientState::new(
            Instrument::new(Exchange::Bybit, "BTCUSDT"),
            vec![Channel::OrderbookRealtime, Channel::TradesRealtime],
            16,
        ));
        registry.register(client.clone());

        assert_eq!(registry.subscribers("dom:bybit:BTCUSDT").len(), 1);
        assert_eq!(registry.subscribers("trades:bybit:BTCUSDT").len(), 1);
        assert!(registry.subscribers("kline:bybit:BTCUSDT").is_empty());

        registry.unregister(&client.id);
        assert!(registry.subscribers("dom:bybit:BTCUSDT").is_empty());
    }
}
