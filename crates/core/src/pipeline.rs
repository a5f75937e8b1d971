//! In-process publish/subscribe fan-out with bounded per-subscriber queues
//! and non-blocking publish.
//!
//! The subscriber map is read-locked to snapshot sender handles for the
//! publish path (so publishing never blocks behind a writer), and
//! write-locked only when a subscriber is added or evicted — the same
//! split the browser-facing signaling fan-out in the server crate uses for
//! its channel registry, generalized from `broadcast` (which lags the
//! whole subscriber) to per-subscriber bounded `mpsc` (which drops into
//! just that subscriber, per the backpressure contract here).

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct VideoSample {
    pub data: Bytes,
    pub is_key: bool,
    pub pts_us: i64,
}

#[derive(Debug, Clone)]
pub struct AudioSample {
    pub data: Bytes,
    pub pts_us: i64,
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_subscriber_id() -> u64 {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A typed sample pipeline: fixed-size per-subscriber queues, publisher
/// never blocks.
pub struct SamplePipeline<T> {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<T>>>,
    queue_depth: usize,
}

impl<T: Clone + Send + 'static> SamplePipeline<T> {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_depth,
        }
    }

    pub async fn subscribe(&self, id: u64) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.write().await.insert(id, tx);
        rx
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    /// Publish to every live subscriber without blocking. A full queue
    /// drops that subscriber's copy of this sample; it is not evicted for
    /// a single drop, only once its sender is actually closed.
    pub async fn publish(&self, sample: T) {
        let snapshot: Vec<(u64, mpsc::Sender<T>)> = {
            let subs = self.subscribers.read().await;
            subs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(sample.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

/// A raw-byte broadcaster with an optional cached initialization segment
/// (fMP4 `ftyp+moov`, or a WebM header) replayed to every new subscriber.
pub struct ByteBroadcaster {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Bytes>>>,
    init_segment: RwLock<Option<Bytes>>,
    queue_depth: usize,
}

impl ByteBroadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            init_segment: RwLock::new(None),
            queue_depth,
        }
    }

    pub async fn set_init_segment(&self, data: Bytes) {
        *self.init_segment.write().await = Some(data);
    }

    /// New subscribers get the cached init segment queued immediately,
    /// best-effort (dropped silently if the fresh queue is somehow already
    /// full — it never is in practice, since the queue was just created).
    pub async fn subscribe(&self, id: u64) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        if let Some(init) = self.init_segment.read().await.clone() {
            let _ = tx.try_send(init);
        }
        self.subscribers.write().await.insert(id, tx);
        rx
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.remove(&id);
    }

    pub async fn broadcast(&self, data: Bytes) {
        let snapshot: Vec<(u64, mpsc::Sender<Bytes>)> = {
            let subs = self.subscribers.read().await;
            subs.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(data.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

pub type SharedSamplePipeline<T> = Arc<SamplePipeline<T>>;
pub type SharedByteBroadcaster = Arc<ByteBroadcaster>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let pipeline = SamplePipeline::<VideoSample>::new(4);
        let id = next_subscriber_id();
        let mut rx = pipeline.subscribe(id).await;

        pipeline
            .publish(VideoSample {
                data: Bytes::from_static(b"frame"),
                is_key: true,
                pts_us: 1000,
            })
            .await;

        let sample = rx.recv().await.unwrap();
        assert!(sample.is_key);
        assert_eq!(sample.pts_us, 1000);
    }

    #[tokio::test]
    async fn publish_never_blocks_on_full_queue() {
        let pipeline = SamplePipeline::<VideoSample>::new(1);
        let id = next_subscriber_id();
        let _rx = pipeline.subscribe(id).await; // hold receiver, never drain

        for i in 0..10 {
            pipeline
                .publish(VideoSample {
                    data: Bytes::new(),
                    is_key: false,
                    pts_us: i,
                })
                .await;
        }
        // If publish blocked, this test would hang instead of reaching here.
        assert_eq!(pipeline.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn dropping_receiver_evicts_subscriber_on_next_publish() {
        let pipeline = SamplePipeline::<AudioSample>::new(4);
        let id = next_subscriber_id();
        let rx = pipeline.subscribe(id).await;
        drop(rx);

        pipeline
            .publish(AudioSample {
                data: Bytes::new(),
                pts_us: 0,
            })
            .await;

        assert_eq!(pipeline.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn byte_broadcaster_replays_init_segment_to_new_subscribers() {
        let broadcaster = ByteBroadcaster::new(4);
        broadcaster.set_init_segment(Bytes::from_static(b"ftyp+moov")).await;

        let id = next_subscriber_id();
        let mut rx = broadcaster.subscribe(id).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"ftyp+moov");
    }

    #[tokio::test]
    async fn byte_broadcaster_without_init_segment_subscribes_empty() {
        let broadcaster = ByteBroadcaster::new(4);
        let id = next_subscriber_id();
        let mut rx = broadcaster.subscribe(id).await;

        broadcaster.broadcast(Bytes::from_static(b"fragment")).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"fragment");
    }
}
