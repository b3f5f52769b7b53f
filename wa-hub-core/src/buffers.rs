//! OutboundQueue / InboundBuffer: bounded in-memory FIFOs, system-mode aware.
//!
//! Inbound drains as batches with an inter-batch delay; outbound drains
//! sequentially with an inter-item delay. Both expire stale entries by TTL
//! rather than growing unbounded while the system is SYNCING.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;
use wa_hub_model::InstanceId;

/// One deferred action, queued while its instance wasn't READY. Accepted
/// with a stable id that the caller can later poll.
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub action: Value,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct OutboundQueue {
    capacity: usize,
    ttl: chrono::Duration,
    inter_item_delay: Duration,
    items: Mutex<VecDeque<OutboundItem>>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, ttl: Duration, inter_item_delay: Duration) -> Self {
        Self {
            capacity,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
            inter_item_delay,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns `None` if the buffer is at capacity.
    pub fn enqueue(&self, instance_id: InstanceId, action: Value) -> Option<Uuid> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return None;
        }
        let now = Utc::now();
        let id = Uuid::now_v7();
        items.push_back(OutboundItem {
            id,
            instance_id,
            action,
            enqueued_at: now,
            expires_at: now + self.ttl,
        });
        Some(id)
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        self.items.lock().retain(|item| item.expires_at > now);
    }

    /// Drain every non-expired item through `handler`, waiting
    /// `inter_item_delay` between calls.
    pub async fn drain<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(OutboundItem) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        self.sweep_expired();
        loop {
            let next = self.items.lock().pop_front();
            let Some(item) = next else { break };
            handler(item).await;
            tokio::time::sleep(self.inter_item_delay).await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One observed driver event (`message` / `vote_update`), buffered while the
/// system is SYNCING.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub instance_id: InstanceId,
    pub event: &'static str,
    pub data: Value,
}

pub struct InboundBuffer {
    capacity: usize,
    batch_size: usize,
    inter_batch_delay: Duration,
    items: Mutex<VecDeque<InboundEvent>>,
}

impl InboundBuffer {
    pub fn new(capacity: usize, batch_size: usize, inter_batch_delay: Duration) -> Self {
        Self {
            capacity,
            batch_size: batch_size.max(1),
            inter_batch_delay,
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Buffer one inbound event. Drops the oldest entry and logs a warning
    /// if the buffer is already full rather than rejecting silently — unlike
    /// the outbound queue, there's no caller waiting on a response to push
    /// a 429 back to.
    pub fn push(&self, item: InboundEvent) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            warn!(instance = %item.instance_id, "inbound buffer full, dropping oldest buffered event");
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Flush in batches of `batch_size`, waiting `inter_batch_delay` between
    /// batches.
    pub async fn flush<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(Vec<InboundEvent>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            let batch: Vec<InboundEvent> = {
                let mut items = self.items.lock();
                if items.is_empty() {
                    break;
                }
                let take = self.batch_size.min(items.len());
                items.drain(..take).collect()
            };
            handler(batch).await;
            tokio::time::sleep(self.inter_batch_delay).await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iid() -> InstanceId {
        InstanceId::parse("inst").unwrap()
    }

    #[test]
    fn outbound_rejects_past_capacity() {
        let q = OutboundQueue::new(1, Duration::from_secs(60), Duration::from_millis(1));
        assert!(q.enqueue(iid(), serde_json::json!({})).is_some());
        assert!(q.enqueue(iid(), serde_json::json!({})).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_drains_in_order() {
        let q = OutboundQueue::new(10, Duration::from_secs(60), Duration::from_millis(1));
        q.enqueue(iid(), serde_json::json!({"n": 1})).unwrap();
        q.enqueue(iid(), serde_json::json!({"n": 2})).unwrap();

        let mut seen = Vec::new();
        q.drain(|item| {
            seen.push(item.action["n"].as_i64().unwrap());
            async {}
        })
        .await;
        assert_eq!(seen, vec![1, 2]);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_flushes_in_batches() {
        let buf = InboundBuffer::new(10, 2, Duration::from_millis(1));
        for n in 0..5 {
            buf.push(InboundEvent {
                instance_id: iid(),
                event: "message",
                data: serde_json::json!({ "n": n }),
            });
        }
        let mut batches = Vec::new();
        buf.flush(|batch| {
            batches.push(batch.len());
            async {}
        })
        .await;
        assert_eq!(batches, vec![2, 2, 1]);
    }
}
