//! Per-session output fan-out.
//!
//! One producer (the session's event task) publishes chunks; any number of
//! consumers attach and receive them in production order. Each subscriber
//! has its own bounded queue, so a slow or vanished consumer never holds
//! up the producer or its siblings. A subscriber whose queue overflows is
//! cut off: its [`Subscription::recv`] drains what was queued, then yields
//! `None` without an [`OutputEvent::End`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Chunks a subscriber may have queued before it is cut off.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// What a subscriber observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Chunk(Arc<[u8]>),
    /// The process exited; nothing follows.
    End,
}

struct Subscribers {
    senders: HashMap<u64, mpsc::Sender<OutputEvent>>,
    queue_capacity: usize,
    next_id: u64,
    finished: bool,
}

/// Fan-out point for one session's output.
pub struct Broadcaster {
    inner: Arc<Mutex<Subscribers>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::with_queue_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broadcaster whose subscribers may fall `capacity` chunks behind.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscribers {
                senders: HashMap::new(),
                queue_capacity: capacity.max(1),
                next_id: 0,
                finished: false,
            })),
        }
    }

    /// Register a new subscriber for every subsequent event.
    ///
    /// Attaching after [`finish`](Self::finish) yields a subscription whose
    /// only event is [`OutputEvent::End`].
    pub fn attach(&self) -> Subscription {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::channel(inner.queue_capacity);
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.finished {
            let _ = tx.try_send(OutputEvent::End);
        } else {
            inner.senders.insert(id, tx);
        }
        trace!(subscriber = id, active = inner.senders.len(), "subscriber attached");
        Subscription {
            id,
            rx,
            owner: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Deliver a chunk to every attached subscriber.
    ///
    /// Subscribers whose receiving side is gone, or whose queue is full,
    /// are dropped here.
    pub fn publish(&self, chunk: Arc<[u8]>) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        inner
            .senders
            .retain(|id, tx| match tx.try_send(OutputEvent::Chunk(chunk.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber fell behind, cutting it off");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subscriber = id, "subscriber gone, detaching");
                    false
                }
            });
    }

    /// Send end-of-stream to everyone and refuse further chunks.
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finished = true;
        for (_, tx) in inner.senders.drain() {
            let _ = tx.try_send(OutputEvent::End);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }
}

/// A consumer's handle on a [`Broadcaster`]. Detaches on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<OutputEvent>,
    owner: Weak<Mutex<Subscribers>>,
    detached: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once detached or the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        if self.detached {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop receiving. Idempotent, and safe after the stream has ended.
    ///
    /// Once this returns, [`recv`](Self::recv) yields nothing more, even
    /// for chunks that were queued before the call.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.lock().senders.remove(&self.id);
        }
        self.rx.close();
        trace!(subscriber = self.id, "subscriber detached");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[u8]) -> Arc<[u8]> {
        Arc::from(data)
    }

    #[tokio::test]
    async fn delivers_in_order_to_every_subscriber() {
        let b = Broadcaster::new();
        let mut s1 = b.attach();
        let mut s2 = b.attach();
        b.publish(chunk(b"one"));
        b.publish(chunk(b"two"));
        b.finish();

        for sub in [&mut s1, &mut s2] {
            assert_eq!(sub.recv().await, Some(OutputEvent::Chunk(chunk(b"one"))));
            assert_eq!(sub.recv().await, Some(OutputEvent::Chunk(chunk(b"two"))));
            assert_eq!(sub.recv().await, Some(OutputEvent::End));
            assert_eq!(sub.recv().await, None);
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_chunks() {
        let b = Broadcaster::new();
        b.publish(chunk(b"early"));
        let mut sub = b.attach();
        b.publish(chunk(b"late"));
        assert_eq!(sub.recv().await, Some(OutputEvent::Chunk(chunk(b"late"))));
    }

    #[tokio::test]
    async fn no_delivery_after_detach() {
        let b = Broadcaster::new();
        let mut sub = b.attach();
        b.publish(chunk(b"queued"));
        sub.detach();
        sub.detach();
        b.publish(chunk(b"after"));
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn attach_after_finish_sees_only_end() {
        let b = Broadcaster::new();
        b.publish(chunk(b"x"));
        b.finish();
        let mut sub = b.attach();
        assert_eq!(sub.recv().await, Some(OutputEvent::End));
        sub.detach();
        assert!(b.is_finished());
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let b = Broadcaster::new();
        let dropped = b.attach();
        let mut kept = b.attach();
        drop(dropped);
        assert_eq!(b.subscriber_count(), 1);
        b.publish(chunk(b"still here"));
        assert_eq!(kept.recv().await, Some(OutputEvent::Chunk(chunk(b"still here"))));
    }

    #[tokio::test]
    async fn lagging_subscriber_is_cut_off_alone() {
        let b = Broadcaster::with_queue_capacity(2);
        let mut stalled = b.attach();
        let mut reader = b.attach();
        for data in [&b"a"[..], b"b", b"c"] {
            b.publish(chunk(data));
            assert_eq!(reader.recv().await, Some(OutputEvent::Chunk(chunk(data))));
        }
        assert_eq!(b.subscriber_count(), 1);

        assert_eq!(stalled.recv().await, Some(OutputEvent::Chunk(chunk(b"a"))));
        assert_eq!(stalled.recv().await, Some(OutputEvent::Chunk(chunk(b"b"))));
        assert_eq!(stalled.recv().await, None);

        b.finish();
        assert_eq!(reader.recv().await, Some(OutputEvent::End));
    }

    #[test]
    fn detach_after_broadcaster_dropped() {
        let b = Broadcaster::new();
        let mut sub = b.attach();
        drop(b);
        sub.detach();
    }
}
