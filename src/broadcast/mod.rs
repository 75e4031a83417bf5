use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

struct Table<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<T>>,
}

struct Inner<T> {
    table: Mutex<Table<T>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Table<T>> {
        // a panicking subscriber cannot leave the table half-written
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A multi-subscriber event channel. Cloning shares the same subscriber set.
///
/// Each subscriber owns an unbounded queue, so a slow consumer never stalls
/// the sender or its peers.
pub struct BroadcastChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for BroadcastChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Clone> Default for BroadcastChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BroadcastChannel<T> {
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl<T: Clone> BroadcastChannel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table {
                    next_id: 0,
                    subscribers: HashMap::new(),
                }),
            }),
        }
    }

    /// Register a new subscriber. It sees every element sent from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.subscribers.insert(id, tx);
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
            rx,
        }
    }

    /// Queue `element` for every current subscriber. Never waits on consumers.
    pub fn send(&self, element: T) {
        let mut table = self.inner.lock();
        // receivers dropped without cancel (e.g. leaked subscription) get pruned here
        table
            .subscribers
            .retain(|_, tx| tx.send(element.clone()).is_ok());
    }

    /// End every subscriber's stream and empty the table.
    pub fn finish(&self) {
        let drained = std::mem::take(&mut self.inner.lock().subscribers);
        tracing::debug!("broadcast finished, closing {} subscribers", drained.len());
        drop(drained);
    }
}

/// One subscriber's view of a [`BroadcastChannel`].
///
/// Ends (yields `None`) after `finish`, or once every handle to the channel
/// is dropped. Dropping the subscription unregisters it.
pub struct Subscription<T> {
    id: u64,
    channel: Weak<Inner<T>>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next element if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Takes effect for every later send.
    pub fn cancel(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.lock().subscribers.remove(&self.id);
        }
        self.channel = Weak::new();
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.lock().subscribers.remove(&self.id);
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn drain<T>(sub: &mut Subscription<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(v) = sub.try_recv() {
            out.push(v);
        }
        out
    }

    #[tokio::test]
    async fn every_live_subscriber_gets_each_element_once() {
        let channel = BroadcastChannel::new();
        let mut subs: Vec<_> = (0..3).map(|_| channel.subscribe()).collect();

        channel.send("e1");
        let mut late = channel.subscribe();

        for sub in &mut subs {
            assert_eq!(drain(sub), vec!["e1"]);
        }
        assert!(drain(&mut late).is_empty());
    }

    #[tokio::test]
    async fn cancelled_subscriber_removed_before_next_send() {
        let channel = BroadcastChannel::new();
        let mut s1 = channel.subscribe();
        let mut s2 = channel.subscribe();
        let mut s3 = channel.subscribe();

        channel.send(1);
        s2.cancel();
        assert_eq!(channel.subscriber_count(), 2);
        channel.send(2);

        assert_eq!(drain(&mut s1), vec![1, 2]);
        assert_eq!(drain(&mut s2), vec![1]);
        assert_eq!(drain(&mut s3), vec![1, 2]);
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let channel: BroadcastChannel<u8> = BroadcastChannel::new();
        let sub = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 1);
        drop(sub);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn finish_ends_all_streams() {
        let channel = BroadcastChannel::new();
        let a = channel.subscribe();
        let b = channel.subscribe();
        channel.send("x");
        channel.finish();
        assert_eq!(channel.subscriber_count(), 0);

        assert_eq!(a.collect::<Vec<_>>().await, vec!["x"]);
        assert_eq!(b.collect::<Vec<_>>().await, vec!["x"]);
    }

    #[tokio::test]
    async fn dropping_channel_terminates_waiting_subscriber() {
        let channel: BroadcastChannel<u32> = BroadcastChannel::new();
        let mut sub = channel.subscribe();

        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;
        drop(channel);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("subscriber left waiting")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_sender() {
        let channel = BroadcastChannel::new();
        let _slow = channel.subscribe();
        let mut fast = channel.subscribe();

        for i in 0..10_000 {
            channel.send(i);
        }
        assert_eq!(drain(&mut fast).len(), 10_000);
    }

    #[tokio::test]
    async fn order_preserved_per_subscriber() {
        let channel = BroadcastChannel::new();
        let sub = channel.subscribe();
        let sender = channel.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                sender.send(i);
            }
            sender.finish();
        })
        .await
        .unwrap();

        let received: Vec<i32> = sub.collect().await;
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrent_senders_reach_everyone() {
        let channel = BroadcastChannel::new();
        let mut subs: Vec<_> = (0..4).map(|_| channel.subscribe()).collect();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        channel.send(t * 100 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        for sub in &mut subs {
            assert_eq!(drain(sub).len(), 400);
        }
    }
}
