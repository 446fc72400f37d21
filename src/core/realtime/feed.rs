//! Notification feeds exposed by the session.
//!
//! A [`Feed`] is a multi-subscriber broadcast channel. Every subscriber sees
//! each value published after it subscribed. Finishing a feed ends every
//! subscriber's sequence; a finished feed can be reopened for the next
//! session run.

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Default number of buffered values per feed before slow subscribers lag.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

pub struct Feed<T: Clone + Send + 'static> {
    name: &'static str,
    capacity: usize,
    sender: RwLock<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            capacity: capacity.max(1),
            sender: RwLock::new(Some(sender)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Subscribe to values published from now on.
    ///
    /// Subscribing to a finished feed yields a subscription that ends
    /// immediately.
    pub fn subscribe(&self) -> FeedSubscription<T> {
        let receiver = match self.sender.read().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        };
        FeedSubscription {
            name: self.name,
            receiver,
        }
    }

    /// Publish a value to all current subscribers.
    ///
    /// Returns the number of subscribers that received it. Publishing with no
    /// subscribers, or after the feed finished, is not an error.
    pub fn publish(&self, value: T) -> usize {
        match self.sender.read().as_ref() {
            Some(sender) => sender.send(value).unwrap_or(0),
            None => 0,
        }
    }

    /// End every subscriber's sequence.
    pub fn finish(&self) {
        self.sender.write().take();
    }

    /// Reopen a finished feed. No-op on an open feed.
    pub fn reopen(&self) {
        let mut sender = self.sender.write();
        if sender.is_none() {
            let (tx, _) = broadcast::channel(self.capacity);
            *sender = Some(tx);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.sender.read().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// One subscriber's view of a [`Feed`].
pub struct FeedSubscription<T: Clone + Send + 'static> {
    name: &'static str,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> FeedSubscription<T> {
    /// Next value, or `None` once the feed finished.
    ///
    /// A subscriber that falls behind skips the values it missed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(feed = self.name, skipped, "Feed subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|value| (value, subscription))
        })
    }
}
