//! Broadcast topics with slow-consumer tolerance.
//!
//! Each topic runs a dedicated fan-out task. Subscribers are bounded
//! queues registered dynamically; when a subscriber's queue is full the
//! message is dropped for that subscriber only, so a stalled `peek_*`
//! client can never stall the publisher. Closed queues are deregistered.

use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

const PUBLISH_QUEUE_CAPACITY: usize = 64;
const SUBSCRIBE_QUEUE_CAPACITY: usize = 8;

/// A broadcast topic.
///
/// Cheap to clone; all clones publish into, and subscribe through, the same
/// fan-out task.
#[derive(Clone)]
pub struct Topic<T> {
    name: &'static str,
    publish_tx: mpsc::Sender<T>,
    subscribe_tx: mpsc::Sender<mpsc::Sender<T>>,
}

impl<T> Topic<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a topic and spawns its fan-out task.
    pub fn spawn(name: &'static str) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(SUBSCRIBE_QUEUE_CAPACITY);

        tokio::spawn(run_fan_out(name, publish_rx, subscribe_rx));

        Self {
            name,
            publish_tx,
            subscribe_tx,
        }
    }

    /// Publishes a message to all current subscribers.
    pub async fn publish(&self, message: T) {
        if self.publish_tx.send(message).await.is_err() {
            trace!(topic = self.name, "Fan-out task gone. Dropping message.");
        }
    }

    /// Registers a new subscriber with the given queue capacity.
    ///
    /// The subscription lasts until the returned receiver is dropped.
    pub async fn subscribe(&self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity);
        if self.subscribe_tx.send(tx).await.is_err() {
            trace!(topic = self.name, "Fan-out task gone. Subscription is inert.");
        }
        rx
    }
}

async fn run_fan_out<T>(
    name: &'static str, mut publish_rx: mpsc::Receiver<T>, mut subscribe_rx: mpsc::Receiver<mpsc::Sender<T>>,
) where
    T: Clone + Send + 'static,
{
    let mut subscribers: Vec<mpsc::Sender<T>> = Vec::new();

    loop {
        select! {
            // Registrations first, so a subscriber never misses a message
            // published after its subscription completed.
            biased;

            maybe_subscriber = subscribe_rx.recv() => match maybe_subscriber {
                Some(subscriber) => subscribers.push(subscriber),
                None => break,
            },
            maybe_message = publish_rx.recv() => match maybe_message {
                Some(message) => {
                    subscribers.retain(|subscriber| match subscriber.try_send(message.clone()) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => {
                            trace!(topic = name, "Subscriber queue full. Dropping message for it.");
                            true
                        }
                        Err(TrySendError::Closed(_)) => false,
                    });
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let topic = Topic::spawn("test");
        let mut first = topic.subscribe(4).await;
        let mut second = topic.subscribe(4).await;

        topic.publish("hello".to_string()).await;

        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn full_subscriber_drops_messages_but_stays_registered() {
        let topic = Topic::spawn("test");
        let mut slow = topic.subscribe(1).await;
        let mut fast = topic.subscribe(16).await;

        // Fill the slow subscriber's queue, then keep publishing.
        for i in 0..4u32 {
            topic.publish(i).await;
        }
        // The fast subscriber sees everything.
        for i in 0..4u32 {
            assert_eq!(fast.recv().await.unwrap(), i);
        }
        // The slow subscriber only got the first message, but is still live.
        assert_eq!(slow.recv().await.unwrap(), 0);

        topic.publish(99).await;
        assert_eq!(slow.recv().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn closed_subscribers_are_deregistered() {
        let topic = Topic::spawn("test");
        let first = topic.subscribe(4).await;
        let mut second = topic.subscribe(4).await;

        drop(first);

        topic.publish(1u32).await;
        topic.publish(2u32).await;
        assert_eq!(second.recv().await.unwrap(), 1);
        assert_eq!(second.recv().await.unwrap(), 2);
    }
}
