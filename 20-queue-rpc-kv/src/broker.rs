use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Result, bail};
use nanoid::nanoid;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

use crate::bus::{Delivery, DeliveryStream, MessageBus, QueueOptions};

type ConnectionId = u64;
type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Delivery>>>;

/// In-process message broker holding every declared queue.
///
/// Cloning shares the same queues. Producers and consumers talk to it through
/// a [`LocalBus`] obtained from [`Broker::connect`]; each bus is one
/// connection as far as exclusive queues are concerned.
#[derive(Clone)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState::new()),
        }
    }

    pub fn connect(&self) -> LocalBus {
        LocalBus {
            state: Arc::clone(&self.state),
            connection: self.state.next_id(),
        }
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues().contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.state.queues().len()
    }
}

struct BrokerState {
    queues: Mutex<HashMap<String, QueueRecord>>,
    next_id: AtomicU64,
}

struct QueueRecord {
    options: QueueOptions,
    owner: Option<ConnectionId>,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: SharedReceiver,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueRecord>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn declare(
        &self,
        connection: ConnectionId,
        name: Option<&str>,
        options: QueueOptions,
    ) -> Result<String> {
        let mut queues = self.queues();

        let name = match name.filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => loop {
                let candidate = format!("amq.gen-{}", nanoid!());
                if !queues.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if let Some(existing) = queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                bail!("queue '{name}' is exclusive to another connection");
            }
            if existing.options != options {
                bail!("queue '{name}' already declared with different options");
            }
            return Ok(name);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queues.insert(
            name.clone(),
            QueueRecord {
                options,
                owner: options.exclusive.then_some(connection),
                sender,
                receiver: Arc::new(AsyncMutex::new(receiver)),
            },
        );
        debug!(queue = %name, ?options, "queue declared");
        Ok(name)
    }

    fn publish(&self, queue: &str, delivery: Delivery) {
        let queues = self.queues();
        match queues.get(queue) {
            Some(record) => {
                if record.sender.send(delivery).is_err() {
                    debug!(%queue, "queue receiver gone, delivery dropped");
                }
            }
            None => debug!(%queue, "no such queue, delivery dropped"),
        }
    }

    fn consume(&self, connection: ConnectionId, queue: &str) -> Result<SharedReceiver> {
        let queues = self.queues();
        let Some(record) = queues.get(queue) else {
            bail!("no queue named '{queue}'");
        };
        if record.owner.is_some_and(|owner| owner != connection) {
            bail!("queue '{queue}' is exclusive to another connection");
        }
        Ok(Arc::clone(&record.receiver))
    }

    fn delete_owned(&self, connection: ConnectionId, queue: &str) {
        let mut queues = self.queues();
        if queues
            .get(queue)
            .is_some_and(|record| record.owner == Some(connection))
        {
            queues.remove(queue);
            debug!(%queue, "exclusive queue deleted");
        }
    }

    fn release_connection(&self, connection: ConnectionId) {
        self.queues()
            .retain(|_, record| record.owner != Some(connection));
    }
}

/// One connection to a [`Broker`].
///
/// Clones share the connection identity, so an exclusive queue declared
/// through one clone may be consumed through another.
#[derive(Clone)]
pub struct LocalBus {
    state: Arc<BrokerState>,
    connection: ConnectionId,
}

impl LocalBus {
    /// Deletes every exclusive queue this connection declared.
    pub fn release(&self) {
        self.state.release_connection(self.connection);
    }
}

impl MessageBus for LocalBus {
    type Subscription = LocalSubscription;

    async fn declare_queue(&self, name: Option<&str>, options: QueueOptions) -> Result<String> {
        self.state.declare(self.connection, name, options)
    }

    async fn publish(&self, queue: &str, delivery: Delivery) -> Result<()> {
        self.state.publish(queue, delivery);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<LocalSubscription> {
        let receiver = self.state.consume(self.connection, queue)?;
        Ok(LocalSubscription {
            receiver,
            queue: queue.to_string(),
            owner: Arc::clone(&self.state),
            connection: self.connection,
        })
    }
}

/// Subscription to a broker queue. Subscriptions on the same queue compete
/// for deliveries.
///
/// Dropping a subscription to an exclusive queue deletes that queue.
pub struct LocalSubscription {
    receiver: SharedReceiver,
    queue: String,
    owner: Arc<BrokerState>,
    connection: ConnectionId,
}

impl DeliveryStream for LocalSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.receiver.lock().await.recv().await
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.owner.delete_owned(self.connection, &self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redeclare_with_same_options_is_idempotent() {
        let broker = Broker::new();
        let bus = broker.connect();
        let first = bus
            .declare_queue(Some("jobs"), QueueOptions::durable())
            .await
            .expect("first declare");
        let second = broker
            .connect()
            .declare_queue(Some("jobs"), QueueOptions::durable())
            .await
            .expect("second declare");

        assert_eq!(first, "jobs");
        assert_eq!(second, "jobs");
        assert_eq!(broker.queue_count(), 1);
    }

    #[tokio::test]
    async fn redeclare_with_other_options_fails() {
        let broker = Broker::new();
        let bus = broker.connect();
        bus.declare_queue(Some("jobs"), QueueOptions::durable())
            .await
            .expect("declare");
        let result = bus.declare_queue(Some("jobs"), QueueOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn generated_names_are_unique() {
        let broker = Broker::new();
        let bus = broker.connect();
        let a = bus
            .declare_queue(None, QueueOptions::exclusive())
            .await
            .expect("declare a");
        let b = bus
            .declare_queue(Some(""), QueueOptions::exclusive())
            .await
            .expect("declare b");

        assert!(a.starts_with("amq.gen-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn exclusive_queue_rejects_other_connections() {
        let broker = Broker::new();
        let owner = broker.connect();
        let intruder = broker.connect();
        let name = owner
            .declare_queue(None, QueueOptions::exclusive())
            .await
            .expect("declare");

        assert!(intruder.consume(&name).await.is_err());
        assert!(
            intruder
                .declare_queue(Some(&name), QueueOptions::exclusive())
                .await
                .is_err()
        );
        // Publishing to someone else's reply queue is how RPC replies work.
        intruder
            .publish(&name, Delivery::new(b"hi".to_vec()))
            .await
            .expect("publish");
        let mut sub = owner.consume(&name).await.expect("owner consumes");
        assert_eq!(sub.next().await.expect("delivery").body, b"hi");
    }

    #[tokio::test]
    async fn dropping_exclusive_subscription_deletes_queue() {
        let broker = Broker::new();
        let bus = broker.connect();
        let name = bus
            .declare_queue(None, QueueOptions::exclusive())
            .await
            .expect("declare");
        let sub = bus.consume(&name).await.expect("consume");
        assert!(broker.has_queue(&name));

        drop(sub);
        assert!(!broker.has_queue(&name));
    }

    #[tokio::test]
    async fn release_drops_only_own_exclusive_queues() {
        let broker = Broker::new();
        let a = broker.connect();
        let b = broker.connect();
        a.declare_queue(Some("shared"), QueueOptions::durable())
            .await
            .expect("declare shared");
        let mine = a
            .declare_queue(None, QueueOptions::exclusive())
            .await
            .expect("declare mine");
        let theirs = b
            .declare_queue(None, QueueOptions::exclusive())
            .await
            .expect("declare theirs");

        a.release();
        assert!(broker.has_queue("shared"));
        assert!(!broker.has_queue(&mine));
        assert!(broker.has_queue(&theirs));
    }

    #[tokio::test]
    async fn publish_to_missing_queue_is_dropped() {
        let bus = Broker::new().connect();
        bus.publish("nowhere", Delivery::new(vec![1, 2, 3]))
            .await
            .expect("unroutable publish is not an error");
    }

    #[tokio::test]
    async fn competing_consumers_split_deliveries() {
        let broker = Broker::new();
        let bus = broker.connect();
        bus.declare_queue(Some("jobs"), QueueOptions::durable())
            .await
            .expect("declare");
        let mut first = bus.consume("jobs").await.expect("first consumer");
        let mut second = bus.consume("jobs").await.expect("second consumer");

        for n in 0..2u8 {
            bus.publish("jobs", Delivery::new(vec![n]))
                .await
                .expect("publish");
        }

        let a = first.next().await.expect("first delivery");
        let b = second.next().await.expect("second delivery");
        assert_eq!(a.body, vec![0]);
        assert_eq!(b.body, vec![1]);
    }
}
