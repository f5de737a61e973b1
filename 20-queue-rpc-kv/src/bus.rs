//! The message-bus contract shared by the RPC server and client.
//!
//! Both ends only ever declare queues, publish deliveries, and pull
//! deliveries from a subscription. [`crate::broker::LocalBus`] serves this
//! in-process and [`crate::remote::RemoteBus`] serves it over TCP.

use std::future::Future;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Well-known queue the RPC server consumes requests from.
pub const SERVER_QUEUE: &str = "message-queue";

/// A message as carried by the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Delivery {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Flags a queue is declared with.
///
/// `durable` is recorded and must match on re-declaration but nothing is
/// persisted. An `exclusive` queue belongs to the connection that declared
/// it and is deleted once that connection stops consuming it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
        }
    }
}

/// Pull side of a queue. Each call to `next` hands out at most one delivery.
pub trait DeliveryStream: Send + 'static {
    /// Waits for the next delivery. `None` once the queue or the connection
    /// behind it is gone.
    fn next(&mut self) -> impl Future<Output = Option<Delivery>> + Send;
}

pub trait MessageBus: Clone + Send + Sync + 'static {
    type Subscription: DeliveryStream;

    /// Declares `name`, or a broker-generated name when `None`, and returns
    /// the queue's name.
    fn declare_queue(
        &self,
        name: Option<&str>,
        options: QueueOptions,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Publishes to `queue`. Deliveries for queues that do not exist are
    /// dropped without error.
    fn publish(&self, queue: &str, delivery: Delivery) -> impl Future<Output = Result<()>> + Send;

    fn consume(&self, queue: &str) -> impl Future<Output = Result<Self::Subscription>> + Send;
}
