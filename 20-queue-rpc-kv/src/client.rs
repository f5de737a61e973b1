//! The RPC client: publish a request, then wait on a private reply queue for
//! the reply carrying the same correlation token.

use std::time::Duration;

use anyhow::{Context, Result};
use nanoid::nanoid;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    bus::{Delivery, DeliveryStream, MessageBus, QueueOptions, SERVER_QUEUE},
    command::{Command, Reply, Request},
};

const TOKEN_LEN: usize = 32;
const TOKEN_ALPHABET: [char; 26] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// How long a call waits for its reply. `None` waits forever.
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct RpcClient<B: MessageBus> {
    bus: B,
    config: ClientConfig,
}

impl<B: MessageBus> RpcClient<B> {
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, ClientConfig::default())
    }

    pub fn with_config(bus: B, config: ClientConfig) -> Self {
        Self { bus, config }
    }

    /// Sends `command` and waits for its reply.
    ///
    /// `Ok(None)` means no reply arrived: the deadline elapsed or the reply
    /// queue went away. Without a configured timeout a server that never
    /// answers blocks this call indefinitely.
    pub async fn call(&self, command: Command) -> Result<Option<Reply>> {
        self.send(command.to_request()).await
    }

    /// Like [`RpcClient::call`] but takes the raw wire record, whose kind
    /// the server may not know.
    pub async fn send(&self, request: Request) -> Result<Option<Reply>> {
        let reply_queue = self
            .bus
            .declare_queue(None, QueueOptions::exclusive())
            .await
            .context("failed to declare reply queue")?;
        let mut replies = self
            .bus
            .consume(&reply_queue)
            .await
            .context("failed to consume reply queue")?;

        let correlation_id = correlation_token();
        let delivery = Delivery::new(request.encode()?)
            .with_correlation_id(&correlation_id)
            .with_reply_to(&reply_queue);
        self.bus
            .publish(SERVER_QUEUE, delivery)
            .await
            .context("failed to publish request")?;
        debug!(%correlation_id, command = %request.command, "request published");

        let wait = await_reply(&mut replies, &correlation_id);
        let body = match self.config.timeout {
            Some(limit) => match timeout(limit, wait).await {
                Ok(body) => body,
                Err(_) => {
                    warn!(%correlation_id, ?limit, "no reply before deadline");
                    None
                }
            },
            None => wait.await,
        };

        body.map(|body| Reply::decode(&body)).transpose()
    }
}

/// Reads `replies` until a delivery tagged with `correlation_id` shows up.
async fn await_reply<S: DeliveryStream>(replies: &mut S, correlation_id: &str) -> Option<Vec<u8>> {
    while let Some(delivery) = replies.next().await {
        if delivery.correlation_id.as_deref() == Some(correlation_id) {
            return Some(delivery.body);
        }
        debug!(
            expected = correlation_id,
            received = ?delivery.correlation_id,
            "discarding reply for another call"
        );
    }
    None
}

pub fn correlation_token() -> String {
    nanoid!(TOKEN_LEN, &TOKEN_ALPHABET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;

    #[test]
    fn tokens_are_upper_case_and_fixed_length() {
        let token = correlation_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_uppercase()));
        assert_ne!(token, correlation_token());
    }

    /// Answers the first request twice: once with a foreign token, then
    /// with the right one.
    async fn answer_with_a_stray_reply_first(broker: Broker) {
        let bus = broker.connect();
        bus.declare_queue(Some(SERVER_QUEUE), QueueOptions::durable())
            .await
            .expect("declare server queue");
        let mut requests = bus.consume(SERVER_QUEUE).await.expect("consume");

        let request = requests.next().await.expect("request delivery");
        let reply_to = request.reply_to.expect("reply_to set");
        let correlation_id = request.correlation_id.expect("correlation id set");

        let stray = Reply::Get {
            success: true,
            value: "wrong".into(),
        };
        let right = Reply::Get {
            success: true,
            value: "right".into(),
        };
        bus.publish(
            &reply_to,
            Delivery::new(stray.encode().expect("encode")).with_correlation_id("SOMEONEELSE"),
        )
        .await
        .expect("publish stray");
        bus.publish(
            &reply_to,
            Delivery::new(right.encode().expect("encode")).with_correlation_id(correlation_id),
        )
        .await
        .expect("publish right");
    }

    #[tokio::test]
    async fn mismatched_replies_are_discarded() {
        let broker = Broker::new();
        // Declare first so the request is not published into the void.
        broker
            .connect()
            .declare_queue(Some(SERVER_QUEUE), QueueOptions::durable())
            .await
            .expect("declare");
        let responder = tokio::spawn(answer_with_a_stray_reply_first(broker.clone()));

        let client = RpcClient::new(broker.connect());
        let reply = client
            .call(Command::Get { key: "k".into() })
            .await
            .expect("call")
            .expect("reply");

        assert_eq!(
            reply,
            Reply::Get {
                success: true,
                value: "right".into()
            }
        );
        responder.await.expect("responder task");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_no_response_and_drops_reply_queue() {
        let broker = Broker::new();
        broker
            .connect()
            .declare_queue(Some(SERVER_QUEUE), QueueOptions::durable())
            .await
            .expect("declare");
        let config = ClientConfig {
            timeout: Some(Duration::from_secs(5)),
        };
        let client = RpcClient::with_config(broker.connect(), config);

        let reply = client.call(Command::GetAll).await.expect("call");
        assert_eq!(reply, None);
        // Only the server queue is left; the exclusive reply queue is gone.
        assert_eq!(broker.queue_count(), 1);
    }
}
