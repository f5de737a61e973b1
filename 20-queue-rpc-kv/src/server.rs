//! The RPC server: one intake loop feeding a bounded set of workers.
//!
//! The intake loop takes requests off [`SERVER_QUEUE`] one at a time and
//! acquires a permit from a semaphore of `concurrency` permits before it
//! accepts the next one. Each accepted request runs in its own task that
//! owns the permit until its reply has been published, so at most
//! `concurrency` requests are in flight and a full pool stalls intake.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use tokio::{
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::sleep,
};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    bus::{Delivery, DeliveryStream, MessageBus, QueueOptions, SERVER_QUEUE},
    command::{Command, KeyValuePair, Reply, Request},
    store::KvStore,
};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of requests processed at the same time.
    pub concurrency: usize,
    /// Artificial latency added to every request before it touches the store.
    pub delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            delay: Duration::ZERO,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.concurrency >= 1, "concurrency must be at least 1");
        ensure!(
            u32::try_from(self.concurrency).is_ok(),
            "concurrency {} is too large",
            self.concurrency
        );
        Ok(())
    }
}

pub struct RpcServer<B: MessageBus> {
    bus: B,
    requests: B::Subscription,
    store: Arc<KvStore>,
    permits: Arc<Semaphore>,
    config: ServerConfig,
}

impl<B: MessageBus> RpcServer<B> {
    /// Declares the durable request queue and subscribes to it.
    ///
    /// Failing to do either is fatal: the server cannot serve anything
    /// without its queue.
    pub async fn start(bus: B, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        bus.declare_queue(Some(SERVER_QUEUE), QueueOptions::durable())
            .await
            .context("failed to declare request queue")?;
        let requests = bus
            .consume(SERVER_QUEUE)
            .await
            .context("failed to consume request queue")?;

        Ok(Self {
            bus,
            requests,
            store: Arc::new(KvStore::new()),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
        })
    }

    /// The store requests are applied to.
    pub fn store(&self) -> Arc<KvStore> {
        Arc::clone(&self.store)
    }

    /// Serves requests until `shutdown` resolves or the request queue goes
    /// away, then unsubscribes and waits for in-flight workers to finish.
    ///
    /// A request that has already been taken off the queue is always
    /// dispatched, even if that means waiting for a permit after shutdown
    /// was requested. Requests published while the workers drain stay on
    /// the queue for other consumers.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer {
            bus,
            mut requests,
            store,
            permits,
            config,
        } = self;
        tokio::pin!(shutdown);

        info!(
            queue = SERVER_QUEUE,
            concurrency = config.concurrency,
            delay = ?config.delay,
            "waiting for requests"
        );

        loop {
            let delivery = select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                delivery = requests.next() => delivery,
            };
            let Some(delivery) = delivery else {
                warn!("request queue closed");
                break;
            };
            let Some(job) = Job::accept(delivery) else {
                continue;
            };

            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .context("worker permits closed")?;
            spawn_worker(bus.clone(), Arc::clone(&store), config.delay, job, permit);
        }

        // Stop intake before draining so an outstanding fetch goes back to
        // the broker instead of pulling a request nobody will dispatch.
        drop(requests);

        // Every permit back in the pool means every worker has replied.
        let all = config.concurrency as u32;
        let _drained = permits
            .acquire_many(all)
            .await
            .context("worker permits closed")?;
        debug!("all workers finished");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// An accepted request waiting for a worker.
struct Job {
    command: Command,
    correlation_id: Option<String>,
    reply_to: Option<String>,
}

impl Job {
    /// Decodes a delivery. Undecodable bodies and unknown command kinds are
    /// logged and yield `None`; they never get a reply.
    fn accept(delivery: Delivery) -> Option<Self> {
        let Delivery {
            body,
            correlation_id,
            reply_to,
        } = delivery;

        let request = match Request::decode(&body) {
            Ok(request) => request,
            Err(err) => {
                warn!(?correlation_id, error = ?err, "discarding undecodable request");
                return None;
            }
        };
        match Command::try_from(request) {
            Ok(command) => Some(Self {
                command,
                correlation_id,
                reply_to,
            }),
            Err(err) => {
                error!(?correlation_id, error = %err, "unknown command");
                None
            }
        }
    }
}

fn spawn_worker<B: MessageBus>(
    bus: B,
    store: Arc<KvStore>,
    delay: Duration,
    job: Job,
    permit: OwnedSemaphorePermit,
) {
    let span = info_span!(
        "request",
        kind = job.command.kind(),
        correlation_id = job.correlation_id.as_deref().unwrap_or("-"),
    );

    tokio::spawn(
        async move {
            let _permit = permit;
            if !delay.is_zero() {
                sleep(delay).await;
            }

            info!(command = %job.command, "processing");
            let reply = execute(&store, job.command);
            info!(?reply, "processed");

            if let Err(err) = publish_reply(&bus, job.reply_to, job.correlation_id, &reply).await {
                error!(error = ?err, "failed to publish reply");
            }
        }
        .instrument(span),
    );
}

/// Applies `command` to `store` and builds the matching reply.
pub fn execute(store: &KvStore, command: Command) -> Reply {
    match command {
        Command::Add { key, value } => {
            store.set(key, value);
            Reply::Add { success: true }
        }
        Command::Remove { key } => {
            store.delete(&key);
            Reply::Remove { success: true }
        }
        Command::Get { key } => match store.get(&key) {
            Some(value) => Reply::Get {
                success: true,
                value,
            },
            None => Reply::Get {
                success: false,
                value: String::new(),
            },
        },
        Command::GetAll => Reply::GetAll {
            items: store
                .list_all()
                .into_iter()
                .map(|(key, value)| KeyValuePair { key, value })
                .collect(),
        },
    }
}

async fn publish_reply<B: MessageBus>(
    bus: &B,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    reply: &Reply,
) -> Result<()> {
    let Some(reply_to) = reply_to else {
        warn!("request carried no reply destination, reply dropped");
        return Ok(());
    };

    let mut delivery = Delivery::new(reply.encode()?);
    delivery.correlation_id = correlation_id;
    bus.publish(&reply_to, delivery)
        .await
        .with_context(|| format!("failed to publish reply to '{reply_to}'"))
}
