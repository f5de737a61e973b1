//! TCP access to a [`Broker`].
//!
//! [`BrokerServer`] accepts connections and runs one session per peer.
//! [`RemoteBus`] is the client side of such a session and implements
//! [`MessageBus`], so the RPC server and client run unchanged over it.
//!
//! Deliveries are pulled: a subscription sends one `fetch` per delivery it
//! wants, so the broker never pushes more than one message ahead of a
//! consumer. A delivery that arrives after its subscription was dropped is
//! published back to its queue.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    broker::{Broker, LocalBus, LocalSubscription},
    bus::{Delivery, DeliveryStream, MessageBus, QueueOptions},
    frame::{BrokerFrame, ClientFrame, read_frame, write_frame},
};

pub struct BrokerServer {
    listener: TcpListener,
    broker: Broker,
}

impl BrokerServer {
    pub fn new(listener: TcpListener, broker: Broker) -> Self {
        Self { listener, broker }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let BrokerServer { listener, broker } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &broker);
                }
            }
        }

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

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, broker: &Broker) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, broker),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, broker: &Broker) {
    let bus = broker.connect();
    tokio::spawn(async move {
        debug!(%peer, "bus connection opened");
        if let Err(err) = handle_connection(stream, bus).await {
            warn!(%peer, error = ?err, "bus connection closed with error");
        } else {
            debug!(%peer, "bus connection closed");
        }
    });
}

async fn handle_connection(stream: TcpStream, bus: LocalBus) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(drain_outbox(writer, outbox_rx));

    let mut session = Session {
        bus: bus.clone(),
        outbox,
        consumers: HashMap::new(),
    };
    let result = session.serve(&mut reader).await;

    session.close();
    bus.release();
    writer_task.abort();
    result
}

async fn drain_outbox(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<BrokerFrame>,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!(?err, "failed to write frame to peer");
            break;
        }
    }
}

struct Session {
    bus: LocalBus,
    outbox: mpsc::UnboundedSender<BrokerFrame>,
    consumers: HashMap<String, Consumer>,
}

struct Consumer {
    credit: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Session {
    async fn serve(&mut self, reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
        while let Some(frame) = read_frame::<_, ClientFrame>(reader).await? {
            self.handle_frame(frame).await;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Declare {
                name,
                durable,
                exclusive,
            } => {
                let options = QueueOptions { durable, exclusive };
                let reply = match self.bus.declare_queue(name.as_deref(), options).await {
                    Ok(queue) => BrokerFrame::Declared { queue },
                    Err(err) => error_frame(&err),
                };
                self.send(reply);
            }
            ClientFrame::Publish { queue, delivery } => {
                if let Err(err) = self.bus.publish(&queue, delivery).await {
                    warn!(%queue, error = ?err, "publish failed");
                }
            }
            ClientFrame::Consume { queue } => {
                let reply = self.start_consumer(queue).await;
                self.send(reply);
            }
            ClientFrame::Fetch { queue } => match self.consumers.get(&queue) {
                Some(consumer) => {
                    let _ = consumer.credit.send(());
                }
                None => warn!(%queue, "fetch for a queue this connection is not consuming"),
            },
            ClientFrame::Cancel { queue } => {
                if let Some(consumer) = self.consumers.remove(&queue) {
                    consumer.task.abort();
                }
            }
        }
    }

    async fn start_consumer(&mut self, queue: String) -> BrokerFrame {
        if self.consumers.contains_key(&queue) {
            return BrokerFrame::Error {
                message: format!("already consuming '{queue}' on this connection"),
            };
        }

        let subscription = match self.bus.consume(&queue).await {
            Ok(subscription) => subscription,
            Err(err) => return error_frame(&err),
        };
        let (credit, credit_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward_deliveries(
            subscription,
            queue.clone(),
            credit_rx,
            self.outbox.clone(),
        ));
        self.consumers.insert(queue.clone(), Consumer { credit, task });
        BrokerFrame::Consuming { queue }
    }

    fn send(&self, frame: BrokerFrame) {
        if self.outbox.send(frame).is_err() {
            debug!("peer writer gone, frame dropped");
        }
    }

    fn close(&mut self) {
        for (_, consumer) in self.consumers.drain() {
            consumer.task.abort();
        }
    }
}

fn error_frame(err: &anyhow::Error) -> BrokerFrame {
    BrokerFrame::Error {
        message: format!("{err:#}"),
    }
}

async fn forward_deliveries(
    mut subscription: LocalSubscription,
    queue: String,
    mut credit: mpsc::UnboundedReceiver<()>,
    outbox: mpsc::UnboundedSender<BrokerFrame>,
) {
    while credit.recv().await.is_some() {
        let Some(delivery) = subscription.next().await else {
            break;
        };
        let frame = BrokerFrame::Deliver {
            queue: queue.clone(),
            delivery,
        };
        if outbox.send(frame).is_err() {
            break;
        }
    }
}

/// [`MessageBus`] over one TCP connection to a [`BrokerServer`].
///
/// Clones share the connection. The connection closes once every clone and
/// every subscription made through it has been dropped.
#[derive(Clone)]
pub struct RemoteBus {
    inner: Arc<Connection>,
}

struct Connection {
    outbox: mpsc::UnboundedSender<ClientFrame>,
    shared: Arc<Shared>,
}

type Ack = oneshot::Sender<std::result::Result<String, String>>;

struct Shared {
    // Acks arrive in request order, so the oldest waiter gets the next one.
    pending: Mutex<PendingAcks>,
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    // Weak so the reader task alone never keeps the connection open.
    outbox: mpsc::WeakUnboundedSender<ClientFrame>,
}

#[derive(Default)]
struct PendingAcks {
    waiters: VecDeque<Ack>,
    closed: bool,
}

impl RemoteBus {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to broker at {addr}"))?;
        debug!(%addr, "connected to broker");

        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(outbox.downgrade()));

        tokio::spawn(send_frames(writer, outbox_rx));
        tokio::spawn(receive_frames(BufReader::new(reader), Arc::clone(&shared)));

        Ok(Self {
            inner: Arc::new(Connection { outbox, shared }),
        })
    }

    async fn request(&self, frame: ClientFrame) -> Result<String> {
        let (ack, response) = oneshot::channel();
        {
            let mut pending = self.inner.shared.pending();
            if pending.closed {
                bail!("broker connection closed");
            }
            pending.waiters.push_back(ack);
            if self.inner.outbox.send(frame).is_err() {
                pending.waiters.pop_back();
                bail!("broker connection closed");
            }
        }

        let reply = response
            .await
            .map_err(|_| anyhow!("broker connection closed"))?;
        reply.map_err(|message| anyhow!("broker refused request: {message}"))
    }
}

impl MessageBus for RemoteBus {
    type Subscription = RemoteSubscription;

    async fn declare_queue(&self, name: Option<&str>, options: QueueOptions) -> Result<String> {
        self.request(ClientFrame::Declare {
            name: name.map(str::to_string),
            durable: options.durable,
            exclusive: options.exclusive,
        })
        .await
    }

    async fn publish(&self, queue: &str, delivery: Delivery) -> Result<()> {
        if self.inner.shared.pending().closed {
            bail!("broker connection closed");
        }
        self.inner
            .outbox
            .send(ClientFrame::Publish {
                queue: queue.to_string(),
                delivery,
            })
            .map_err(|_| anyhow!("broker connection closed"))
    }

    async fn consume(&self, queue: &str) -> Result<RemoteSubscription> {
        let (sender, deliveries) = mpsc::unbounded_channel();
        {
            let mut subscribers = self.inner.shared.subscribers();
            if subscribers.contains_key(queue) {
                bail!("already consuming '{queue}' on this connection");
            }
            subscribers.insert(queue.to_string(), sender);
        }

        let consume = ClientFrame::Consume {
            queue: queue.to_string(),
        };
        if let Err(err) = self.request(consume).await {
            self.inner.shared.subscribers().remove(queue);
            return Err(err);
        }

        Ok(RemoteSubscription {
            queue: queue.to_string(),
            deliveries,
            outbox: self.inner.outbox.clone(),
            shared: Arc::clone(&self.inner.shared),
            fetch_outstanding: false,
        })
    }
}

pub struct RemoteSubscription {
    queue: String,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    outbox: mpsc::UnboundedSender<ClientFrame>,
    shared: Arc<Shared>,
    fetch_outstanding: bool,
}

impl DeliveryStream for RemoteSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        // A cancelled `next` leaves its fetch outstanding; don't ask twice.
        if !self.fetch_outstanding {
            let fetch = ClientFrame::Fetch {
                queue: self.queue.clone(),
            };
            self.outbox.send(fetch).ok()?;
            self.fetch_outstanding = true;
        }

        let delivery = self.deliveries.recv().await?;
        self.fetch_outstanding = false;
        Some(delivery)
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.shared.subscribers().remove(&self.queue);
        let _ = self.outbox.send(ClientFrame::Cancel {
            queue: self.queue.clone(),
        });
    }
}

impl Shared {
    fn new(outbox: mpsc::WeakUnboundedSender<ClientFrame>) -> Self {
        Self {
            pending: Mutex::default(),
            subscribers: Mutex::default(),
            outbox,
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingAcks> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Delivery>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, frame: BrokerFrame) {
        match frame {
            BrokerFrame::Declared { queue } | BrokerFrame::Consuming { queue } => {
                self.resolve(Ok(queue))
            }
            BrokerFrame::Error { message } => self.resolve(Err(message)),
            BrokerFrame::Deliver { queue, delivery } => {
                let sender = self.subscribers().get(&queue).cloned();
                let undelivered = match sender {
                    Some(sender) => sender.send(delivery).err().map(|err| err.0),
                    None => Some(delivery),
                };
                if let Some(delivery) = undelivered {
                    self.requeue(queue, delivery);
                }
            }
        }
    }

    /// Hands a delivery that raced a `cancel` back to its queue.
    fn requeue(&self, queue: String, delivery: Delivery) {
        let returned = self.outbox.upgrade().is_some_and(|outbox| {
            let frame = ClientFrame::Publish {
                queue: queue.clone(),
                delivery,
            };
            outbox.send(frame).is_ok()
        });
        if returned {
            debug!(%queue, "delivery for a cancelled subscription requeued");
        } else {
            warn!(%queue, "delivery for a cancelled subscription lost");
        }
    }

    fn resolve(&self, outcome: std::result::Result<String, String>) {
        match self.pending().waiters.pop_front() {
            // The waiter may have given up; nothing to do then.
            Some(ack) => {
                let _ = ack.send(outcome);
            }
            None => warn!(?outcome, "unsolicited acknowledgement from broker"),
        }
    }

    fn close(&self) {
        let mut pending = self.pending();
        pending.closed = true;
        pending.waiters.clear();
        drop(pending);
        self.subscribers().clear();
    }
}

async fn send_frames(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<ClientFrame>,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            warn!(error = ?err, "failed to write to broker");
            break;
        }
    }
}

async fn receive_frames(mut reader: BufReader<OwnedReadHalf>, shared: Arc<Shared>) {
    loop {
        match read_frame::<_, BrokerFrame>(&mut reader).await {
            Ok(Some(frame)) => shared.dispatch(frame),
            Ok(None) => {
                debug!("broker closed the connection");
                break;
            }
            Err(err) => {
                warn!(error = ?err, "failed to read from broker");
                break;
            }
        }
    }
    shared.close();
}
