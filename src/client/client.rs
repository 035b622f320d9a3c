use crate::{
    client::{
        builder::ClientBuilder,
        io_task::{Command, Endpoint, FirstConnect, IoTask},
        value_types::{
            KeepAlive,
            Publish,
            Subscribe,
        },
    },
    packet::{Connect, QoS},
    session::{
        AckMode,
        Delivery,
        FlowId,
        ListenerId,
        Listeners,
        MemoryStore,
        PublishResult,
        ReconnectPolicy,
        Session,
        SessionConfig,
        SessionStore,
    },
    Error,
    Result,
    util::{
        ConnectionMode,
        RuntimeLease,
        TokioRuntime,
    },
};
use log::{debug, warn};
use tokio::{
    sync::{
        mpsc,
        oneshot,
    },
    task::JoinHandle,
    time::{
        Duration,
        timeout,
    },
};

/// An MQTT client.
///
/// Start building an instance by calling Client::builder() to get a
/// ClientBuilder, using the fluent builder pattern on ClientBuilder,
/// then calling ClientBuilder::build(). For example:
///
/// ```
/// # use mqtt_delivery::client::Client;
/// let client =
///     Client::builder()
///        .set_host("example.com".to_owned())
///        .build();
/// ```
///
/// Once connected, a background task owns the connection and
/// reconnects as configured. Open QoS 1 and 2 exchanges survive
/// reconnects and, through the session store, `disconnect` followed
/// by `connect`.
pub struct Client {
    options: ClientOptions,
    state: ConnectState,
    /// Kept between connections; `None` while a connection task owns it.
    store: Option<Box<dyn SessionStore>>,
}

pub(crate) struct ClientOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) keep_alive: KeepAlive,
    pub(crate) runtime: TokioRuntime,
    pub(crate) client_id: Option<String>,
    pub(crate) packet_buffer_len: usize,
    pub(crate) max_packet_len: usize,
    pub(crate) operation_timeout: Duration,
    pub(crate) connection_mode: ConnectionMode,
    pub(crate) automatic_connect: bool,
    pub(crate) connect_retry_delay: Duration,
    pub(crate) max_connect_retry_delay: Duration,
    pub(crate) clean_session: bool,
    pub(crate) receive_maximum: u16,
    pub(crate) send_maximum: u16,
    pub(crate) listeners: Listeners,
}

enum ConnectState {
    Disconnected,
    Connected(ClientConnection),
}

/// The client side of the communication channels to an IO task.
struct ClientConnection {
    /// Sender to send requests to the IO task.
    tx_commands: mpsc::Sender<Command>,

    /// Resolves to the session store when the IO task ends.
    task: JoinHandle<Box<dyn SessionStore>>,

    /// Keeps the runtime the IO task runs on alive.
    _lease: RuntimeLease,
}

/// Messages received for one subscription.
///
/// Dropping a `Subscription` unsubscribes in the background and
/// acknowledges whatever it had not acknowledged yet.
pub struct Subscription {
    flow: FlowId,
    granted: Vec<Option<QoS>>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    tx_commands: mpsc::Sender<Command>,
    operation_timeout: Duration,
    ended: bool,
}

impl Client {
    /// Start a fluent builder interface to construct a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub(crate) fn new(options: ClientOptions, store: Option<Box<dyn SessionStore>>) -> Result<Client> {
        Ok(Client {
            options,
            state: ConnectState::Disconnected,
            store: Some(store.unwrap_or_else(|| Box::new(MemoryStore::new()))),
        })
    }

    /// Open a connection to the configured MQTT broker.
    ///
    /// Returns the outcome of the first attempt. If that attempt fails
    /// but a reconnect is scheduled, the client keeps trying in the
    /// background and publishes wait for the connection.
    pub async fn connect(&mut self) -> Result<()> {
        self.check_disconnected()?;
        let lease = self.options.runtime.acquire()?;
        let (tx_commands, rx_commands) = mpsc::channel::<Command>(self.options.packet_buffer_len);
        let (tx_acks, rx_acks) = mpsc::unbounded_channel();
        let (tx_first, rx_first) = oneshot::channel::<FirstConnect>();

        let store = match self.store.take() {
            Some(s) => s,
            None => Box::new(MemoryStore::new()),
        };
        let session = Session::new(self.session_config(), store, self.options.listeners.clone(),
                                   tx_acks);
        let endpoint = Endpoint {
            host: self.options.host.clone(),
            port: self.options.port,
            connection_mode: self.options.connection_mode.clone(),
            keep_alive: self.options.keep_alive,
            max_packet_len: self.options.max_packet_len,
            operation_timeout: self.options.operation_timeout,
        };
        let io = IoTask::new(endpoint, session, rx_commands, rx_acks, tx_first);
        let task = lease.spawn(io.run());
        self.state = ConnectState::Connected(ClientConnection {
            tx_commands,
            task,
            _lease: lease,
        });

        match rx_first.await {
            Ok((Ok(()), _)) => Ok(()),
            Ok((Err(e), true)) => Err(e),
            Ok((Err(e), false)) => {
                self.reclaim().await;
                Err(e)
            }
            Err(_) => {
                self.reclaim().await;
                Err(Error::Disconnected)
            }
        }
    }

    /// Publish a message and wait until its exchange completes: at once
    /// for QoS 0, on PUBACK for QoS 1, on PUBCOMP for QoS 2.
    ///
    /// Note that this method takes `&self`. This means a caller can
    /// create several publish futures to publish several payloads of
    /// data simultaneously without waiting for responses. Dropping the
    /// future does not abort the exchange.
    pub async fn publish(&self, p: &Publish) -> Result<PublishResult> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Publish { message: p.to_message(), tx }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Like `publish`, but fails with `Error::AdmissionRejected` instead
    /// of waiting when no packet identifier is free or the client is
    /// between connections.
    pub async fn try_publish(&self, p: &Publish) -> Result<PublishResult> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::TryPublish { message: p.to_message(), tx }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Subscribe to some topics. Messages on them arrive on the returned
    /// `Subscription` from the moment this is called.
    ///
    /// With `AckMode::Manual` each QoS 1 or 2 delivery must be
    /// acknowledged (or dropped) before the broker is acknowledged.
    pub async fn subscribe(&self, s: Subscribe, mode: AckMode) -> Result<Subscription> {
        let c = self.check_connected()?;
        let (sink, deliveries) = mpsc::unbounded_channel();
        let (flow_tx, mut flow_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            topics: s.topics().to_owned(),
            mode,
            sink,
            flow_tx,
            tx,
        }).await?;
        let res = timeout(self.options.operation_timeout, rx).await;
        let suback = match res {
            Ok(r) => r.map_err(|_| Error::Disconnected)??,
            Err(_) => {
                if let Ok(flow) = flow_rx.try_recv() {
                    let _ = c.tx_commands.try_send(Command::CancelFlow(flow));
                }
                return Err(Error::Timeout(format!("No SUBACK after {}ms",
                                                  self.options.operation_timeout.as_millis())));
            }
        };
        let flow = flow_rx.try_recv().map_err(|_| Error::Disconnected)?;
        debug!("Subscribed flow {:?}", flow);
        Ok(Subscription {
            flow,
            granted: suback.granted,
            rx: deliveries,
            tx_commands: c.tx_commands.clone(),
            operation_timeout: self.options.operation_timeout,
            ended: false,
        })
    }

    /// Remove a lifecycle listener registered on the builder. Returns
    /// false if it was not registered.
    pub async fn remove_listener(&mut self, id: ListenerId) -> Result<bool> {
        let removed = self.options.listeners.remove(id);
        if let ConnectState::Connected(c) = &self.state {
            let (tx, rx) = oneshot::channel();
            if c.tx_commands.send(Command::RemoveListener { id, tx }).await.is_ok() {
                return Ok(rx.await.unwrap_or(removed));
            }
        }
        Ok(removed)
    }

    /// Gracefully close the connection to the server and cancel any
    /// scheduled reconnect.
    ///
    /// Publishes still waiting for admission fail with
    /// `Error::Disconnected`; open exchanges are kept for the next
    /// `connect`.
    pub async fn disconnect(&mut self) -> Result<()> {
        let c = self.check_connected()?;
        debug!("Disconnecting");
        let (tx, rx) = oneshot::channel();
        if c.tx_commands.send(Command::Disconnect { tx }).await.is_ok() {
            let _ = rx.await;
        }
        self.reclaim().await;
        Ok(())
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect: Connect {
                client_id: match &self.options.client_id {
                    None => "".to_owned(),
                    Some(cid) => cid.to_owned(),
                },
                clean_session: self.options.clean_session,
                keep_alive: self.options.keep_alive.as_secs(),
                username: self.options.username.clone(),
                password: self.options.password.clone(),
                receive_maximum: self.options.receive_maximum,
            },
            send_maximum: self.options.send_maximum,
            policy: ReconnectPolicy {
                automatic: self.options.automatic_connect,
                initial_delay: self.options.connect_retry_delay,
                max_delay: self.options.max_connect_retry_delay,
            },
        }
    }

    /// Wait for the IO task to end and take back the session store.
    async fn reclaim(&mut self) {
        let c = match std::mem::replace(&mut self.state, ConnectState::Disconnected) {
            ConnectState::Connected(c) => c,
            ConnectState::Disconnected => return,
        };
        let ClientConnection { tx_commands, task, _lease } = c;
        drop(tx_commands);
        match task.await {
            Ok(store) => self.store = Some(store),
            Err(e) => {
                warn!("IO task failed, open exchanges are lost: {}", e);
                self.store = Some(Box::new(MemoryStore::new()));
            }
        }
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        let c = self.check_connected()?;
        c.tx_commands.send(cmd).await.map_err(|_| Error::Disconnected)
    }

    fn check_connected(&self) -> Result<&ClientConnection> {
        match self.state {
            ConnectState::Disconnected => Err(Error::Disconnected),
            ConnectState::Connected(ref c) => Ok(c),
        }
    }

    fn check_disconnected(&self) -> Result<()> {
        match self.state {
            ConnectState::Disconnected => Ok(()),
            ConnectState::Connected(_) => Err("Connected already".into()),
        }
    }
}

impl Subscription {
    /// Wait for the next message. Returns `None` once the subscription or
    /// the client has ended.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// QoS granted per topic, `None` where the broker refused it.
    pub fn granted(&self) -> &[Option<QoS>] {
        &*self.granted
    }

    /// Fails if the broker refused any topic.
    pub fn any_failures(&self) -> Result<()> {
        let n = self.granted.iter().filter(|g| g.is_none()).count();
        if n > 0 {
            return Err(format!("{} subscription topics refused", n).into());
        }
        Ok(())
    }

    /// Stop receiving and unsubscribe; waits for the UNSUBACK.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.ended = true;
        let (tx, rx) = oneshot::channel();
        self.tx_commands.send(Command::Unsubscribe { flow: self.flow, tx }).await
            .map_err(|_| Error::Disconnected)?;
        match timeout(self.operation_timeout, rx).await {
            Ok(r) => r.map_err(|_| Error::Disconnected)?,
            Err(_) => Err(Error::Timeout(format!("No UNSUBACK after {}ms",
                                                 self.operation_timeout.as_millis()))),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        // If the queue is full the flow is still cancelled once a
        // delivery finds its receiver gone.
        if self.tx_commands.try_send(Command::CancelFlow(self.flow)).is_err() {
            debug!("Could not queue cancellation of flow {:?}", self.flow);
        }
    }
}
