use bytes::BytesMut;
use crate::{
    client::KeepAlive,
    codec,
    packet::{Message, Packet, SubscribeTopic},
    session::{
        AckMode,
        AckToken,
        Delivery,
        DisconnectSource,
        FlowId,
        ListenerId,
        Session,
        SessionStore,
        SubscribeTx,
        UnsubscribeTx,
        outgoing::PublishTx,
    },
    util::{AsyncStream, ConnectionMode},
    Error,
    Result,
};
use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    time::{sleep, sleep_until, timeout, Duration, Instant},
};

/// A request from `Client` to the connection task.
pub(crate) enum Command {
    Publish { message: Message, tx: PublishTx },
    TryPublish { message: Message, tx: PublishTx },
    Subscribe {
        topics: Vec<SubscribeTopic>,
        mode: AckMode,
        sink: mpsc::UnboundedSender<Delivery>,
        flow_tx: oneshot::Sender<FlowId>,
        tx: SubscribeTx,
    },
    Unsubscribe { flow: FlowId, tx: UnsubscribeTx },
    CancelFlow(FlowId),
    RemoveListener { id: ListenerId, tx: oneshot::Sender<bool> },
    Disconnect { tx: oneshot::Sender<()> },
}

/// Outcome of the first connection attempt, and whether the task keeps
/// trying.
pub(crate) type FirstConnect = (Result<()>, bool);

/// Where the transport settings come from.
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub connection_mode: ConnectionMode,
    pub keep_alive: KeepAlive,
    pub max_packet_len: usize,
    pub operation_timeout: Duration,
}

/// The state held by the connection task, a long-running tokio future.
/// It owns the session, connects and reconnects the transport, sends
/// keep-alive pings, and serves requests from `Client`.
pub(crate) struct IoTask {
    endpoint: Endpoint,
    session: Session,

    /// A buffer with data read from the stream.
    read_buf: BytesMut,

    /// The number of bytes at the start of `read_buf` that have been
    /// read from the stream.
    read_bufn: usize,

    rx_commands: mpsc::Receiver<Command>,
    rx_acks: mpsc::UnboundedReceiver<AckToken>,
    first_connect: Option<oneshot::Sender<FirstConnect>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
}

enum SelectResult {
    Read(Result<Option<Packet>>),
    Command(Option<Command>),
    Ack(AckToken),
    Ping,
    PingTimeout,
}

impl IoTask {
    pub(crate) fn new(
        endpoint: Endpoint,
        session: Session,
        rx_commands: mpsc::Receiver<Command>,
        rx_acks: mpsc::UnboundedReceiver<AckToken>,
        first_connect: oneshot::Sender<FirstConnect>,
    ) -> IoTask {
        IoTask {
            read_buf: BytesMut::with_capacity(endpoint.max_packet_len),
            read_bufn: 0,
            endpoint,
            session,
            rx_commands,
            rx_acks,
            first_connect: Some(first_connect),
            disconnect_waiters: Vec::new(),
        }
    }

    /// Run until the session ends. Returns the store so a later
    /// connection can resume open exchanges.
    pub(crate) async fn run(mut self) -> Box<dyn SessionStore> {
        loop {
            let (source, cause) = match self.connect_once().await {
                Ok(stream) => {
                    if let Some(tx) = self.first_connect.take() {
                        let _ = tx.send((Ok(()), true));
                    }
                    self.serve(stream).await
                }
                Err(e) => e,
            };
            let plan = self.session.on_connection_lost(source, &cause);
            if source == DisconnectSource::User {
                for tx in self.disconnect_waiters.drain(..) {
                    let _ = tx.send(());
                }
            }
            if let Some(tx) = self.first_connect.take() {
                let _ = tx.send((Err(cause), plan.is_some()));
            }
            let delay = match plan {
                Some(plan) => plan.delay,
                None => break,
            };
            info!("IoTask: Reconnecting in {:?}", delay);
            if !self.wait_reconnect(delay).await {
                break;
            }
        }
        debug!("IoTask: Session ended");
        for tx in self.disconnect_waiters.drain(..) {
            let _ = tx.send(());
        }
        self.session.into_store()
    }

    /// Open the transport, send CONNECT and wait for an accepted CONNACK,
    /// all within the operation timeout.
    async fn connect_once(&mut self) -> std::result::Result<AsyncStream, (DisconnectSource, Error)> {
        self.session.start_connect().map_err(|e| (DisconnectSource::Client, e))?;
        self.read_buf.clear();
        self.read_bufn = 0;
        let op_timeout = self.endpoint.operation_timeout;
        debug!("IoTask: Connecting to {}:{}", self.endpoint.host, self.endpoint.port);

        let attempt = async {
            let mut stream = AsyncStream::connect(
                &*self.endpoint.host, self.endpoint.port, &self.endpoint.connection_mode).await
                .map_err(|e| Error::ConnectionLost(e.to_string()))?;
            self.flush(&mut stream).await?;
            let p = Self::read_packet(&mut stream, &mut self.read_buf, &mut self.read_bufn,
                                      self.endpoint.max_packet_len).await?;
            match p {
                Some(Packet::Connack(ca)) => self.session.on_connack(ca)?,
                Some(p) => return Err(Error::protocol(format!(
                    "Received {} instead of CONNACK", p.name()))),
                None => return Err(Error::ConnectionLost(
                    "Closed by broker before CONNACK".to_owned())),
            }
            Ok(stream)
        };
        match timeout(op_timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e @ Error::RemoteError { .. })) => {
                warn!("IoTask: Connection refused: {}", e);
                Err((DisconnectSource::Server, e))
            }
            Ok(Err(e)) => {
                error!("IoTask: Failed to connect: {}", e);
                Err((DisconnectSource::Client, e))
            }
            Err(_) => Err((DisconnectSource::Client, Error::Timeout(format!(
                "No CONNACK after {}ms", op_timeout.as_millis())))),
        }
    }

    /// Serve one established connection until it ends.
    async fn serve(&mut self, mut stream: AsyncStream) -> (DisconnectSource, Error) {
        let keep_alive = match self.endpoint.keep_alive {
            KeepAlive::Disabled => None,
            KeepAlive::Enabled { secs } => Some(Duration::from_secs(secs as u64)),
        };
        let mut last_write_time = Instant::now();
        let mut ping_sent: Option<Instant> = None;
        let mut closing: Option<(DisconnectSource, Error)> = None;

        loop {
            match self.flush(&mut stream).await {
                Ok(true) => last_write_time = Instant::now(),
                Ok(false) => (),
                Err(e) => {
                    error!("IoTask: Error writing packet: {}", e);
                    return (DisconnectSource::Client, Error::ConnectionLost(e.to_string()));
                }
            }
            if let Some(c) = closing.take() {
                if let Err(e) = stream.shutdown().await {
                    error!("IoTask: Error shutting down stream: {:?}", e);
                }
                return c;
            }

            let far = Instant::now() + Duration::from_secs(86400);
            let ping_at = keep_alive.map(|k| last_write_time + k).unwrap_or(far);
            let pong_deadline = match (ping_sent, keep_alive) {
                (Some(t), Some(k)) => t + k,
                _ => far,
            };

            let sel_res = tokio::select! {
                read = Self::read_packet(&mut stream, &mut self.read_buf, &mut self.read_bufn,
                                         self.endpoint.max_packet_len) => SelectResult::Read(read),
                cmd = self.rx_commands.recv() => SelectResult::Command(cmd),
                Some(token) = self.rx_acks.recv() => SelectResult::Ack(token),
                _ = sleep_until(ping_at), if keep_alive.is_some() && ping_sent.is_none() =>
                    SelectResult::Ping,
                _ = sleep_until(pong_deadline), if ping_sent.is_some() =>
                    SelectResult::PingTimeout,
            };

            match sel_res {
                SelectResult::Read(Ok(Some(p))) => {
                    if let Packet::Pingresp = p {
                        trace!("IoTask: Pingresp");
                        ping_sent = None;
                    }
                    match self.session.handle_packet(p) {
                        Ok(()) => (),
                        Err(e @ Error::RemoteError { packet: "DISCONNECT", .. }) => {
                            info!("IoTask: Broker disconnected: {}", e);
                            return (DisconnectSource::Server, e);
                        }
                        Err(e) => {
                            self.session.on_protocol_violation(&e);
                            closing = Some((DisconnectSource::Client, e));
                        }
                    }
                }
                SelectResult::Read(Ok(None)) => {
                    error!("IoTask: Socket disconnected");
                    return (DisconnectSource::Server,
                            Error::ConnectionLost("Closed by broker".to_owned()));
                }
                SelectResult::Read(Err(e @ Error::ConnectionLost(_))) => {
                    error!("IoTask: Failed to read packet: {}", e);
                    return (DisconnectSource::Client, e);
                }
                SelectResult::Read(Err(e)) => {
                    // Undecodable input.
                    let e = match e {
                        e @ Error::ProtocolViolation { .. } => e,
                        e => Error::protocol(format!("Malformed packet: {}", e)),
                    };
                    self.session.on_protocol_violation(&e);
                    closing = Some((DisconnectSource::Client, e));
                }
                SelectResult::Command(None) => {
                    debug!("IoTask: Client dropped, disconnecting.");
                    if closing.is_none() && self.session.disconnect() {
                        closing = Some((DisconnectSource::User, Error::Disconnected));
                    }
                }
                SelectResult::Command(Some(cmd)) => {
                    if self.handle_command(cmd) && closing.is_none() && self.session.disconnect() {
                        debug!("IoTask: Disconnecting");
                        closing = Some((DisconnectSource::User, Error::Disconnected));
                    }
                }
                SelectResult::Ack(token) => self.session.acknowledge(token),
                SelectResult::Ping => {
                    debug!("IoTask: Writing Pingreq");
                    last_write_time = Instant::now();
                    ping_sent = Some(last_write_time);
                    if let Err(e) = Self::write_packets(&[Packet::Pingreq], &mut stream,
                                                        self.endpoint.max_packet_len).await {
                        error!("IoTask: Failed to write ping: {:?}", e);
                        return (DisconnectSource::Client, Error::ConnectionLost(e.to_string()));
                    }
                }
                SelectResult::PingTimeout => {
                    error!("IoTask: No Pingresp within keep alive");
                    return (DisconnectSource::Client,
                            Error::Timeout("No PINGRESP within keep alive".to_owned()));
                }
            }
        }
    }

    /// Sleep before the next attempt while still serving requests.
    /// Returns false if the session ended meanwhile.
    async fn wait_reconnect(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                cmd = self.rx_commands.recv() => match cmd {
                    None => {
                        self.session.disconnect();
                        return false;
                    }
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            self.session.disconnect();
                            return false;
                        }
                    }
                },
                Some(token) = self.rx_acks.recv() => self.session.acknowledge(token),
            }
        }
    }

    /// Returns true for a disconnect request.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Publish { message, tx } => self.session.publish(message, tx),
            Command::TryPublish { message, tx } => self.session.try_publish(message, tx),
            Command::Subscribe { topics, mode, sink, flow_tx, tx } => {
                if let Some(flow) = self.session.subscribe(topics, mode, sink, tx) {
                    let _ = flow_tx.send(flow);
                }
            }
            Command::Unsubscribe { flow, tx } => self.session.unsubscribe(flow, Some(tx)),
            Command::CancelFlow(flow) => self.session.cancel_flow(flow),
            Command::RemoveListener { id, tx } => {
                let _ = tx.send(self.session.listeners_mut().remove(id));
            }
            Command::Disconnect { tx } => {
                self.disconnect_waiters.push(tx);
                return true;
            }
        }
        false
    }

    /// Write everything the session queued. Returns true if anything was written.
    async fn flush(&mut self, stream: &mut AsyncStream) -> Result<bool> {
        let packets: Vec<Packet> = std::iter::from_fn(|| self.session.poll_transmit()).collect();
        if packets.is_empty() {
            return Ok(false);
        }
        Self::write_packets(&packets, stream, self.endpoint.max_packet_len).await?;
        Ok(true)
    }

    async fn write_packets(
        packets: &[Packet],
        stream: &mut AsyncStream,
        max_packet_len: usize
    ) -> Result<()> {
        let mut bytes = BytesMut::with_capacity(max_packet_len);
        for p in packets {
            let start = bytes.len();
            codec::encode(p, &mut bytes)?;
            if bytes.len() - start > max_packet_len {
                return Err(format!("{} of {} bytes exceeds the maximum packet length",
                                   p.name(), bytes.len() - start).into());
            }
        }
        if cfg!(feature = "unsafe-logging") {
            trace!("write_packets bytes={:?}", &*bytes);
        }
        stream.write_all(&*bytes).await
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        Ok(())
    }

    /// Read one packet. Returns `Ok(None)` when the broker closed the
    /// connection.
    async fn read_packet(
        stream: &mut AsyncStream,
        read_buf: &mut BytesMut,
        read_bufn: &mut usize,
        max_packet_len: usize
    ) -> Result<Option<Packet>> {
        loop {
            if cfg!(feature = "unsafe-logging") {
                trace!("read_packet Decoding buf={:?}", &read_buf[0..*read_bufn]);
            }
            if *read_bufn > 0 {
                // We already have some bytes in the buffer. Try to decode a packet
                read_buf.truncate(*read_bufn);
                let old_len = read_buf.len();
                let decoded = codec::decode(read_buf)?;
                if let Some(p) = decoded {
                    let new_len = read_buf.len();
                    trace!("read_packet old_len={} new_len={} read_bufn={}",
                           old_len, new_len, *read_bufn);
                    *read_bufn -= old_len - new_len;
                    return Ok(Some(p));
                }
                if *read_bufn >= max_packet_len {
                    return Err(Error::protocol(format!(
                        "Packet exceeds the maximum packet length of {} bytes", max_packet_len)));
                }
            }
            read_buf.resize(max_packet_len, 0u8);
            let readlen = read_buf.len();
            trace!("read_packet read read_bufn={} readlen={}", *read_bufn, readlen);
            let nread = stream.read(&mut read_buf[*read_bufn..readlen]).await
                .map_err(|e| Error::ConnectionLost(e.to_string()))?;
            *read_bufn += nread;
            if nread == 0 {
                return Ok(None);
            }
        }
    }
}
