//! The QoS delivery engine, free of any I/O.
//!
//! A [`Session`] is fed packets read from the broker and application
//! requests, and queues the packets to write in an outbox drained with
//! [`Session::poll_transmit`]. The connection task in [`crate::client`]
//! owns the only instance and does all the reading and writing.

pub mod incoming;
pub mod lifecycle;
pub mod outgoing;
pub mod store;

pub use incoming::{
    filter_matches, AckMode, AckToken, Acknowledger, Delivery, FlowId, FlowState, IncomingQos,
};
pub use lifecycle::{
    ConnectedContext, ConnectionState, DisconnectSource, DisconnectedContext, Lifecycle,
    ListenerId, Listeners, ReconnectPlan, ReconnectPolicy, Reconnector,
};
pub use outgoing::{OutgoingQos, PublishResult};
pub use store::{ExchangeSnapshot, MemoryStore, OutgoingState, SessionStore};

use crate::{
    packet::{
        Connack, Connect, Message, Packet, Pid, ReasonCode, Suback, Subscribe, SubscribeTopic,
        Unsubscribe,
    },
    util::PidAllocator,
    Error,
    Result,
};
use log::{debug, error, trace, warn};
use self::outgoing::PublishTx;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{mpsc, oneshot};

/// Identifiers at the top of the range are kept for SUBSCRIBE and
/// UNSUBSCRIBE so publishes can never starve them.
pub const SUBSCRIBE_PIDS: u16 = 10;

pub(crate) type SubscribeTx = oneshot::Sender<Result<Suback>>;
pub(crate) type UnsubscribeTx = oneshot::Sender<Result<()>>;

enum SubRequest {
    Subscribe { flow: FlowId, topics: Vec<SubscribeTopic>, tx: Option<SubscribeTx> },
    Resubscribe { flows: Vec<FlowId>, topics: Vec<SubscribeTopic> },
    Unsubscribe { filters: Vec<String>, tx: Option<UnsubscribeTx> },
}

/// Fixed settings of a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// CONNECT sent on every connection attempt unless a reconnector
    /// replaces it.
    pub connect: Connect,
    /// Upper bound on open outgoing exchanges; the broker's receive
    /// maximum lowers it per connection.
    pub send_maximum: u16,
    /// Reconnect defaults.
    pub policy: ReconnectPolicy,
}

/// One client's delivery state across connections.
pub struct Session {
    connect: Connect,
    send_maximum: u16,
    outgoing: OutgoingQos,
    incoming: IncomingQos,
    lifecycle: Lifecycle,
    sub_pids: PidAllocator,
    /// SUBSCRIBE/UNSUBSCRIBE requests written and not yet acknowledged.
    sub_requests: BTreeMap<Pid, SubRequest>,
    /// Requests waiting for a connection or an identifier.
    sub_queue: VecDeque<SubRequest>,
    outbox: VecDeque<Packet>,
    /// Set once the session has ended for good.
    ended: bool,
}

impl Session {
    /// A disconnected session. Acknowledgements of manual flows arrive on
    /// the receiving end of `ack_tx` and must be passed to
    /// [`Session::acknowledge`].
    pub fn new(
        config: SessionConfig,
        store: Box<dyn SessionStore>,
        listeners: Listeners,
        ack_tx: mpsc::UnboundedSender<AckToken>,
    ) -> Session {
        let id_limit = u16::MAX - SUBSCRIBE_PIDS;
        Session {
            incoming: IncomingQos::new(config.connect.receive_maximum, ack_tx),
            connect: config.connect,
            send_maximum: config.send_maximum,
            outgoing: OutgoingQos::new(id_limit, store),
            lifecycle: Lifecycle::new(config.policy, listeners),
            sub_pids: PidAllocator::with_bounds(id_limit + 1, u16::MAX),
            sub_requests: BTreeMap::new(),
            sub_queue: VecDeque::new(),
            outbox: VecDeque::new(),
            ended: false,
        }
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Returns true once the session has ended: a disconnect left no
    /// reconnect scheduled. A session that has not connected yet is not
    /// ended.
    pub fn is_terminated(&self) -> bool {
        self.ended
    }

    /// The outgoing coordinator.
    pub fn outgoing(&self) -> &OutgoingQos {
        &self.outgoing
    }

    /// The incoming coordinator.
    pub fn incoming(&self) -> &IncomingQos {
        &self.incoming
    }

    /// Lifecycle listeners, to add or remove some.
    pub fn listeners_mut(&mut self) -> &mut Listeners {
        self.lifecycle.listeners_mut()
    }

    /// End the session and keep its open outgoing exchanges for the next one.
    pub fn into_store(self) -> Box<dyn SessionStore> {
        self.outgoing.into_store()
    }

    /// The next packet to write, if any.
    pub fn poll_transmit(&mut self) -> Option<Packet> {
        self.outbox.pop_front()
    }

    /// Begin a connection attempt; queues the CONNECT.
    pub fn start_connect(&mut self) -> Result<()> {
        self.lifecycle.start_connect()?;
        self.outbox.clear();
        self.outbox.push_back(Packet::Connect(self.connect.clone()));
        Ok(())
    }

    /// Handle the CONNACK of the current attempt.
    ///
    /// A refused connection is returned as [`Error::RemoteError`]; the
    /// caller then ends the attempt with a server-sourced disconnect.
    pub fn on_connack(&mut self, connack: Connack) -> Result<()> {
        if self.lifecycle.state() != ConnectionState::Connecting {
            return Err(Error::protocol("CONNACK must not be received on an open connection"));
        }
        if connack.reason.is_error() {
            return Err(Error::RemoteError { packet: "CONNACK", reason: connack.reason });
        }
        let send_maximum = connack.receive_maximum
            .unwrap_or(u16::MAX)
            .min(self.send_maximum)
            .max(1);
        self.outgoing.resume(connack.session_present, send_maximum, &mut self.outbox)?;

        if !connack.session_present && self.lifecycle.resubscribe_if_session_expired() {
            self.resubscribe();
        }
        let ctx = ConnectedContext { session_present: connack.session_present, send_maximum };
        self.lifecycle.on_connected(&ctx)?;
        self.drain_subs();
        Ok(())
    }

    /// Publish `message`; `tx` receives the outcome once the exchange
    /// completes.
    pub(crate) fn publish(&mut self, message: Message, tx: PublishTx) {
        if self.is_terminated() {
            let _ = tx.send(Err(Error::Disconnected));
            return;
        }
        self.outgoing.publish(message, tx, &mut self.outbox);
    }

    /// Like [`Session::publish`] but fails with [`Error::AdmissionRejected`]
    /// instead of waiting for a packet identifier or a connection.
    pub(crate) fn try_publish(&mut self, message: Message, tx: PublishTx) {
        if !self.outgoing.can_admit(message.qos) {
            let _ = tx.send(Err(Error::AdmissionRejected));
            return;
        }
        self.outgoing.publish(message, tx, &mut self.outbox);
    }

    /// Register a flow and subscribe to `topics`. The flow receives
    /// deliveries on `sink` from now on; `tx` receives the SUBACK.
    pub(crate) fn subscribe(
        &mut self,
        topics: Vec<SubscribeTopic>,
        mode: AckMode,
        sink: mpsc::UnboundedSender<Delivery>,
        tx: SubscribeTx,
    ) -> Option<FlowId> {
        if topics.is_empty() {
            let _ = tx.send(Err("At least one topic is needed to subscribe".into()));
            return None;
        }
        if self.is_terminated() {
            let _ = tx.send(Err(Error::Disconnected));
            return None;
        }
        let flow = self.incoming.register_flow(topics.clone(), mode, sink);
        debug!("Subscribing flow {:?} to {} topics", flow, topics.len());
        self.sub_queue.push_back(SubRequest::Subscribe { flow, topics, tx: Some(tx) });
        self.drain_subs();
        Some(flow)
    }

    /// End a flow and unsubscribe its topics. Deliveries stop at once and
    /// anything it still owed counts as acknowledged.
    pub(crate) fn unsubscribe(&mut self, flow: FlowId, tx: Option<UnsubscribeTx>) {
        self.end_flow(flow, FlowState::Done, tx);
    }

    /// End a flow whose receiver went away.
    pub(crate) fn cancel_flow(&mut self, flow: FlowId) {
        self.end_flow(flow, FlowState::Cancelled, None);
    }

    /// Record a manual acknowledgement.
    pub fn acknowledge(&mut self, token: AckToken) {
        self.incoming.acknowledge(token, &mut self.outbox);
    }

    /// Route a packet read from the broker.
    ///
    /// Errors for which [`Error::is_fatal`] holds must end the
    /// connection through [`Session::on_protocol_violation`].
    pub fn handle_packet(&mut self, p: Packet) -> Result<()> {
        if let Packet::Connack(ca) = p {
            return self.on_connack(ca);
        }
        match self.lifecycle.state() {
            ConnectionState::Connected => (),
            ConnectionState::Connecting => {
                return Err(Error::protocol(format!(
                    "{} must not be received before CONNACK", p.name())));
            }
            s => {
                trace!("Ignoring {} while {:?}", p.name(), s);
                return Ok(());
            }
        }
        match p {
            Packet::Publish(publish) => self.incoming.on_publish(publish, &mut self.outbox),
            Packet::Puback(ack) => self.outgoing.on_puback(ack, &mut self.outbox),
            Packet::Pubrec(ack) => self.outgoing.on_pubrec(ack, &mut self.outbox),
            Packet::Pubcomp(ack) => self.outgoing.on_pubcomp(ack, &mut self.outbox),
            Packet::Pubrel(ack) => self.incoming.on_pubrel(ack, &mut self.outbox),
            Packet::Suback(suback) => self.on_suback(suback),
            Packet::Unsuback(pid) => self.on_unsuback(pid),
            Packet::Pingresp => Ok(()),
            Packet::Disconnect(reason) => {
                Err(Error::RemoteError { packet: "DISCONNECT", reason })
            }
            Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::Pingreq => {
                Err(Error::protocol(format!("{} must not be sent by a broker", p.name())))
            }
        }
    }

    /// Queue a DISCONNECT carrying the violation's reason code. The caller
    /// then closes the transport and calls [`Session::on_connection_lost`]
    /// with [`DisconnectSource::Client`].
    pub fn on_protocol_violation(&mut self, err: &Error) {
        error!("Closing connection: {}", err);
        let reason = match err {
            Error::ProtocolViolation { reason, .. } => *reason,
            _ => ReasonCode::UNSPECIFIED_ERROR,
        };
        self.lifecycle.begin_disconnect();
        self.outbox.clear();
        self.outbox.push_back(Packet::Disconnect(reason));
    }

    /// Start a user disconnect. If connected, queues a DISCONNECT and
    /// returns true; the caller closes the transport and calls
    /// [`Session::on_connection_lost`] with [`DisconnectSource::User`].
    /// Otherwise any scheduled reconnect is cancelled and the session ends.
    pub fn disconnect(&mut self) -> bool {
        match self.lifecycle.state() {
            ConnectionState::Connected => {
                self.lifecycle.begin_disconnect();
                self.outbox.push_back(Packet::Disconnect(ReasonCode::SUCCESS));
                true
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                self.on_connection_lost(DisconnectSource::User, &Error::Disconnected);
                false
            }
            ConnectionState::Disconnected => {
                self.lifecycle.cancel_reconnect();
                self.terminate();
                false
            }
        }
    }

    /// The transport closed, or a connection attempt failed.
    ///
    /// Freezes outgoing admission, drops open incoming exchanges without
    /// acknowledging them and runs the disconnected listeners. Returns the
    /// reconnect plan, or `None` once the session has ended.
    pub fn on_connection_lost(&mut self, source: DisconnectSource, cause: &Error) -> Option<ReconnectPlan> {
        self.outgoing.freeze();
        self.incoming.clear();
        self.outbox.clear();
        self.sub_pids.clear();
        // Written but unanswered requests go out again on the next connection.
        let in_flight = std::mem::replace(&mut self.sub_requests, BTreeMap::new());
        for (_, req) in in_flight.into_iter().rev() {
            match req {
                SubRequest::Resubscribe { .. } => {}
                req => self.sub_queue.push_front(req),
            }
        }

        match self.lifecycle.on_disconnected(source, cause) {
            Some(plan) => {
                if let Some(c) = &plan.connect {
                    self.incoming.set_receive_maximum(c.receive_maximum);
                    self.connect = c.clone();
                }
                Some(plan)
            }
            None => {
                self.terminate();
                None
            }
        }
    }

    /// Fail everything still waiting and close every flow.
    fn terminate(&mut self) {
        self.ended = true;
        debug!("Session ended with {} open outgoing exchanges", self.outgoing.open());
        self.outgoing.fail_queued(|| Error::Disconnected);
        for req in self.sub_queue.drain(..) {
            match req {
                SubRequest::Subscribe { tx: Some(tx), .. } => {
                    let _ = tx.send(Err(Error::Disconnected));
                }
                SubRequest::Unsubscribe { tx: Some(tx), .. } => {
                    let _ = tx.send(Ok(()));
                }
                _ => {}
            }
        }
        let mut ignored = VecDeque::new();
        for flow in self.incoming.flow_ids() {
            self.incoming.remove_flow(flow, FlowState::Done, &mut ignored);
        }
    }

    fn end_flow(&mut self, flow: FlowId, end: FlowState, tx: Option<UnsubscribeTx>) {
        let filters: Vec<String> = match self.incoming.flow_topics(flow) {
            Some(topics) => topics.iter().map(|t| t.filter.clone()).collect(),
            None => {
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(()));
                }
                return;
            }
        };
        self.incoming.remove_flow(flow, end, &mut self.outbox);

        // Never subscribed: drop the queued SUBSCRIBE instead.
        let queued = self.sub_queue.iter().position(|r| match r {
            SubRequest::Subscribe { flow: f, .. } => *f == flow,
            _ => false,
        });
        if let Some(i) = queued {
            if let Some(SubRequest::Subscribe { tx: Some(stx), .. }) = self.sub_queue.remove(i) {
                let _ = stx.send(Err(Error::from("Subscription ended before it was made")));
            }
            if let Some(tx) = tx {
                let _ = tx.send(Ok(()));
            }
            return;
        }

        if self.is_terminated() {
            if let Some(tx) = tx {
                let _ = tx.send(Ok(()));
            }
            return;
        }
        self.sub_queue.push_back(SubRequest::Unsubscribe { filters, tx });
        self.drain_subs();
    }

    /// Subscribe every active flow again in one SUBSCRIBE.
    fn resubscribe(&mut self) {
        let flows = self.incoming.flows_in(FlowState::Active);
        if flows.is_empty() {
            return;
        }
        let topics: Vec<SubscribeTopic> = flows.iter()
            .filter_map(|f| self.incoming.flow_topics(*f))
            .flat_map(|t| t.iter().cloned())
            .collect();
        debug!("Session expired, resubscribing {} flows", flows.len());
        self.sub_queue.push_front(SubRequest::Resubscribe { flows, topics });
    }

    /// Write queued SUBSCRIBE/UNSUBSCRIBE requests while identifiers last.
    fn drain_subs(&mut self) {
        if self.lifecycle.state() != ConnectionState::Connected {
            return;
        }
        while !self.sub_queue.is_empty() {
            let pid = match self.sub_pids.allocate() {
                Some(pid) => pid,
                None => {
                    trace!("{} subscription requests wait for an identifier", self.sub_queue.len());
                    return;
                }
            };
            let req = match self.sub_queue.pop_front() {
                Some(req) => req,
                None => return,
            };
            let packet = match &req {
                SubRequest::Subscribe { topics, .. } | SubRequest::Resubscribe { topics, .. } => {
                    Packet::Subscribe(Subscribe { pid, topics: topics.clone() })
                }
                SubRequest::Unsubscribe { filters, .. } => {
                    Packet::Unsubscribe(Unsubscribe { pid, filters: filters.clone() })
                }
            };
            self.outbox.push_back(packet);
            self.sub_requests.insert(pid, req);
        }
    }

    fn take_sub_request(&mut self, packet: &str, pid: Pid) -> Result<SubRequest> {
        let req = self.sub_requests.remove(&pid).ok_or_else(|| {
            Error::protocol(format!("{} contained unknown packet identifier {}", packet, pid))
        })?;
        self.sub_pids.release(pid)?;
        Ok(req)
    }

    fn on_suback(&mut self, suback: Suback) -> Result<()> {
        match self.take_sub_request("SUBACK", suback.pid)? {
            SubRequest::Subscribe { flow, topics, tx } => {
                if suback.granted.len() != topics.len() {
                    return Err(Error::protocol("SUBACK must contain one return code per topic"));
                }
                if suback.granted.iter().all(Option::is_none) {
                    warn!("Every topic of flow {:?} was refused", flow);
                    self.incoming.remove_flow(flow, FlowState::Cancelled, &mut self.outbox);
                    if let Some(tx) = tx {
                        let _ = tx.send(Err(Error::RemoteError {
                            packet: "SUBACK",
                            reason: ReasonCode::UNSPECIFIED_ERROR,
                        }));
                    }
                } else {
                    self.incoming.activate_flow(flow);
                    let delivered = match tx {
                        Some(tx) => tx.send(Ok(suback)).is_ok(),
                        None => true,
                    };
                    if !delivered {
                        self.cancel_flow(flow);
                    }
                }
            }
            SubRequest::Resubscribe { flows, topics } => {
                if suback.granted.len() != topics.len() {
                    return Err(Error::protocol("SUBACK must contain one return code per topic"));
                }
                let refused = suback.granted.iter().filter(|g| g.is_none()).count();
                if refused > 0 {
                    warn!("{} topics refused while resubscribing {} flows", refused, flows.len());
                }
            }
            SubRequest::Unsubscribe { .. } => {
                return Err(Error::protocol("SUBACK must not be received for an UNSUBSCRIBE"));
            }
        }
        self.drain_subs();
        Ok(())
    }

    fn on_unsuback(&mut self, pid: Pid) -> Result<()> {
        match self.take_sub_request("UNSUBACK", pid)? {
            SubRequest::Unsubscribe { tx, .. } => {
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(()));
                }
            }
            _ => return Err(Error::protocol("UNSUBACK must not be received for a SUBSCRIBE")),
        }
        self.drain_subs();
        Ok(())
    }
}
