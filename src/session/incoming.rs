//! Receive → acknowledgement handshakes and fan-out to subscriber flows.

use crate::{
    packet::{Ack, Message, Packet, Pid, Publish, QoS, ReasonCode, SubscribeTopic},
    Error,
    Result,
};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::mpsc;

/// How a subscriber flow acknowledges deliveries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub enum AckMode {
    /// Acknowledged as soon as the message is handed to the flow.
    Automatic,
    /// Acknowledged when [`Delivery::acknowledge`] is called or the
    /// delivery is dropped.
    Manual,
}

impl Default for AckMode {
    fn default() -> AckMode {
        AckMode::Automatic
    }
}

/// Identifies a registered subscriber flow.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FlowId(u64);

/// Lifecycle of a subscriber flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowState {
    /// Registered, SUBACK not yet received.
    Init,
    /// Subscribed.
    Active,
    /// Unsubscribed or ended with the client.
    Done,
    /// Its receiver went away.
    Cancelled,
}

/// Names one flow's share of one incoming exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AckToken {
    pid: Pid,
    exchange: u64,
    flow: FlowId,
}

/// Acknowledges one delivery of a manual-mode flow.
///
/// Dropping it without calling [`Acknowledger::acknowledge`] also
/// acknowledges, so an exchange can always complete.
#[derive(Debug)]
pub struct Acknowledger {
    token: AckToken,
    tx: mpsc::UnboundedSender<AckToken>,
    sent: bool,
}

impl Acknowledger {
    /// Acknowledge the delivery.
    pub fn acknowledge(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if self.sent {
            return;
        }
        self.sent = true;
        // The connection task may be gone; nothing is owed then.
        let _ = self.tx.send(self.token);
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        self.send();
    }
}

/// One message handed to one subscriber flow.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    dup: bool,
    acknowledger: Option<Acknowledger>,
}

impl Delivery {
    /// Topic the message was published to.
    pub fn topic(&self) -> &str {
        &*self.message.topic
    }

    /// Message payload.
    pub fn payload(&self) -> &[u8] {
        &*self.message.payload
    }

    /// QoS the message was received with.
    pub fn qos(&self) -> QoS {
        self.message.qos
    }

    /// The whole message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Set if the broker marked the PUBLISH as a retransmission.
    pub fn dup(&self) -> bool {
        self.dup
    }

    /// Returns true if this delivery still waits for [`Delivery::acknowledge`].
    pub fn needs_ack(&self) -> bool {
        self.acknowledger.is_some()
    }

    /// Acknowledge this delivery. Does nothing for automatic flows, QoS 0
    /// messages, or a delivery already acknowledged.
    pub fn acknowledge(&mut self) {
        if let Some(a) = self.acknowledger.take() {
            a.acknowledge();
        }
    }

    /// Take the acknowledger to acknowledge later, e.g. from another task.
    pub fn take_acknowledger(&mut self) -> Option<Acknowledger> {
        self.acknowledger.take()
    }
}

struct Flow {
    topics: Vec<SubscribeTopic>,
    mode: AckMode,
    state: FlowState,
    sink: mpsc::UnboundedSender<Delivery>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IncomingState {
    /// Delivered, broker-facing ack not sent yet.
    Delivering,
    /// PUBREC sent, waiting for PUBREL.
    PubrecSent,
}

struct IncomingExchange {
    seq: u64,
    qos: QoS,
    /// Fan-out set, fixed at dispatch.
    flows: Vec<FlowId>,
    /// Manual flows that have not acknowledged yet.
    owing: BTreeSet<FlowId>,
    subscription_found: bool,
    pending_pubrel: bool,
    state: IncomingState,
}

/// Drives incoming QoS 1 and QoS 2 exchanges and fans messages out to
/// subscriber flows.
pub struct IncomingQos {
    flows: BTreeMap<FlowId, Flow>,
    next_flow: u64,
    exchanges: BTreeMap<Pid, IncomingExchange>,
    next_exchange: u64,
    receive_maximum: u16,
    ack_tx: mpsc::UnboundedSender<AckToken>,
}

impl IncomingQos {
    /// Acknowledgements of manual flows are sent through `ack_tx`; the
    /// owner feeds them back through [`IncomingQos::acknowledge`].
    pub fn new(receive_maximum: u16, ack_tx: mpsc::UnboundedSender<AckToken>) -> IncomingQos {
        IncomingQos {
            flows: BTreeMap::new(),
            next_flow: 1,
            exchanges: BTreeMap::new(),
            next_exchange: 1,
            receive_maximum: receive_maximum.max(1),
            ack_tx,
        }
    }

    /// How many incoming QoS 1/2 exchanges may be open at once.
    pub fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    /// Change the receive maximum, e.g. for a CONNECT that announces a
    /// different one. Exchanges already open are kept.
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) {
        self.receive_maximum = receive_maximum.max(1);
    }

    /// Register a flow receiving messages on topics matching any of its
    /// topic filters.
    pub fn register_flow(
        &mut self,
        topics: Vec<SubscribeTopic>,
        mode: AckMode,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> FlowId {
        let id = FlowId(self.next_flow);
        self.next_flow += 1;
        self.flows.insert(id, Flow { topics, mode, state: FlowState::Init, sink });
        id
    }

    /// Mark a flow subscribed.
    pub fn activate_flow(&mut self, id: FlowId) {
        if let Some(f) = self.flows.get_mut(&id) {
            if f.state == FlowState::Init {
                f.state = FlowState::Active;
            }
        }
    }

    /// State of a registered flow; `None` once removed.
    pub fn flow_state(&self, id: FlowId) -> Option<FlowState> {
        self.flows.get(&id).map(|f| f.state)
    }

    /// Topics of a registered flow.
    pub fn flow_topics(&self, id: FlowId) -> Option<&[SubscribeTopic]> {
        self.flows.get(&id).map(|f| &*f.topics)
    }

    /// Every flow in `state`.
    pub fn flows_in(&self, state: FlowState) -> Vec<FlowId> {
        self.flows.iter()
            .filter(|(_, f)| f.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Every registered flow.
    pub fn flow_ids(&self) -> Vec<FlowId> {
        self.flows.keys().cloned().collect()
    }

    /// Remove a flow, ending it as `Done` or `Cancelled`. Whatever it still
    /// owed counts as acknowledged.
    pub(crate) fn remove_flow(&mut self, id: FlowId, end: FlowState, out: &mut VecDeque<Packet>) {
        let flow = match self.flows.remove(&id) {
            Some(f) => f,
            None => return,
        };
        debug!("Flow {:?} {:?} -> {:?}", id, flow.state, end);
        let owed: Vec<Pid> = self.exchanges.iter()
            .filter(|(_, ex)| ex.owing.contains(&id))
            .map(|(pid, _)| *pid)
            .collect();
        for pid in owed {
            if let Some(ex) = self.exchanges.get_mut(&pid) {
                ex.owing.remove(&id);
            }
            self.try_finish(pid, out);
        }
    }

    /// Number of open incoming exchanges.
    pub fn open(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether the exchange for `pid` matched any flow; `None` if no such exchange.
    pub fn subscription_found(&self, pid: Pid) -> Option<bool> {
        self.exchanges.get(&pid).map(|ex| ex.subscription_found)
    }

    /// Number of flows an open exchange was fanned out to.
    pub fn fan_out(&self, pid: Pid) -> Option<usize> {
        self.exchanges.get(&pid).map(|ex| ex.flows.len())
    }

    /// Drop every open exchange without acknowledging. The broker
    /// retransmits them on the next connection.
    pub fn clear(&mut self) {
        if !self.exchanges.is_empty() {
            debug!("Dropping {} incoming exchanges", self.exchanges.len());
        }
        self.exchanges.clear();
    }

    pub(crate) fn on_publish(&mut self, publish: Publish, out: &mut VecDeque<Packet>) -> Result<()> {
        let qos = publish.qos();
        let pid = match (qos, publish.pid) {
            (QoS::AtMostOnce, _) => {
                self.dispatch(&publish, None, out);
                return Ok(());
            }
            (_, Some(pid)) => pid,
            (_, None) => return Err(Error::protocol("QoS 1/2 PUBLISH without packet identifier")),
        };

        if let Some(ex) = self.exchanges.get(&pid) {
            if ex.qos != qos {
                return Err(Error::protocol(format!(
                    "QoS {} PUBLISH must not be received with the same packet identifier as a QoS {} PUBLISH",
                    qos.code(), ex.qos.code())));
            }
            if !publish.dup {
                return Err(Error::protocol(format!(
                    "DUP flag must be set for a resent QoS {} PUBLISH", qos.code())));
            }
            trace!("Duplicate PUBLISH pid={}, not redelivered", pid);
            if ex.state == IncomingState::PubrecSent {
                out.push_back(Packet::Pubrec(Ack::success(pid)));
            }
            return Ok(());
        }

        if self.exchanges.len() >= self.receive_maximum as usize {
            return Err(Error::ProtocolViolation {
                reason: ReasonCode::RECEIVE_MAXIMUM_EXCEEDED,
                message: "Received more QoS 1 and/or 2 PUBLISHes than allowed by Receive Maximum".to_owned(),
            });
        }

        let seq = self.next_exchange;
        self.next_exchange += 1;
        let (flows, owing) = self.dispatch(&publish, Some((pid, seq)), out);
        trace!("PUBLISH pid={} fanned out to {} flows, {} owe an ack", pid, flows.len(), owing.len());
        self.exchanges.insert(pid, IncomingExchange {
            seq,
            qos,
            subscription_found: !flows.is_empty(),
            flows,
            owing,
            pending_pubrel: false,
            state: IncomingState::Delivering,
        });
        self.try_finish(pid, out);
        Ok(())
    }

    pub(crate) fn on_pubrel(&mut self, ack: Ack, out: &mut VecDeque<Packet>) -> Result<()> {
        let ex = match self.exchanges.get_mut(&ack.pid) {
            Some(ex) => ex,
            None => {
                // The PUBCOMP may have been lost; answer again.
                out.push_back(Packet::Pubcomp(Ack {
                    pid: ack.pid,
                    reason: ReasonCode::PACKET_IDENTIFIER_NOT_FOUND,
                }));
                return Ok(());
            }
        };
        if ex.qos != QoS::ExactlyOnce {
            return Err(Error::protocol(
                "PUBREL must not be received with the same packet identifier as a QoS 1 PUBLISH"));
        }
        match ex.state {
            IncomingState::PubrecSent => {
                self.exchanges.remove(&ack.pid);
                out.push_back(Packet::Pubcomp(Ack::success(ack.pid)));
            }
            IncomingState::Delivering => {
                trace!("PUBREL pid={} before all flows acknowledged, PUBCOMP deferred", ack.pid);
                ex.pending_pubrel = true;
            }
        }
        Ok(())
    }

    /// Record one flow's acknowledgement. Stale tokens from an earlier
    /// exchange or connection are ignored.
    pub(crate) fn acknowledge(&mut self, token: AckToken, out: &mut VecDeque<Packet>) {
        let ex = match self.exchanges.get_mut(&token.pid) {
            Some(ex) if ex.seq == token.exchange => ex,
            _ => {
                trace!("Ignoring stale acknowledgement for pid={}", token.pid);
                return;
            }
        };
        if ex.owing.remove(&token.flow) {
            self.try_finish(token.pid, out);
        }
    }

    /// Deliver to every matching flow. Returns the fan-out set and the
    /// flows owing an acknowledgement.
    fn dispatch(
        &mut self,
        publish: &Publish,
        exchange: Option<(Pid, u64)>,
        out: &mut VecDeque<Packet>,
    ) -> (Vec<FlowId>, BTreeSet<FlowId>) {
        let topic = &*publish.message.topic;
        let mut matched = Vec::new();
        let mut owing = BTreeSet::new();
        let mut gone = Vec::new();
        for (id, flow) in self.flows.iter() {
            if !flow.topics.iter().any(|t| filter_matches(&t.filter, topic)) {
                continue;
            }
            let acknowledger = match (flow.mode, exchange) {
                (AckMode::Manual, Some((pid, seq))) => Some(Acknowledger {
                    token: AckToken { pid, exchange: seq, flow: *id },
                    tx: self.ack_tx.clone(),
                    sent: false,
                }),
                _ => None,
            };
            let manual = acknowledger.is_some();
            let delivery = Delivery {
                message: publish.message.clone(),
                dup: publish.dup,
                acknowledger,
            };
            if let Err(mpsc::error::SendError(mut undelivered)) = flow.sink.send(delivery) {
                // Nobody will acknowledge; don't let the returned
                // acknowledger queue a token.
                if let Some(mut a) = undelivered.acknowledger.take() {
                    a.sent = true;
                }
                gone.push(*id);
                continue;
            }
            matched.push(*id);
            if manual {
                owing.insert(*id);
            }
        }
        for id in gone {
            self.remove_flow(id, FlowState::Cancelled, out);
        }
        (matched, owing)
    }

    /// Send the broker-facing ack once nothing is owed.
    fn try_finish(&mut self, pid: Pid, out: &mut VecDeque<Packet>) {
        let ex = match self.exchanges.get_mut(&pid) {
            Some(ex) => ex,
            None => return,
        };
        if !ex.owing.is_empty() {
            return;
        }
        match (ex.qos, ex.state) {
            (QoS::ExactlyOnce, IncomingState::Delivering) if ex.pending_pubrel => {
                self.exchanges.remove(&pid);
                out.push_back(Packet::Pubcomp(Ack::success(pid)));
            }
            (QoS::ExactlyOnce, IncomingState::Delivering) => {
                ex.state = IncomingState::PubrecSent;
                out.push_back(Packet::Pubrec(Ack::success(pid)));
            }
            (QoS::ExactlyOnce, IncomingState::PubrecSent) => {}
            _ => {
                self.exchanges.remove(&pid);
                out.push_back(Packet::Puback(Ack::success(pid)));
            }
        }
    }
}

/// Returns true if `topic` matches the subscription `filter`.
///
/// `+` matches one level, a trailing `#` matches any number of levels
/// including the parent. Wildcards at the first level never match
/// topics starting with `$`.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
