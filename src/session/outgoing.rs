//! Publish → acknowledgement handshakes for messages this client sends.

use crate::{
    packet::{Ack, Message, Packet, Pid, Publish, QoS, ReasonCode},
    session::store::{ExchangeSnapshot, OutgoingState, SessionStore},
    util::PidAllocator,
    Error,
    Result,
};
use log::{debug, trace, warn};
use std::{
    cmp,
    collections::{BTreeMap, VecDeque},
};
use tokio::sync::oneshot;

/// The outcome of a successfully completed publish.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishResult {
    /// Identifier the exchange used; `None` for QoS 0.
    pub pid: Option<Pid>,
    /// QoS of the message.
    pub qos: QoS,
    /// Reason code of the final acknowledgement.
    pub reason: ReasonCode,
}

pub(crate) type PublishTx = oneshot::Sender<Result<PublishResult>>;

/// Drives outgoing QoS 1 and QoS 2 exchanges.
///
/// Publishes that cannot get a packet identifier are held in FIFO order
/// until an open exchange completes.
pub struct OutgoingQos {
    pids: PidAllocator,
    store: Box<dyn SessionStore>,
    /// The caller waiting on each open exchange.
    waiters: BTreeMap<Pid, PublishTx>,
    /// Publishes not yet admitted.
    queued: VecDeque<(Message, PublishTx)>,
    /// Highest identifier this coordinator may use.
    id_limit: u16,
    /// Maximum number of open exchanges on the current connection.
    send_maximum: usize,
    frozen: bool,
}

impl OutgoingQos {
    /// A frozen coordinator using identifiers `1..=id_limit`.
    pub fn new(id_limit: u16, store: Box<dyn SessionStore>) -> OutgoingQos {
        OutgoingQos {
            pids: PidAllocator::with_bounds(1, id_limit),
            store,
            waiters: BTreeMap::new(),
            queued: VecDeque::new(),
            id_limit,
            send_maximum: id_limit as usize,
            frozen: true,
        }
    }

    /// Number of open exchanges.
    pub fn open(&self) -> usize {
        self.store.len()
    }

    /// Number of publishes waiting for admission.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Returns true while no new exchanges are admitted.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The store backing this coordinator.
    pub fn store(&self) -> &dyn SessionStore {
        &*self.store
    }

    /// Give up the store, e.g. to hand it to the next session.
    pub fn into_store(self) -> Box<dyn SessionStore> {
        self.store
    }

    /// Returns true if a publish of `qos` would be written right now.
    pub fn can_admit(&self, qos: QoS) -> bool {
        !self.frozen && self.queued.is_empty() && (qos == QoS::AtMostOnce || self.has_capacity())
    }

    /// Queue a publish and admit as many queued publishes as possible.
    pub(crate) fn publish(&mut self, message: Message, tx: PublishTx, out: &mut VecDeque<Packet>) {
        self.queued.push_back((message, tx));
        self.admit_queued(out);
    }

    /// Stop admitting publishes. Open exchanges are kept as they are.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Resume on a new connection.
    ///
    /// With `session_present` every stored exchange is retransmitted once,
    /// before queued publishes are admitted. Otherwise every stored
    /// exchange fails with [`Error::SessionExpired`].
    pub(crate) fn resume(
        &mut self,
        session_present: bool,
        send_maximum: u16,
        out: &mut VecDeque<Packet>,
    ) -> Result<()> {
        let n = cmp::max(cmp::min(self.id_limit, send_maximum), 1);
        let stored = self.store.list_all();
        // Resumed ids keep their numbers even if the new maximum is lower.
        let highest = match session_present {
            true => stored.iter().map(|s| s.pid.get()).max().unwrap_or(0),
            false => 0,
        };
        self.pids = PidAllocator::with_bounds(1, cmp::max(n, highest));
        self.send_maximum = n as usize;

        if session_present {
            debug!("Resuming {} outgoing exchanges", stored.len());
            for mut snapshot in stored {
                self.pids.reserve(snapshot.pid)?;
                match snapshot.state {
                    OutgoingState::Sent => {
                        snapshot.dup = true;
                        out.push_back(Packet::Publish(Publish {
                            dup: true,
                            pid: Some(snapshot.pid),
                            message: snapshot.message.clone(),
                        }));
                        self.store.store(snapshot);
                    }
                    OutgoingState::AwaitingComp => {
                        out.push_back(Packet::Pubrel(Ack::success(snapshot.pid)));
                    }
                }
            }
        } else {
            if !stored.is_empty() {
                warn!("Session expired, failing {} outgoing exchanges", stored.len());
            }
            self.store.clear_all();
            for snapshot in stored {
                self.resolve(snapshot.pid, Err(Error::SessionExpired));
            }
        }

        self.frozen = false;
        self.admit_queued(out);
        Ok(())
    }

    /// Fail every publish still waiting for admission.
    pub(crate) fn fail_queued(&mut self, make_err: impl Fn() -> Error) {
        for (_, tx) in self.queued.drain(..) {
            let _ = tx.send(Err(make_err()));
        }
    }

    pub(crate) fn on_puback(&mut self, ack: Ack, out: &mut VecDeque<Packet>) -> Result<()> {
        let snapshot = self.expect_open("PUBACK", ack.pid)?;
        if snapshot.state == OutgoingState::AwaitingComp {
            return Err(Error::protocol("PUBACK must not be received for a PUBREL"));
        }
        if snapshot.qos() != QoS::AtLeastOnce {
            return Err(Error::protocol("PUBACK must not be received for a QoS 2 PUBLISH"));
        }
        let result = if ack.reason.is_error() {
            Err(Error::RemoteError { packet: "PUBACK", reason: ack.reason })
        } else {
            Ok(PublishResult { pid: Some(ack.pid), qos: QoS::AtLeastOnce, reason: ack.reason })
        };
        self.complete(ack.pid, result, out)
    }

    pub(crate) fn on_pubrec(&mut self, ack: Ack, out: &mut VecDeque<Packet>) -> Result<()> {
        let snapshot = self.expect_open("PUBREC", ack.pid)?;
        if snapshot.state == OutgoingState::AwaitingComp {
            return Err(Error::protocol("PUBREC must not be received when the PUBREL has already been sent"));
        }
        if snapshot.qos() != QoS::ExactlyOnce {
            return Err(Error::protocol("PUBREC must not be received for a QoS 1 PUBLISH"));
        }
        if ack.reason.is_error() {
            debug!("PUBREC pid={} carried error {}", ack.pid, ack.reason);
            return self.complete(
                ack.pid,
                Err(Error::RemoteError { packet: "PUBREC", reason: ack.reason }),
                out);
        }
        let mut snapshot = snapshot.clone();
        snapshot.state = OutgoingState::AwaitingComp;
        self.store.store(snapshot);
        out.push_back(Packet::Pubrel(Ack::success(ack.pid)));
        Ok(())
    }

    pub(crate) fn on_pubcomp(&mut self, ack: Ack, out: &mut VecDeque<Packet>) -> Result<()> {
        let snapshot = self.expect_open("PUBCOMP", ack.pid)?;
        if snapshot.state != OutgoingState::AwaitingComp {
            return Err(Error::protocol("PUBCOMP must not be received before the PUBREL was sent"));
        }
        let result = if ack.reason.is_error() {
            Err(Error::RemoteError { packet: "PUBCOMP", reason: ack.reason })
        } else {
            Ok(PublishResult { pid: Some(ack.pid), qos: QoS::ExactlyOnce, reason: ack.reason })
        };
        self.complete(ack.pid, result, out)
    }

    fn expect_open(&self, packet: &str, pid: Pid) -> Result<&ExchangeSnapshot> {
        self.store.get(pid).ok_or_else(|| {
            Error::protocol(format!("{} contained unknown packet identifier {}", packet, pid))
        })
    }

    fn has_capacity(&self) -> bool {
        self.store.len() < self.send_maximum && !self.pids.is_exhausted()
    }

    fn admit_queued(&mut self, out: &mut VecDeque<Packet>) {
        while !self.frozen {
            let qos = match self.queued.front() {
                Some((m, _)) => m.qos,
                None => return,
            };
            if qos != QoS::AtMostOnce && !self.has_capacity() {
                trace!("No packet identifier free, holding {} publishes", self.queued.len());
                return;
            }
            let (message, tx) = match self.queued.pop_front() {
                Some(x) => x,
                None => return,
            };
            if qos == QoS::AtMostOnce {
                out.push_back(Packet::Publish(Publish { dup: false, pid: None, message }));
                let _ = tx.send(Ok(PublishResult {
                    pid: None,
                    qos,
                    reason: ReasonCode::SUCCESS,
                }));
                continue;
            }
            let pid = match self.pids.allocate() {
                Some(pid) => pid,
                None => {
                    self.queued.push_front((message, tx));
                    return;
                }
            };
            trace!("Admitted QoS {} publish pid={}", qos.code(), pid);
            out.push_back(Packet::Publish(Publish {
                dup: false,
                pid: Some(pid),
                message: message.clone(),
            }));
            self.store.store(ExchangeSnapshot {
                pid,
                message,
                dup: false,
                state: OutgoingState::Sent,
            });
            self.waiters.insert(pid, tx);
        }
    }

    fn complete(
        &mut self,
        pid: Pid,
        result: Result<PublishResult>,
        out: &mut VecDeque<Packet>,
    ) -> Result<()> {
        self.store.discard(pid);
        self.pids.release(pid)?;
        self.resolve(pid, result);
        self.admit_queued(out);
        Ok(())
    }

    fn resolve(&mut self, pid: Pid, result: Result<PublishResult>) {
        match self.waiters.remove(&pid) {
            Some(tx) => {
                if tx.send(result).is_err() {
                    trace!("Publish caller for pid={} went away", pid);
                }
            }
            None => debug!("No caller waiting on pid={}", pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{packet::pid, session::store::MemoryStore};
    use tokio::sync::oneshot::{self, error::TryRecvError};

    type Rx = oneshot::Receiver<Result<PublishResult>>;

    fn message(qos: QoS, tag: &str) -> Message {
        Message {
            topic: format!("t/{}", tag),
            payload: tag.as_bytes().to_vec(),
            qos,
            retain: false,
        }
    }

    fn coordinator(id_limit: u16) -> OutgoingQos {
        let mut o = OutgoingQos::new(id_limit, Box::new(MemoryStore::new()));
        o.resume(false, u16::MAX, &mut VecDeque::new()).unwrap();
        o
    }

    fn publish(o: &mut OutgoingQos, m: Message, out: &mut VecDeque<Packet>) -> Rx {
        let (tx, rx) = oneshot::channel();
        o.publish(m, tx, out);
        rx
    }

    fn sent_pids(out: &mut VecDeque<Packet>) -> Vec<(u16, bool)> {
        out.drain(..).filter_map(|p| match p {
            Packet::Publish(p) => p.pid.map(|pid| (pid.get(), p.dup)),
            _ => None,
        }).collect()
    }

    #[test]
    fn held_publish_takes_released_id() {
        let mut o = coordinator(2);
        let mut out = VecDeque::new();
        let mut a = publish(&mut o, message(QoS::AtLeastOnce, "a"), &mut out);
        let _b = publish(&mut o, message(QoS::AtLeastOnce, "b"), &mut out);
        let mut c = publish(&mut o, message(QoS::AtLeastOnce, "c"), &mut out);
        assert_eq!(sent_pids(&mut out), vec![(1, false), (2, false)]);
        assert_eq!(o.queued(), 1);
        assert!(matches!(c.try_recv(), Err(TryRecvError::Empty)));

        o.on_puback(Ack::success(pid(1)), &mut out).unwrap();
        let res = a.try_recv().unwrap().unwrap();
        assert_eq!(res.pid, Some(pid(1)));
        assert_eq!(o.queued(), 0);
        match out.pop_front() {
            Some(Packet::Publish(p)) => {
                assert_eq!(p.pid, Some(pid(1)));
                assert_eq!(p.message.topic, "t/c");
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn qos2_handshake() {
        let mut o = coordinator(10);
        let mut out = VecDeque::new();
        let mut rx = publish(&mut o, message(QoS::ExactlyOnce, "x"), &mut out);
        out.clear();

        o.on_pubrec(Ack::success(pid(1)), &mut out).unwrap();
        assert_eq!(out.pop_front(), Some(Packet::Pubrel(Ack::success(pid(1)))));
        assert_eq!(o.store().get(pid(1)).unwrap().state, OutgoingState::AwaitingComp);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        o.on_pubcomp(Ack::success(pid(1)), &mut out).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap().qos, QoS::ExactlyOnce);
        assert_eq!(o.open(), 0);
    }

    #[test]
    fn pubrec_error_ends_exchange_without_pubrel() {
        let mut o = coordinator(10);
        let mut out = VecDeque::new();
        let mut rx = publish(&mut o, message(QoS::ExactlyOnce, "x"), &mut out);
        out.clear();

        let ack = Ack { pid: pid(1), reason: ReasonCode::UNSPECIFIED_ERROR };
        o.on_pubrec(ack, &mut out).unwrap();
        assert!(out.is_empty());
        match rx.try_recv().unwrap() {
            Err(Error::RemoteError { packet: "PUBREC", reason }) =>
                assert_eq!(reason, ReasonCode::UNSPECIFIED_ERROR),
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(o.open(), 0);
    }

    #[test]
    fn unmatched_acks_are_protocol_violations() {
        let mut o = coordinator(10);
        let mut out = VecDeque::new();
        assert!(matches!(o.on_puback(Ack::success(pid(3)), &mut out),
                         Err(Error::ProtocolViolation { .. })));
        assert!(matches!(o.on_pubcomp(Ack::success(pid(3)), &mut out),
                         Err(Error::ProtocolViolation { .. })));

        let _q1 = publish(&mut o, message(QoS::AtLeastOnce, "one"), &mut out);
        let _q2 = publish(&mut o, message(QoS::ExactlyOnce, "two"), &mut out);
        // PUBCOMP before PUBREL, PUBREC for QoS 1, PUBACK for QoS 2.
        assert!(o.on_pubcomp(Ack::success(pid(2)), &mut out).is_err());
        assert!(o.on_pubrec(Ack::success(pid(1)), &mut out).is_err());
        assert!(o.on_puback(Ack::success(pid(2)), &mut out).is_err());

        o.on_pubrec(Ack::success(pid(2)), &mut out).unwrap();
        assert!(o.on_pubrec(Ack::success(pid(2)), &mut out).is_err());
        assert!(o.on_puback(Ack::success(pid(2)), &mut out).is_err());
        assert_eq!(o.open(), 2);
    }

    #[test]
    fn frozen_coordinator_holds_publishes() {
        let mut o = OutgoingQos::new(10, Box::new(MemoryStore::new()));
        let mut out = VecDeque::new();
        let _rx = publish(&mut o, message(QoS::AtLeastOnce, "x"), &mut out);
        let mut q0 = publish(&mut o, message(QoS::AtMostOnce, "y"), &mut out);
        assert!(out.is_empty());
        assert!(!o.can_admit(QoS::AtMostOnce));

        o.resume(true, 10, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(q0.try_recv().unwrap().unwrap().pid, None);
    }

    #[test]
    fn resume_with_session_resends_once() {
        let mut o = coordinator(10);
        let mut out = VecDeque::new();
        let _a = publish(&mut o, message(QoS::AtLeastOnce, "a"), &mut out);
        let _b = publish(&mut o, message(QoS::ExactlyOnce, "b"), &mut out);
        o.on_pubrec(Ack::success(pid(2)), &mut out).unwrap();
        out.clear();

        o.freeze();
        let _c = publish(&mut o, message(QoS::AtLeastOnce, "c"), &mut out);
        assert!(out.is_empty());

        o.resume(true, 10, &mut out).unwrap();
        let packets: Vec<Packet> = out.drain(..).collect();
        assert_eq!(packets.len(), 3);
        let resent = &packets[..2];
        assert!(resent.iter().any(|p| matches!(p,
            Packet::Publish(Publish { dup: true, pid: Some(x), .. }) if *x == pid(1))));
        assert!(resent.contains(&Packet::Pubrel(Ack::success(pid(2)))));
        // The new publish goes out last, on a fresh id.
        assert!(matches!(&packets[2],
            Packet::Publish(Publish { dup: false, pid: Some(x), .. }) if *x == pid(3)));
        assert!(o.store().get(pid(1)).unwrap().dup);
    }

    #[test]
    fn resume_without_session_fails_each_once() {
        let mut o = coordinator(10);
        let mut out = VecDeque::new();
        let mut rxs: Vec<Rx> = (0..3)
            .map(|i| publish(&mut o, message(QoS::ExactlyOnce, &i.to_string()), &mut out))
            .collect();
        o.freeze();
        out.clear();

        o.resume(false, 10, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(o.open(), 0);
        for rx in rxs.iter_mut() {
            assert!(matches!(rx.try_recv(), Ok(Err(Error::SessionExpired))));
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        }
        // Ids start over.
        let _d = publish(&mut o, message(QoS::AtLeastOnce, "d"), &mut out);
        assert_eq!(sent_pids(&mut out), vec![(1, false)]);
    }

    #[test]
    fn never_more_open_than_send_maximum() {
        let mut o = OutgoingQos::new(100, Box::new(MemoryStore::new()));
        let mut out = VecDeque::new();
        o.resume(false, 3, &mut out).unwrap();
        let mut rxs = Vec::new();
        for i in 0..20u16 {
            rxs.push(publish(&mut o, message(QoS::AtLeastOnce, &i.to_string()), &mut out));
            assert!(o.open() <= 3);
            if i % 4 == 3 {
                let acked: Vec<u16> = sent_pids(&mut out).into_iter().map(|(p, _)| p).collect();
                for p in acked.into_iter().take(2) {
                    o.on_puback(Ack::success(pid(p)), &mut out).unwrap();
                    assert!(o.open() <= 3);
                }
            }
        }
        let completed = rxs.iter_mut()
            .map(|rx| matches!(rx.try_recv(), Ok(Ok(_))))
            .filter(|done| *done)
            .count();
        assert_eq!(o.open() + o.queued() + completed, 20);
    }

    #[test]
    fn dropped_caller_does_not_abort_exchange() {
        let mut o = coordinator(10);
        let mut out = VecDeque::new();
        drop(publish(&mut o, message(QoS::ExactlyOnce, "x"), &mut out));
        out.clear();
        o.on_pubrec(Ack::success(pid(1)), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        o.on_pubcomp(Ack::success(pid(1)), &mut out).unwrap();
        assert_eq!(o.open(), 0);
    }
}
