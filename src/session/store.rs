//! Persistence of open outgoing exchanges between connections.

use crate::packet::{Message, Pid, QoS};
use std::collections::BTreeMap;

/// Where an outgoing exchange is in its handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OutgoingState {
    /// PUBLISH written, waiting for PUBACK (QoS 1) or PUBREC (QoS 2).
    Sent,
    /// PUBREL written, waiting for PUBCOMP.
    AwaitingComp,
}

/// What the store keeps for one open outgoing exchange.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExchangeSnapshot {
    /// Identifier owned by the exchange.
    pub pid: Pid,
    /// The message published.
    pub message: Message,
    /// Set once the PUBLISH has been retransmitted.
    pub dup: bool,
    /// Handshake state.
    pub state: OutgoingState,
}

impl ExchangeSnapshot {
    /// QoS of the exchange.
    pub fn qos(&self) -> QoS {
        self.message.qos
    }
}

/// Keeps open outgoing exchanges so they can be resumed on a new connection.
///
/// Iteration order of `list_all` is unspecified.
pub trait SessionStore: Send {
    /// Insert or replace the snapshot for `snapshot.pid`.
    fn store(&mut self, snapshot: ExchangeSnapshot);
    /// Look up a snapshot.
    fn get(&self, pid: Pid) -> Option<&ExchangeSnapshot>;
    /// Remove and return a snapshot.
    fn discard(&mut self, pid: Pid) -> Option<ExchangeSnapshot>;
    /// All stored snapshots.
    fn list_all(&self) -> Vec<ExchangeSnapshot>;
    /// Remove every snapshot.
    fn clear_all(&mut self);
    /// Number of stored snapshots.
    fn len(&self) -> usize;
    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    exchanges: BTreeMap<Pid, ExchangeSnapshot>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl SessionStore for MemoryStore {
    fn store(&mut self, snapshot: ExchangeSnapshot) {
        self.exchanges.insert(snapshot.pid, snapshot);
    }

    fn get(&self, pid: Pid) -> Option<&ExchangeSnapshot> {
        self.exchanges.get(&pid)
    }

    fn discard(&mut self, pid: Pid) -> Option<ExchangeSnapshot> {
        self.exchanges.remove(&pid)
    }

    fn list_all(&self) -> Vec<ExchangeSnapshot> {
        self.exchanges.values().cloned().collect()
    }

    fn clear_all(&mut self) {
        self.exchanges.clear();
    }

    fn len(&self) -> usize {
        self.exchanges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::pid;

    fn snapshot(id: u16, state: OutgoingState) -> ExchangeSnapshot {
        ExchangeSnapshot {
            pid: pid(id),
            message: Message {
                topic: "t".to_owned(),
                payload: vec![id as u8],
                qos: QoS::ExactlyOnce,
                retain: false,
            },
            dup: false,
            state,
        }
    }

    #[test]
    fn store_replaces_by_pid() {
        let mut s = MemoryStore::new();
        s.store(snapshot(1, OutgoingState::Sent));
        s.store(snapshot(2, OutgoingState::Sent));
        s.store(snapshot(1, OutgoingState::AwaitingComp));
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(pid(1)).unwrap().state, OutgoingState::AwaitingComp);
    }

    #[test]
    fn discard_and_clear() {
        let mut s = MemoryStore::new();
        s.store(snapshot(1, OutgoingState::Sent));
        s.store(snapshot(7, OutgoingState::Sent));
        assert_eq!(s.discard(pid(7)).map(|x| x.pid), Some(pid(7)));
        assert_eq!(s.discard(pid(7)), None);
        assert_eq!(s.list_all().len(), 1);
        s.clear_all();
        assert!(s.is_empty());
        assert!(s.get(pid(1)).is_none());
    }
}
