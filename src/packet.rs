//! The structured packet model the delivery engine works on.
//!
//! These values carry every field the QoS flows care about (packet
//! identifier, QoS, DUP flag and reason code). Converting them to and
//! from bytes is the job of [`crate::codec`].

use std::{
    convert::TryFrom,
    fmt::{self, Display, Formatter},
    num::NonZeroU16,
};

/// A packet identifier, in the range `1..=65535`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pid(NonZeroU16);

impl Pid {
    /// Returns the numeric value of this identifier.
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<u16> for Pid {
    type Error = crate::Error;

    fn try_from(x: u16) -> crate::Result<Pid> {
        match NonZeroU16::new(x) {
            Some(nz) => Ok(Pid(nz)),
            None => Err("Packet identifier 0 is not allowed".into()),
        }
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// MQTT quality of service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery, PUBLISH → PUBACK.
    AtLeastOnce,
    /// Assured delivery, PUBLISH → PUBREC → PUBREL → PUBCOMP.
    ExactlyOnce,
}

impl QoS {
    /// The numeric QoS level, 0 to 2.
    pub fn code(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// An MQTT 5 style reason code carried on acknowledgement and DISCONNECT packets.
///
/// Codes of `0x80` and above are errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    /// Success, or normal disconnection on DISCONNECT.
    pub const SUCCESS: ReasonCode = ReasonCode(0x00);
    /// PUBACK/PUBREC: accepted but nobody was subscribed.
    pub const NO_MATCHING_SUBSCRIBERS: ReasonCode = ReasonCode(0x10);
    /// Generic failure.
    pub const UNSPECIFIED_ERROR: ReasonCode = ReasonCode(0x80);
    /// DISCONNECT: the peer violated the protocol.
    pub const PROTOCOL_ERROR: ReasonCode = ReasonCode(0x82);
    /// PUBACK/PUBREC: the identifier is already used by another exchange.
    pub const PACKET_IDENTIFIER_IN_USE: ReasonCode = ReasonCode(0x91);
    /// PUBREL/PUBCOMP: no exchange is known for the identifier.
    pub const PACKET_IDENTIFIER_NOT_FOUND: ReasonCode = ReasonCode(0x92);
    /// DISCONNECT: more QoS 1/2 publishes were in flight than allowed.
    pub const RECEIVE_MAXIMUM_EXCEEDED: ReasonCode = ReasonCode(0x93);

    /// Returns true if this code signals a failure.
    pub fn is_error(self) -> bool {
        self.0 >= 0x80
    }
}

impl Default for ReasonCode {
    fn default() -> ReasonCode {
        ReasonCode::SUCCESS
    }
}

impl Display for ReasonCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// An application message, independent of any packet identifier.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Requested quality of service.
    pub qos: QoS,
    /// Retain flag, passed through untouched.
    pub retain: bool,
}

/// A PUBLISH packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Publish {
    /// Set on retransmission.
    pub dup: bool,
    /// Present for QoS 1 and 2.
    pub pid: Option<Pid>,
    /// The message carried.
    pub message: Message,
}

impl Publish {
    /// The QoS of the carried message.
    pub fn qos(&self) -> QoS {
        self.message.qos
    }
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share this body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ack {
    /// Identifier of the exchange acknowledged.
    pub pid: Pid,
    /// Outcome.
    pub reason: ReasonCode,
}

impl Ack {
    /// A successful acknowledgement of `pid`.
    pub fn success(pid: Pid) -> Ack {
        Ack { pid, reason: ReasonCode::SUCCESS }
    }
}

/// A CONNECT packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connect {
    /// Client identifier; empty lets the broker assign one.
    pub client_id: String,
    /// Ask the broker to drop any previous session.
    pub clean_session: bool,
    /// Keep alive in seconds; 0 disables it.
    pub keep_alive: u16,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<Vec<u8>>,
    /// How many incoming QoS 1/2 exchanges this client accepts at once.
    pub receive_maximum: u16,
}

/// A CONNACK packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Connack {
    /// The broker resumed a previous session.
    pub session_present: bool,
    /// Outcome of the connect attempt.
    pub reason: ReasonCode,
    /// The broker's receive maximum, if it announced one.
    pub receive_maximum: Option<u16>,
}

/// One topic filter of a SUBSCRIBE.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscribeTopic {
    /// The filter, possibly with `+` and `#` wildcards.
    pub filter: String,
    /// Maximum QoS requested.
    pub qos: QoS,
}

/// A SUBSCRIBE packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscribe {
    /// Identifier of the request.
    pub pid: Pid,
    /// Filters to subscribe to.
    pub topics: Vec<SubscribeTopic>,
}

/// A SUBACK packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Suback {
    /// Identifier of the request answered.
    pub pid: Pid,
    /// Granted QoS per filter, `None` for a refused filter.
    pub granted: Vec<Option<QoS>>,
}

/// An UNSUBSCRIBE packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Unsubscribe {
    /// Identifier of the request.
    pub pid: Pid,
    /// Filters to remove.
    pub filters: Vec<String>,
}

/// Every packet the engine sends or receives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// CONNECT
    Connect(Connect),
    /// CONNACK
    Connack(Connack),
    /// PUBLISH
    Publish(Publish),
    /// PUBACK
    Puback(Ack),
    /// PUBREC
    Pubrec(Ack),
    /// PUBREL
    Pubrel(Ack),
    /// PUBCOMP
    Pubcomp(Ack),
    /// SUBSCRIBE
    Subscribe(Subscribe),
    /// SUBACK
    Suback(Suback),
    /// UNSUBSCRIBE
    Unsubscribe(Unsubscribe),
    /// UNSUBACK
    Unsuback(Pid),
    /// PINGREQ
    Pingreq,
    /// PINGRESP
    Pingresp,
    /// DISCONNECT
    Disconnect(ReasonCode),
}

impl Packet {
    /// The packet identifier, for packets that carry one.
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Packet::Publish(p) => p.pid,
            Packet::Puback(a) | Packet::Pubrec(a) | Packet::Pubrel(a) | Packet::Pubcomp(a) => {
                Some(a.pid)
            }
            Packet::Subscribe(s) => Some(s.pid),
            Packet::Suback(s) => Some(s.pid),
            Packet::Unsubscribe(u) => Some(u.pid),
            Packet::Unsuback(pid) => Some(*pid),
            Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Pingreq
            | Packet::Pingresp
            | Packet::Disconnect(_) => None,
        }
    }

    /// A short upper-case name, as used in log lines and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Connack(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::Puback(_) => "PUBACK",
            Packet::Pubrec(_) => "PUBREC",
            Packet::Pubrel(_) => "PUBREL",
            Packet::Pubcomp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Suback(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::Unsuback(_) => "UNSUBACK",
            Packet::Pingreq => "PINGREQ",
            Packet::Pingresp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
        }
    }
}

#[cfg(test)]
pub(crate) fn pid(x: u16) -> Pid {
    Pid::try_from(x).expect("non-zero pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_zero_rejected() {
        assert!(Pid::try_from(0).is_err());
        assert_eq!(Pid::try_from(7).unwrap().get(), 7);
    }

    #[test]
    fn reason_code_errors() {
        assert!(!ReasonCode::SUCCESS.is_error());
        assert!(!ReasonCode::NO_MATCHING_SUBSCRIBERS.is_error());
        assert!(ReasonCode::UNSPECIFIED_ERROR.is_error());
        assert!(ReasonCode::PACKET_IDENTIFIER_NOT_FOUND.is_error());
    }

    #[test]
    fn ack_packets_expose_pid() {
        let p = Packet::Pubrel(Ack::success(pid(9)));
        assert_eq!(p.pid(), Some(pid(9)));
        assert_eq!(p.name(), "PUBREL");
        assert_eq!(Packet::Pingreq.pid(), None);
    }
}
