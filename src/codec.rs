//! Mapping between [`crate::packet`] values and MQTT 3.1.1 frames.
//!
//! Byte-level encoding is done by `mqttrs`. MQTT 3.1.1 has no reason
//! codes on acknowledgements, so decoded acknowledgements are always
//! successful and error codes are dropped on encode.

use bytes::BytesMut;
use crate::{
    packet::{
        Ack, Connack, Connect, Message, Packet, Pid, Publish, QoS, ReasonCode, Suback,
        Subscribe, SubscribeTopic, Unsubscribe,
    },
    Error,
    Result,
};
use log::trace;
use mqttrs::{self, ConnectReturnCode, QosPid, SubscribeReturnCodes};
use std::convert::TryFrom;

/// Encode `p` and append the frame to `buf`.
pub fn encode(p: &Packet, buf: &mut BytesMut) -> Result<()> {
    let wire = to_wire(p)?;
    if cfg!(feature = "unsafe-logging") {
        trace!("encode p={:?}", wire);
    }
    mqttrs::encode(&wire, buf)?;
    Ok(())
}

/// Decode one frame from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` if `buf` does not yet hold a whole frame.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>> {
    match mqttrs::decode(buf)? {
        Some(wire) => {
            if cfg!(feature = "unsafe-logging") {
                trace!("decode p={:?}", wire);
            }
            Ok(Some(from_wire(wire)?))
        }
        None => Ok(None),
    }
}

/// Map a packet to its MQTT 3.1.1 shape.
pub fn to_wire(p: &Packet) -> Result<mqttrs::Packet> {
    Ok(match p {
        Packet::Connect(c) => mqttrs::Packet::Connect(mqttrs::Connect {
            protocol: mqttrs::Protocol::MQTT311,
            keep_alive: c.keep_alive,
            client_id: c.client_id.clone(),
            clean_session: c.clean_session,
            last_will: None,
            username: c.username.clone(),
            password: c.password.clone(),
        }),
        Packet::Connack(ca) => mqttrs::Packet::Connack(mqttrs::Connack {
            session_present: ca.session_present,
            code: return_code_to_wire(ca.reason),
        }),
        Packet::Publish(p) => mqttrs::Packet::Publish(mqttrs::Publish {
            dup: p.dup,
            qospid: qospid_to_wire(p.message.qos, p.pid)?,
            retain: p.message.retain,
            topic_name: p.message.topic.clone(),
            payload: p.message.payload.clone(),
        }),
        Packet::Puback(a) => mqttrs::Packet::Puback(pid_to_wire(a.pid)?),
        Packet::Pubrec(a) => mqttrs::Packet::Pubrec(pid_to_wire(a.pid)?),
        Packet::Pubrel(a) => mqttrs::Packet::Pubrel(pid_to_wire(a.pid)?),
        Packet::Pubcomp(a) => mqttrs::Packet::Pubcomp(pid_to_wire(a.pid)?),
        Packet::Subscribe(s) => mqttrs::Packet::Subscribe(mqttrs::Subscribe {
            pid: pid_to_wire(s.pid)?,
            topics: s.topics.iter().map(|t| mqttrs::SubscribeTopic {
                topic_path: t.filter.clone(),
                qos: qos_to_wire(t.qos),
            }).collect(),
        }),
        Packet::Suback(s) => mqttrs::Packet::Suback(mqttrs::Suback {
            pid: pid_to_wire(s.pid)?,
            return_codes: s.granted.iter().map(|g| match g {
                Some(q) => SubscribeReturnCodes::Success(qos_to_wire(*q)),
                None => SubscribeReturnCodes::Failure,
            }).collect(),
        }),
        Packet::Unsubscribe(u) => mqttrs::Packet::Unsubscribe(mqttrs::Unsubscribe {
            pid: pid_to_wire(u.pid)?,
            topics: u.filters.clone(),
        }),
        Packet::Unsuback(pid) => mqttrs::Packet::Unsuback(pid_to_wire(*pid)?),
        Packet::Pingreq => mqttrs::Packet::Pingreq,
        Packet::Pingresp => mqttrs::Packet::Pingresp,
        Packet::Disconnect(_) => mqttrs::Packet::Disconnect,
    })
}

/// Map an MQTT 3.1.1 packet to the internal shape.
pub fn from_wire(p: mqttrs::Packet) -> Result<Packet> {
    Ok(match p {
        mqttrs::Packet::Connect(c) => Packet::Connect(Connect {
            client_id: c.client_id,
            clean_session: c.clean_session,
            keep_alive: c.keep_alive,
            username: c.username,
            password: c.password,
            receive_maximum: u16::MAX,
        }),
        mqttrs::Packet::Connack(ca) => Packet::Connack(Connack {
            session_present: ca.session_present,
            reason: return_code_from_wire(ca.code),
            receive_maximum: None,
        }),
        mqttrs::Packet::Publish(p) => {
            let (qos, pid) = match p.qospid {
                QosPid::AtMostOnce => (QoS::AtMostOnce, None),
                QosPid::AtLeastOnce(pid) => (QoS::AtLeastOnce, Some(pid_from_wire(pid)?)),
                QosPid::ExactlyOnce(pid) => (QoS::ExactlyOnce, Some(pid_from_wire(pid)?)),
            };
            Packet::Publish(Publish {
                dup: p.dup,
                pid,
                message: Message {
                    topic: p.topic_name,
                    payload: p.payload,
                    qos,
                    retain: p.retain,
                },
            })
        }
        mqttrs::Packet::Puback(pid) => Packet::Puback(Ack::success(pid_from_wire(pid)?)),
        mqttrs::Packet::Pubrec(pid) => Packet::Pubrec(Ack::success(pid_from_wire(pid)?)),
        mqttrs::Packet::Pubrel(pid) => Packet::Pubrel(Ack::success(pid_from_wire(pid)?)),
        mqttrs::Packet::Pubcomp(pid) => Packet::Pubcomp(Ack::success(pid_from_wire(pid)?)),
        mqttrs::Packet::Subscribe(s) => Packet::Subscribe(Subscribe {
            pid: pid_from_wire(s.pid)?,
            topics: s.topics.into_iter().map(|t| SubscribeTopic {
                filter: t.topic_path,
                qos: qos_from_wire(t.qos),
            }).collect(),
        }),
        mqttrs::Packet::Suback(s) => Packet::Suback(Suback {
            pid: pid_from_wire(s.pid)?,
            granted: s.return_codes.into_iter().map(|rc| match rc {
                SubscribeReturnCodes::Success(q) => Some(qos_from_wire(q)),
                SubscribeReturnCodes::Failure => None,
            }).collect(),
        }),
        mqttrs::Packet::Unsubscribe(u) => Packet::Unsubscribe(Unsubscribe {
            pid: pid_from_wire(u.pid)?,
            filters: u.topics,
        }),
        mqttrs::Packet::Unsuback(pid) => Packet::Unsuback(pid_from_wire(pid)?),
        mqttrs::Packet::Pingreq => Packet::Pingreq,
        mqttrs::Packet::Pingresp => Packet::Pingresp,
        mqttrs::Packet::Disconnect => Packet::Disconnect(ReasonCode::SUCCESS),
    })
}

fn pid_to_wire(pid: Pid) -> Result<mqttrs::Pid> {
    mqttrs::Pid::try_from(pid.get()).map_err(Error::from)
}

fn pid_from_wire(pid: mqttrs::Pid) -> Result<Pid> {
    Pid::try_from(pid.get())
}

fn qos_to_wire(qos: QoS) -> mqttrs::QoS {
    match qos {
        QoS::AtMostOnce => mqttrs::QoS::AtMostOnce,
        QoS::AtLeastOnce => mqttrs::QoS::AtLeastOnce,
        QoS::ExactlyOnce => mqttrs::QoS::ExactlyOnce,
    }
}

fn qos_from_wire(qos: mqttrs::QoS) -> QoS {
    match qos {
        mqttrs::QoS::AtMostOnce => QoS::AtMostOnce,
        mqttrs::QoS::AtLeastOnce => QoS::AtLeastOnce,
        mqttrs::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn qospid_to_wire(qos: QoS, pid: Option<Pid>) -> Result<QosPid> {
    match (qos, pid) {
        (QoS::AtMostOnce, _) => Ok(QosPid::AtMostOnce),
        (QoS::AtLeastOnce, Some(pid)) => Ok(QosPid::AtLeastOnce(pid_to_wire(pid)?)),
        (QoS::ExactlyOnce, Some(pid)) => Ok(QosPid::ExactlyOnce(pid_to_wire(pid)?)),
        (_, None) => Err(format!("QoS {} PUBLISH without packet identifier", qos.code()).into()),
    }
}

// CONNACK return codes and their MQTT 5 reason code equivalents.
const RETURN_CODES: [(ConnectReturnCode, u8); 5] = [
    (ConnectReturnCode::RefusedProtocolVersion, 0x84),
    (ConnectReturnCode::RefusedIdentifierRejected, 0x85),
    (ConnectReturnCode::BadUsernamePassword, 0x86),
    (ConnectReturnCode::NotAuthorized, 0x87),
    (ConnectReturnCode::ServerUnavailable, 0x88),
];

fn return_code_from_wire(code: ConnectReturnCode) -> ReasonCode {
    if code == ConnectReturnCode::Accepted {
        return ReasonCode::SUCCESS;
    }
    RETURN_CODES.iter()
        .find(|(c, _)| *c == code)
        .map(|(_, rc)| ReasonCode(*rc))
        .unwrap_or(ReasonCode::UNSPECIFIED_ERROR)
}

fn return_code_to_wire(reason: ReasonCode) -> ConnectReturnCode {
    if !reason.is_error() {
        return ConnectReturnCode::Accepted;
    }
    RETURN_CODES.iter()
        .find(|(_, rc)| *rc == reason.0)
        .map(|(c, _)| c.clone())
        .unwrap_or(ConnectReturnCode::ServerUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::pid;

    fn publish(qos: QoS, pid: Option<Pid>, dup: bool) -> Packet {
        Packet::Publish(Publish {
            dup,
            pid,
            message: Message {
                topic: "a/b".to_owned(),
                payload: b"x".to_vec(),
                qos,
                retain: false,
            },
        })
    }

    #[test]
    fn publish_keeps_dup_and_pid() {
        let p = publish(QoS::ExactlyOnce, Some(pid(300)), true);
        let mut buf = BytesMut::new();
        encode(&p, &mut buf).unwrap();
        assert_eq!(decode(&mut buf).unwrap(), Some(p));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let mut buf = BytesMut::new();
        encode(&publish(QoS::AtLeastOnce, Some(pid(1)), false), &mut buf).unwrap();
        let mut head = buf.split_to(buf.len() - 1);
        assert_eq!(decode(&mut head).unwrap(), None);
    }

    #[test]
    fn qos1_publish_without_pid_is_rejected() {
        let mut buf = BytesMut::new();
        assert!(encode(&publish(QoS::AtLeastOnce, None, false), &mut buf).is_err());
    }

    #[test]
    fn error_reason_codes_are_dropped_on_the_wire() {
        let p = Packet::Pubrec(Ack { pid: pid(4), reason: ReasonCode::UNSPECIFIED_ERROR });
        let mut buf = BytesMut::new();
        encode(&p, &mut buf).unwrap();
        assert_eq!(decode(&mut buf).unwrap(), Some(Packet::Pubrec(Ack::success(pid(4)))));
    }

    #[test]
    fn connack_codes() {
        let refused = Connack {
            session_present: false,
            reason: ReasonCode(0x87),
            receive_maximum: None,
        };
        let mut buf = BytesMut::new();
        encode(&Packet::Connack(refused), &mut buf).unwrap();
        assert_eq!(decode(&mut buf).unwrap(), Some(Packet::Connack(refused)));
    }
}
