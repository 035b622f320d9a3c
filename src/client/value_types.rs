use crate::packet::{Message, QoS, SubscribeTopic};

/// A message to publish, with its options.
#[derive(Clone, Debug)]
pub struct Publish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

impl Publish {
    /// A QoS 0 message on `topic`.
    pub fn new(topic: String, payload: Vec<u8>) -> Publish {
        Publish {
            topic,
            payload,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Topic to publish to.
    pub fn topic(&self) -> &str {
        &*self.topic
    }

    /// Message payload.
    pub fn payload(&self) -> &[u8] {
        &*self.payload
    }

    /// Quality of service.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Set MQTT quality of service
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        self.qos = qos;
        self
    }

    /// Returns true if the broker should retain the message.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Set the retain flag.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    pub(crate) fn to_message(&self) -> Message {
        Message {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
        }
    }
}

/// Topics to subscribe to.
#[derive(Clone, Debug)]
pub struct Subscribe {
    topics: Vec<SubscribeTopic>,
}

impl Subscribe {
    /// Subscribe to `v`.
    pub fn new(v: Vec<SubscribeTopic>) -> Subscribe {
        Subscribe {
            topics: v,
        }
    }

    /// The topics.
    pub fn topics(&self) -> &[SubscribeTopic] {
        &*self.topics
    }
}

/// How often to ping an idle connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub enum KeepAlive {
    /// Never ping.
    Disabled,
    /// Ping after `secs` seconds without writing.
    Enabled {
        /// Interval in seconds.
        secs: u16,
    },
}

impl KeepAlive {
    /// Set keep alive time in seconds.
    ///
    /// Panics if `secs` parameter is 0.
    pub fn from_secs(secs: u16) -> KeepAlive {
        if secs == 0 {
            panic!("KeepAlive secs == 0 not permitted");
        }
        KeepAlive::Enabled { secs, }
    }

    /// Disable keep alive functionality.
    pub fn disabled() -> KeepAlive {
        KeepAlive::Disabled
    }

    /// The value sent in CONNECT.
    pub fn as_secs(&self) -> u16 {
        match self {
            KeepAlive::Disabled => 0,
            KeepAlive::Enabled { secs } => *secs,
        }
    }
}
