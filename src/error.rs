use crate::packet::ReasonCode;
use std::{
    convert::From,
    fmt::{Display, Formatter, self},
};

/// Fallible result values returned by the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the library.
#[derive(Debug)]
pub enum Error {
    /// No packet identifier was free and the caller asked not to wait.
    AdmissionRejected,

    /// The broker broke the protocol. Fatal to the connection.
    ProtocolViolation {
        /// Reason code sent in the DISCONNECT.
        reason: ReasonCode,
        /// What went wrong.
        message: String,
    },

    /// An acknowledgement carried an error reason code. Fails only its exchange.
    RemoteError {
        /// Name of the acknowledgement packet.
        packet: &'static str,
        /// The reason code received.
        reason: ReasonCode,
    },

    /// The transport closed.
    ConnectionLost(String),

    /// A connect or ping deadline passed.
    Timeout(String),

    /// The broker did not resume the session the exchange belonged to.
    SessionExpired,

    /// The client is not connected and will not reconnect.
    Disconnected,

    /// A wrapped error from another library.
    StdError(Box<dyn std::error::Error + Send + Sync>),

    /// Any other error.
    String(String),
}

impl Error {
    /// Wrap any standard error.
    pub fn from_std_err<T: std::error::Error + Send + Sync + 'static>(e: T) -> Error {
        Error::StdError(Box::new(e))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Error {
        Error::ProtocolViolation {
            reason: ReasonCode::PROTOCOL_ERROR,
            message: message.into(),
        }
    }

    /// Returns true for errors that must tear down the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolViolation { .. } | Error::Timeout(_))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> std::result::Result<(), fmt::Error> {
        match self {
            Error::AdmissionRejected => write!(f, "No packet identifier available"),
            Error::ProtocolViolation { reason, message } =>
                write!(f, "Protocol violation ({}): {}", reason, message),
            Error::RemoteError { packet, reason } =>
                write!(f, "{} contained error reason code {}", packet, reason),
            Error::ConnectionLost(s) => write!(f, "Connection lost: {}", s),
            Error::Timeout(s) => write!(f, "Timeout: {}", s),
            Error::SessionExpired => write!(f, "Session expired before the exchange completed"),
            Error::Disconnected => write!(f, "Disconnected"),
            Error::StdError(e) => write!(f, "{}", e),
            Error::String(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::StdError(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::String(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::String(s.to_owned())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::StdError(Box::new(e))
    }
}

impl From<mqttrs::Error> for Error {
    fn from(e: mqttrs::Error) -> Error {
        Error::StdError(Box::new(e))
    }
}
