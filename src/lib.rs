//! An MQTT client with QoS 1 and QoS 2 delivery that survives
//! reconnects.
//!
//! The delivery engine in [`session`] is free of I/O: it allocates
//! packet identifiers, drives the outgoing and incoming acknowledgement
//! handshakes, keeps open outgoing exchanges in a [`session::SessionStore`]
//! and runs the connection lifecycle. [`client::Client`] spawns one tokio
//! task per connection that feeds it packets and writes what it queues.
//!
//! For example usage see the command-line test app at
//! `src/bin/mqttc.rs`, and integration tests at `tests/*.rs`.
//!
//! This crate uses the log crate. To enable extra, potentially
//! sensitive logging (including passwords) enable the
//! "unsafe-logging" Cargo feature. With "unsafe-logging" enabled at
//! the "trace" log level every packet is logged.
//!
//! The "tls" feature is enabled by default and allows connections
//! over TLS using [rustls](https://crates.io/crates/rustls).
//! If TLS is not required you can opt out by specifying
//! `default-features = false`.
//!
//! The "serde" feature is disabled by default, but when enabled
//! `client::ClientBuilder` will implement `serde::Deserialize`, and
//! stored exchanges are serializable. For example, you can then
//! `Deserialize` your `ClientBuilder` with options from a config file.
#![deny(missing_docs)]

pub mod client;
pub mod codec;
mod error;
pub mod packet;
pub mod session;
pub mod util;

pub use error::{Error, Result};
