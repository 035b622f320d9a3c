//! The tokio-facing client: configuration, the connection task and the
//! application API.

mod builder;
pub use builder::ClientBuilder;

mod client;
pub use client::{Client, Subscription};
pub(crate) use client::ClientOptions;

mod io_task;

mod value_types;
pub use value_types::{
    KeepAlive,
    Publish,
    Subscribe,
};

pub use crate::packet::{
    QoS,
    SubscribeTopic,
};

pub use crate::session::{
    AckMode,
    Acknowledger,
    ConnectedContext,
    ConnectionState,
    Delivery,
    DisconnectSource,
    DisconnectedContext,
    ListenerId,
    PublishResult,
    Reconnector,
};
