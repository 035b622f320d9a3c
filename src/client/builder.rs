use crate::{
    client::{
        Client,
        ClientOptions,
        KeepAlive,
    },
    session::{
        ConnectedContext,
        DisconnectedContext,
        ListenerId,
        Listeners,
        SessionStore,
    },
    Result,
    util::{
        ConnectionMode,
        TokioRuntime,
    }
};

#[cfg(feature = "tls")]
use std::sync::Arc;
use tokio::time::Duration;

/// A fluent builder interface to configure a Client.
///
/// Note that you must call `.set_host()` to configure a host to
/// connect to before `.build()`
#[derive(Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ClientBuilder {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<Vec<u8>>,
    keep_alive: Option<KeepAlive>,
    #[cfg_attr(feature = "serde", serde(skip))]
    runtime: TokioRuntime,
    client_id: Option<String>,
    packet_buffer_len: Option<usize>,
    max_packet_len: Option<usize>,
    operation_timeout: Option<Duration>,
    #[cfg_attr(feature = "serde", serde(skip))]
    connection_mode: ConnectionMode,
    automatic_connect: Option<bool>,
    connect_retry_delay: Option<Duration>,
    max_connect_retry_delay: Option<Duration>,
    clean_session: Option<bool>,
    receive_maximum: Option<u16>,
    send_maximum: Option<u16>,
    #[cfg_attr(feature = "serde", serde(skip))]
    listeners: Listeners,
    #[cfg_attr(feature = "serde", serde(skip))]
    session_store: Option<Box<dyn SessionStore>>,
}

impl ClientBuilder {
    /// Build a new `Client` with this configuration.
    ///
    /// A session store set with `set_session_store` goes to the first
    /// client built; later clients get an in-memory store.
    pub fn build(&mut self) -> Result<Client> {
        Client::new(
            ClientOptions {
                host: match self.host {
                    Some(ref h) => h.clone(),
                    None => return Err("You must set a host to build a Client".into())
                },
                port: self.port.unwrap_or(1883),
                username: self.username.clone(),
                password: self.password.clone(),
                keep_alive: self.keep_alive.unwrap_or(KeepAlive::from_secs(30)),
                runtime: self.runtime.clone(),
                client_id: self.client_id.clone(),
                packet_buffer_len: self.packet_buffer_len.unwrap_or(100),
                max_packet_len: self.max_packet_len.unwrap_or(64 * 1024),
                operation_timeout: self.operation_timeout.unwrap_or(Duration::from_secs(20)),
                connection_mode: self.connection_mode.clone(),
                automatic_connect: self.automatic_connect.unwrap_or(true),
                connect_retry_delay: self.connect_retry_delay.unwrap_or(Duration::from_secs(1)),
                max_connect_retry_delay: self.max_connect_retry_delay
                    .unwrap_or(Duration::from_secs(120)),
                clean_session: self.clean_session.unwrap_or(true),
                receive_maximum: self.receive_maximum.unwrap_or(u16::MAX),
                send_maximum: self.send_maximum.unwrap_or(u16::MAX),
                listeners: self.listeners.clone(),
            },
            self.session_store.take())
    }

    /// Set host to connect to. This is a required parameter.
    pub fn set_host(&mut self, host: String) -> &mut Self {
        self.host = Some(host);
        self
    }

    /// Set TCP port to connect to.
    ///
    /// The default value is 1883.
    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }

    /// Set username to authenticate with.
    ///
    /// The default value is no username.
    pub fn set_username(&mut self, username: Option<String>) -> &mut Self {
        self.username = username;
        self
    }

    /// Set password to authenticate with.
    ///
    /// The default is no password.
    pub fn set_password(&mut self, password: Option<Vec<u8>>) -> &mut Self {
        self.password = password;
        self
    }

    /// Set keep alive time.
    ///
    /// This controls how often ping requests are sent when the connection is idle.
    /// A connection that sees no PINGRESP within the same interval is closed.
    /// See [MQTT 3.1.1 specification section 3.1.2.10](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/csprd02/mqtt-v3.1.1-csprd02.html#_Keep_Alive)
    ///
    /// The default value is 30 seconds.
    pub fn set_keep_alive(&mut self, keep_alive: KeepAlive) -> &mut Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Set the tokio runtime to spawn the connection task onto.
    ///
    /// The default is the runtime `Client::connect` is called on.
    pub fn set_tokio_runtime(&mut self, rt: TokioRuntime) -> &mut Self {
        self.runtime = rt;
        self
    }

    /// Set the ClientId to connect with.
    pub fn set_client_id(&mut self, client_id: Option<String>) -> &mut Self {
        self.client_id = client_id;
        self
    }

    /// Set the length of the queue of requests to the connection task.
    ///
    /// The default is 100.
    pub fn set_packet_buffer_len(&mut self, packet_buffer_len: usize) -> &mut Self {
        self.packet_buffer_len = Some(packet_buffer_len);
        self
    }

    /// Set the maximum packet length.
    ///
    /// The default is 64 * 1024 bytes.
    pub fn set_max_packet_len(&mut self, max_packet_len: usize) -> &mut Self {
        self.max_packet_len = Some(max_packet_len);
        self
    }

    /// Set the timeout for connecting, subscribing and unsubscribing.
    ///
    /// The default is 20 seconds.
    pub fn set_operation_timeout(&mut self, operation_timeout: Duration) -> &mut Self {
        self.operation_timeout = Some(operation_timeout);
        self
    }

    /// Set the TLS ClientConfig for the client-server connection.
    ///
    /// Enables TLS. By default TLS is disabled.
    #[cfg(feature = "tls")]
    pub fn set_tls_client_config(&mut self, tls_client_config: rustls::ClientConfig) -> &mut Self {
        self.connection_mode = ConnectionMode::Tls(Arc::new(tls_client_config));
        self
    }

    /// Sets the connection mode to the given value
    ///
    /// The default is to use Tcp
    pub fn set_connection_mode(&mut self, mode: ConnectionMode) -> &mut Self {
        self.connection_mode = mode;
        self
    }

    /// Set whether to reconnect automatically after the connection is
    /// lost. Disconnected listeners can override this per disconnect.
    ///
    /// The default is true.
    pub fn set_automatic_connect(&mut self, automatic_connect: bool) -> &mut Self {
        self.automatic_connect = Some(automatic_connect);
        self
    }

    /// Set the delay before the first reconnect attempt. It doubles with
    /// every failed attempt.
    ///
    /// The default is 1s.
    pub fn set_connect_retry_delay(&mut self, connect_retry_delay: Duration) -> &mut Self {
        self.connect_retry_delay = Some(connect_retry_delay);
        self
    }

    /// Set the upper bound of the reconnect delay.
    ///
    /// The default is 120s.
    pub fn set_max_connect_retry_delay(&mut self, max_connect_retry_delay: Duration) -> &mut Self {
        self.max_connect_retry_delay = Some(max_connect_retry_delay);
        self
    }

    /// Set whether the broker should discard any previous session.
    ///
    /// The default is true.
    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = Some(clean_session);
        self
    }

    /// Set how many incoming QoS 1 and 2 messages may be unacknowledged
    /// at once. More is a protocol violation by the broker.
    ///
    /// The default is 65535.
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.receive_maximum = Some(receive_maximum);
        self
    }

    /// Set how many outgoing QoS 1 and 2 messages may be unacknowledged
    /// at once. Further publishes wait.
    ///
    /// The default is 65535.
    pub fn set_send_maximum(&mut self, send_maximum: u16) -> &mut Self {
        self.send_maximum = Some(send_maximum);
        self
    }

    /// Set where open outgoing exchanges are kept between connections.
    ///
    /// The default is an in-memory store.
    pub fn set_session_store(&mut self, store: Box<dyn SessionStore>) -> &mut Self {
        self.session_store = Some(store);
        self
    }

    /// Call `f` every time a connection is established.
    pub fn add_connected_listener<F>(&mut self, f: F) -> ListenerId
        where F: Fn(&ConnectedContext) + Send + Sync + 'static
    {
        self.listeners.add_connected(f)
    }

    /// Call `f` every time a connection ends or an attempt fails. It may
    /// change whether and when to reconnect.
    pub fn add_disconnected_listener<F>(&mut self, f: F) -> ListenerId
        where F: Fn(&mut DisconnectedContext) + Send + Sync + 'static
    {
        self.listeners.add_disconnected(f)
    }
}
