//! Connection states, lifecycle listeners and the reconnect decision.

use crate::{packet::Connect, Error, Result};
use log::{debug, info};
use std::{fmt, sync::Arc};
use tokio::time::Duration;

/// State of the connection to the broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connection, see [`Lifecycle::will_reconnect`].
    Disconnected,
    /// CONNECT sent or transport being opened.
    Connecting,
    /// CONNACK accepted.
    Connected,
    /// Tearing down the connection.
    Disconnecting,
}

/// Who ended a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectSource {
    /// The application called `disconnect`.
    User,
    /// This client, e.g. after a protocol violation, a timeout or a
    /// transport error.
    Client,
    /// The broker refused the connection or sent DISCONNECT.
    Server,
}

/// Passed to connected listeners.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectedContext {
    /// The broker resumed the previous session.
    pub session_present: bool,
    /// Number of open outgoing exchanges allowed on this connection.
    pub send_maximum: u16,
}

/// Passed to disconnected listeners. The listener may change what
/// happens next through [`DisconnectedContext::reconnector`].
pub struct DisconnectedContext<'a> {
    source: DisconnectSource,
    cause: &'a Error,
    reconnector: &'a mut Reconnector,
}

impl<'a> DisconnectedContext<'a> {
    /// Who ended the connection.
    pub fn source(&self) -> DisconnectSource {
        self.source
    }

    /// Why the connection ended.
    pub fn cause(&self) -> &Error {
        self.cause
    }

    /// The reconnect decision, pre-filled from configuration.
    pub fn reconnector(&mut self) -> &mut Reconnector {
        self.reconnector
    }
}

/// Decides whether and how to reconnect after a disconnect.
#[derive(Clone, Debug)]
pub struct Reconnector {
    attempts: u32,
    reconnect: bool,
    delay: Duration,
    resubscribe_if_session_expired: bool,
    connect: Option<Connect>,
}

impl Reconnector {
    /// Number of failed connection attempts since the last successful
    /// connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true if the client will reconnect.
    pub fn is_reconnect(&self) -> bool {
        self.reconnect
    }

    /// Set whether to reconnect.
    pub fn reconnect(&mut self, reconnect: bool) -> &mut Self {
        self.reconnect = reconnect;
        self
    }

    /// Delay before the next attempt.
    pub fn get_delay(&self) -> Duration {
        self.delay
    }

    /// Set the delay before the next attempt.
    pub fn delay(&mut self, delay: Duration) -> &mut Self {
        self.delay = delay;
        self
    }

    /// Use `connect` instead of the configured CONNECT packet for the
    /// next attempt.
    pub fn connect_packet(&mut self, connect: Connect) -> &mut Self {
        self.connect = Some(connect);
        self
    }

    /// Set whether to subscribe every flow again when the broker did
    /// not keep the session. The default is true.
    pub fn resubscribe_if_session_expired(&mut self, resubscribe: bool) -> &mut Self {
        self.resubscribe_if_session_expired = resubscribe;
        self
    }
}

/// Called after every accepted CONNACK.
pub type ConnectedListener = Arc<dyn Fn(&ConnectedContext) + Send + Sync>;

/// Called after every disconnect, including failed connect attempts.
pub type DisconnectedListener = Arc<dyn Fn(&mut DisconnectedContext) + Send + Sync>;

/// Returned when registering a listener; pass it back to remove it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ListenerId(u64);

/// Lifecycle listeners, in registration order.
#[derive(Clone, Default)]
pub struct Listeners {
    next_id: u64,
    connected: Vec<(ListenerId, ConnectedListener)>,
    disconnected: Vec<(ListenerId, DisconnectedListener)>,
}

impl Listeners {
    /// Register a connected listener.
    pub fn add_connected<F>(&mut self, l: F) -> ListenerId
        where F: Fn(&ConnectedContext) + Send + Sync + 'static
    {
        let id = self.next_id();
        self.connected.push((id, Arc::new(l)));
        id
    }

    /// Register a disconnected listener.
    pub fn add_disconnected<F>(&mut self, l: F) -> ListenerId
        where F: Fn(&mut DisconnectedContext) + Send + Sync + 'static
    {
        let id = self.next_id();
        self.disconnected.push((id, Arc::new(l)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.connected.len() + self.disconnected.len();
        self.connected.retain(|(i, _)| *i != id);
        self.disconnected.retain(|(i, _)| *i != id);
        before != self.connected.len() + self.disconnected.len()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.connected.len() + self.disconnected.len()
    }

    /// Returns true if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listeners")
         .field("connected", &self.connected.len())
         .field("disconnected", &self.disconnected.len())
         .finish()
    }
}

/// Defaults for the reconnector offered to disconnected listeners.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect after connections not ended by the user.
    pub automatic: bool,
    /// Delay before the first attempt; doubled per failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// The delay before attempt number `attempts + 1`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        self.initial_delay.checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> ReconnectPolicy {
        ReconnectPolicy {
            automatic: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
        }
    }
}

/// What to do after a disconnect, decided by the listeners.
#[derive(Clone, Debug)]
pub struct ReconnectPlan {
    /// Wait this long, then connect again.
    pub delay: Duration,
    /// Replacement CONNECT for the attempt.
    pub connect: Option<Connect>,
}

/// The connection state machine.
pub struct Lifecycle {
    state: ConnectionState,
    will_reconnect: bool,
    policy: ReconnectPolicy,
    attempts: u32,
    resubscribe_if_session_expired: bool,
    listeners: Listeners,
}

impl Lifecycle {
    /// A disconnected state machine.
    pub fn new(policy: ReconnectPolicy, listeners: Listeners) -> Lifecycle {
        Lifecycle {
            state: ConnectionState::Disconnected,
            will_reconnect: false,
            policy,
            attempts: 0,
            resubscribe_if_session_expired: true,
            listeners,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The `WillReconnect` tag: true while a reconnect is scheduled or its
    /// attempt is `Connecting`.
    pub fn will_reconnect(&self) -> bool {
        self.will_reconnect
    }

    /// Whether flows are subscribed again if the next CONNACK reports no session.
    pub fn resubscribe_if_session_expired(&self) -> bool {
        self.resubscribe_if_session_expired
    }

    /// The registered listeners.
    pub fn listeners_mut(&mut self) -> &mut Listeners {
        &mut self.listeners
    }

    /// `Disconnected → Connecting`.
    pub fn start_connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                Ok(())
            }
            s => Err(format!("Cannot connect while {:?}", s).into()),
        }
    }

    /// `Connecting → Connected`; runs connected listeners.
    pub fn on_connected(&mut self, ctx: &ConnectedContext) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(format!("CONNACK received while {:?}", self.state).into());
        }
        info!("Connected, session_present={}", ctx.session_present);
        self.state = ConnectionState::Connected;
        self.will_reconnect = false;
        self.attempts = 0;
        for (_, l) in self.listeners.connected.iter() {
            l(ctx);
        }
        Ok(())
    }

    /// `Connected → Disconnecting`.
    pub fn begin_disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Any state `→ Disconnected`. Runs disconnected listeners and returns
    /// the reconnect plan they settled on, if any.
    pub fn on_disconnected(&mut self, source: DisconnectSource, cause: &Error) -> Option<ReconnectPlan> {
        let was = self.state;
        self.state = ConnectionState::Disconnected;
        let mut reconnector = Reconnector {
            attempts: self.attempts,
            reconnect: self.policy.automatic && source != DisconnectSource::User,
            delay: self.policy.backoff(self.attempts),
            resubscribe_if_session_expired: true,
            connect: None,
        };
        for (_, l) in self.listeners.disconnected.iter() {
            let mut ctx = DisconnectedContext {
                source,
                cause,
                reconnector: &mut reconnector,
            };
            l(&mut ctx);
        }
        self.will_reconnect = reconnector.reconnect;
        self.resubscribe_if_session_expired = reconnector.resubscribe_if_session_expired;
        if !reconnector.reconnect {
            info!("Disconnected from {:?} by {:?}: {}", was, source, cause);
            return None;
        }
        self.attempts = self.attempts.saturating_add(1);
        debug!("Disconnected from {:?} by {:?}: {}; reconnecting in {:?}",
               was, source, cause, reconnector.delay);
        Some(ReconnectPlan {
            delay: reconnector.delay,
            connect: reconnector.connect,
        })
    }

    /// Drop a scheduled reconnect. The state stays `Disconnected`.
    pub fn cancel_reconnect(&mut self) {
        if self.will_reconnect {
            debug!("Scheduled reconnect cancelled");
        }
        self.will_reconnect = false;
    }
}
