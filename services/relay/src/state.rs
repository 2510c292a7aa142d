//! Global runtime state.
//!
//! A single [`RuntimeState`] is owned by the dispatcher task and passed by
//! reference into every event handler. It is the only owner of relay
//! connections and admin sessions; removing an entry from a registry drops
//! its channels, which closes their sockets.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::admin::AdminSession;
use crate::channel::Connector;
use crate::dispatch::Event;
use crate::relay::RelayConnection;

/// Registry key for a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry key for an admin session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Upstream host and port that new relay connections connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Local addresses of the two listening endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Relay clients connect here.
    pub proxy: SocketAddr,
    /// Admin sessions connect here.
    pub shell: SocketAddr,
}

/// Counters maintained by the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Relay connections accepted.
    pub connections_accepted: u64,
    /// Relay connections torn down, for any reason.
    pub connections_closed: u64,
    /// Upstream connects that failed.
    pub upstream_connect_failures: u64,
    /// Bytes relayed from clients to upstreams.
    pub bytes_to_upstream: u64,
    /// Bytes relayed from upstreams to clients.
    pub bytes_to_client: u64,
    /// Admin sessions opened.
    pub sessions_opened: u64,
    /// Admin command lines processed.
    pub commands_executed: u64,
    /// Admin command lines that failed.
    pub commands_failed: u64,
}

/// State shared by every handler on the dispatch task.
pub struct RuntimeState {
    destination: Destination,
    endpoints: Endpoints,
    /// Active relay connections.
    pub(crate) connections: HashMap<ConnectionId, RelayConnection>,
    /// Active admin sessions.
    pub(crate) sessions: HashMap<SessionId, AdminSession>,
    pub(crate) stats: RelayStats,
    events: mpsc::UnboundedSender<Event>,
    connector: Arc<dyn Connector>,
    next_id: u64,
}

impl RuntimeState {
    /// Create the runtime state.
    ///
    /// `events` is handed to every channel created later so that its I/O task
    /// can post readiness and close events back to the dispatcher.
    pub fn new(
        destination: Destination,
        endpoints: Endpoints,
        events: mpsc::UnboundedSender<Event>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            destination,
            endpoints,
            connections: HashMap::new(),
            sessions: HashMap::new(),
            stats: RelayStats::default(),
            events,
            connector,
            next_id: 1,
        }
    }

    /// Destination used for the next accepted relay connection.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn set_dest_host(&mut self, host: String) {
        self.destination.host = host;
    }

    pub fn set_dest_port(&mut self, port: u16) {
        self.destination.port = port;
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Number of relay connections in the registry, including ones whose
    /// upstream is still connecting.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.events.clone()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub(crate) fn next_connection_id(&mut self) -> ConnectionId {
        ConnectionId(self.bump_id())
    }

    pub(crate) fn next_session_id(&mut self) -> SessionId {
        SessionId(self.bump_id())
    }

    fn bump_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
