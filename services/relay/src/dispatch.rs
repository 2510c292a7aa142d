//! Dispatch loop.
//!
//! All relay and admin logic runs as handlers on one task, the dispatcher,
//! which owns the [`RuntimeState`]. Sockets live in their own I/O tasks and
//! talk to the dispatcher only through [`Event`]s, so handlers never run
//! concurrently and need no locks.
//!
//! ```text
//! accept tasks ──Accepted──┐
//!                          ├──> dispatcher (RuntimeState) ──> channel output queues
//! channel I/O tasks ───────┘       Readable / Connected / Closed
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::acceptor::{self, EndpointKind};
use crate::admin;
use crate::channel::{ChannelOwner, Connector, TcpConnector};
use crate::config::RelayConfig;
use crate::error::{CloseReason, StartupError};
use crate::relay;
use crate::state::{ConnectionId, Destination, Endpoints, RelayStats, RuntimeState};

/// Work items processed by the dispatcher, one at a time.
#[derive(Debug)]
pub enum Event {
    /// A listener accepted a socket.
    Accepted {
        endpoint: EndpointKind,
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    /// An upstream channel finished connecting.
    Connected {
        id: ConnectionId,
        remote_addr: SocketAddr,
    },
    /// A channel read some bytes.
    Readable { owner: ChannelOwner, data: Bytes },
    /// A channel hit EOF or an error. Posted at most once per channel.
    Closed {
        owner: ChannelOwner,
        reason: CloseReason,
    },
}

/// Route one event to its handler.
fn dispatch(state: &mut RuntimeState, event: Event) {
    match event {
        Event::Accepted {
            endpoint,
            stream,
            peer_addr,
        } => acceptor::on_accept(state, endpoint, stream, peer_addr),
        Event::Connected { id, remote_addr } => relay::on_connected(state, id, remote_addr),
        Event::Readable { owner, data } => match owner {
            ChannelOwner::Relay { id, side } => relay::on_readable(state, id, side, data),
            ChannelOwner::Admin(id) => admin::on_readable(state, id, data),
        },
        Event::Closed { owner, reason } => match owner {
            ChannelOwner::Relay { id, side } => relay::on_closed(state, id, side, reason),
            ChannelOwner::Admin(id) => admin::on_closed(state, id, reason),
        },
    }
}

/// A relay with both endpoints bound, ready to run.
pub struct RelayServer {
    proxy_listener: TcpListener,
    shell_listener: TcpListener,
    endpoints: Endpoints,
    destination: Destination,
    connector: Arc<dyn Connector>,
}

impl RelayServer {
    /// Bind the proxy endpoint, then the shell endpoint.
    pub async fn bind(config: &RelayConfig) -> Result<Self, StartupError> {
        let (proxy_listener, proxy) = acceptor::bind(EndpointKind::Proxy, config.proxy_addr).await?;
        let (shell_listener, shell) = acceptor::bind(EndpointKind::Shell, config.shell_addr).await?;
        let endpoints = Endpoints { proxy, shell };

        Ok(Self {
            proxy_listener,
            shell_listener,
            endpoints,
            destination: config.destination.clone(),
            connector: Arc::new(TcpConnector),
        })
    }

    /// Replace the resolver/connector used for upstream channels.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Run the dispatch loop until `shutdown` turns true or its sender is
    /// dropped.
    ///
    /// Nothing is drained on the way out: dropping the state closes every
    /// socket and abandons queued bytes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayStats {
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let accept_tasks = [
            acceptor::spawn_accept_loop(EndpointKind::Proxy, self.proxy_listener, events_tx.clone()),
            acceptor::spawn_accept_loop(EndpointKind::Shell, self.shell_listener, events_tx.clone()),
        ];

        let mut state = RuntimeState::new(self.destination, self.endpoints, events_tx, self.connector);

        info!(
            proxy_addr = %self.endpoints.proxy,
            shell_addr = %self.endpoints.shell,
            dest = %state.destination(),
            "Relay started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => dispatch(&mut state, event),
                    None => break,
                },
            }
        }

        for task in &accept_tasks {
            task.abort();
        }

        let stats = state.stats().clone();
        info!(
            connections_active = state.connection_count(),
            sessions_active = state.session_count(),
            connections_accepted = stats.connections_accepted,
            connections_closed = stats.connections_closed,
            upstream_connect_failures = stats.upstream_connect_failures,
            bytes_to_upstream = stats.bytes_to_upstream,
            bytes_to_client = stats.bytes_to_client,
            sessions_opened = stats.sessions_opened,
            commands_executed = stats.commands_executed,
            commands_failed = stats.commands_failed,
            "Relay stopped"
        );
        stats
    }

    /// Run on a background task.
    pub fn spawn(self) -> RelayHandle {
        let endpoints = self.endpoints;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));

        RelayHandle {
            endpoints,
            shutdown,
            task,
        }
    }
}

/// Handle to a relay started with [`RelayServer::spawn`].
pub struct RelayHandle {
    endpoints: Endpoints,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<RelayStats>,
}

impl RelayHandle {
    pub fn proxy_addr(&self) -> SocketAddr {
        self.endpoints.proxy
    }

    pub fn shell_addr(&self) -> SocketAddr {
        self.endpoints.shell
    }

    /// Stop the dispatch loop and wait for it to exit.
    pub async fn shutdown(self) -> RelayStats {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Relay task failed");
                RelayStats::default()
            }
        }
    }
}
