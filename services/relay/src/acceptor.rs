//! Listening endpoints and accept handling.
//!
//! Each listener runs in its own accept task that hands new sockets to the
//! dispatcher as [`Event::Accepted`]. Building and registering the entity for
//! the socket happens on the dispatcher, in [`on_accept`].

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admin::AdminSession;
use crate::channel::{Channel, ChannelOwner, Side};
use crate::dispatch::Event;
use crate::error::StartupError;
use crate::relay::RelayConnection;
use crate::state::RuntimeState;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Which listening endpoint a socket arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Relay clients.
    Proxy,
    /// Admin console.
    Shell,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Proxy => f.write_str("proxy"),
            EndpointKind::Shell => f.write_str("shell"),
        }
    }
}

/// Bind a listening endpoint, returning it with its local address.
pub(crate) async fn bind(
    endpoint: EndpointKind,
    addr: SocketAddr,
) -> Result<(TcpListener, SocketAddr), StartupError> {
    let bind_err = |source| StartupError::Bind {
        endpoint,
        addr,
        source,
    };

    let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;

    info!(endpoint = %endpoint, bind_addr = %local_addr, "Listener bound");
    Ok((listener, local_addr))
}

/// Accept connections forever, forwarding them to the dispatcher.
///
/// Stops once the dispatcher has gone away.
pub(crate) fn spawn_accept_loop(
    endpoint: EndpointKind,
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let event = Event::Accepted {
                        endpoint,
                        stream,
                        peer_addr,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Accept error");
                    // Avoid a tight loop on persistent errors (e.g. fd exhaustion)
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    })
}

/// Register a freshly accepted socket.
pub(crate) fn on_accept(
    state: &mut RuntimeState,
    endpoint: EndpointKind,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    match endpoint {
        EndpointKind::Proxy => accept_relay(state, stream, peer_addr),
        EndpointKind::Shell => accept_session(state, stream, peer_addr),
    }
}

/// Create a relay connection for a proxy client.
///
/// Both channels exist, and the connection is in the registry, before the
/// upstream connect is issued. Client bytes that arrive early are queued on
/// the upstream channel. The destination is captured now; a later reset does
/// not rewire this connection.
fn accept_relay(state: &mut RuntimeState, stream: TcpStream, peer_addr: SocketAddr) {
    let id = state.next_connection_id();
    let destination = state.destination().clone();

    let client = Channel::accepted(
        stream,
        ChannelOwner::Relay {
            id,
            side: Side::Client,
        },
        state.events(),
    );
    let upstream = Channel::connecting(id, destination.clone(), state.connector(), state.events());

    info!(conn_id = %id, peer_addr = %peer_addr, dest = %destination, "Relay connection accepted");

    state
        .connections
        .insert(id, RelayConnection::new(client, upstream, peer_addr, destination));
    state.stats.connections_accepted += 1;
}

/// Create an admin session and greet it with the prompt.
fn accept_session(state: &mut RuntimeState, stream: TcpStream, peer_addr: SocketAddr) {
    let id = state.next_session_id();
    let channel = Channel::accepted(stream, ChannelOwner::Admin(id), state.events());
    let session = AdminSession::new(channel, peer_addr);
    session.write_prompt();

    info!(session_id = %id, peer_addr = %peer_addr, "Admin session opened");

    state.sessions.insert(id, session);
    state.stats.sessions_opened += 1;
}
