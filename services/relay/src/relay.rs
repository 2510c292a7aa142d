//! Relay engine.
//!
//! Bytes read on either channel of a [`RelayConnection`] are appended,
//! unmodified and in order, to the other channel's output queue. There is no
//! half-close: EOF or an error on either side tears down the whole pair.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Side};
use crate::error::CloseReason;
use crate::state::{ConnectionId, Destination, RelayStats, RuntimeState};

/// One proxied session: the accepted client channel and the upstream channel.
pub struct RelayConnection {
    client: Channel,
    upstream: Channel,
    peer_addr: SocketAddr,
    destination: Destination,
    bytes_to_upstream: u64,
    bytes_to_client: u64,
}

impl RelayConnection {
    pub(crate) fn new(
        client: Channel,
        upstream: Channel,
        peer_addr: SocketAddr,
        destination: Destination,
    ) -> Self {
        Self {
            client,
            upstream,
            peer_addr,
            destination,
            bytes_to_upstream: 0,
            bytes_to_client: 0,
        }
    }

    fn channel(&self, side: Side) -> &Channel {
        match side {
            Side::Client => &self.client,
            Side::Upstream => &self.upstream,
        }
    }

    /// Destination this connection was created with.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Forward a chunk read on `side` to the opposite channel.
pub(crate) fn on_readable(state: &mut RuntimeState, id: ConnectionId, side: Side, data: Bytes) {
    let Some(conn) = state.connections.get_mut(&id) else {
        warn!(conn_id = %id, side = %side, bytes = data.len(), "No connection exists for channel; dropping data");
        return;
    };

    let len = data.len() as u64;
    conn.channel(side.peer()).write(data);

    match side {
        Side::Client => {
            conn.bytes_to_upstream += len;
            state.stats.bytes_to_upstream += len;
        }
        Side::Upstream => {
            conn.bytes_to_client += len;
            state.stats.bytes_to_client += len;
        }
    }
}

pub(crate) fn on_connected(state: &mut RuntimeState, id: ConnectionId, remote_addr: SocketAddr) {
    match state.connections.get(&id) {
        Some(conn) => debug!(
            conn_id = %id,
            dest = %conn.destination,
            remote_addr = %remote_addr,
            "Upstream connected"
        ),
        None => debug!(conn_id = %id, "Upstream connected for a closed connection"),
    }
}

/// Tear down the pair after either channel reported EOF or an error.
pub(crate) fn on_closed(state: &mut RuntimeState, id: ConnectionId, side: Side, reason: CloseReason) {
    let Some(conn) = state.connections.remove(&id) else {
        debug!(conn_id = %id, side = %side, reason = %reason, "Close event for a connection already torn down");
        return;
    };

    if reason.is_connect_failure() {
        state.stats.upstream_connect_failures += 1;
        warn!(conn_id = %id, reason = %reason, "Upstream connect failed");
    }
    teardown(&mut state.stats, id, conn, Some(side), &reason);
}

/// Destroy every relay connection, exactly as an error on each would.
///
/// Admin sessions are left alone. Returns the number of connections closed.
pub(crate) fn disconnect_all(state: &mut RuntimeState) -> usize {
    let conns: Vec<_> = state.connections.drain().collect();
    let count = conns.len();

    for (id, conn) in conns {
        teardown(&mut state.stats, id, conn, None, &CloseReason::Reset);
    }

    count
}

/// `side` is the channel that reported the close; `None` when the relay
/// itself closed the pair.
fn teardown(
    stats: &mut RelayStats,
    id: ConnectionId,
    conn: RelayConnection,
    side: Option<Side>,
    reason: &CloseReason,
) {
    stats.connections_closed += 1;
    info!(
        conn_id = %id,
        peer_addr = %conn.peer_addr,
        dest = %conn.destination,
        side = side.map(Side::as_str),
        reason = %reason,
        bytes_to_upstream = conn.bytes_to_upstream,
        bytes_to_client = conn.bytes_to_client,
        "Relay connection closed"
    );
    // Dropping both channels closes both sockets.
    drop(conn);
}
