//! Socket channels.
//!
//! A [`Channel`] wraps one TCP socket. The socket itself lives in a spawned
//! I/O task which:
//! - posts every chunk it reads as an [`Event::Readable`], in order
//! - drains the channel's output queue into the socket
//! - posts a single [`Event::Closed`] when the socket hits EOF or an error
//!
//! The dispatcher owns the `Channel` value. Dropping it aborts the I/O task
//! and closes the socket, so a channel never outlives its registry entry.
//!
//! Output queues are unbounded: a peer that reads slower than the other side
//! writes makes the queue grow.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatch::Event;
use crate::error::CloseReason;
use crate::state::{ConnectionId, Destination, SessionId};

/// Size of a single socket read.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Which half of a relay connection a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted socket.
    Client,
    /// The socket to the destination.
    Upstream,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }

    /// The channel bytes read on this side are written to.
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry entry an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOwner {
    Relay { id: ConnectionId, side: Side },
    Admin(SessionId),
}

/// Asynchronous resolver plus connector used for upstream channels.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolve `host` and connect to `port` on it.
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Default connector backed by the system resolver.
///
/// Every resolved address is tried in order, across address families, and
/// the first successful connection wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;

        for addr in lookup_host((host, port)).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(host = %host, addr = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            )
        }))
    }
}

/// One socket plus its output queue.
pub struct Channel {
    output: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl Channel {
    /// Wrap an already connected socket.
    pub(crate) fn accepted(
        stream: TcpStream,
        owner: ChannelOwner,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let (output, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let reason = pump(stream, owner, &events, queue).await;
            let _ = events.send(Event::Closed { owner, reason });
        });

        Self { output, task }
    }

    /// Create the upstream channel of a relay connection.
    ///
    /// The channel starts disconnected. Writes made before the connect
    /// completes stay queued and are flushed in order once it does.
    pub(crate) fn connecting(
        id: ConnectionId,
        dest: Destination,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let owner = ChannelOwner::Relay {
            id,
            side: Side::Upstream,
        };
        let (output, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let reason = match connector.connect(&dest.host, dest.port).await {
                Ok(stream) => {
                    if let Ok(remote_addr) = stream.peer_addr() {
                        let _ = events.send(Event::Connected { id, remote_addr });
                    }
                    pump(stream, owner, &events, queue).await
                }
                Err(source) => CloseReason::Connect { dest, source },
            };
            let _ = events.send(Event::Closed { owner, reason });
        });

        Self { output, task }
    }

    /// Append bytes to the output queue.
    pub(crate) fn write(&self, data: Bytes) {
        // A send error means the I/O task already finished; its Closed event
        // is queued behind us and will tear the owner down.
        let _ = self.output.send(data);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Move bytes between the socket and the dispatcher until either direction
/// fails.
async fn pump(
    stream: TcpStream,
    owner: ChannelOwner,
    events: &mpsc::UnboundedSender<Event>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
) -> CloseReason {
    let (mut reader, mut writer) = stream.into_split();

    let inbound = async {
        loop {
            let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
            match reader.read_buf(&mut buf).await {
                Ok(0) => return CloseReason::Eof,
                Ok(_) => {
                    let data = buf.freeze();
                    if events.send(Event::Readable { owner, data }).is_err() {
                        // Dispatcher is gone
                        return CloseReason::Eof;
                    }
                }
                Err(e) => return CloseReason::Io(e),
            }
        }
    };

    let outbound = async {
        while let Some(chunk) = queue.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                return CloseReason::Io(e);
            }
        }
        std::future::pending::<CloseReason>().await
    };

    tokio::select! {
        reason = inbound => reason,
        reason = outbound => reason,
    }
}
