//! Admin console.
//!
//! A line-oriented text protocol for inspecting and reconfiguring the relay
//! at runtime. Every line yields exactly one response followed by a fresh
//! prompt; command errors are reported as `FAILED: <message>` and never close
//! the session.
//!
//! There is no authentication on this channel. Anyone who can reach the
//! shell port can change the destination and disconnect every client.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{CloseReason, CommandError};
use crate::relay;
use crate::state::{RuntimeState, SessionId};

/// Prompt written on connect and after every response.
pub const PROMPT: &str = "proxy> ";

/// Longest accepted command line, excluding its terminator.
pub const MAX_LINE_LENGTH: usize = 4096;

pub const HELP_TEXT: &str = "\
commands:
  help: you're reading it now.
  count (or c): show the number of connected clients.
  reset [dest-host] [dest-port]: if a new dest-host/dest-port are given, change
    the destination host and disconnect all clients. if a new destination is
    not given, just disconnect all clients.
";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Count,
    Reset {
        host: Option<String>,
        port: Option<u16>,
    },
}

impl Command {
    /// Parse one line. Command names are case-sensitive.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_ascii_whitespace();
        let name = tokens.next().ok_or(CommandError::Empty)?;
        let args: Vec<&str> = tokens.collect();

        match name {
            "help" | "?" => Ok(Command::Help),
            "count" | "c" => {
                if !args.is_empty() {
                    return Err(CommandError::IncorrectArgumentCount);
                }
                Ok(Command::Count)
            }
            "reset" => match args.as_slice() {
                [] => Ok(Command::Reset {
                    host: None,
                    port: None,
                }),
                [host] => Ok(Command::Reset {
                    host: Some(host.to_string()),
                    port: None,
                }),
                [host, port] => Ok(Command::Reset {
                    host: Some(host.to_string()),
                    port: Some(lenient_port(port)),
                }),
                _ => Err(CommandError::IncorrectArgumentCount),
            },
            other => Err(CommandError::InvalidCommand(other.to_string())),
        }
    }

    /// Run the command against the runtime state and return the response
    /// text, one newline-terminated line per entry.
    pub fn execute(self, state: &mut RuntimeState) -> String {
        match self {
            Command::Help => HELP_TEXT.to_string(),
            Command::Count => {
                format!("there are {} clients connected\n", state.connection_count())
            }
            Command::Reset { host, port } => {
                let mut out = String::new();
                let changed = host.is_some() || port.is_some();
                if let Some(host) = host {
                    out.push_str(&format!("dest host set to {host}\n"));
                    state.set_dest_host(host);
                }
                if let Some(port) = port {
                    out.push_str(&format!("dest port set to {port}\n"));
                    state.set_dest_port(port);
                }
                if changed {
                    info!(dest = %state.destination(), "Destination updated");
                }

                out.push_str("disconnecting all clients\n");
                let closed = relay::disconnect_all(state);
                info!(closed, "Disconnected all clients");
                out
            }
        }
    }
}

/// Port number from the leading digits of `arg`, wrapped into `u16`.
///
/// Nothing is rejected here: `"80abc"` is 80, `"http"` is 0 and `"70000"`
/// wraps to 4464. A bad port only shows up as a failed connect later.
fn lenient_port(arg: &str) -> u16 {
    let arg = arg.trim_start();
    let (negative, digits) = match arg.as_bytes().first() {
        Some(b'-') => (true, &arg[1..]),
        Some(b'+') => (false, &arg[1..]),
        _ => (false, arg),
    };

    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u16, |acc, d| acc.wrapping_mul(10).wrapping_add(u16::from(d - b'0')));

    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}

/// Render the bytes written back for one command line.
///
/// Command output already ends in a newline; two more follow it before the
/// prompt.
pub(crate) fn render_response(result: &Result<String, CommandError>) -> String {
    match result {
        Ok(output) => format!("{output}\n\n{PROMPT}"),
        Err(e) => format!("FAILED: {e}\n\n{PROMPT}"),
    }
}

/// Accumulates session input and splits it into lines.
///
/// Lines end at `\n`; a single `\r` before it is dropped.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: BytesMut,
    /// Set after an overlong line until its terminator shows up.
    discarding: bool,
}

impl LineBuffer {
    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Next complete line, an error for an overlong one, or `None` when more
    /// input is needed.
    pub(crate) fn next_line(&mut self) -> Option<Result<String, CommandError>> {
        loop {
            match self.pending.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let mut line = self.pending.split_to(pos + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    line.truncate(pos);
                    if line.last() == Some(&b'\r') {
                        line.truncate(pos - 1);
                    }
                    if line.len() > MAX_LINE_LENGTH {
                        return Some(Err(CommandError::LineTooLong));
                    }
                    return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
                }
                None if self.discarding => {
                    self.pending.clear();
                    return None;
                }
                None if self.pending.len() > MAX_LINE_LENGTH => {
                    self.pending.clear();
                    self.discarding = true;
                    return Some(Err(CommandError::LineTooLong));
                }
                None => return None,
            }
        }
    }
}

/// One admin console connection.
pub struct AdminSession {
    channel: Channel,
    peer_addr: SocketAddr,
    lines: LineBuffer,
}

impl AdminSession {
    pub(crate) fn new(channel: Channel, peer_addr: SocketAddr) -> Self {
        Self {
            channel,
            peer_addr,
            lines: LineBuffer::default(),
        }
    }

    pub(crate) fn write_prompt(&self) {
        self.channel.write(Bytes::from_static(PROMPT.as_bytes()));
    }

    fn respond(&self, result: &Result<String, CommandError>) {
        self.channel.write(Bytes::from(render_response(result)));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Handle input on an admin session: run every complete line in order.
pub(crate) fn on_readable(state: &mut RuntimeState, id: SessionId, data: Bytes) {
    let lines = match state.sessions.get_mut(&id) {
        Some(session) => {
            session.lines.extend(&data);
            std::iter::from_fn(|| session.lines.next_line()).collect::<Vec<_>>()
        }
        None => {
            warn!(session_id = %id, bytes = data.len(), "No session exists for channel; dropping input");
            return;
        }
    };

    for line in lines {
        let result = line.and_then(|line| {
            debug!(session_id = %id, command = %line, "Admin command");
            Command::parse(&line)
        });
        let result = result.map(|command| command.execute(state));

        state.stats.commands_executed += 1;
        if let Err(e) = &result {
            state.stats.commands_failed += 1;
            debug!(session_id = %id, error = %e, "Admin command failed");
        }

        if let Some(session) = state.sessions.get(&id) {
            session.respond(&result);
        }
    }
}

pub(crate) fn on_closed(state: &mut RuntimeState, id: SessionId, reason: CloseReason) {
    match state.sessions.remove(&id) {
        Some(session) => info!(
            session_id = %id,
            peer_addr = %session.peer_addr,
            reason = %reason,
            "Admin session closed"
        ),
        None => debug!(session_id = %id, "Close event for a session already removed"),
    }
}
