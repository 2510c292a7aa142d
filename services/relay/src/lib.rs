//! plfm-vt relay
//!
//! Transparent TCP relay with a runtime admin console.
//!
//! Bytes are forwarded unmodified between each client and a fixed upstream
//! destination. A second, line-oriented text endpoint lets an operator count
//! active relay connections, change the destination, and disconnect every
//! client while traffic is in flight.

pub mod acceptor;
pub mod admin;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod relay;
pub mod state;

pub use acceptor::EndpointKind;
pub use admin::{Command, HELP_TEXT, PROMPT};
pub use channel::{Connector, TcpConnector};
pub use config::{Args, Config, LogFormat, RelayConfig};
pub use dispatch::{Event, RelayHandle, RelayServer};
pub use error::{CloseReason, CommandError, ConfigError, StartupError};
pub use state::{Destination, Endpoints, RelayStats, RuntimeState};
