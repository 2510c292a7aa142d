//! Error types for the relay.
//!
//! Errors fall into three groups with different handling:
//! - [`ConfigError`] and [`StartupError`] are fatal and map to process exit codes
//! - [`CommandError`] is rendered back to the admin session that issued the line
//! - [`CloseReason`] explains why a channel went away and is only ever logged

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::acceptor::EndpointKind;
use crate::state::Destination;

/// Invalid startup arguments.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One of the listening ports was zero.
    #[error("neither listening port number may be zero")]
    ZeroPort,
}

impl ConfigError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// Failures while opening the listening endpoints.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("can't open {endpoint} listening socket on {addr}: {source}")]
    Bind {
        endpoint: EndpointKind,
        addr: SocketAddr,
        source: io::Error,
    },
}

impl StartupError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        2
    }
}

/// Errors raised while handling one admin console line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command is empty; try 'help'")]
    Empty,

    #[error("incorrect argument count")]
    IncorrectArgumentCount,

    #[error("invalid command: {0} (try 'help')")]
    InvalidCommand(String),

    #[error("command line too long")]
    LineTooLong,
}

/// Why a channel stopped.
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("end of stream")]
    Eof,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to connect to {dest}: {source}")]
    Connect { dest: Destination, source: io::Error },

    #[error("disconnected by admin reset")]
    Reset,
}

impl CloseReason {
    /// True when the upstream connection never came up.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, CloseReason::Connect { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_messages() {
        assert_eq!(CommandError::Empty.to_string(), "command is empty; try 'help'");
        assert_eq!(
            CommandError::InvalidCommand("foo".to_string()).to_string(),
            "invalid command: foo (try 'help')"
        );
        assert_eq!(
            CommandError::LineTooLong.to_string(),
            "command line too long"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ConfigError::ZeroPort.exit_code(), 1);

        let err = StartupError::Bind {
            endpoint: EndpointKind::Shell,
            addr: "127.0.0.1:9002".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("shell listening socket"));
    }

    #[test]
    fn test_connect_failure_reason() {
        let reason = CloseReason::Connect {
            dest: Destination::new("example", 80),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(reason.is_connect_failure());
        assert!(reason.to_string().starts_with("failed to connect to example:80"));
        assert!(!CloseReason::Eof.is_connect_failure());
    }
}
