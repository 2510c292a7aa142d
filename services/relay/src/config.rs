//! Relay configuration.
//!
//! Startup is driven by positional arguments
//! (`<proxy-port> <shell-port> <dest-host> [dest-port]`) plus a few options
//! that can also come from the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::state::Destination;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(version, about = "Transparent TCP relay with a runtime admin console", long_about = None)]
pub struct Args {
    /// Port relay clients connect to.
    pub proxy_port: u16,

    /// Port the admin console listens on.
    pub shell_port: u16,

    /// Host new relay connections are forwarded to.
    pub dest_host: String,

    /// Port on the destination host (defaults to the proxy port).
    pub dest_port: Option<u16>,

    /// Address both listeners bind on.
    #[arg(long, env = "RELAY_BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Addresses and initial destination for a [`RelayServer`](crate::RelayServer).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub proxy_addr: SocketAddr,
    pub shell_addr: SocketAddr,
    pub destination: Destination,
}

impl RelayConfig {
    pub fn new(bind: IpAddr, proxy_port: u16, shell_port: u16, destination: Destination) -> Self {
        Self {
            proxy_addr: SocketAddr::new(bind, proxy_port),
            shell_addr: SocketAddr::new(bind, shell_port),
            destination,
        }
    }
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Validate parsed arguments.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.proxy_port == 0 || args.shell_port == 0 {
            return Err(ConfigError::ZeroPort);
        }

        let dest_port = args.dest_port.unwrap_or(args.proxy_port);
        let destination = Destination::new(args.dest_host, dest_port);

        Ok(Self {
            relay: RelayConfig::new(args.bind, args.proxy_port, args.shell_port, destination),
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Config, ConfigError> {
        let args = Args::try_parse_from(std::iter::once("relay").chain(argv.iter().copied()))
            .expect("arguments should parse");
        Config::from_args(args)
    }

    #[test]
    fn test_dest_port_defaults_to_proxy_port() {
        let config = parse(&["9001", "9002", "example"]).unwrap();
        assert_eq!(config.relay.destination, Destination::new("example", 9001));
        assert_eq!(config.relay.proxy_addr, "0.0.0.0:9001".parse().unwrap());
        assert_eq!(config.relay.shell_addr, "0.0.0.0:9002".parse().unwrap());
    }

    #[test]
    fn test_explicit_dest_port_and_bind() {
        let config = parse(&["9001", "9002", "example", "80", "--bind", "127.0.0.1"]).unwrap();
        assert_eq!(config.relay.destination, Destination::new("example", 80));
        assert_eq!(config.relay.proxy_addr, "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn test_zero_port_rejected() {
        assert!(matches!(
            parse(&["0", "9002", "example"]),
            Err(ConfigError::ZeroPort)
        ));
        assert!(matches!(
            parse(&["9001", "0", "example"]),
            Err(ConfigError::ZeroPort)
        ));
    }

    #[test]
    fn test_wrong_argument_count_rejected() {
        assert!(Args::try_parse_from(["relay", "9001", "9002"]).is_err());
        assert!(Args::try_parse_from(["relay", "9001", "9002", "example", "80", "extra"]).is_err());
        assert!(Args::try_parse_from(["relay", "port", "9002", "example"]).is_err());
    }

    #[test]
    fn test_log_format_option() {
        let args =
            Args::try_parse_from(["relay", "9001", "9002", "example", "--log-format", "text"])
                .unwrap();
        assert_eq!(args.log_format, LogFormat::Text);
    }
}
