//! Socket configuration and validation
//!
//! Options are kept in their raw, unchecked form so that values read from a
//! config file or typed by a user can be out of range. [`SocketOptions::validate`]
//! turns them into a [`ValidatedOptions`] or the specific [`ErrorKind`] that
//! rejected them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Default server port
pub const DEFAULT_STREAM_PORT: i32 = 7000;

/// Default datagram port
pub const DEFAULT_DATAGRAM_PORT: i32 = 8000;

/// Default receive buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: i64 = 8192;

/// Default depth of the pending-connection queue
pub const DEFAULT_BACKLOG: u32 = 50;

/// Raw socket options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// IP address to bind to or connect to
    pub address: String,
    pub port: i32,
    /// Receive buffer size; bounds the payload of a single read
    pub buffer_size: i64,
    /// Pending-connection queue depth (stream servers only)
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::server(DEFAULT_STREAM_PORT)
    }
}

impl SocketOptions {
    /// Options for a server listening on all interfaces
    pub fn server(port: i32) -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED.to_string(),
            port,
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Options for an explicit address and port
    pub fn new(address: impl Into<String>, port: i32) -> Self {
        Self {
            address: address.into(),
            port,
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Options for a client connecting to `address:port`
    pub fn client(address: impl Into<String>, port: i32) -> Self {
        Self::new(address, port)
    }

    /// Options for a datagram endpoint bound on all interfaces
    pub fn datagram(port: i32) -> Self {
        Self::server(port)
    }

    /// Options from an already parsed address
    pub fn from_ip(ip: IpAddr, port: i32) -> Self {
        Self::new(ip.to_string(), port)
    }

    pub fn with_buffer_size(mut self, buffer_size: i64) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Check address, port and buffer size, in that order
    pub fn validate(&self) -> Result<ValidatedOptions> {
        let ip = parse_ip(&self.address)?;
        let port = validate_port(self.port)?;

        if self.buffer_size <= 0 {
            return Err(Error::new(
                ErrorKind::BadBufferSize,
                format!("buffer size must be positive, got {}", self.buffer_size),
            ));
        }
        let buffer_size = usize::try_from(self.buffer_size).map_err(|_| {
            Error::new(
                ErrorKind::BadBufferSize,
                format!("buffer size {} does not fit in memory", self.buffer_size),
            )
        })?;

        Ok(ValidatedOptions {
            addr: SocketAddr::new(ip, port),
            buffer_size,
            backlog: self.backlog,
        })
    }
}

/// Options that passed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedOptions {
    pub addr: SocketAddr,
    pub buffer_size: usize,
    pub backlog: u32,
}

/// Parse textual IP address
pub fn parse_ip(address: &str) -> Result<IpAddr> {
    address
        .trim()
        .parse()
        .map_err(|_| Error::new(ErrorKind::BadAddress, format!("bad address '{}'", address)))
}

/// Check that a port fits in `0..=65535`
pub fn validate_port(port: i32) -> Result<u16> {
    u16::try_from(port)
        .map_err(|_| Error::new(ErrorKind::BadPort, format!("port {} is out of range", port)))
}

/// Parse an address/port pair into a socket address
pub fn parse_endpoint(address: &str, port: i32) -> Result<SocketAddr> {
    let ip = parse_ip(address)?;
    let port = validate_port(port)?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = SocketOptions::default().validate().unwrap();
        assert_eq!(opts.addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(opts.buffer_size, 8192);
        assert_eq!(opts.backlog, 50);
    }

    #[test]
    fn test_valid_edges() {
        for port in [0, 1, 65535] {
            assert!(SocketOptions::client("127.0.0.1", port).validate().is_ok());
        }
        let opts = SocketOptions::client("::1", 9000)
            .with_buffer_size(1)
            .validate()
            .unwrap();
        assert!(opts.addr.is_ipv6());
        assert_eq!(opts.buffer_size, 1);
    }

    #[test]
    fn test_bad_port() {
        for port in [-1, 65536, i32::MIN, i32::MAX] {
            let err = SocketOptions::server(port).validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadPort);
        }
    }

    #[test]
    fn test_bad_address() {
        for addr in ["", "localhost", "300.1.1.1", "1.2.3"] {
            let err = SocketOptions::client(addr, 80).validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadAddress, "address {:?}", addr);
        }
    }

    #[test]
    fn test_bad_buffer_size() {
        for size in [0, -1] {
            let err = SocketOptions::server(7000)
                .with_buffer_size(size)
                .validate()
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BadBufferSize);
        }
    }

    #[test]
    fn test_address_checked_before_port() {
        let err = SocketOptions::client("nope", -5).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadAddress);
    }

    #[test]
    fn test_parse_endpoint() {
        let addr = parse_endpoint("10.0.0.1", 53).unwrap();
        assert_eq!(addr, "10.0.0.1:53".parse().unwrap());
        assert_eq!(
            parse_endpoint("10.0.0.1", 70000).unwrap_err().kind(),
            ErrorKind::BadPort
        );
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let opts: SocketOptions = toml::from_str("port = 9100\nbuffer_size = 512").unwrap();
        assert_eq!(opts.port, 9100);
        assert_eq!(opts.buffer_size, 512);
        assert_eq!(opts.address, "0.0.0.0");
        assert_eq!(opts.backlog, DEFAULT_BACKLOG);
    }
}
