//! USB/IP device addresses
//!
//! `usbip://<host>[:<port>]:<busid>`, with IPv6 hosts in brackets:
//!
//! ```
//! use proxy::UsbIpAddress;
//!
//! let addr: UsbIpAddress = "usbip://[fe80::1]:4000:2-1.3".parse().unwrap();
//! assert_eq!(addr.host, "fe80::1");
//! assert_eq!(addr.port, 4000);
//! assert_eq!(addr.busid, "2-1.3");
//! ```

use crate::error::ProxyError;
use protocol::BUSID_SIZE;
use std::fmt;
use std::str::FromStr;

/// Scheme prefix of a USB/IP address
pub const SCHEME: &str = "usbip://";

/// Default `usbipd` TCP port
pub const DEFAULT_PORT: u16 = 3240;

/// A parsed USB/IP device address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbIpAddress {
    pub host: String,
    pub port: u16,
    pub busid: String,
}

impl UsbIpAddress {
    /// `host:port` suitable for `ToSocketAddrs`
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for UsbIpAddress {
    type Err = ProxyError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let rest = address
            .strip_prefix(SCHEME)
            .ok_or_else(|| ProxyError::invalid_address(address, "missing usbip:// prefix"))?;

        let (host_port, busid) = rest
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::invalid_address(address, "missing bus id"))?;

        if busid.is_empty() || busid.len() >= BUSID_SIZE {
            return Err(ProxyError::invalid_address(address, "bus id is empty or too long"));
        }

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| ProxyError::invalid_address(address, "unterminated IPv6 host"))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(ProxyError::invalid_address(
                            address,
                            "unexpected text after IPv6 host",
                        ));
                    }
                },
            }
        } else {
            match host_port.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(ProxyError::invalid_address(address, "missing host"));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| ProxyError::invalid_address(address, format!("invalid port '{}'", port)))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            busid: busid.to_string(),
        })
    }
}

impl fmt::Display for UsbIpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", SCHEME, self.socket_addr(), self.busid)
    }
}
