//! D-Bus listen address parsing.
//!
//! Parses the subset of the D-Bus address grammar the broker can listen
//! on: `unix:path=<abs-path>` and
//! `tcp:host=<host>[,port=<port>][,family=ipv4|ipv6]` (`bind=` is
//! accepted as a synonym for `host=`).

use std::fmt;
use std::path::PathBuf;

use crate::error::AddressError;

/// IP family restriction for TCP listen addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// A parsed listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix {
        path: PathBuf,
    },
    Tcp {
        host: String,
        /// 0 requests a kernel-assigned port.
        port: u16,
        family: Option<AddressFamily>,
    },
}

impl Address {
    /// Parse a D-Bus address string.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let (transport, properties) = address
            .split_once(':')
            .ok_or_else(|| AddressError::InvalidFormat(address.to_string()))?;

        let mut pairs = Vec::new();
        if !properties.is_empty() {
            for pair in properties.split(',') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| AddressError::InvalidFormat(pair.to_string()))?;
                pairs.push((key, value));
            }
        }
        let get = |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

        match transport {
            "unix" => {
                let path = get("path").ok_or(AddressError::MissingProperty {
                    transport: "unix",
                    property: "path",
                })?;
                Ok(Address::Unix {
                    path: PathBuf::from(path),
                })
            }
            "tcp" => {
                let host = get("host")
                    .or_else(|| get("bind"))
                    .ok_or(AddressError::MissingProperty {
                        transport: "tcp",
                        property: "host",
                    })?;
                let port = match get("port") {
                    Some(value) => {
                        value
                            .parse::<u16>()
                            .map_err(|_| AddressError::InvalidProperty {
                                property: "port",
                                value: value.to_string(),
                            })?
                    }
                    None => 0,
                };
                let family = match get("family") {
                    Some("ipv4") => Some(AddressFamily::Ipv4),
                    Some("ipv6") => Some(AddressFamily::Ipv6),
                    Some(other) => {
                        return Err(AddressError::InvalidProperty {
                            property: "family",
                            value: other.to_string(),
                        })
                    }
                    None => None,
                };
                Ok(Address::Tcp {
                    host: host.to_string(),
                    port,
                    family,
                })
            }
            other => Err(AddressError::UnknownTransport(other.to_string())),
        }
    }

    /// The same address with the actual bound port filled in.
    pub fn with_port(self, port: u16) -> Self {
        match self {
            Address::Tcp { host, family, .. } => Address::Tcp { host, port, family },
            unix => unix,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix { path } => write!(f, "unix:path={}", path.display()),
            Address::Tcp { host, port, family } => {
                write!(f, "tcp:host={},port={}", host, port)?;
                match family {
                    Some(AddressFamily::Ipv4) => write!(f, ",family=ipv4"),
                    Some(AddressFamily::Ipv6) => write!(f, ",family=ipv6"),
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix() {
        let address = Address::parse("unix:path=/run/bus-socket").unwrap();
        assert_eq!(
            address,
            Address::Unix {
                path: PathBuf::from("/run/bus-socket")
            }
        );
        assert_eq!(address.to_string(), "unix:path=/run/bus-socket");
    }

    #[test]
    fn test_parse_tcp() {
        let address = Address::parse("tcp:host=localhost,port=7000,family=ipv4").unwrap();
        assert_eq!(
            address,
            Address::Tcp {
                host: "localhost".into(),
                port: 7000,
                family: Some(AddressFamily::Ipv4),
            }
        );
    }

    #[test]
    fn test_parse_tcp_bind_synonym_and_default_port() {
        let address = Address::parse("tcp:bind=127.0.0.1").unwrap();
        assert_eq!(
            address,
            Address::Tcp {
                host: "127.0.0.1".into(),
                port: 0,
                family: None,
            }
        );
    }

    #[test]
    fn test_with_port_reflects_kernel_port() {
        let address = Address::parse("tcp:host=localhost").unwrap().with_port(40123);
        assert_eq!(address.to_string(), "tcp:host=localhost,port=40123");
    }

    #[test]
    fn test_missing_path() {
        match Address::parse("unix:") {
            Err(AddressError::MissingProperty {
                transport: "unix",
                property: "path",
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_transport() {
        match Address::parse("launchd:env=DBUS_LAUNCHD_SESSION_BUS_SOCKET") {
            Err(AddressError::UnknownTransport(transport)) => assert_eq!(transport, "launchd"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_family() {
        assert!(matches!(
            Address::parse("tcp:host=::1,family=ipx"),
            Err(AddressError::InvalidProperty { property: "family", .. })
        ));
    }

    #[test]
    fn test_no_transport_separator() {
        assert!(matches!(
            Address::parse("garbage"),
            Err(AddressError::InvalidFormat(_))
        ));
    }
}
