// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layer-4 ports as services expose them, and sets thereof.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A transport protocol carried by a [`Port`].
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
            PortProtocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for PortProtocol {
    type Err = InvalidPort;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(PortProtocol::Tcp),
            "udp" => Ok(PortProtocol::Udp),
            "sctp" => Ok(PortProtocol::Sctp),
            _ => Err(InvalidPort(s.to_string())),
        }
    }
}

/// One (protocol, port number) pair exposed by a service.
///
/// Two `Port` values conflict iff they are equal.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct Port {
    pub protocol: PortProtocol,
    pub port: u16,
}

impl Port {
    pub fn new(protocol: PortProtocol, port: u16) -> Port {
        Port { protocol, port }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.port)
    }
}

impl FromStr for Port {
    type Err = InvalidPort;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, number) =
            s.split_once('/').ok_or_else(|| InvalidPort(s.to_string()))?;
        let protocol = protocol.parse()?;
        let port =
            number.parse().map_err(|_| InvalidPort(s.to_string()))?;
        Ok(Port { protocol, port })
    }
}

/// Error returned when parsing a [`Port`] from its textual form.
#[derive(Debug, thiserror::Error)]
#[error("invalid port {0:?} (expected \"protocol/number\", e.g. \"tcp/80\")")]
pub struct InvalidPort(String);

/// The set of ports a service exposes on its load balancer address.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq,
)]
pub struct PortSet(BTreeSet<Port>);

impl PortSet {
    pub fn new() -> PortSet {
        PortSet(BTreeSet::new())
    }

    pub fn insert(&mut self, port: Port) -> bool {
        self.0.insert(port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Report whether the two sets have any port in common.
    pub fn intersects(&self, other: &PortSet) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }
}

impl FromIterator<Port> for PortSet {
    fn from_iter<I: IntoIterator<Item = Port>>(iter: I) -> PortSet {
        PortSet(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ports(specs: &[&str]) -> PortSet {
        specs.iter().map(|s| s.parse::<Port>().unwrap()).collect()
    }

    #[test]
    fn test_parse_and_display() {
        let port: Port = "tcp/80".parse().unwrap();
        assert_eq!(port, Port::new(PortProtocol::Tcp, 80));
        assert_eq!(port.to_string(), "tcp/80");
        assert_eq!(
            "sctp/9999".parse::<Port>().unwrap(),
            Port::new(PortProtocol::Sctp, 9999)
        );

        assert!("80".parse::<Port>().is_err());
        assert!("icmp/80".parse::<Port>().is_err());
        assert!("tcp/notaport".parse::<Port>().is_err());
        assert!("tcp/65536".parse::<Port>().is_err());
    }

    #[test]
    fn test_intersects() {
        let web = ports(&["tcp/80", "tcp/443"]);
        assert!(web.intersects(&ports(&["tcp/443"])));
        assert!(!web.intersects(&ports(&["udp/443"])));
        assert!(!web.intersects(&ports(&["tcp/8080"])));
        assert!(!web.intersects(&PortSet::new()));
        assert!(!PortSet::new().intersects(&PortSet::new()));
    }

    #[test]
    fn test_insert_dedups() {
        let mut set = PortSet::new();
        assert!(set.insert("tcp/80".parse().unwrap()));
        assert!(!set.insert("tcp/80".parse().unwrap()));
        assert_eq!(set.len(), 1);
    }
}
