// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common IP addressing functionality.
//!
//! Addresses are always compared in canonical form: IPv4-mapped IPv6
//! addresses are treated as the IPv4 address they carry.

use ipnetwork::IpNetwork;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// The address family of an IP address or pool.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Classify `ip`, treating IPv4-mapped IPv6 addresses as IPv4.
    pub fn of(ip: &IpAddr) -> IpFamily {
        match ip.to_canonical() {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Report whether `ip` is an IPv4 address ending in `.0` or `.255`.
///
/// Some consumer network equipment drops traffic for such addresses due to
/// poor implementations of smurf protection.  Pools can be configured to
/// skip them.
pub fn is_buggy(ip: &IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            let last = v4.octets()[3];
            last == 0 || last == 255
        }
        IpAddr::V6(_) => false,
    }
}

/// The number of addresses covered by `cidr`, saturating at `i64::MAX`.
///
/// Anything with 62 or more host bits (an IPv6 /66 and wider) reports
/// `i64::MAX` outright; such ranges can never run dry.
pub fn cidr_size(cidr: &IpNetwork) -> i64 {
    let host_bits = match cidr {
        IpNetwork::V4(net) => 32 - net.prefix(),
        IpNetwork::V6(net) => 128 - net.prefix(),
    };
    if host_bits >= 62 {
        return i64::MAX;
    }
    1i64 << host_bits
}

/// The number of `.0`/`.255` addresses inside `cidr`.
pub fn buggy_address_count(cidr: &Ipv4Network) -> i64 {
    if cidr.prefix() <= 24 {
        // One .0 and one .255 for each /24 the block covers.
        return 2 * (1i64 << (24 - cidr.prefix()));
    }

    // Blocks longer than a /24 contain a .0 only as their first address and
    // a .255 only as their last.
    let first = IpAddr::V4(cidr.network());
    let last = IpAddr::V4(cidr.broadcast());
    let mut count = 0;
    if is_buggy(&first) {
        count += 1;
    }
    if last != first && is_buggy(&last) {
        count += 1;
    }
    count
}

/// Iterate the addresses of `cidr` in ascending numeric order.
///
/// The iterator is lazy; it is safe to call on an IPv6 /64 as long as the
/// caller bounds how far it walks.
pub fn addr_iter(cidr: &IpNetwork) -> Box<dyn Iterator<Item = IpAddr> + Send> {
    match cidr {
        IpNetwork::V4(net) => Box::new(net.iter().map(IpAddr::V4)),
        IpNetwork::V6(net) => Box::new(net.iter().map(IpAddr::V6)),
    }
}
