// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address pools as the configuration layer hands them to the allocator.

use crate::ipam::IpamAgent;
use ipnetwork::IpNetwork;
use lb_common::address;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// How addresses drawn from a pool are made reachable, and where the
/// addresses themselves come from.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum PoolProtocol {
    /// Addresses are announced over BGP sessions.
    Bgp,
    /// Addresses are announced with ARP/NDP from one node.
    Layer2,
    /// Addresses are reserved on demand from an external IPAM agent
    /// instead of being drawn from pre-declared CIDRs.
    Ipam,
}

/// One administrator-configured address pool.
///
/// The pool's name is the key under which it is registered with
/// [`crate::Allocator::set_pools`].  The configuration layer guarantees
/// that `cidrs` do not overlap, within or between pools.
#[derive(Clone, Debug)]
pub struct Pool {
    pub protocol: PoolProtocol,
    /// The address ranges this pool hands out.  Empty when `protocol` is
    /// [`PoolProtocol::Ipam`].
    pub cidrs: Vec<IpNetwork>,
    /// Whether this pool participates in auto-assignment.
    pub auto_assign: bool,
    /// Whether to withhold IPv4 addresses ending in .0 or .255.
    pub avoid_buggy_ips: bool,
    /// The reservation service backing this pool; present iff `protocol`
    /// is [`PoolProtocol::Ipam`].
    pub ipam: Option<Arc<dyn IpamAgent>>,
}

impl Pool {
    /// Report whether this pool statically owns `ip`.
    ///
    /// IPAM pools declare no ranges of their own, so they never match here;
    /// ownership of reserved addresses is tracked by the allocator against
    /// the reservation instead.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        if self.avoid_buggy_ips && address::is_buggy(&ip) {
            return false;
        }
        self.cidrs.iter().any(|cidr| cidr.contains(ip))
    }

    /// The number of usable addresses in this pool, saturating at
    /// `i64::MAX`.
    pub fn capacity(&self) -> i64 {
        let mut total: i64 = 0;
        for cidr in &self.cidrs {
            let mut size = address::cidr_size(cidr);
            if self.avoid_buggy_ips {
                if let IpNetwork::V4(net) = cidr {
                    size -= address::buggy_address_count(net);
                }
            }
            total = total.saturating_add(size);
        }
        total
    }
}
