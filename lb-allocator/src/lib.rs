// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IP address allocator at the heart of the load balancer controller.
//!
//! The allocator owns the authoritative in-memory mapping from service
//! identifiers to load balancer IP addresses, drawn from a set of
//! administrator-configured address pools.  It decides whether a requested
//! address may be assigned, auto-picks addresses when none is requested,
//! enforces the IP sharing rules that let cooperating services co-locate on
//! one address, reserves addresses through an external IPAM agent for pools
//! with no pre-declared ranges, and accepts live pool reconfiguration
//! without disturbing existing valid assignments.
//!
//! The allocator holds no persistent state; on startup the controller
//! replays the orchestrator's service records through [`Allocator::assign`]
//! to rebuild the maps.

mod allocator;
mod ipam;
mod pool;
mod port;
mod sharing;

pub use allocator::Allocator;
pub use allocator::AllocatorError;
pub use ipam::cluster_id;
pub use ipam::reservation_metadata;
pub use ipam::IpReservation;
pub use ipam::IpamAgent;
pub use ipam::IpamError;
pub use ipam::ReservationRequest;
pub use ipam::CLUSTER_ID_ENV_VAR;
pub use ipam::CLUSTER_ID_METADATA_KEY;
pub use ipam::SERVICE_METADATA_KEY;
pub use pool::Pool;
pub use pool::PoolProtocol;
pub use port::InvalidPort;
pub use port::Port;
pub use port::PortProtocol;
pub use port::PortSet;
pub use sharing::SharingKey;
