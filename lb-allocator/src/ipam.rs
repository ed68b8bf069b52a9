// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to the external IP address management (IPAM) agent.
//!
//! Pools with [`crate::PoolProtocol::Ipam`] declare no address ranges of
//! their own; instead the allocator reserves individual addresses from an
//! agent implementing [`IpamAgent`] and releases them when the owning
//! service goes away.  The agent is consumed purely as a reservation
//! service; its transport and its consistency model are its own business.

use async_trait::async_trait;
use lb_common::address::IpFamily;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment variable naming the cluster on whose behalf reservations are
/// made.  The value is copied verbatim into reservation metadata; when the
/// variable is unset the metadata carries an empty string.
pub const CLUSTER_ID_ENV_VAR: &str = "LB_CLUSTER_ID";

/// Metadata key under which the cluster identifier travels.
pub const CLUSTER_ID_METADATA_KEY: &str = "cluster-id";

/// Metadata key under which the owning service identifier travels.
pub const SERVICE_METADATA_KEY: &str = "service";

/// The cluster identifier from the environment, or an empty string.
///
/// This is deliberately re-read on every call rather than cached; it is
/// only consulted when building reservation metadata.
pub fn cluster_id() -> String {
    std::env::var(CLUSTER_ID_ENV_VAR).unwrap_or_default()
}

/// Build the metadata attached to a reservation made for `service`.
pub fn reservation_metadata(service: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(CLUSTER_ID_METADATA_KEY.to_string(), cluster_id());
    metadata.insert(SERVICE_METADATA_KEY.to_string(), service.to_string());
    metadata
}

/// A request for the agent to set aside addresses.
#[derive(Clone, Debug)]
pub struct ReservationRequest {
    pub family: IpFamily,
    pub count: usize,
    pub metadata: BTreeMap<String, String>,
}

/// One address the agent has set aside.
///
/// The agent reports addresses textually; the allocator parses and
/// validates them.  `handle` is opaque to the allocator and is passed back
/// unchanged on release.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IpReservation {
    pub address: String,
    pub handle: String,
}

/// Failures at the agent boundary.
#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("request to the IPAM agent timed out")]
    Timeout,

    #[error("IPAM agent returned {returned} reservations, wanted {wanted}")]
    WrongReservationCount { wanted: usize, returned: usize },

    #[error("IPAM agent returned unparseable address {address:?}")]
    UnparseableAddress { address: String },

    #[error("IPAM agent error")]
    Agent(#[source] anyhow::Error),
}

/// An external service that reserves and releases individual addresses on
/// demand.
///
/// Implementations are expected to enforce their own deadlines and report
/// expiry as [`IpamError::Timeout`]; a timed-out reservation must not be
/// left live on the agent side.
#[async_trait]
pub trait IpamAgent: fmt::Debug + Send + Sync {
    /// Set aside `request.count` addresses of the requested family.
    async fn reserve(
        &self,
        request: ReservationRequest,
    ) -> Result<Vec<IpReservation>, IpamError>;

    /// Return previously reserved addresses to the agent.
    async fn release(
        &self,
        reservations: &[IpReservation],
    ) -> Result<(), IpamError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory agent with injectable failures, for tests.

    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeState {
        /// Reservations handed back by the next `reserve` call.
        pub reservations_to_return: Vec<IpReservation>,
        /// When set, `reserve` fails with this message.
        pub reserve_error: Option<String>,
        /// When set, `release` fails with this message.
        pub release_error: Option<String>,
        /// Every reservation successfully released so far.
        pub released: Vec<IpReservation>,
        /// Every request seen by `reserve`.
        pub requests: Vec<ReservationRequest>,
    }

    #[derive(Debug, Default)]
    pub struct FakeIpamAgent {
        pub state: Mutex<FakeState>,
    }

    impl FakeIpamAgent {
        /// Queue reservations for the given addresses, with handles
        /// derived from them.
        pub fn set_reservations(&self, addresses: &[&str]) {
            let mut state = self.state.lock().unwrap();
            state.reservations_to_return = addresses
                .iter()
                .map(|address| IpReservation {
                    address: address.to_string(),
                    handle: format!("handle-{}", address),
                })
                .collect();
        }

        pub fn set_reserve_error(&self, message: Option<&str>) {
            self.state.lock().unwrap().reserve_error =
                message.map(|m| m.to_string());
        }

        pub fn set_release_error(&self, message: Option<&str>) {
            self.state.lock().unwrap().release_error =
                message.map(|m| m.to_string());
        }

        pub fn released(&self) -> Vec<IpReservation> {
            self.state.lock().unwrap().released.clone()
        }
    }

    #[async_trait]
    impl IpamAgent for FakeIpamAgent {
        async fn reserve(
            &self,
            request: ReservationRequest,
        ) -> Result<Vec<IpReservation>, IpamError> {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request);
            if let Some(message) = &state.reserve_error {
                return Err(IpamError::Agent(anyhow!("{message}")));
            }
            Ok(state.reservations_to_return.clone())
        }

        async fn release(
            &self,
            reservations: &[IpReservation],
        ) -> Result<(), IpamError> {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.release_error {
                return Err(IpamError::Agent(anyhow!("{message}")));
            }
            state.released.extend(reservations.iter().cloned());
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Environment mutation below would race against a concurrent cluster_id
    // reader, so both behaviors are covered by one test.
    #[test]
    fn test_cluster_id_and_metadata() {
        std::env::remove_var(CLUSTER_ID_ENV_VAR);
        assert_eq!(cluster_id(), "");
        let metadata = reservation_metadata("default/web");
        assert_eq!(metadata[CLUSTER_ID_METADATA_KEY], "");
        assert_eq!(metadata[SERVICE_METADATA_KEY], "default/web");

        std::env::set_var(CLUSTER_ID_ENV_VAR, "awd12e78wa");
        assert_eq!(cluster_id(), "awd12e78wa");
        let metadata = reservation_metadata("default/web");
        assert_eq!(metadata[CLUSTER_ID_METADATA_KEY], "awd12e78wa");

        std::env::remove_var(CLUSTER_ID_ENV_VAR);
        assert_eq!(cluster_id(), "");
    }
}
