// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The allocator core: the authoritative mapping from services to load
//! balancer addresses.

use crate::ipam::reservation_metadata;
use crate::ipam::IpReservation;
use crate::ipam::IpamAgent;
use crate::ipam::IpamError;
use crate::ipam::ReservationRequest;
use crate::pool::Pool;
use crate::pool::PoolProtocol;
use crate::port::Port;
use crate::port::PortSet;
use crate::sharing::SharingKey;
use lb_common::address;
use lb_common::address::IpFamily;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;

/// Upper bound on candidate addresses examined by one auto-assignment
/// attempt against a static pool.  Pools wider than this (an IPv6 /64 says
/// hello) are scanned first-fit up to the bound; callers see exhaustion and
/// may retry.
const MAX_AUTO_ASSIGN_SCAN: usize = 65_536;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("{ip} is not allowed by the configured pools")]
    NoPool { ip: IpAddr },

    #[error("{ip} is already in use by service {holder:?}")]
    InUse { ip: IpAddr, holder: String },

    #[error("sharing key for {ip} does not match the current holders")]
    SharingMismatch { ip: IpAddr },

    #[error(
        "service {service:?} cannot change its sharing key while {ip} \
         is shared"
    )]
    SharingFrozen { service: String, ip: IpAddr },

    #[error("port {port} on {ip} is already in use by service {holder:?}")]
    PortConflict { ip: IpAddr, port: Port, holder: String },

    #[error(
        "service {service:?} holds {ip}, which is not an {family} address"
    )]
    FamilyMismatch { service: String, ip: IpAddr, family: IpFamily },

    #[error("no available {family} addresses in pool {pool:?}")]
    PoolExhausted { pool: String, family: IpFamily },

    #[error("no {family} addresses available in any pool")]
    NoCapacity { family: IpFamily },

    #[error("unknown pool {pool:?}")]
    NoSuchPool { pool: String },

    #[error(
        "service {service:?} is assigned from pool {assigned:?}, \
         not {requested:?}"
    )]
    PoolMismatch { service: String, assigned: String, requested: String },

    #[error("pool {pool:?} has protocol \"ipam\" but no agent configured")]
    NoIpamAgent { pool: String },

    #[error(
        "new pools are not compatible with assigned addresses: service \
         {service:?} cannot keep {ip}"
    )]
    IncompatiblePools { service: String, ip: IpAddr },

    #[error("IPAM operation failed")]
    Ipam(#[from] IpamError),
}

/// A reservation held with an IPAM agent on behalf of one address.
///
/// The agent handle rides along so the reservation can be released even if
/// the pool it came from has since been renamed.
#[derive(Clone, Debug)]
struct HeldReservation {
    agent: Arc<dyn IpamAgent>,
    reservation: IpReservation,
}

/// One service's current address, as recorded in the forward index.
#[derive(Clone, Debug)]
struct Assignment {
    ip: IpAddr,
    pool: String,
    ports: PortSet,
    sharing: SharingKey,
}

/// Reverse-index entry: everything currently parked on one address.
///
/// The IPAM reservation lives here rather than on any one assignment:
/// services sharing a reserved address come and go (including the one that
/// originally reserved it), and the reservation must outlive all but the
/// last of them.
#[derive(Debug)]
struct IpUsers {
    pool: String,
    sharing: SharingKey,
    services: BTreeSet<String>,
    ports: BTreeMap<Port, String>,
    reservation: Option<HeldReservation>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    pools: BTreeMap<String, Pool>,
    allocated: BTreeMap<String, Assignment>,
    ips_in_use: BTreeMap<IpAddr, IpUsers>,
}

/// The IP address allocator.
///
/// Mutating operations are serialized against each other and are atomic as
/// observed by any caller; the read-only queries [`Allocator::ip`] and
/// [`Allocator::pool`] may run concurrently with anything.  Calls out to an
/// IPAM agent happen with the state lock released, and any reservation that
/// cannot be committed afterwards is handed back to the agent before the
/// error returns.
pub struct Allocator {
    log: Logger,
    /// Serializes mutating operations end-to-end, including across agent
    /// calls.
    op_lock: tokio::sync::Mutex<()>,
    /// Never held across an await point.
    state: RwLock<AllocatorState>,
}

impl Allocator {
    /// Create an empty allocator.  State is rebuilt by the caller replaying
    /// service records after [`Allocator::set_pools`].
    pub fn new(log: &Logger) -> Allocator {
        Allocator {
            log: log.new(o!("component" => "IpAllocator")),
            op_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(AllocatorState::default()),
        }
    }

    /// Replace the pool configuration.
    ///
    /// The new configuration is validated in full before anything changes:
    /// every live assignment must remain representable, i.e. some new pool
    /// must still own its address.  Pools may be renamed, split, merged, or
    /// deleted freely as long as that holds; cached pool names are
    /// refreshed afterwards.
    pub async fn set_pools(
        &self,
        pools: BTreeMap<String, Pool>,
    ) -> Result<(), AllocatorError> {
        let _op = self.op_lock.lock().await;
        let mut state = self.state.write().unwrap();

        let mut renamed = Vec::new();
        for (service, assignment) in &state.allocated {
            let reserved = state
                .ips_in_use
                .get(&assignment.ip)
                .is_some_and(|users| users.reservation.is_some());
            match Self::pool_for_assignment(&pools, assignment, reserved) {
                Some(pool) => {
                    if pool != assignment.pool {
                        renamed.push((service.clone(), pool));
                    }
                }
                None => {
                    return Err(AllocatorError::IncompatiblePools {
                        service: service.clone(),
                        ip: assignment.ip,
                    });
                }
            }
        }

        state.pools = pools;
        for (service, pool) in renamed {
            let Some(assignment) = state.allocated.get_mut(&service) else {
                continue;
            };
            let ip = assignment.ip;
            assignment.pool = pool.clone();
            if let Some(users) = state.ips_in_use.get_mut(&ip) {
                users.pool = pool;
            }
        }

        info!(
            self.log, "applied pool configuration";
            "pools" => state.pools.len(),
            "assigned" => state.allocated.len()
        );
        Ok(())
    }

    /// Assign `ip` to `service`, if the configuration and the address's
    /// current holders allow it.
    ///
    /// Repeating an assignment with identical arguments is a no-op.  If the
    /// service holds a different address, it is released in the same
    /// operation; when that address came from an IPAM pool and no other
    /// service still shares it, the reservation is returned to the agent
    /// first, and a failed release fails the whole operation with the prior
    /// assignment intact.
    pub async fn assign(
        &self,
        service: &str,
        ip: IpAddr,
        ports: PortSet,
        sharing_key: &str,
        backend_key: &str,
    ) -> Result<(), AllocatorError> {
        let _op = self.op_lock.lock().await;
        self.do_assign(
            service,
            ip.to_canonical(),
            ports,
            SharingKey::new(sharing_key, backend_key),
        )
        .await
    }

    /// Assign `service` an address of the requested family from any pool
    /// that allows auto-assignment.
    ///
    /// If the service already holds an address of that family, the holding
    /// is re-validated against the supplied ports and keys and returned;
    /// should re-validation fail, the old address is freed and a fresh pick
    /// proceeds.
    pub async fn allocate(
        &self,
        service: &str,
        family: IpFamily,
        ports: PortSet,
        sharing_key: &str,
        backend_key: &str,
    ) -> Result<IpAddr, AllocatorError> {
        let _op = self.op_lock.lock().await;
        let sharing = SharingKey::new(sharing_key, backend_key);

        if let Some(current) = self.current_assignment(service) {
            if IpFamily::of(&current.ip) != family {
                return Err(AllocatorError::FamilyMismatch {
                    service: service.to_string(),
                    ip: current.ip,
                    family,
                });
            }
            match self
                .do_assign(service, current.ip, ports.clone(), sharing.clone())
                .await
            {
                Ok(()) => return Ok(current.ip),
                Err(_) => {
                    // The current address no longer fits the service's
                    // sharing posture.  Free it and pick afresh, returning
                    // its reservation to the agent if nobody else shares
                    // the address.
                    let held = {
                        let state = self.state.read().unwrap();
                        Self::sole_holder_reservation(
                            &state,
                            service,
                            &current.ip,
                        )
                    };
                    if let Some(held) = held {
                        held.agent.release(&[held.reservation]).await?;
                    }
                    let mut state = self.state.write().unwrap();
                    Self::unassign_locked(&mut state, service);
                }
            }
        }

        let candidates: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .pools
                .iter()
                .filter(|(_, pool)| pool.auto_assign)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for pool_name in candidates {
            if let Ok(ip) = self
                .do_allocate_from_pool(
                    service,
                    family,
                    &pool_name,
                    ports.clone(),
                    sharing.clone(),
                )
                .await
            {
                return Ok(ip);
            }
        }
        Err(AllocatorError::NoCapacity { family })
    }

    /// Assign `service` an address of the requested family from the named
    /// pool.
    pub async fn allocate_from_pool(
        &self,
        service: &str,
        family: IpFamily,
        pool_name: &str,
        ports: PortSet,
        sharing_key: &str,
        backend_key: &str,
    ) -> Result<IpAddr, AllocatorError> {
        let _op = self.op_lock.lock().await;
        self.do_allocate_from_pool(
            service,
            family,
            pool_name,
            ports,
            SharingKey::new(sharing_key, backend_key),
        )
        .await
    }

    /// Drop `service`'s assignment, if any, without contacting any IPAM
    /// agent.  The address becomes free once its last holder leaves.
    pub async fn unassign(&self, service: &str) {
        let _op = self.op_lock.lock().await;
        let mut state = self.state.write().unwrap();
        if Self::unassign_locked(&mut state, service) {
            debug!(self.log, "unassigned service"; "service" => service);
        }
    }

    /// Drop `service`'s assignment, returning the IPAM reservation behind
    /// its address to the agent first when `service` is the last holder;
    /// co-holders of a shared address keep the reservation live.
    ///
    /// If the agent declines the release, nothing is mutated and the error
    /// surfaces; the operation is safe to retry.  For addresses from static
    /// pools this is equivalent to [`Allocator::unassign`].
    pub async fn unallocate(
        &self,
        service: &str,
    ) -> Result<(), AllocatorError> {
        let _op = self.op_lock.lock().await;
        let held = {
            let state = self.state.read().unwrap();
            let Some(assignment) = state.allocated.get(service) else {
                return Ok(());
            };
            Self::sole_holder_reservation(&state, service, &assignment.ip)
        };
        if let Some(held) = held {
            held.agent.release(&[held.reservation]).await?;
        }
        let mut state = self.state.write().unwrap();
        Self::unassign_locked(&mut state, service);
        debug!(self.log, "released service"; "service" => service);
        Ok(())
    }

    /// The address currently assigned to `service`, if any.
    pub fn ip(&self, service: &str) -> Option<IpAddr> {
        self.state
            .read()
            .unwrap()
            .allocated
            .get(service)
            .map(|assignment| assignment.ip)
    }

    /// The name of the pool `service`'s address came from, if any.
    pub fn pool(&self, service: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .allocated
            .get(service)
            .map(|assignment| assignment.pool.clone())
    }

    fn current_assignment(&self, service: &str) -> Option<Assignment> {
        self.state.read().unwrap().allocated.get(service).cloned()
    }

    /// The assignment primitive.  Callers hold the operation lock.
    async fn do_assign(
        &self,
        service: &str,
        ip: IpAddr,
        ports: PortSet,
        sharing: SharingKey,
    ) -> Result<(), AllocatorError> {
        let (pool_name, prior) = {
            let state = self.state.read().unwrap();
            let pool_name = Self::pool_for_ip(&state, &ip)
                .ok_or(AllocatorError::NoPool { ip })?;
            Self::check_sharing(&state, service, &ip, &ports, &sharing)?;
            let prior = state.allocated.get(service).and_then(|previous| {
                if previous.ip == ip {
                    None
                } else {
                    Self::sole_holder_reservation(
                        &state,
                        service,
                        &previous.ip,
                    )
                }
            });
            (pool_name, prior)
        };

        // When the last holder moves off a reserved address, the
        // reservation goes back to the agent before the indexes change; a
        // failed release leaves the prior assignment intact for a retry.
        if let Some(held) = prior {
            held.agent.release(&[held.reservation]).await?;
        }

        let mut state = self.state.write().unwrap();
        Self::commit_assign(
            &mut state,
            service,
            Assignment { ip, pool: pool_name, ports, sharing },
            None,
        );
        debug!(self.log, "assigned address"; "service" => service, "ip" => %ip);
        Ok(())
    }

    async fn do_allocate_from_pool(
        &self,
        service: &str,
        family: IpFamily,
        pool_name: &str,
        ports: PortSet,
        sharing: SharingKey,
    ) -> Result<IpAddr, AllocatorError> {
        if let Some(current) = self.current_assignment(service) {
            if IpFamily::of(&current.ip) != family {
                return Err(AllocatorError::FamilyMismatch {
                    service: service.to_string(),
                    ip: current.ip,
                    family,
                });
            }
            // Services name their pool up front; a request against another
            // pool is a caller bug, not a reallocation.
            if current.pool != pool_name {
                return Err(AllocatorError::PoolMismatch {
                    service: service.to_string(),
                    assigned: current.pool,
                    requested: pool_name.to_string(),
                });
            }
            self.do_assign(service, current.ip, ports, sharing).await?;
            return Ok(current.ip);
        }

        let pool = {
            let state = self.state.read().unwrap();
            state.pools.get(pool_name).cloned().ok_or_else(|| {
                AllocatorError::NoSuchPool { pool: pool_name.to_string() }
            })?
        };

        match pool.protocol {
            PoolProtocol::Ipam => {
                self.allocate_from_ipam(
                    service, family, pool_name, &pool, ports, sharing,
                )
                .await
            }
            PoolProtocol::Bgp | PoolProtocol::Layer2 => self
                .allocate_from_static(
                    service, family, pool_name, &pool, ports, sharing,
                ),
        }
    }

    /// First-fit scan over a pool's declared ranges.
    fn allocate_from_static(
        &self,
        service: &str,
        family: IpFamily,
        pool_name: &str,
        pool: &Pool,
        ports: PortSet,
        sharing: SharingKey,
    ) -> Result<IpAddr, AllocatorError> {
        let mut state = self.state.write().unwrap();

        let mut chosen = None;
        let mut scanned = 0;
        'ranges: for cidr in &pool.cidrs {
            if IpFamily::of(&cidr.ip()) != family {
                continue;
            }
            for ip in address::addr_iter(cidr) {
                if scanned >= MAX_AUTO_ASSIGN_SCAN {
                    break 'ranges;
                }
                scanned += 1;
                if pool.avoid_buggy_ips && address::is_buggy(&ip) {
                    continue;
                }
                if Self::check_sharing(&state, service, &ip, &ports, &sharing)
                    .is_ok()
                {
                    chosen = Some(ip);
                    break 'ranges;
                }
            }
        }

        let Some(ip) = chosen else {
            return Err(AllocatorError::PoolExhausted {
                pool: pool_name.to_string(),
                family,
            });
        };
        Self::commit_assign(
            &mut state,
            service,
            Assignment { ip, pool: pool_name.to_string(), ports, sharing },
            None,
        );
        debug!(
            self.log, "auto-assigned address";
            "service" => service, "ip" => %ip, "pool" => pool_name
        );
        Ok(ip)
    }

    /// Reserve one address from the pool's agent, then run it through the
    /// normal assignment checks.  Any reservation that cannot be committed
    /// is handed back before the error returns.
    async fn allocate_from_ipam(
        &self,
        service: &str,
        family: IpFamily,
        pool_name: &str,
        pool: &Pool,
        ports: PortSet,
        sharing: SharingKey,
    ) -> Result<IpAddr, AllocatorError> {
        let agent = pool.ipam.clone().ok_or_else(|| {
            AllocatorError::NoIpamAgent { pool: pool_name.to_string() }
        })?;

        let request = ReservationRequest {
            family,
            count: 1,
            metadata: reservation_metadata(service),
        };
        let mut reservations = agent.reserve(request).await?;
        if reservations.len() != 1 {
            let returned = reservations.len();
            self.release_quietly(&agent, &reservations).await;
            return Err(IpamError::WrongReservationCount {
                wanted: 1,
                returned,
            }
            .into());
        }
        let reservation = reservations.remove(0);

        let ip = match reservation.address.parse::<IpAddr>() {
            Ok(ip) => ip.to_canonical(),
            Err(_) => {
                let address = reservation.address.clone();
                self.release_quietly(&agent, &[reservation]).await;
                return Err(IpamError::UnparseableAddress { address }.into());
            }
        };
        if IpFamily::of(&ip) != family {
            self.release_quietly(&agent, &[reservation]).await;
            return Err(AllocatorError::FamilyMismatch {
                service: service.to_string(),
                ip,
                family,
            });
        }

        let outcome = {
            let mut state = self.state.write().unwrap();
            match Self::check_sharing(&state, service, &ip, &ports, &sharing)
            {
                Ok(()) => Ok(Self::commit_assign(
                    &mut state,
                    service,
                    Assignment {
                        ip,
                        pool: pool_name.to_string(),
                        ports,
                        sharing,
                    },
                    Some(HeldReservation {
                        agent: Arc::clone(&agent),
                        reservation: reservation.clone(),
                    }),
                )),
                Err(error) => Err(error),
            }
        };
        match outcome {
            Ok(surplus) => {
                // The agent can hand out an address that is already
                // reserved here; the duplicate reservation goes straight
                // back.
                if let Some(held) = surplus {
                    self.release_quietly(&held.agent, &[held.reservation])
                        .await;
                }
                info!(
                    self.log, "reserved address";
                    "service" => service, "ip" => %ip, "pool" => pool_name
                );
                Ok(ip)
            }
            Err(error) => {
                self.release_quietly(&agent, &[reservation]).await;
                Err(error)
            }
        }
    }

    async fn release_quietly(
        &self,
        agent: &Arc<dyn IpamAgent>,
        reservations: &[IpReservation],
    ) {
        if reservations.is_empty() {
            return;
        }
        if let Err(error) = agent.release(reservations).await {
            warn!(
                self.log, "failed to release IPAM reservation";
                "error" => %error
            );
        }
    }

    /// Which pool owns `ip` right now?  An in-use address answers from the
    /// reverse index (which is how reserved addresses, statically owned by
    /// nothing, stay assignable to their holder); anything else is a scan
    /// of the configured pools.
    fn pool_for_ip(state: &AllocatorState, ip: &IpAddr) -> Option<String> {
        if let Some(users) = state.ips_in_use.get(ip) {
            return Some(users.pool.clone());
        }
        state
            .pools
            .iter()
            .find(|(_, pool)| pool.contains(ip))
            .map(|(name, _)| name.clone())
    }

    /// The reservation behind `ip`, provided `service` is its only
    /// remaining holder.
    fn sole_holder_reservation(
        state: &AllocatorState,
        service: &str,
        ip: &IpAddr,
    ) -> Option<HeldReservation> {
        let users = state.ips_in_use.get(ip)?;
        if users.services.len() == 1 && users.services.contains(service) {
            users.reservation.clone()
        } else {
            None
        }
    }

    /// Which pool of a prospective configuration would own an existing
    /// assignment?  `reserved` says whether the assignment's address is
    /// backed by an IPAM reservation.
    fn pool_for_assignment(
        pools: &BTreeMap<String, Pool>,
        assignment: &Assignment,
        reserved: bool,
    ) -> Option<String> {
        if reserved {
            // Reservation-backed addresses stay with an IPAM pool: the one
            // they came from if it survives, else the first remaining one.
            if let Some(pool) = pools.get(&assignment.pool) {
                if pool.protocol == PoolProtocol::Ipam {
                    return Some(assignment.pool.clone());
                }
            }
            return pools
                .iter()
                .find(|(_, pool)| pool.protocol == PoolProtocol::Ipam)
                .map(|(name, _)| name.clone());
        }
        pools
            .iter()
            .find(|(_, pool)| pool.contains(&assignment.ip))
            .map(|(name, _)| name.clone())
    }

    /// Can `service` park on `ip` with these ports and this key?
    ///
    /// A service alone on an address may rewrite its own key pair; once a
    /// second service joins, the pair is frozen and only port changes
    /// remain possible.  Port checks skip the service's own ports so that
    /// in-place changes don't conflict with themselves.
    fn check_sharing(
        state: &AllocatorState,
        service: &str,
        ip: &IpAddr,
        ports: &PortSet,
        sharing: &SharingKey,
    ) -> Result<(), AllocatorError> {
        let Some(users) = state.ips_in_use.get(ip) else {
            return Ok(());
        };

        if !users.sharing.compatible_with(sharing) {
            let sole_holder = users.services.len() == 1
                && users.services.contains(service);
            if !sole_holder {
                if users.services.contains(service) {
                    return Err(AllocatorError::SharingFrozen {
                        service: service.to_string(),
                        ip: *ip,
                    });
                }
                if !users.sharing.enables_sharing()
                    || !sharing.enables_sharing()
                {
                    let holder = users
                        .services
                        .iter()
                        .next()
                        .cloned()
                        .unwrap_or_default();
                    return Err(AllocatorError::InUse { ip: *ip, holder });
                }
                return Err(AllocatorError::SharingMismatch { ip: *ip });
            }
        }

        for port in ports.iter() {
            if let Some(holder) = users.ports.get(port) {
                if holder != service {
                    return Err(AllocatorError::PortConflict {
                        ip: *ip,
                        port: *port,
                        holder: holder.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Record an assignment in both indexes, displacing whatever the
    /// service held before.  `reservation` is a freshly acquired
    /// reservation to attach to the address; if the address already
    /// carries one, the fresh one is returned for the caller to hand back.
    /// Validation is the caller's job.
    fn commit_assign(
        state: &mut AllocatorState,
        service: &str,
        assignment: Assignment,
        reservation: Option<HeldReservation>,
    ) -> Option<HeldReservation> {
        // A same-address reassign by a sole holder briefly empties the
        // entry; the address's reservation has to survive that.
        let existing = state
            .ips_in_use
            .get(&assignment.ip)
            .and_then(|users| users.reservation.clone());
        Self::unassign_locked(state, service);
        let users = state
            .ips_in_use
            .entry(assignment.ip)
            .or_insert_with(|| IpUsers {
                pool: assignment.pool.clone(),
                sharing: assignment.sharing.clone(),
                services: BTreeSet::new(),
                ports: BTreeMap::new(),
                reservation: None,
            });
        users.pool = assignment.pool.clone();
        users.sharing = assignment.sharing.clone();
        users.services.insert(service.to_string());
        for port in assignment.ports.iter() {
            users.ports.insert(*port, service.to_string());
        }
        if users.reservation.is_none() {
            users.reservation = existing;
        }
        let surplus = if users.reservation.is_none() {
            users.reservation = reservation;
            None
        } else {
            reservation
        };
        state.allocated.insert(service.to_string(), assignment);
        surplus
    }

    /// Remove a service from both indexes.  Returns whether it was
    /// assigned at all.
    fn unassign_locked(state: &mut AllocatorState, service: &str) -> bool {
        let Some(assignment) = state.allocated.remove(service) else {
            return false;
        };
        if let Some(users) = state.ips_in_use.get_mut(&assignment.ip) {
            users.services.remove(service);
            users.ports.retain(|_, holder| holder != service);
            if users.services.is_empty() {
                state.ips_in_use.remove(&assignment.ip);
            }
        }
        true
    }
}
