// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reservations: requests to bind an instance to an address on a network.

use crate::network::Network;
use flotilla_director_types::ids::InstanceUuid;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationKind {
    /// An explicit address from the manifest.
    Static,
    /// Any free address in an AZ-eligible subnet.
    Dynamic,
}

/// Where a reservation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationOrigin {
    /// Requested by the current run's desired state.
    Desired,
    /// Recovered from the instance's persisted network settings.
    Existing,
}

/// A binding (or request to bind) between an instance and an address on
/// one network.
///
/// Created per desired network per instance per run; resolved by the IP
/// provider.  An existing reservation whose address no longer fits the
/// current topology stays unresolved rather than failing the run, and
/// planning then reports the instance's network topology as changed.
#[derive(Clone, Debug)]
pub struct Reservation {
    pub instance: InstanceUuid,
    pub network: Arc<Network>,
    pub kind: ReservationKind,
    pub origin: ReservationOrigin,
    /// Availability zone of the instance, constraining subnet choice for
    /// dynamic allocation.
    pub availability_zone: Option<String>,
    pub ip: Option<IpAddr>,
    resolved: bool,
}

impl Reservation {
    pub fn new_static(
        instance: InstanceUuid,
        network: Arc<Network>,
        ip: IpAddr,
    ) -> Reservation {
        Reservation {
            instance,
            network,
            kind: ReservationKind::Static,
            origin: ReservationOrigin::Desired,
            availability_zone: None,
            ip: Some(ip),
            resolved: false,
        }
    }

    pub fn new_dynamic(
        instance: InstanceUuid,
        network: Arc<Network>,
    ) -> Reservation {
        Reservation {
            instance,
            network,
            kind: ReservationKind::Dynamic,
            origin: ReservationOrigin::Desired,
            availability_zone: None,
            ip: None,
            resolved: false,
        }
    }

    pub fn in_az(mut self, az: Option<String>) -> Reservation {
        self.availability_zone = az;
        self
    }

    /// Pre-bind an address without resolving it (for dynamic reservations
    /// that want to keep the address the instance already had).
    pub fn with_address(mut self, ip: IpAddr) -> Reservation {
        self.ip = Some(ip);
        self
    }

    /// Recover a reservation from persisted network settings.  Its kind is
    /// re-classified against the current topology when registered with the
    /// IP provider.
    pub fn new_existing(
        instance: InstanceUuid,
        network: Arc<Network>,
        ip: IpAddr,
    ) -> Reservation {
        Reservation {
            instance,
            network,
            kind: ReservationKind::Dynamic,
            origin: ReservationOrigin::Existing,
            availability_zone: None,
            ip: Some(ip),
            resolved: false,
        }
    }

    pub fn network_name(&self) -> &str {
        self.network.name()
    }

    pub fn is_static(&self) -> bool {
        self.kind == ReservationKind::Static
    }

    pub fn resolved(&self) -> bool {
        self.resolved
    }

    pub(crate) fn resolve(&mut self, ip: IpAddr) {
        self.ip = Some(ip);
        self.resolved = true;
    }

    pub(crate) fn mark_resolved(&mut self) {
        self.resolved = true;
    }

    pub(crate) fn reclassify(&mut self, kind: ReservationKind) {
        self.kind = kind;
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ReservationKind::Static => "static",
            ReservationKind::Dynamic => "dynamic",
        };
        match self.ip {
            Some(ip) => write!(
                f,
                "{kind} reservation of {ip} on network '{}' for instance {}",
                self.network_name(),
                self.instance
            ),
            None => write!(
                f,
                "{kind} reservation on network '{}' for instance {}",
                self.network_name(),
                self.instance
            ),
        }
    }
}
