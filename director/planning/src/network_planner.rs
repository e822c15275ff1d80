// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pairs an instance's desired networks with its persisted reservations.
//!
//! Each attached network ends up with a plan marked *existing* (keep the
//! address), *desired* (bind a new one), or *obsolete* (release it).  The
//! set of non-existing plans is what the reconciliation engine calls a
//! network topology change.
//!
//! Reservations are resolved in manifest-declaration order, so static-IP
//! to subnet assignment is deterministic and reproducible across repeated
//! runs with unchanged input.

use crate::errors::PlanningError;
use flotilla_director_network::errors::AllocationError;
use flotilla_director_network::ip_provider::IpProvider;
use flotilla_director_network::network::Network;
use flotilla_director_network::reservation::Reservation;
use flotilla_director_types::instance::{DesiredInstance, InstanceGroup};
use flotilla_director_types::records::ExistingInstanceSnapshot;
use flotilla_director_types::spec::NetworkSetting;
use slog::{debug, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkPlanState {
    /// The persisted reservation still fits; keep it.
    Existing,
    /// A new binding this run must create.
    Desired,
    /// A persisted binding the desired state no longer wants.
    Obsolete,
}

#[derive(Clone, Debug)]
pub struct NetworkPlan {
    pub reservation: Reservation,
    pub state: NetworkPlanState,
}

impl NetworkPlan {
    pub fn is_existing(&self) -> bool {
        self.state == NetworkPlanState::Existing
    }

    pub fn is_desired(&self) -> bool {
        self.state == NetworkPlanState::Desired
    }

    pub fn is_obsolete(&self) -> bool {
        self.state == NetworkPlanState::Obsolete
    }
}

pub struct NetworkPlanner<'a> {
    pub networks: &'a BTreeMap<String, Arc<Network>>,
    pub log: &'a Logger,
}

impl NetworkPlanner<'_> {
    /// Reject a manifest that assigns the same static IP twice within one
    /// instance group, before any allocation is attempted.
    pub fn validate_group_static_ips(
        &self,
        group: &InstanceGroup,
    ) -> Result<(), AllocationError> {
        for attachment in &group.networks {
            let mut seen = BTreeSet::new();
            for ip in &attachment.static_ips {
                if !seen.insert(*ip) {
                    return Err(AllocationError::DuplicateStaticIp {
                        instance_group: group.name.clone(),
                        network: attachment.name.clone(),
                        ip: *ip,
                    });
                }
            }
        }
        Ok(())
    }

    /// Build and resolve the network plans for one desired instance.
    ///
    /// `existing_networks` is the instance's persisted settings blob (if
    /// any); its addresses are re-registered with the provider first so
    /// they cannot be handed to anyone else while the instance still
    /// holds them.
    pub fn plan_instance_networks(
        &self,
        provider: &mut IpProvider,
        desired: &DesiredInstance,
        existing_networks: Option<&BTreeMap<String, NetworkSetting>>,
    ) -> Result<Vec<NetworkPlan>, PlanningError> {
        let mut existing =
            self.register_existing(provider, desired, existing_networks)?;

        let az = desired.az_name();
        let mut plans = Vec::new();
        for attachment in &desired.group.networks {
            let network = self.networks.get(&attachment.name).ok_or_else(
                || PlanningError::UnknownNetwork {
                    instance_group: desired.group.name.clone(),
                    network: attachment.name.clone(),
                },
            )?;

            let requested_azs: Vec<&str> = az.into_iter().collect();
            if !network.has_azs(&requested_azs) {
                return Err(PlanningError::NetworkAzMismatch {
                    instance_group: desired.group.name.clone(),
                    network: attachment.name.clone(),
                    az: az.map(str::to_string),
                });
            }

            let want_static: Option<IpAddr> = if attachment.static_ips.is_empty()
            {
                None
            } else {
                match attachment.static_ips.get(desired.index as usize) {
                    Some(ip) => Some(*ip),
                    None => {
                        return Err(AllocationError::NotEnoughStaticIps {
                            instance_group: desired.group.name.clone(),
                            network: attachment.name.clone(),
                            required: desired.index as usize + 1,
                            available: attachment.static_ips.len(),
                        }
                        .into());
                    }
                }
            };

            match existing.remove(&attachment.name) {
                Some(kept)
                    if Self::still_fits(&kept, want_static) =>
                {
                    debug!(
                        self.log,
                        "keeping existing reservation";
                        "reservation" => %kept,
                    );
                    plans.push(NetworkPlan {
                        reservation: kept,
                        state: NetworkPlanState::Existing,
                    });
                }
                replaced => {
                    if let Some(old) = replaced {
                        plans.push(NetworkPlan {
                            reservation: old,
                            state: NetworkPlanState::Obsolete,
                        });
                    }
                    let mut reservation = match want_static {
                        Some(ip) => Reservation::new_static(
                            desired.uuid,
                            Arc::clone(network),
                            ip,
                        ),
                        None => Reservation::new_dynamic(
                            desired.uuid,
                            Arc::clone(network),
                        ),
                    }
                    .in_az(az.map(str::to_string));
                    provider.reserve(&mut reservation)?;
                    plans.push(NetworkPlan {
                        reservation,
                        state: NetworkPlanState::Desired,
                    });
                }
            }
        }

        // Whatever the desired side no longer mentions gets released.
        for (_, reservation) in existing {
            plans.push(NetworkPlan {
                reservation,
                state: NetworkPlanState::Obsolete,
            });
        }
        Ok(plans)
    }

    /// Network plans for an instance being scaled away: every persisted
    /// reservation is re-registered, then marked obsolete.
    pub fn plan_obsolete_instance(
        &self,
        provider: &mut IpProvider,
        snapshot: &ExistingInstanceSnapshot,
    ) -> Result<Vec<NetworkPlan>, PlanningError> {
        let existing = self.register_existing_from_snapshot(
            provider,
            snapshot,
        )?;
        Ok(existing
            .into_values()
            .map(|reservation| NetworkPlan {
                reservation,
                state: NetworkPlanState::Obsolete,
            })
            .collect())
    }

    /// Release every obsolete plan's address and drop those plans.
    pub fn release_obsolete_plans(
        &self,
        provider: &mut IpProvider,
        plans: &mut Vec<NetworkPlan>,
    ) -> Result<(), AllocationError> {
        for plan in plans.iter().filter(|plan| plan.is_obsolete()) {
            if plan.reservation.ip.is_some() {
                provider.release(&plan.reservation)?;
            }
        }
        plans.retain(|plan| !plan.is_obsolete());
        Ok(())
    }

    /// A kept reservation still fits when its static-ness matches what
    /// the manifest wants: same explicit IP for static attachments, a
    /// resolved dynamic-pool address otherwise.
    fn still_fits(kept: &Reservation, want_static: Option<IpAddr>) -> bool {
        if !kept.resolved() {
            return false;
        }
        match want_static {
            Some(ip) => kept.is_static() && kept.ip == Some(ip),
            None => !kept.is_static(),
        }
    }

    fn register_existing(
        &self,
        provider: &mut IpProvider,
        desired: &DesiredInstance,
        existing_networks: Option<&BTreeMap<String, NetworkSetting>>,
    ) -> Result<BTreeMap<String, Reservation>, PlanningError> {
        let Some(existing_networks) = existing_networks else {
            return Ok(BTreeMap::new());
        };
        self.recover_reservations(
            provider,
            desired.uuid,
            desired.az_name(),
            existing_networks,
        )
    }

    fn register_existing_from_snapshot(
        &self,
        provider: &mut IpProvider,
        snapshot: &ExistingInstanceSnapshot,
    ) -> Result<BTreeMap<String, Reservation>, PlanningError> {
        let Some(networks) =
            snapshot.record.spec.as_ref().and_then(|spec| spec.networks.as_ref())
        else {
            return Ok(BTreeMap::new());
        };
        self.recover_reservations(
            provider,
            snapshot.record.uuid,
            snapshot.record.availability_zone.as_deref(),
            networks,
        )
    }

    fn recover_reservations(
        &self,
        provider: &mut IpProvider,
        instance: flotilla_director_types::ids::InstanceUuid,
        az: Option<&str>,
        networks: &BTreeMap<String, NetworkSetting>,
    ) -> Result<BTreeMap<String, Reservation>, PlanningError> {
        let mut recovered = BTreeMap::new();
        for (name, setting) in networks {
            let Some(network) = self.networks.get(name) else {
                warn!(
                    self.log,
                    "persisted network no longer exists in topology";
                    "network" => %name,
                    "instance" => %instance,
                );
                continue;
            };
            let ip = setting.ip.as_deref().and_then(|s| s.parse().ok());
            let mut reservation = match ip {
                Some(ip) => Reservation::new_existing(
                    instance,
                    Arc::clone(network),
                    ip,
                ),
                // Dynamic networks may never have reported an address;
                // the reservation is address-less but still real.
                None if matches!(&**network, Network::Dynamic(_)) => {
                    Reservation::new_dynamic(instance, Arc::clone(network))
                }
                None => continue,
            }
            .in_az(az.map(str::to_string));
            provider.reserve_existing(&mut reservation)?;
            recovered.insert(name.clone(), reservation);
        }
        Ok(recovered)
    }
}
