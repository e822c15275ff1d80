// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network settings and preferred-address computation for one instance.
//!
//! Given the resolved reservations of an instance, this produces (a) the
//! structured settings blob the agent apply spec embeds, and (b) the
//! single preferred address for the instance or for a consumed link.
//! Which shape the address takes (raw IP, standard DNS record, or
//! encoded short query) depends only on the network kind and the
//! explicit [`AddressingPolicy`], never on ambient state.

use crate::dns::{dns_record_name, DnsEncoder, InstanceQuery};
use crate::errors::TopologyError;
use crate::network::Network;
use crate::reservation::Reservation;
use flotilla_director_types::instance::NetworkConcern;
use flotilla_director_types::link::LinkDefinition;
use flotilla_director_types::spec::NetworkSetting;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Deployment-wide addressing switches, threaded explicitly into every
/// component that derives an address.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AddressingPolicy {
    /// Are per-instance DNS records actually served?  Without them a
    /// manual network has no addressable record and must fall back to raw
    /// IPs even when DNS is preferred.
    pub local_dns_enabled: bool,
    /// Prefer DNS names over raw IPs for instance addresses.
    pub use_dns_addresses: bool,
    /// Emit compact encoded queries instead of standard record names.
    pub use_short_dns_addresses: bool,
    /// Emit link-scoped queries for addresses handed to link consumers.
    pub use_link_dns_names: bool,
    pub root_domain: String,
}

impl Default for AddressingPolicy {
    fn default() -> Self {
        AddressingPolicy {
            local_dns_enabled: false,
            use_dns_addresses: false,
            use_short_dns_addresses: false,
            use_link_dns_names: false,
            root_domain: "bosh".to_string(),
        }
    }
}

/// Address derivation for one instance's resolved reservations.
pub struct NetworkSettings<'a> {
    pub instance_group_name: &'a str,
    pub deployment_name: &'a str,
    /// The group's concern -> network-name elections.
    pub default_network: &'a BTreeMap<NetworkConcern, String>,
    /// Non-obsolete reservations, in manifest declaration order.
    pub reservations: &'a [Reservation],
    /// The agent's last-reported per-network state, for dynamic networks.
    pub current_networks: &'a BTreeMap<String, NetworkSetting>,
    pub availability_zone: Option<&'a str>,
    pub instance_index: u32,
    pub instance_uuid: &'a str,
    pub policy: &'a AddressingPolicy,
    pub encoder: &'a dyn DnsEncoder,
}

impl<'a> NetworkSettings<'a> {
    /// The structured settings blob consumed by the agent apply spec.
    pub fn to_hash(
        &self,
    ) -> Result<BTreeMap<String, NetworkSetting>, TopologyError> {
        let mut settings = BTreeMap::new();
        for reservation in self.reservations {
            let name = reservation.network_name();
            let concerns = self.concerns_for(name);
            let setting = reservation.network.network_settings(
                reservation,
                Some(&concerns),
                self.availability_zone,
                self.current_networks.get(name),
            )?;
            settings.insert(name.to_string(), setting);
        }
        Ok(settings)
    }

    /// Like [`Self::to_hash`], with the derived `dns_record_name` filled
    /// in per network; used by the template spec the renderer sees.
    pub fn to_hash_with_dns_record_names(
        &self,
    ) -> Result<BTreeMap<String, NetworkSetting>, TopologyError> {
        let mut settings = self.to_hash()?;
        for (name, setting) in settings.iter_mut() {
            setting.dns_record_name = Some(dns_record_name(
                &self.instance_index.to_string(),
                self.instance_group_name,
                name,
                self.deployment_name,
                &self.policy.root_domain,
            ));
        }
        Ok(settings)
    }

    /// The single preferred address of the instance.
    pub fn network_address(
        &self,
        prefer_dns_entry: bool,
    ) -> Result<String, TopologyError> {
        let network_name = self.address_network_name()?;
        let reservation = self.reservation_for(network_name)?;
        self.address_for(reservation, prefer_dns_entry, |name| {
            self.instance_dns_name(name)
        })
    }

    /// Preferred address per attached network.
    pub fn network_addresses(
        &self,
        prefer_dns_entry: bool,
    ) -> Result<BTreeMap<String, String>, TopologyError> {
        let mut addresses = BTreeMap::new();
        for reservation in self.reservations {
            let name = reservation.network_name();
            let address =
                self.address_for(reservation, prefer_dns_entry, |name| {
                    self.instance_dns_name(name)
                })?;
            addresses.insert(name.to_string(), address);
        }
        Ok(addresses)
    }

    /// The preferred address to hand to a consumer of `link`.  Identical
    /// decision tree to [`Self::network_address`], except that a DNS
    /// answer is a query scoped to the link rather than to this instance.
    pub fn link_network_address(
        &self,
        link: &LinkDefinition,
        prefer_dns_entry: bool,
    ) -> Result<String, TopologyError> {
        let network_name = self.address_network_name()?;
        let reservation = self.reservation_for(network_name)?;
        self.address_for(reservation, prefer_dns_entry, |name| {
            self.link_dns_name(link, name)
        })
    }

    /// Link-scoped preferred address per attached network.
    pub fn link_network_addresses(
        &self,
        link: &LinkDefinition,
        prefer_dns_entry: bool,
    ) -> Result<BTreeMap<String, String>, TopologyError> {
        let mut addresses = BTreeMap::new();
        for reservation in self.reservations {
            let name = reservation.network_name();
            let address =
                self.address_for(reservation, prefer_dns_entry, |name| {
                    self.link_dns_name(link, name)
                })?;
            addresses.insert(name.to_string(), address);
        }
        Ok(addresses)
    }

    /// Every DNS name that should resolve to this instance, with the
    /// address it should resolve to: the numeric-index record and the
    /// UUID record, per network with a known address.  Used to populate
    /// the DNS record store.
    pub fn dns_record_info(
        &self,
    ) -> Result<BTreeMap<String, String>, TopologyError> {
        let mut records = BTreeMap::new();
        for (name, setting) in self.to_hash()? {
            let Some(ip) = setting.ip else { continue };
            for hostname in
                [self.instance_index.to_string(), self.instance_uuid.to_string()]
            {
                records.insert(
                    dns_record_name(
                        &hostname,
                        self.instance_group_name,
                        &name,
                        self.deployment_name,
                        &self.policy.root_domain,
                    ),
                    ip.clone(),
                );
            }
        }
        Ok(records)
    }

    /// The network instance-level addresses are drawn from: the
    /// `addressable` override if declared, the gateway default otherwise.
    pub fn address_network_name(&self) -> Result<&'a str, TopologyError> {
        self.default_network
            .get(&NetworkConcern::Addressable)
            .or_else(|| self.default_network.get(&NetworkConcern::Gateway))
            .map(String::as_str)
            .ok_or_else(|| TopologyError::NoDefaultNetwork {
                instance_group: self.instance_group_name.to_string(),
            })
    }

    fn reservation_for(
        &self,
        network_name: &str,
    ) -> Result<&Reservation, TopologyError> {
        self.reservations
            .iter()
            .find(|reservation| reservation.network_name() == network_name)
            .ok_or_else(|| TopologyError::NoReservationForNetwork {
                network: network_name.to_string(),
            })
    }

    fn concerns_for(&self, network_name: &str) -> Vec<NetworkConcern> {
        self.default_network
            .iter()
            .filter(|(_, name)| name.as_str() == network_name)
            .map(|(concern, _)| *concern)
            .collect()
    }

    fn address_for(
        &self,
        reservation: &Reservation,
        prefer_dns_entry: bool,
        dns_name: impl Fn(&str) -> String,
    ) -> Result<String, TopologyError> {
        let network_name = reservation.network_name();
        match &*reservation.network {
            // The director never knows a dynamic address; the DNS name is
            // the only stable handle.
            Network::Dynamic(_) => Ok(dns_name(network_name)),
            Network::Manual(_) | Network::Vip(_) => {
                if prefer_dns_entry && self.policy.local_dns_enabled {
                    return Ok(dns_name(network_name));
                }
                reservation
                    .ip
                    .map(|ip| ip.to_string())
                    .ok_or_else(|| TopologyError::UnresolvedReservation {
                        network: network_name.to_string(),
                    })
            }
        }
    }

    fn instance_dns_name(&self, network_name: &str) -> String {
        if self.policy.use_short_dns_addresses {
            self.encoder.encode_instance_query(&self.query(network_name))
        } else {
            dns_record_name(
                self.instance_uuid,
                self.instance_group_name,
                network_name,
                self.deployment_name,
                &self.policy.root_domain,
            )
        }
    }

    fn link_dns_name(
        &self,
        link: &LinkDefinition,
        network_name: &str,
    ) -> String {
        self.encoder.encode_link_query(link, &self.query(network_name))
    }

    fn query<'q>(&'q self, network_name: &'q str) -> InstanceQuery<'q> {
        InstanceQuery {
            instance_uuid: self.instance_uuid,
            instance_group: self.instance_group_name,
            deployment: self.deployment_name,
            network: network_name,
            root_domain: &self.policy.root_domain,
        }
    }
}
