// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subnets: the address-bearing pieces of a network.
//!
//! Manual subnets carry a concrete address range plus static and reserved
//! pools; dynamic subnets are range-less (the IaaS assigns addresses) and
//! exist to carry DNS, cloud properties, and AZ affinity; VIP subnets are
//! bare pools of floating addresses.

use crate::errors::{GatewayProblem, TopologyError};
use flotilla_common::address::{ip_from_u128, ip_to_u128, IpRange};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Options that apply to every subnet parsed in a run.
#[derive(Clone, Debug, Default)]
pub struct NetworkParseOptions {
    /// The director's own addresses, excluded from allocation everywhere.
    pub director_ips: Vec<IpAddr>,
    /// Accept manual subnets without a gateway (some IaaSes route without
    /// one).
    pub ignore_missing_gateway: bool,
}

/// Manifest shape of a manual subnet, as deserialized upstream.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualSubnetConfig {
    /// Required for managed subnets only.
    pub name: Option<String>,
    pub range: Option<String>,
    pub gateway: Option<String>,
    /// Managed subnets may ask for a range of this width to be carved out
    /// instead of declaring one.
    pub netmask_bits: Option<u8>,
    pub dns: Option<Vec<IpAddr>>,
    #[serde(default)]
    pub reserved: Vec<String>,
    #[serde(default, rename = "static")]
    pub static_ips: Vec<String>,
    pub az: Option<String>,
    #[serde(default)]
    pub azs: Vec<String>,
    pub cloud_properties: Option<Value>,
}

/// Manifest shape of a dynamic subnet.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicSubnetConfig {
    pub dns: Option<Vec<IpAddr>>,
    pub az: Option<String>,
    #[serde(default)]
    pub azs: Vec<String>,
    pub cloud_properties: Option<Value>,
}

/// Manifest shape of a VIP subnet.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VipSubnetConfig {
    #[serde(default, rename = "static")]
    pub static_ips: Vec<String>,
}

/// A parsed, validated manual subnet.
#[derive(Clone, Debug, PartialEq)]
pub struct ManualSubnet {
    pub network_name: String,
    pub name: Option<String>,
    /// `None` only for managed subnets declared via `netmask_bits`.
    pub cidr: Option<IpNetwork>,
    pub range: Option<IpRange>,
    pub netmask: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub dns: Option<Vec<IpAddr>>,
    pub availability_zone_names: Vec<String>,
    /// Addresses never handed out: manifest `reserved` entries plus the
    /// network id, broadcast, gateway, and director addresses.
    pub restricted: Vec<IpRange>,
    pub static_pool: BTreeSet<IpAddr>,
    pub cloud_properties: Value,
    pub netmask_bits: Option<u8>,
}

fn netmask_from_prefix(prefix: u8, v6: bool) -> IpAddr {
    let bits: u32 = if v6 { 128 } else { 32 };
    let host_bits = bits - u32::from(prefix);
    let mask = if host_bits >= 128 {
        0
    } else {
        u128::MAX << host_bits
    };
    let mask = if v6 { mask } else { mask & u128::from(u32::MAX) };
    ip_from_u128(mask, v6).expect("netmask fits its family")
}

/// First and last address of a CIDR block, inclusive.
fn cidr_bounds(net: &IpNetwork) -> (IpAddr, IpAddr) {
    let v6 = net.ip().is_ipv6();
    let bits: u32 = if v6 { 128 } else { 32 };
    let host_bits = bits - u32::from(net.prefix());
    let host_mask: u128 = if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    let base = ip_to_u128(net.ip()) & !host_mask;
    let first = ip_from_u128(base, v6).expect("network id fits its family");
    let last =
        ip_from_u128(base | host_mask, v6).expect("broadcast fits its family");
    (first, last)
}

fn parse_az_names(
    network_name: &str,
    az: &Option<String>,
    azs: &[String],
    known_azs: &[flotilla_director_types::instance::AvailabilityZone],
) -> Result<Vec<String>, TopologyError> {
    if az.is_some() && !azs.is_empty() {
        return Err(TopologyError::InvalidField {
            network: network_name.to_string(),
            field: "az".to_string(),
            expected: "either 'az' or 'azs', not both".to_string(),
        });
    }
    let names: Vec<String> = match az {
        Some(name) => vec![name.clone()],
        None => azs.to_vec(),
    };
    for name in &names {
        if !known_azs.iter().any(|known| &known.name == name) {
            return Err(TopologyError::UnknownAvailabilityZone {
                network: network_name.to_string(),
                zone: name.clone(),
            });
        }
    }
    Ok(names)
}

fn parse_cloud_properties(
    network_name: &str,
    raw: &Option<Value>,
) -> Result<Value, TopologyError> {
    match raw {
        None => Ok(Value::Object(serde_json::Map::new())),
        Some(value) if value.is_object() => Ok(value.clone()),
        Some(_) => Err(TopologyError::InvalidField {
            network: network_name.to_string(),
            field: "cloud_properties".to_string(),
            expected: "a hash".to_string(),
        }),
    }
}

impl ManualSubnet {
    pub fn parse(
        network_name: &str,
        config: &ManualSubnetConfig,
        known_azs: &[flotilla_director_types::instance::AvailabilityZone],
        managed: bool,
        options: &NetworkParseOptions,
    ) -> Result<ManualSubnet, TopologyError> {
        let missing = |field: &str| TopologyError::MissingField {
            network: network_name.to_string(),
            field: field.to_string(),
        };

        if managed && config.name.is_none() {
            return Err(missing("name"));
        }

        let cidr = match &config.range {
            Some(range) => Some(range.parse::<IpNetwork>().map_err(|_| {
                TopologyError::InvalidRange {
                    network: network_name.to_string(),
                    range: range.clone(),
                }
            })?),
            None if managed && config.netmask_bits.is_some() => None,
            None => return Err(missing("range")),
        };
        let range = cidr.as_ref().map(|net| {
            let (first, last) = cidr_bounds(net);
            IpRange::new(first, last).expect("CIDR bounds are ordered")
        });
        let netmask = cidr
            .as_ref()
            .map(|net| netmask_from_prefix(net.prefix(), net.ip().is_ipv6()));

        let gateway = match (&config.gateway, &range) {
            (Some(raw), Some(range)) => {
                Some(Self::parse_gateway(network_name, raw, range)?)
            }
            (Some(raw), None) => {
                // Managed subnet without a range yet; just require a plain
                // address.
                Some(raw.parse().map_err(|_| TopologyError::InvalidGateway {
                    network: network_name.to_string(),
                    problem: GatewayProblem::NotASingleIp,
                })?)
            }
            (None, Some(_)) if !options.ignore_missing_gateway => {
                return Err(missing("gateway"));
            }
            (None, _) => None,
        };

        let mut restricted: Vec<IpRange> = Vec::new();
        if let Some(range) = &range {
            // The network id and (IPv4) broadcast address are never
            // reservable, nor is the gateway.
            restricted.push(IpRange::single(range.first()));
            if !range.is_ipv6() {
                restricted.push(IpRange::single(range.last()));
            }
            if let Some(gateway) = gateway {
                restricted.push(IpRange::single(gateway));
            }
        }
        for ip in &options.director_ips {
            restricted.push(IpRange::single(*ip));
        }
        for entry in &config.reserved {
            let reserved: IpRange = entry.parse().map_err(|_| {
                TopologyError::InvalidField {
                    network: network_name.to_string(),
                    field: "reserved".to_string(),
                    expected: "an IP or an IP range".to_string(),
                }
            })?;
            if let Some(range) = &range {
                for boundary in [reserved.first(), reserved.last()] {
                    if !range.contains(boundary) {
                        return Err(TopologyError::ReservedIpOutOfRange {
                            network: network_name.to_string(),
                            ip: boundary.to_string(),
                        });
                    }
                }
            }
            restricted.push(reserved);
        }

        let mut static_pool = BTreeSet::new();
        for entry in &config.static_ips {
            let statics: IpRange = entry.parse().map_err(|_| {
                TopologyError::InvalidField {
                    network: network_name.to_string(),
                    field: "static".to_string(),
                    expected: "an IP or an IP range".to_string(),
                }
            })?;
            for ip in statics.iter() {
                if range.as_ref().map_or(true, |range| !range.contains(ip)) {
                    return Err(TopologyError::StaticIpOutOfRange {
                        network: network_name.to_string(),
                        ip: ip.to_string(),
                    });
                }
                if restricted.iter().any(|r| r.contains(ip)) {
                    return Err(TopologyError::StaticIpInReservedRange {
                        network: network_name.to_string(),
                        ip: ip.to_string(),
                    });
                }
                static_pool.insert(ip);
            }
        }

        Ok(ManualSubnet {
            network_name: network_name.to_string(),
            name: config.name.clone(),
            cidr,
            range,
            netmask,
            gateway,
            dns: config.dns.clone(),
            availability_zone_names: parse_az_names(
                network_name,
                &config.az,
                &config.azs,
                known_azs,
            )?,
            restricted,
            static_pool,
            cloud_properties: parse_cloud_properties(
                network_name,
                &config.cloud_properties,
            )?,
            netmask_bits: config.netmask_bits,
        })
    }

    fn parse_gateway(
        network_name: &str,
        raw: &str,
        range: &IpRange,
    ) -> Result<IpAddr, TopologyError> {
        let problem = |problem| TopologyError::InvalidGateway {
            network: network_name.to_string(),
            problem,
        };
        let gateway: IpAddr = raw
            .parse()
            .map_err(|_| problem(GatewayProblem::NotASingleIp))?;
        if !range.contains(gateway) {
            return Err(problem(GatewayProblem::OutsideRange));
        }
        if gateway == range.first() {
            return Err(problem(GatewayProblem::IsNetworkId));
        }
        if !range.is_ipv6() && gateway == range.last() {
            return Err(problem(GatewayProblem::IsBroadcast));
        }
        Ok(gateway)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.range.as_ref().is_some_and(|range| range.contains(ip))
    }

    pub fn is_restricted(&self, ip: IpAddr) -> bool {
        self.restricted.iter().any(|range| range.contains(ip))
    }

    /// Could any reservation (static or dynamic) bind this address here?
    pub fn is_reservable(&self, ip: IpAddr) -> bool {
        self.contains(ip) && !self.is_restricted(ip)
    }

    pub fn in_static_pool(&self, ip: IpAddr) -> bool {
        self.static_pool.contains(&ip)
    }

    pub fn overlaps(&self, other: &ManualSubnet) -> bool {
        match (&self.range, &other.range) {
            (Some(a), Some(b)) => a.overlaps(b),
            _ => false,
        }
    }

    pub fn declares_azs(&self) -> bool {
        !self.availability_zone_names.is_empty()
    }

    pub fn matches_az(&self, az: Option<&str>) -> bool {
        match az {
            None => true,
            Some(az) => {
                self.availability_zone_names.iter().any(|name| name == az)
            }
        }
    }
}

/// A parsed dynamic subnet.
#[derive(Clone, Debug)]
pub struct DynamicSubnet {
    pub dns: Option<Vec<IpAddr>>,
    pub availability_zone_names: Vec<String>,
    pub cloud_properties: Value,
}

impl DynamicSubnet {
    pub fn parse(
        network_name: &str,
        config: &DynamicSubnetConfig,
        known_azs: &[flotilla_director_types::instance::AvailabilityZone],
    ) -> Result<DynamicSubnet, TopologyError> {
        Ok(DynamicSubnet {
            dns: config.dns.clone(),
            availability_zone_names: parse_az_names(
                network_name,
                &config.az,
                &config.azs,
                known_azs,
            )?,
            cloud_properties: parse_cloud_properties(
                network_name,
                &config.cloud_properties,
            )?,
        })
    }

    pub fn declares_azs(&self) -> bool {
        !self.availability_zone_names.is_empty()
    }

    pub fn matches_az(&self, az: Option<&str>) -> bool {
        match az {
            None => true,
            Some(az) => {
                self.availability_zone_names.iter().any(|name| name == az)
            }
        }
    }
}

/// A parsed VIP subnet: a pool of floating addresses.
#[derive(Clone, Debug)]
pub struct VipSubnet {
    pub static_ips: Vec<IpAddr>,
}

impl VipSubnet {
    pub fn parse(
        network_name: &str,
        config: &VipSubnetConfig,
    ) -> Result<VipSubnet, TopologyError> {
        let mut static_ips = Vec::new();
        for entry in &config.static_ips {
            let range: IpRange = entry.parse().map_err(|_| {
                TopologyError::InvalidField {
                    network: network_name.to_string(),
                    field: "static".to_string(),
                    expected: "an IP or an IP range".to_string(),
                }
            })?;
            static_ips.extend(range.iter());
        }
        Ok(VipSubnet { static_ips })
    }
}
