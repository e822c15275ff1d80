// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The network model: manual, dynamic, and VIP networks.
//!
//! The three kinds are a closed union.  Every consumer matches
//! exhaustively, so a fourth network kind is a compile-time-visible
//! change, not a runtime surprise.

use crate::errors::TopologyError;
use crate::reservation::Reservation;
use crate::subnet::{
    DynamicSubnet, DynamicSubnetConfig, ManualSubnet, ManualSubnetConfig,
    NetworkParseOptions, VipSubnet, VipSubnetConfig,
};
use flotilla_director_types::instance::{AvailabilityZone, NetworkConcern};
use flotilla_director_types::spec::{NetworkSetting, NetworkSettingKind};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkKind {
    Manual,
    Dynamic,
    Vip,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkKind::Manual => "manual",
            NetworkKind::Dynamic => "dynamic",
            NetworkKind::Vip => "vip",
        };
        f.write_str(s)
    }
}

/// Manifest shape of a network, dispatched on its `type` field.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkConfig {
    Manual(ManualNetworkConfig),
    Dynamic(DynamicNetworkConfig),
    Vip(VipNetworkConfig),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManualNetworkConfig {
    #[serde(default)]
    pub name: String,
    /// Network-wide DNS servers; subnets may override.
    pub dns: Option<Vec<IpAddr>>,
    #[serde(default)]
    pub subnets: Vec<ManualSubnetConfig>,
    /// Managed networks get per-deployment subnet lifecycle; unmanaged
    /// networks have a fixed, manually curated subnet set.
    #[serde(default)]
    pub managed: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DynamicNetworkConfig {
    #[serde(default)]
    pub name: String,
    pub dns: Option<Vec<IpAddr>>,
    pub cloud_properties: Option<Value>,
    #[serde(default)]
    pub subnets: Vec<DynamicSubnetConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VipNetworkConfig {
    #[serde(default)]
    pub name: String,
    pub cloud_properties: Option<Value>,
    #[serde(default)]
    pub subnets: Vec<VipSubnetConfig>,
}

#[derive(Clone, Debug)]
pub struct ManualNetwork {
    pub name: String,
    pub dns: Option<Vec<IpAddr>>,
    pub subnets: Vec<ManualSubnet>,
    pub managed: bool,
}

impl ManualNetwork {
    pub fn subnet_for_ip(&self, ip: IpAddr) -> Option<&ManualSubnet> {
        self.subnets.iter().find(|subnet| subnet.contains(ip))
    }
}

#[derive(Clone, Debug)]
pub struct DynamicNetwork {
    pub name: String,
    pub subnets: Vec<DynamicSubnet>,
}

impl DynamicNetwork {
    /// The subnet whose settings an instance in `az` should carry: AZ
    /// affinity first, then declaration order.
    pub fn subnet_for_az(&self, az: Option<&str>) -> Option<&DynamicSubnet> {
        match az {
            Some(az) => self
                .subnets
                .iter()
                .find(|subnet| {
                    subnet.availability_zone_names.iter().any(|n| n == az)
                })
                .or_else(|| self.subnets.first()),
            None => self.subnets.first(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VipNetwork {
    pub name: String,
    pub cloud_properties: Value,
    pub subnets: Vec<VipSubnet>,
}

/// A parsed, validated network.
#[derive(Clone, Debug)]
pub enum Network {
    Manual(ManualNetwork),
    Dynamic(DynamicNetwork),
    Vip(VipNetwork),
}

impl Network {
    pub fn parse(
        config: &NetworkConfig,
        known_azs: &[AvailabilityZone],
        options: &NetworkParseOptions,
    ) -> Result<Network, TopologyError> {
        match config {
            NetworkConfig::Manual(config) => {
                Self::parse_manual(config, known_azs, options)
            }
            NetworkConfig::Dynamic(config) => {
                Self::parse_dynamic(config, known_azs)
            }
            NetworkConfig::Vip(config) => Self::parse_vip(config),
        }
    }

    fn require_name(name: &str) -> Result<(), TopologyError> {
        if name.is_empty() {
            return Err(TopologyError::MissingField {
                network: "<unnamed>".to_string(),
                field: "name".to_string(),
            });
        }
        Ok(())
    }

    fn parse_manual(
        config: &ManualNetworkConfig,
        known_azs: &[AvailabilityZone],
        options: &NetworkParseOptions,
    ) -> Result<Network, TopologyError> {
        Self::require_name(&config.name)?;
        let subnets = config
            .subnets
            .iter()
            .map(|subnet| {
                ManualSubnet::parse(
                    &config.name,
                    subnet,
                    known_azs,
                    config.managed,
                    options,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Enumerate every conflicting pair, not just the first.
        let mut conflicts = Vec::new();
        for (i, a) in subnets.iter().enumerate() {
            for b in &subnets[i + 1..] {
                if a.overlaps(b) {
                    let describe = |s: &ManualSubnet| {
                        s.cidr
                            .map(|cidr| cidr.to_string())
                            .unwrap_or_else(|| "<no range>".to_string())
                    };
                    conflicts.push((describe(a), describe(b)));
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(TopologyError::OverlappingSubnets {
                network: config.name.clone(),
                conflicts,
            });
        }

        Self::check_az_consistency(
            &config.name,
            subnets.iter().map(|s| s.declares_azs()),
        )?;

        Ok(Network::Manual(ManualNetwork {
            name: config.name.clone(),
            dns: config.dns.clone(),
            subnets,
            managed: config.managed,
        }))
    }

    fn parse_dynamic(
        config: &DynamicNetworkConfig,
        known_azs: &[AvailabilityZone],
    ) -> Result<Network, TopologyError> {
        Self::require_name(&config.name)?;
        // A dynamic network may be declared flat, without subnets; that is
        // one subnet carrying the network-level dns and cloud properties.
        let subnet_configs = if config.subnets.is_empty() {
            vec![DynamicSubnetConfig {
                dns: config.dns.clone(),
                cloud_properties: config.cloud_properties.clone(),
                ..Default::default()
            }]
        } else {
            config.subnets.clone()
        };
        let subnets = subnet_configs
            .iter()
            .map(|subnet| DynamicSubnet::parse(&config.name, subnet, known_azs))
            .collect::<Result<Vec<_>, _>>()?;

        Self::check_az_consistency(
            &config.name,
            subnets.iter().map(|s| s.declares_azs()),
        )?;

        Ok(Network::Dynamic(DynamicNetwork {
            name: config.name.clone(),
            subnets,
        }))
    }

    fn parse_vip(config: &VipNetworkConfig) -> Result<Network, TopologyError> {
        Self::require_name(&config.name)?;
        let subnets = config
            .subnets
            .iter()
            .map(|subnet| VipSubnet::parse(&config.name, subnet))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Network::Vip(VipNetwork {
            name: config.name.clone(),
            cloud_properties: config
                .cloud_properties
                .clone()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            subnets,
        }))
    }

    /// Within one network, either all subnets declare an availability zone
    /// or none do.
    fn check_az_consistency(
        network: &str,
        mut declares: impl Iterator<Item = bool>,
    ) -> Result<(), TopologyError> {
        let Some(first) = declares.next() else {
            return Ok(());
        };
        if declares.any(|declared| declared != first) {
            return Err(TopologyError::MixedAvailabilityZones {
                network: network.to_string(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        match self {
            Network::Manual(net) => &net.name,
            Network::Dynamic(net) => &net.name,
            Network::Vip(net) => &net.name,
        }
    }

    pub fn kind(&self) -> NetworkKind {
        match self {
            Network::Manual(_) => NetworkKind::Manual,
            Network::Dynamic(_) => NetworkKind::Dynamic,
            Network::Vip(_) => NetworkKind::Vip,
        }
    }

    /// Does this network offer every requested availability zone?
    ///
    /// A network with zero AZ-bearing subnets accepts only an empty
    /// request; VIP networks place no constraint on zones.
    pub fn has_azs(&self, requested: &[&str]) -> bool {
        let offered: BTreeSet<&str> = match self {
            Network::Vip(_) => return true,
            Network::Manual(net) => net
                .subnets
                .iter()
                .flat_map(|s| s.availability_zone_names.iter())
                .map(String::as_str)
                .collect(),
            Network::Dynamic(net) => net
                .subnets
                .iter()
                .flat_map(|s| s.availability_zone_names.iter())
                .map(String::as_str)
                .collect(),
        };
        if offered.is_empty() {
            return requested.is_empty();
        }
        requested.iter().all(|az| offered.contains(az))
    }

    /// The settings entry an instance should carry for a reservation on
    /// this network.
    ///
    /// `default_for` lists the concerns this network is the instance
    /// group's default for; `None` means "the standard defaults", which
    /// VIP networks refuse to compute.  `current` is the agent's
    /// last-reported state for this network, merged into dynamic settings
    /// (the director does not know dynamic addresses itself).
    pub fn network_settings(
        &self,
        reservation: &Reservation,
        default_for: Option<&[NetworkConcern]>,
        availability_zone: Option<&str>,
        current: Option<&NetworkSetting>,
    ) -> Result<NetworkSetting, TopologyError> {
        let default = match default_for {
            Some(concerns) => concerns.to_vec(),
            None => match self {
                Network::Vip(net) => {
                    return Err(TopologyError::VipDefaultsUnsupported {
                        network: net.name.clone(),
                    });
                }
                _ => vec![NetworkConcern::Dns, NetworkConcern::Gateway],
            },
        };
        let default = {
            let mut names: Vec<String> =
                default.iter().map(|c| c.to_string()).collect();
            names.sort();
            names.dedup();
            if names.is_empty() { None } else { Some(names) }
        };

        match self {
            Network::Manual(net) => {
                let ip = reservation.ip.ok_or_else(|| {
                    TopologyError::UnresolvedReservation {
                        network: net.name.clone(),
                    }
                })?;
                let subnet = net.subnet_for_ip(ip).ok_or(
                    TopologyError::IpOutsideSubnets {
                        network: net.name.clone(),
                        ip,
                    },
                )?;
                let dns = subnet.dns.as_ref().or(net.dns.as_ref());
                Ok(NetworkSetting {
                    kind: NetworkSettingKind::Manual,
                    ip: Some(ip.to_string()),
                    netmask: subnet.netmask.map(|mask| mask.to_string()),
                    gateway: subnet.gateway.map(|gw| gw.to_string()),
                    dns: dns.map(|servers| {
                        servers.iter().map(|ip| ip.to_string()).collect()
                    }),
                    default,
                    cloud_properties: subnet.cloud_properties.clone(),
                    dns_record_name: None,
                })
            }
            Network::Dynamic(net) => {
                let subnet = net.subnet_for_az(availability_zone);
                let mut setting = NetworkSetting {
                    kind: NetworkSettingKind::Dynamic,
                    ip: None,
                    netmask: None,
                    gateway: None,
                    dns: subnet.and_then(|s| s.dns.as_ref()).map(|servers| {
                        servers.iter().map(|ip| ip.to_string()).collect()
                    }),
                    default,
                    cloud_properties: subnet
                        .map(|s| s.cloud_properties.clone())
                        .unwrap_or_else(|| {
                            Value::Object(serde_json::Map::new())
                        }),
                    dns_record_name: None,
                };
                // The agent knows its dynamic address; the director does
                // not.  Carry the agent's view forward.
                if let Some(current) = current {
                    setting.ip.clone_from(&current.ip);
                    setting.netmask.clone_from(&current.netmask);
                    setting.gateway.clone_from(&current.gateway);
                }
                Ok(setting)
            }
            Network::Vip(net) => {
                let ip = reservation.ip.ok_or_else(|| {
                    TopologyError::UnresolvedReservation {
                        network: net.name.clone(),
                    }
                })?;
                Ok(NetworkSetting {
                    kind: NetworkSettingKind::Vip,
                    ip: Some(ip.to_string()),
                    netmask: None,
                    gateway: None,
                    dns: None,
                    default,
                    cloud_properties: net.cloud_properties.clone(),
                    dns_record_name: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reservation::Reservation;
    use flotilla_director_types::ids::InstanceUuid;
    use serde_json::json;
    use std::sync::Arc;

    fn azs() -> Vec<AvailabilityZone> {
        vec![
            AvailabilityZone::new("az-1", json!({})),
            AvailabilityZone::new("az-2", json!({})),
        ]
    }

    fn manual_network_config(name: &str) -> NetworkConfig {
        NetworkConfig::Manual(ManualNetworkConfig {
            name: name.to_string(),
            dns: None,
            subnets: vec![ManualSubnetConfig {
                range: Some("192.168.1.0/24".to_string()),
                gateway: Some("192.168.1.1".to_string()),
                dns: Some(vec!["192.168.1.1".parse().unwrap()]),
                cloud_properties: Some(json!({"foo": "bar"})),
                ..Default::default()
            }],
            managed: false,
        })
    }

    fn parse(config: &NetworkConfig) -> Result<Network, TopologyError> {
        Network::parse(config, &azs(), &NetworkParseOptions::default())
    }

    #[test]
    fn test_name_is_required() {
        let config = NetworkConfig::Manual(ManualNetworkConfig::default());
        assert!(matches!(
            parse(&config),
            Err(TopologyError::MissingField { field, .. }) if field == "name"
        ));
    }

    #[test]
    fn test_overlapping_subnets_enumerate_conflicts() {
        let subnet = |range: &str, gateway: &str| ManualSubnetConfig {
            range: Some(range.to_string()),
            gateway: Some(gateway.to_string()),
            ..Default::default()
        };
        let config = NetworkConfig::Manual(ManualNetworkConfig {
            name: "net_a".to_string(),
            dns: None,
            subnets: vec![
                subnet("192.168.0.0/23", "192.168.0.1"),
                subnet("192.168.1.0/24", "192.168.1.1"),
                subnet("192.168.0.0/24", "192.168.0.2"),
            ],
            managed: false,
        });
        match parse(&config) {
            Err(TopologyError::OverlappingSubnets { network, conflicts }) => {
                assert_eq!(network, "net_a");
                // /23 overlaps both /24s, and nothing else conflicts.
                assert_eq!(
                    conflicts,
                    vec![
                        (
                            "192.168.0.0/23".to_string(),
                            "192.168.1.0/24".to_string()
                        ),
                        (
                            "192.168.0.0/23".to_string(),
                            "192.168.0.0/24".to_string()
                        ),
                    ]
                );
            }
            other => panic!("expected overlap error, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_az_declarations_are_rejected() {
        let config = NetworkConfig::Manual(ManualNetworkConfig {
            name: "net_a".to_string(),
            dns: None,
            subnets: vec![
                ManualSubnetConfig {
                    range: Some("192.168.1.0/24".to_string()),
                    gateway: Some("192.168.1.1".to_string()),
                    az: Some("az-1".to_string()),
                    ..Default::default()
                },
                ManualSubnetConfig {
                    range: Some("192.168.2.0/24".to_string()),
                    gateway: Some("192.168.2.1".to_string()),
                    ..Default::default()
                },
            ],
            managed: false,
        });
        assert!(matches!(
            parse(&config),
            Err(TopologyError::MixedAvailabilityZones { network }) if network == "net_a"
        ));
    }

    #[test]
    fn test_has_azs() {
        let config = NetworkConfig::Manual(ManualNetworkConfig {
            name: "net_a".to_string(),
            dns: None,
            subnets: vec![
                ManualSubnetConfig {
                    range: Some("192.168.1.0/24".to_string()),
                    gateway: Some("192.168.1.1".to_string()),
                    az: Some("az-1".to_string()),
                    ..Default::default()
                },
                ManualSubnetConfig {
                    range: Some("192.168.2.0/24".to_string()),
                    gateway: Some("192.168.2.1".to_string()),
                    azs: vec!["az-1".to_string(), "az-2".to_string()],
                    ..Default::default()
                },
            ],
            managed: false,
        });
        let network = parse(&config).unwrap();
        assert!(network.has_azs(&["az-1"]));
        assert!(network.has_azs(&["az-1", "az-2"]));
        assert!(!network.has_azs(&["az-3"]));

        let flat = parse(&manual_network_config("net_b")).unwrap();
        assert!(flat.has_azs(&[]));
        assert!(!flat.has_azs(&["az-1"]));
    }

    #[test]
    fn test_dynamic_network_normalizes_flat_declaration() {
        let config = NetworkConfig::Dynamic(DynamicNetworkConfig {
            name: "net_dyn".to_string(),
            dns: Some(vec!["1.2.3.4".parse().unwrap()]),
            cloud_properties: Some(json!({"foo": "bar"})),
            subnets: vec![],
        });
        let Network::Dynamic(network) = parse(&config).unwrap() else {
            panic!("expected dynamic network");
        };
        assert_eq!(network.subnets.len(), 1);
        assert_eq!(network.subnets[0].cloud_properties, json!({"foo": "bar"}));
    }

    #[test]
    fn test_manual_settings() {
        let network = Arc::new(parse(&manual_network_config("net_a")).unwrap());
        let mut reservation = Reservation::new_dynamic(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
        );
        reservation.resolve("192.168.1.6".parse().unwrap());

        let setting = network
            .network_settings(&reservation, None, None, None)
            .unwrap();
        assert_eq!(setting.kind, NetworkSettingKind::Manual);
        assert_eq!(setting.ip.as_deref(), Some("192.168.1.6"));
        assert_eq!(setting.netmask.as_deref(), Some("255.255.255.0"));
        assert_eq!(setting.gateway.as_deref(), Some("192.168.1.1"));
        assert_eq!(
            setting.default,
            Some(vec!["dns".to_string(), "gateway".to_string()])
        );
    }

    #[test]
    fn test_dynamic_settings_merge_agent_state() {
        let config = NetworkConfig::Dynamic(DynamicNetworkConfig {
            name: "net_dyn".to_string(),
            dns: Some(vec!["1.2.3.4".parse().unwrap()]),
            cloud_properties: Some(json!({"foo": "bar"})),
            subnets: vec![],
        });
        let network = Arc::new(parse(&config).unwrap());
        let reservation = Reservation::new_dynamic(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
        );
        let current = NetworkSetting {
            kind: NetworkSettingKind::Dynamic,
            ip: Some("10.0.0.6".to_string()),
            netmask: Some("255.255.255.0".to_string()),
            gateway: Some("10.0.0.1".to_string()),
            dns: None,
            default: None,
            cloud_properties: json!({}),
            dns_record_name: None,
        };
        let setting = network
            .network_settings(
                &reservation,
                Some(&[NetworkConcern::Gateway]),
                None,
                Some(&current),
            )
            .unwrap();
        assert_eq!(setting.ip.as_deref(), Some("10.0.0.6"));
        assert_eq!(setting.netmask.as_deref(), Some("255.255.255.0"));
        assert_eq!(setting.gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(setting.default, Some(vec!["gateway".to_string()]));
        assert_eq!(setting.cloud_properties, json!({"foo": "bar"}));
    }

    #[test]
    fn test_vip_refuses_automatic_defaults() {
        let config = NetworkConfig::Vip(VipNetworkConfig {
            name: "vip_net".to_string(),
            cloud_properties: None,
            subnets: vec![],
        });
        let network = Arc::new(parse(&config).unwrap());
        let mut reservation = Reservation::new_static(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            "69.69.69.69".parse().unwrap(),
        );
        reservation.resolve("69.69.69.69".parse().unwrap());

        assert!(matches!(
            network.network_settings(&reservation, None, None, None),
            Err(TopologyError::VipDefaultsUnsupported { .. })
        ));

        let setting = network
            .network_settings(&reservation, Some(&[]), None, None)
            .unwrap();
        assert_eq!(setting.kind, NetworkSettingKind::Vip);
        assert_eq!(setting.ip.as_deref(), Some("69.69.69.69"));
        assert!(setting.default.is_none());
    }
}
