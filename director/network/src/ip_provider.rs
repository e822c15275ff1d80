// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The allocation authority: binds reservations to concrete addresses.
//!
//! There is exactly one `IpProvider` per planning run and every
//! reservation flows through it, so address uniqueness is enforced in one
//! place.  The planning layer serializes access (instances race for the
//! same subnet's free addresses); this module itself is synchronous.

use crate::errors::AllocationError;
use crate::network::{ManualNetwork, Network, VipNetwork};
use crate::reservation::{Reservation, ReservationKind};
use flotilla_director_types::ids::InstanceUuid;
use slog::{debug, Logger};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// In-memory record of which instance holds which address on which
/// network.
#[derive(Clone, Debug, Default)]
pub struct IpRepo {
    allocated: BTreeMap<String, BTreeMap<IpAddr, InstanceUuid>>,
}

impl IpRepo {
    pub fn owner(&self, network: &str, ip: IpAddr) -> Option<InstanceUuid> {
        self.allocated.get(network)?.get(&ip).copied()
    }

    fn add(
        &mut self,
        network: &str,
        ip: IpAddr,
        instance: InstanceUuid,
    ) -> Result<(), AllocationError> {
        match self.owner(network, ip) {
            Some(owner) if owner != instance => {
                Err(AllocationError::AlreadyReserved {
                    network: network.to_string(),
                    ip,
                    owner,
                })
            }
            _ => {
                self.allocated
                    .entry(network.to_string())
                    .or_default()
                    .insert(ip, instance);
                Ok(())
            }
        }
    }

    fn delete(&mut self, network: &str, ip: IpAddr) {
        if let Some(ips) = self.allocated.get_mut(network) {
            ips.remove(&ip);
        }
    }

    fn is_allocated(&self, network: &str, ip: IpAddr) -> bool {
        self.owner(network, ip).is_some()
    }
}

/// Allocates and validates IP reservations against the parsed topology.
#[derive(Debug)]
pub struct IpProvider {
    repo: IpRepo,
    log: Logger,
}

impl IpProvider {
    pub fn new(log: Logger) -> IpProvider {
        IpProvider { repo: IpRepo::default(), log }
    }

    pub fn repo(&self) -> &IpRepo {
        &self.repo
    }

    /// Resolve a desired reservation to a concrete address.
    pub fn reserve(
        &mut self,
        reservation: &mut Reservation,
    ) -> Result<(), AllocationError> {
        let network = reservation.network.clone();
        match &*network {
            Network::Manual(net) => match reservation.ip {
                Some(ip) => self.reserve_manual_ip(net, reservation, ip),
                None => self.allocate_manual_dynamic(net, reservation),
            },
            Network::Dynamic(_) => {
                // The IaaS assigns the address; there is nothing to bind
                // on the director side.
                reservation.mark_resolved();
                Ok(())
            }
            Network::Vip(net) => match reservation.ip {
                Some(ip) => {
                    self.repo.add(net.name.as_str(), ip, reservation.instance)?;
                    reservation.resolve(ip);
                    Ok(())
                }
                None => self.allocate_vip(net, reservation),
            },
        }
    }

    /// Re-register an instance's previously persisted address.
    ///
    /// The reservation is re-classified against the current static pools.
    /// An address that no longer fits the topology is left unresolved
    /// rather than failing the run; planning will surface that as a
    /// topology change for the instance.
    pub fn reserve_existing(
        &mut self,
        reservation: &mut Reservation,
    ) -> Result<(), AllocationError> {
        let network = reservation.network.clone();
        match &*network {
            Network::Manual(net) => {
                let Some(ip) = reservation.ip else {
                    return Ok(());
                };
                let Some(subnet) = net.subnet_for_ip(ip) else {
                    debug!(
                        self.log,
                        "existing address no longer fits topology";
                        "network" => %net.name,
                        "ip" => %ip,
                    );
                    return Ok(());
                };
                if subnet.is_restricted(ip) {
                    debug!(
                        self.log,
                        "existing address drifted into reserved range";
                        "network" => %net.name,
                        "ip" => %ip,
                    );
                    return Ok(());
                }
                let kind = if subnet.in_static_pool(ip) {
                    ReservationKind::Static
                } else {
                    ReservationKind::Dynamic
                };
                reservation.reclassify(kind);
                self.repo.add(net.name.as_str(), ip, reservation.instance)?;
                reservation.resolve(ip);
                Ok(())
            }
            Network::Dynamic(_) => {
                reservation.reclassify(ReservationKind::Dynamic);
                reservation.mark_resolved();
                Ok(())
            }
            Network::Vip(net) => {
                let Some(ip) = reservation.ip else {
                    return Ok(());
                };
                reservation.reclassify(ReservationKind::Static);
                self.repo.add(net.name.as_str(), ip, reservation.instance)?;
                reservation.resolve(ip);
                Ok(())
            }
        }
    }

    /// Return a reservation's address to the pool.
    pub fn release(
        &mut self,
        reservation: &Reservation,
    ) -> Result<(), AllocationError> {
        match reservation.ip {
            Some(ip) => {
                self.repo.delete(reservation.network_name(), ip);
                Ok(())
            }
            // Dynamic networks never hold a director-side address.
            None if matches!(&*reservation.network, Network::Dynamic(_)) => {
                Ok(())
            }
            None => Err(AllocationError::MissingIp {
                network: reservation.network_name().to_string(),
            }),
        }
    }

    fn reserve_manual_ip(
        &mut self,
        net: &ManualNetwork,
        reservation: &mut Reservation,
        ip: IpAddr,
    ) -> Result<(), AllocationError> {
        let subnet = net.subnet_for_ip(ip).ok_or_else(|| {
            AllocationError::IpOutsideSubnet { network: net.name.clone(), ip }
        })?;
        if subnet.is_restricted(ip) {
            return Err(AllocationError::IpReserved {
                network: net.name.clone(),
                ip,
            });
        }
        let in_static_pool = subnet.in_static_pool(ip);
        match reservation.kind {
            ReservationKind::Static if !in_static_pool => {
                return Err(AllocationError::WrongPool {
                    network: net.name.clone(),
                    ip,
                    pool: "static",
                });
            }
            ReservationKind::Dynamic if in_static_pool => {
                return Err(AllocationError::WrongPool {
                    network: net.name.clone(),
                    ip,
                    pool: "dynamic",
                });
            }
            _ => {}
        }
        self.repo.add(net.name.as_str(), ip, reservation.instance)?;
        reservation.resolve(ip);
        debug!(
            self.log,
            "reserved requested address";
            "network" => %net.name,
            "ip" => %ip,
            "instance" => %reservation.instance,
        );
        Ok(())
    }

    fn allocate_manual_dynamic(
        &mut self,
        net: &ManualNetwork,
        reservation: &mut Reservation,
    ) -> Result<(), AllocationError> {
        let az = reservation.availability_zone.clone();
        // AZ affinity first: an instance placed in a zone only draws from
        // subnets declaring that zone.  Subnets are consulted in
        // declaration order so repeated runs allocate identically.
        let eligible: Vec<_> = net
            .subnets
            .iter()
            .filter(|subnet| match &az {
                Some(az) => {
                    subnet.availability_zone_names.iter().any(|n| n == az)
                }
                None => true,
            })
            .collect();
        for subnet in &eligible {
            let Some(range) = &subnet.range else { continue };
            for candidate in range.iter() {
                if subnet.is_restricted(candidate)
                    || subnet.in_static_pool(candidate)
                    || self.repo.is_allocated(net.name.as_str(), candidate)
                {
                    continue;
                }
                self.repo.add(
                    net.name.as_str(),
                    candidate,
                    reservation.instance,
                )?;
                reservation.resolve(candidate);
                debug!(
                    self.log,
                    "allocated dynamic address";
                    "network" => %net.name,
                    "ip" => %candidate,
                    "instance" => %reservation.instance,
                );
                return Ok(());
            }
        }
        Err(AllocationError::NotEnoughCapacity {
            network: net.name.clone(),
            azs: az.map(|az| vec![az]).unwrap_or_default(),
        })
    }

    fn allocate_vip(
        &mut self,
        net: &VipNetwork,
        reservation: &mut Reservation,
    ) -> Result<(), AllocationError> {
        for subnet in &net.subnets {
            for candidate in &subnet.static_ips {
                if self.repo.is_allocated(net.name.as_str(), *candidate) {
                    continue;
                }
                self.repo.add(
                    net.name.as_str(),
                    *candidate,
                    reservation.instance,
                )?;
                reservation.resolve(*candidate);
                return Ok(());
            }
        }
        Err(AllocationError::NotEnoughCapacity {
            network: net.name.clone(),
            azs: vec![],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::{
        ManualNetworkConfig, NetworkConfig, VipNetworkConfig,
    };
    use crate::subnet::{
        ManualSubnetConfig, NetworkParseOptions, VipSubnetConfig,
    };
    use flotilla_director_types::instance::AvailabilityZone;
    use serde_json::json;
    use std::sync::Arc;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn azs() -> Vec<AvailabilityZone> {
        vec![
            AvailabilityZone::new("az-1", json!({})),
            AvailabilityZone::new("az-2", json!({})),
        ]
    }

    fn subnet(range: &str, gateway: &str) -> ManualSubnetConfig {
        ManualSubnetConfig {
            range: Some(range.to_string()),
            gateway: Some(gateway.to_string()),
            ..Default::default()
        }
    }

    fn manual(
        name: &str,
        subnets: Vec<ManualSubnetConfig>,
    ) -> Arc<Network> {
        let config = NetworkConfig::Manual(ManualNetworkConfig {
            name: name.to_string(),
            dns: None,
            subnets,
            managed: false,
        });
        Arc::new(
            Network::parse(&config, &azs(), &NetworkParseOptions::default())
                .unwrap(),
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_static_reservation_outside_subnets_fails() {
        let network = manual("my-net", vec![subnet("192.168.1.0/30", "192.168.1.1")]);
        let mut provider = IpProvider::new(log());
        let mut reservation = Reservation::new_static(
            InstanceUuid::new_v4(),
            network,
            ip("192.168.2.6"),
        );
        assert!(matches!(
            provider.reserve(&mut reservation),
            Err(AllocationError::IpOutsideSubnet { .. })
        ));
    }

    #[test]
    fn test_reserved_range_is_refused() {
        let mut config = subnet("192.168.1.0/24", "192.168.1.1");
        config.reserved = vec!["192.168.1.11".to_string()];
        let network = manual("my-net", vec![config]);
        let mut provider = IpProvider::new(log());
        // A desired reservation that wants to keep this address hard-fails.
        let mut reservation =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network))
                .with_address(ip("192.168.1.11"));
        assert_eq!(
            provider.reserve(&mut reservation),
            Err(AllocationError::IpReserved {
                network: "my-net".to_string(),
                ip: ip("192.168.1.11"),
            })
        );
    }

    #[test]
    fn test_pool_membership_is_enforced() {
        let mut config = subnet("192.168.1.0/24", "192.168.1.1");
        config.static_ips = vec!["192.168.1.2".to_string()];
        let network = manual("my-net", vec![config]);
        let mut provider = IpProvider::new(log());

        // A dynamic-path reservation may not land on a static-pool IP.
        let mut dynamic =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network))
                .with_address(ip("192.168.1.2"));
        assert_eq!(
            provider.reserve(&mut dynamic),
            Err(AllocationError::WrongPool {
                network: "my-net".to_string(),
                ip: ip("192.168.1.2"),
                pool: "dynamic",
            })
        );

        // And a static reservation must name a static-pool IP.
        let mut stat = Reservation::new_static(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            ip("192.168.1.3"),
        );
        assert_eq!(
            provider.reserve(&mut stat),
            Err(AllocationError::WrongPool {
                network: "my-net".to_string(),
                ip: ip("192.168.1.3"),
                pool: "static",
            })
        );

        let mut ok = Reservation::new_static(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            ip("192.168.1.2"),
        );
        assert!(provider.reserve(&mut ok).is_ok());
        assert!(ok.resolved());
    }

    #[test]
    fn test_duplicate_allocation_names_the_owner() {
        let mut config = subnet("192.168.1.0/24", "192.168.1.1");
        config.static_ips = vec!["192.168.1.5".to_string()];
        let network = manual("my-net", vec![config]);
        let mut provider = IpProvider::new(log());

        let first_instance = InstanceUuid::new_v4();
        let mut first = Reservation::new_static(
            first_instance,
            Arc::clone(&network),
            ip("192.168.1.5"),
        );
        provider.reserve(&mut first).unwrap();

        let mut second = Reservation::new_static(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            ip("192.168.1.5"),
        );
        assert_eq!(
            provider.reserve(&mut second),
            Err(AllocationError::AlreadyReserved {
                network: "my-net".to_string(),
                ip: ip("192.168.1.5"),
                owner: first_instance,
            })
        );
    }

    #[test]
    fn test_dynamic_allocation_prefers_az_subnets() {
        let mut az1 = subnet("192.168.1.0/30", "192.168.1.1");
        az1.az = Some("az-1".to_string());
        let mut az2 = subnet("192.168.2.0/30", "192.168.2.1");
        az2.az = Some("az-2".to_string());
        let network = manual("my-net", vec![az1, az2]);
        let mut provider = IpProvider::new(log());

        let mut reservation =
            Reservation::new_dynamic(InstanceUuid::new_v4(), network)
                .in_az(Some("az-2".to_string()));
        provider.reserve(&mut reservation).unwrap();
        // /30 leaves exactly one address once the network id, broadcast,
        // and gateway are restricted.
        assert_eq!(reservation.ip, Some(ip("192.168.2.2")));
    }

    #[test]
    fn test_exhaustion_names_the_network() {
        let network = manual("my-net", vec![subnet("192.168.1.0/30", "192.168.1.1")]);
        let mut provider = IpProvider::new(log());

        let mut first =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        provider.reserve(&mut first).unwrap();
        assert_eq!(first.ip, Some(ip("192.168.1.2")));

        let mut second =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        assert_eq!(
            provider.reserve(&mut second),
            Err(AllocationError::NotEnoughCapacity {
                network: "my-net".to_string(),
                azs: vec![],
            })
        );
    }

    #[test]
    fn test_reserve_existing_reclassifies_and_tolerates_drift() {
        let mut config = subnet("192.168.1.0/24", "192.168.1.1");
        config.static_ips = vec!["192.168.1.2".to_string()];
        let network = manual("my-net", vec![config]);
        let mut provider = IpProvider::new(log());

        let mut static_ish = Reservation::new_existing(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            ip("192.168.1.2"),
        );
        provider.reserve_existing(&mut static_ish).unwrap();
        assert!(static_ish.is_static());
        assert!(static_ish.resolved());

        let mut dynamic_ish = Reservation::new_existing(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            ip("192.168.1.3"),
        );
        provider.reserve_existing(&mut dynamic_ish).unwrap();
        assert!(!dynamic_ish.is_static());

        // An address outside today's subnets is kept but unresolved.
        let mut drifted = Reservation::new_existing(
            InstanceUuid::new_v4(),
            Arc::clone(&network),
            ip("10.10.0.1"),
        );
        provider.reserve_existing(&mut drifted).unwrap();
        assert!(!drifted.resolved());
        assert_eq!(drifted.ip, Some(ip("10.10.0.1")));
    }

    #[test]
    fn test_vip_allocation() {
        let config = NetworkConfig::Vip(VipNetworkConfig {
            name: "my-vip".to_string(),
            cloud_properties: None,
            subnets: vec![
                VipSubnetConfig {
                    static_ips: vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()],
                },
                VipSubnetConfig { static_ips: vec!["3.3.3.3".to_string()] },
            ],
        });
        let network = Arc::new(
            Network::parse(&config, &[], &NetworkParseOptions::default())
                .unwrap(),
        );
        let mut provider = IpProvider::new(log());

        let mut first =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        provider.reserve(&mut first).unwrap();
        assert_eq!(first.ip, Some(ip("1.1.1.1")));

        let mut second =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        provider.reserve(&mut second).unwrap();
        assert_eq!(second.ip, Some(ip("2.2.2.2")));

        let mut third =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        provider.reserve(&mut third).unwrap();
        let mut exhausted =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        assert!(matches!(
            provider.reserve(&mut exhausted),
            Err(AllocationError::NotEnoughCapacity { .. })
        ));
    }

    #[test]
    fn test_release() {
        let network = manual("my-net", vec![subnet("192.168.1.0/30", "192.168.1.1")]);
        let mut provider = IpProvider::new(log());

        let mut reservation =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        provider.reserve(&mut reservation).unwrap();
        provider.release(&reservation).unwrap();

        // The freed address can be taken again.
        let mut again =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        provider.reserve(&mut again).unwrap();
        assert_eq!(again.ip, reservation.ip);

        // Releasing an address-less manual reservation is an error ...
        let empty =
            Reservation::new_dynamic(InstanceUuid::new_v4(), Arc::clone(&network));
        assert!(matches!(
            provider.release(&empty),
            Err(AllocationError::MissingIp { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn dynamic_allocations_are_unique_and_legal(count in 1usize..64) {
            let mut config = subnet("192.168.1.0/24", "192.168.1.1");
            config.reserved = vec!["192.168.1.40-192.168.1.60".to_string()];
            config.static_ips = vec!["192.168.1.100-192.168.1.110".to_string()];
            let network = manual("my-net", vec![config]);
            let Network::Manual(manual_net) = &*network else { unreachable!() };
            let subnet = &manual_net.subnets[0];

            let mut provider = IpProvider::new(log());
            let mut seen = std::collections::BTreeSet::new();
            for _ in 0..count {
                let mut reservation = Reservation::new_dynamic(
                    InstanceUuid::new_v4(),
                    Arc::clone(&network),
                );
                provider.reserve(&mut reservation).unwrap();
                let ip = reservation.ip.unwrap();
                proptest::prop_assert!(seen.insert(ip), "duplicate {ip}");
                proptest::prop_assert!(!subnet.is_restricted(ip));
                proptest::prop_assert!(!subnet.in_static_pool(ip));
            }
        }
    }
}
