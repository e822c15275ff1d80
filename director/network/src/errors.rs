// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for the network model.
//!
//! Topology errors are raised while parsing networks, before any instance
//! planning; allocation errors are raised while resolving reservations for
//! a specific instance.  Both are fatal for the deployment run and every
//! variant names the offending entity so an operator can fix the manifest
//! without extra diagnostics.

use flotilla_director_types::ids::InstanceUuid;
use std::net::IpAddr;

/// Why a gateway address was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayProblem {
    NotASingleIp,
    OutsideRange,
    IsNetworkId,
    IsBroadcast,
}

impl std::fmt::Display for GatewayProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            GatewayProblem::NotASingleIp => "must be a single IP",
            GatewayProblem::OutsideRange => "must be inside the range",
            GatewayProblem::IsNetworkId => "can't be the network id",
            GatewayProblem::IsBroadcast => "can't be the broadcast IP",
        };
        f.write_str(msg)
    }
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("network '{network}' is missing required field '{field}'")]
    MissingField { network: String, field: String },

    #[error(
        "network '{network}' field '{field}' is invalid: expected {expected}"
    )]
    InvalidField { network: String, field: String, expected: String },

    #[error("network '{network}' range '{range}' is not a valid CIDR")]
    InvalidRange { network: String, range: String },

    #[error("invalid gateway for network '{network}': {problem}")]
    InvalidGateway { network: String, problem: GatewayProblem },

    #[error(
        "network '{network}' has overlapping subnet ranges: {}",
        conflicts
            .iter()
            .map(|(a, b)| format!("{a} overlaps {b}"))
            .collect::<Vec<_>>()
            .join(", ")
    )]
    OverlappingSubnets { network: String, conflicts: Vec<(String, String)> },

    #[error("reserved IP '{ip}' is out of network '{network}' range")]
    ReservedIpOutOfRange { network: String, ip: String },

    #[error("static IP '{ip}' is out of network '{network}' range")]
    StaticIpOutOfRange { network: String, ip: String },

    #[error("static IP '{ip}' is in network '{network}' reserved range")]
    StaticIpInReservedRange { network: String, ip: String },

    #[error(
        "network '{network}' must declare availability zones on all of its \
         subnets or on none of them"
    )]
    MixedAvailabilityZones { network: String },

    #[error(
        "network '{network}' references unknown availability zone '{zone}'"
    )]
    UnknownAvailabilityZone { network: String, zone: String },

    #[error(
        "vip network '{network}' does not compute default addressing; pass \
         an explicit default list"
    )]
    VipDefaultsUnsupported { network: String },

    #[error(
        "reservation on network '{network}' is unresolved; cannot build \
         network settings"
    )]
    UnresolvedReservation { network: String },

    #[error("IP '{ip}' does not belong to any subnet of network '{network}'")]
    IpOutsideSubnets { network: String, ip: IpAddr },

    #[error(
        "instance group '{instance_group}' declares no default network for \
         addressing"
    )]
    NoDefaultNetwork { instance_group: String },

    #[error("instance has no reservation on network '{network}'")]
    NoReservationForNetwork { network: String },
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error(
        "failed to reserve IP '{ip}' for network '{network}': IP is outside \
         every subnet range"
    )]
    IpOutsideSubnet { network: String, ip: IpAddr },

    #[error(
        "failed to reserve IP '{ip}' for network '{network}': IP belongs to \
         reserved range"
    )]
    IpReserved { network: String, ip: IpAddr },

    #[error("IP '{ip}' on network '{network}' does not belong to {pool} pool")]
    WrongPool { network: String, ip: IpAddr, pool: &'static str },

    #[error(
        "failed to reserve IP '{ip}' for network '{network}': already \
         reserved by instance {owner}"
    )]
    AlreadyReserved { network: String, ip: IpAddr, owner: InstanceUuid },

    #[error(
        "failed to reserve IP for network '{network}': no more available \
         addresses{}",
        if azs.is_empty() {
            String::new()
        } else {
            format!(" (availability zones: {})", azs.join(", "))
        }
    )]
    NotEnoughCapacity { network: String, azs: Vec<String> },

    #[error(
        "instance group '{instance_group}' requests static IP '{ip}' on \
         network '{network}' more than once"
    )]
    DuplicateStaticIp { instance_group: String, network: String, ip: IpAddr },

    #[error(
        "instance group '{instance_group}' needs {required} static IPs on \
         network '{network}' but only {available} are assigned"
    )]
    NotEnoughStaticIps {
        instance_group: String,
        network: String,
        required: usize,
        available: usize,
    },

    #[error("can't release reservation on network '{network}' without an IP")]
    MissingIp { network: String },
}
