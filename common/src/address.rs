// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common IP addressing functionality.
//!
//! The network model stores subnet pools (static, reserved) as inclusive
//! first-last ranges and the reservation system walks those ranges when
//! allocating.  Both IPv4 and IPv6 are supported; a range never spans
//! address families.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Map an address into the integer space used for range arithmetic.
///
/// IPv4 addresses occupy the low 32 bits so that ordering and distance
/// computations work uniformly for both families.
pub fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inverse of [`ip_to_u128`].  The caller supplies the family; returns
/// `None` when the value does not fit it.
pub fn ip_from_u128(value: u128, v6: bool) -> Option<IpAddr> {
    if v6 {
        Some(IpAddr::V6(Ipv6Addr::from(value)))
    } else {
        let v4 = u32::try_from(value).ok()?;
        Some(IpAddr::V4(Ipv4Addr::from(v4)))
    }
}

/// The address `offset` places after `ip`, or `None` if that would leave
/// the address family.
pub fn ip_add(ip: IpAddr, offset: u128) -> Option<IpAddr> {
    let value = ip_to_u128(ip).checked_add(offset)?;
    ip_from_u128(value, ip.is_ipv6())
}

/// The immediate successor of `ip` within its family.
pub fn ip_succ(ip: IpAddr) -> Option<IpAddr> {
    ip_add(ip, 1)
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum IpRangeError {
    #[error("IP range '{first}-{last}' mixes address families")]
    MixedFamilies { first: IpAddr, last: IpAddr },
    #[error("IP range '{first}-{last}' ends before it starts")]
    Inverted { first: IpAddr, last: IpAddr },
    #[error("'{0}' is not an IP address or an IP address range")]
    Unparseable(String),
}

/// An inclusive range of IP addresses within one family.
///
/// Manifests express reserved and static pools either as a single address
/// (`"10.0.0.4"`) or as a dash-separated inclusive range
/// (`"10.0.0.4-10.0.0.9"`); both parse into this type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct IpRange {
    first: IpAddr,
    last: IpAddr,
}

impl IpRange {
    pub fn new(first: IpAddr, last: IpAddr) -> Result<Self, IpRangeError> {
        if first.is_ipv4() != last.is_ipv4() {
            return Err(IpRangeError::MixedFamilies { first, last });
        }
        if ip_to_u128(first) > ip_to_u128(last) {
            return Err(IpRangeError::Inverted { first, last });
        }
        Ok(Self { first, last })
    }

    pub fn single(addr: IpAddr) -> Self {
        Self { first: addr, last: addr }
    }

    pub fn first(&self) -> IpAddr {
        self.first
    }

    pub fn last(&self) -> IpAddr {
        self.last
    }

    pub fn is_ipv6(&self) -> bool {
        self.first.is_ipv6()
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        addr.is_ipv6() == self.first.is_ipv6()
            && ip_to_u128(self.first) <= ip_to_u128(addr)
            && ip_to_u128(addr) <= ip_to_u128(self.last)
    }

    /// Number of addresses in the range, saturating at `u128::MAX` for the
    /// degenerate full-IPv6 case.
    pub fn len(&self) -> u128 {
        (ip_to_u128(self.last) - ip_to_u128(self.first)).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn overlaps(&self, other: &IpRange) -> bool {
        self.is_ipv6() == other.is_ipv6()
            && ip_to_u128(self.first) <= ip_to_u128(other.last)
            && ip_to_u128(other.first) <= ip_to_u128(self.last)
    }

    pub fn iter(&self) -> IpRangeIter {
        IpRangeIter {
            next: Some(ip_to_u128(self.first)),
            last: ip_to_u128(self.last),
            v6: self.is_ipv6(),
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

impl FromStr for IpRange {
    type Err = IpRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unparseable = || IpRangeError::Unparseable(s.to_string());
        match s.split_once('-') {
            None => {
                let addr =
                    s.trim().parse().map_err(|_| unparseable())?;
                Ok(IpRange::single(addr))
            }
            Some((first, last)) => {
                let first =
                    first.trim().parse().map_err(|_| unparseable())?;
                let last =
                    last.trim().parse().map_err(|_| unparseable())?;
                IpRange::new(first, last)
            }
        }
    }
}

#[derive(Debug)]
pub struct IpRangeIter {
    next: Option<u128>,
    last: u128,
    v6: bool,
}

impl Iterator for IpRangeIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let value = self.next?;
        self.next = if value < self.last { value.checked_add(1) } else { None };
        ip_from_u128(value, self.v6)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_single_and_range() {
        let single: IpRange = "192.168.0.4".parse().unwrap();
        assert_eq!(single.first(), ip("192.168.0.4"));
        assert_eq!(single.last(), ip("192.168.0.4"));
        assert_eq!(single.len(), 1);

        let range: IpRange = "192.168.0.4-192.168.0.9".parse().unwrap();
        assert_eq!(range.len(), 6);
        assert!(range.contains(ip("192.168.0.7")));
        assert!(!range.contains(ip("192.168.0.10")));

        let v6: IpRange =
            "fdab::10-fdab::ff".parse().unwrap();
        assert!(v6.contains(ip("fdab::42")));
        assert!(!v6.contains(ip("192.168.0.4")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "not-an-ip".parse::<IpRange>(),
            Err(IpRangeError::Unparseable(_))
        ));
        assert!(matches!(
            "192.168.0.9-192.168.0.4".parse::<IpRange>(),
            Err(IpRangeError::Inverted { .. })
        ));
        assert!(matches!(
            "192.168.0.1-fdab::1".parse::<IpRange>(),
            Err(IpRangeError::MixedFamilies { .. })
        ));
    }

    #[test]
    fn test_iteration() {
        let range: IpRange = "10.0.0.254-10.0.1.1".parse().unwrap();
        let addrs: Vec<_> = range.iter().collect();
        assert_eq!(
            addrs,
            vec![
                ip("10.0.0.254"),
                ip("10.0.0.255"),
                ip("10.0.1.0"),
                ip("10.0.1.1"),
            ]
        );
    }

    #[test]
    fn test_successor_overflow() {
        assert_eq!(ip_succ(ip("10.0.0.255")), Some(ip("10.0.1.0")));
        assert_eq!(ip_succ(ip("255.255.255.255")), None);
        assert_eq!(
            ip_succ(ip("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff")),
            None
        );
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric(a0: u32, a1: u32, b0: u32, b1: u32) {
            let a = IpRange::new(
                IpAddr::V4(Ipv4Addr::from(a0.min(a1))),
                IpAddr::V4(Ipv4Addr::from(a0.max(a1))),
            ).unwrap();
            let b = IpRange::new(
                IpAddr::V4(Ipv4Addr::from(b0.min(b1))),
                IpAddr::V4(Ipv4Addr::from(b0.max(b1))),
            ).unwrap();
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        }

        #[test]
        fn contained_implies_overlap(a0: u32, a1: u32, x: u32) {
            let a = IpRange::new(
                IpAddr::V4(Ipv4Addr::from(a0.min(a1))),
                IpAddr::V4(Ipv4Addr::from(a0.max(a1))),
            ).unwrap();
            let x = IpAddr::V4(Ipv4Addr::from(x));
            if a.contains(x) {
                prop_assert!(a.overlaps(&IpRange::single(x)));
            }
        }
    }
}
