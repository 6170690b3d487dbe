use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::{Error, Family, Result};

pub const DEFAULT_V4_HOST_PREFIX: u8 = 24;
pub const DEFAULT_V6_HOST_PREFIX: u8 = 64;

/// A configured cluster range and the prefix length of the host subnets carved
/// out of it, written as `cidr/hostPrefix` (`10.128.0.0/14/23`). The host
/// prefix may be omitted, in which case /24 (IPv4) or /64 (IPv6) is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetRange {
    pub network: IpNetwork,
    pub host_prefix: u8,
}

impl SubnetRange {
    pub fn family(&self) -> Family {
        Family::of(&self.network)
    }
}

impl FromStr for SubnetRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: String| Error::InvalidRange {
            range: s.to_owned(),
            reason,
        };
        let (cidr, host_prefix) = match s.matches('/').count() {
            2 => {
                let (cidr, host) = s
                    .rsplit_once('/')
                    .ok_or_else(|| invalid("missing host subnet length".into()))?;
                let host = host
                    .parse::<u8>()
                    .map_err(|e| invalid(format!("host subnet length: {e}")))?;
                (cidr, Some(host))
            }
            _ => (s, None),
        };
        let network = IpNetwork::from_str(cidr).map_err(|e| invalid(e.to_string()))?;
        let host_prefix = host_prefix.unwrap_or(match Family::of(&network) {
            Family::V4 => DEFAULT_V4_HOST_PREFIX,
            Family::V6 => DEFAULT_V6_HOST_PREFIX,
        });
        Ok(Self {
            network,
            host_prefix,
        })
    }
}

impl Display for SubnetRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.host_prefix)
    }
}

/// A registered range, subdivided into `capacity` host subnets indexed from
/// the start of the range. Only reserved indices are stored.
#[derive(Debug)]
pub(crate) struct AddressRange {
    network: IpNetwork,
    host_prefix: u8,
    base: u128,
    host_bits: u32,
    capacity: u128,
    used: BTreeMap<u128, String>,
}

impl AddressRange {
    pub(crate) fn new(network: IpNetwork, host_prefix: u8) -> Result<Self> {
        let family = Family::of(&network);
        if host_prefix < network.prefix() || host_prefix > family.bits() {
            return Err(Error::InvalidRange {
                range: format!("{network}/{host_prefix}"),
                reason: format!(
                    "host subnet length must be between /{} and /{}",
                    network.prefix(),
                    family.bits()
                ),
            });
        }
        // 10.128.0.1/14 registers the same range as 10.128.0.0/14
        let network =
            IpNetwork::new(network.network(), network.prefix()).map_err(|e| {
                Error::InvalidRange {
                    range: network.to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(Self {
            network,
            host_prefix,
            base: addr_bits(network.network()),
            host_bits: u32::from(family.bits() - host_prefix),
            capacity: 1u128
                .checked_shl(u32::from(host_prefix - network.prefix()))
                .unwrap_or(u128::MAX),
            used: BTreeMap::new(),
        })
    }

    pub(crate) fn family(&self) -> Family {
        Family::of(&self.network)
    }

    pub(crate) fn network(&self) -> IpNetwork {
        self.network
    }

    pub(crate) fn capacity(&self) -> u128 {
        self.capacity
    }

    pub(crate) fn used(&self) -> usize {
        self.used.len()
    }

    pub(crate) fn overlaps(&self, other: &IpNetwork) -> bool {
        Family::of(other) == self.family()
            && (self.network.contains(other.network()) || other.contains(self.network.network()))
    }

    /// Index of `subnet` if it is exactly one of this range's host subnets.
    pub(crate) fn index_of(&self, subnet: &IpNetwork) -> Option<u128> {
        if Family::of(subnet) != self.family()
            || subnet.prefix() != self.host_prefix
            || subnet.ip() != subnet.network()
            || !self.network.contains(subnet.ip())
        {
            return None;
        }
        Some(shr(addr_bits(subnet.ip()) - self.base, self.host_bits))
    }

    pub(crate) fn subnet_at(&self, index: u128) -> Result<IpNetwork> {
        let addr = self.base + shl(index, self.host_bits);
        let ip = match self.family() {
            // the range is IPv4 so the address fits in 32 bits
            Family::V4 => IpAddr::V4(Ipv4Addr::from(addr as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(addr)),
        };
        IpNetwork::new(ip, self.host_prefix).map_err(|e| Error::InvalidRange {
            range: self.network.to_string(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn owner(&self, index: u128) -> Option<&str> {
        self.used.get(&index).map(String::as_str)
    }

    pub(crate) fn reserve(&mut self, index: u128, owner: &str) {
        self.used.insert(index, owner.to_owned());
    }

    pub(crate) fn free(&mut self, index: u128) {
        self.used.remove(&index);
    }

    /// Lowest unreserved index.
    pub(crate) fn first_free(&self) -> Option<u128> {
        let mut candidate = 0u128;
        for index in self.used.keys() {
            if *index != candidate {
                break;
            }
            candidate += 1;
        }
        (candidate < self.capacity).then_some(candidate)
    }
}

fn addr_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(addr) => u128::from(u32::from(addr)),
        IpAddr::V6(addr) => u128::from(addr),
    }
}

fn shl(value: u128, bits: u32) -> u128 {
    value.checked_shl(bits).unwrap_or(0)
}

fn shr(value: u128, bits: u32) -> u128 {
    value.checked_shr(bits).unwrap_or(0)
}
