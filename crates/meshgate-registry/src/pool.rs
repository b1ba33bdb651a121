//! Address pools.
//!
//! A pool is a CIDR scoped to one address family. It keeps no state: the
//! next free address is a function of the CIDR and the allocated set the
//! caller hands in, so the registry stays the only source of truth.
//!
//! The network address and the first host (the server's own interface
//! address) are reserved. Peers receive single-host routes on a
//! point-to-point tunnel, so the last address of an IPv4 range is a valid
//! peer address.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use meshgate_wireguard::{AddressFamily, AllowedIp};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Number of reserved addresses at the start of every pool.
const RESERVED_HOSTS: u128 = 2;

/// Default IPv4 pool.
pub const DEFAULT_IPV4_POOL: &str = "10.25.0.0/16";

/// Default IPv6 pool.
pub const DEFAULT_IPV6_POOL: &str = "fd42:42:42::/112";

/// A range of peer addresses in one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IpNet", into = "IpNet")]
pub struct AddressPool {
    network: IpNet,
    family: AddressFamily,
}

impl AddressPool {
    /// Creates a pool for the given network and family.
    ///
    /// Host bits in `network` are ignored (`10.25.0.7/16` is `10.25.0.0/16`).
    ///
    /// # Errors
    ///
    /// Returns an error if the network is of another family or has no room
    /// for a peer after the reserved addresses.
    pub fn new(network: IpNet, family: AddressFamily) -> Result<Self> {
        let network = network.trunc();
        if AddressFamily::of(&network.addr()) != family {
            return Err(RegistryError::FamilyMismatch {
                network,
                expected: family,
            });
        }
        let pool = Self { network, family };
        if pool.capacity() == 0 {
            return Err(RegistryError::NoHosts(network));
        }
        Ok(pool)
    }

    /// Creates a pool from CIDR notation, taking the family from the address.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR is invalid or too small.
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let network: IpNet = cidr
            .trim()
            .parse()
            .map_err(|_| RegistryError::InvalidCidr(cidr.to_string()))?;
        Self::new(network, AddressFamily::of(&network.addr()))
    }

    /// Returns the pool network.
    #[must_use]
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// Returns the pool family.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Returns the number of addresses peers can receive.
    #[must_use]
    pub fn capacity(&self) -> u128 {
        let host_bits = u32::from(self.network.max_prefix_len() - self.network.prefix_len());
        let size = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
        size.saturating_sub(RESERVED_HOSTS)
    }

    /// Returns the reserved first host, conventionally the server's address.
    #[must_use]
    pub fn interface_address(&self) -> IpAddr {
        self.from_offset(to_u128(self.network.network()) + 1)
    }

    /// Returns true if peers may be assigned `addr` from this pool.
    #[must_use]
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.network.contains(addr) && self.first_host() <= to_u128(*addr)
    }

    /// Returns the lowest address of the pool that is not in `allocated`.
    ///
    /// Addresses of other networks in `allocated` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Exhausted`] if every host address is taken.
    pub fn allocate(&self, allocated: &HashSet<IpAddr>) -> Result<IpAddr> {
        self.allocate_outside(allocated, &[])
    }

    /// Returns the lowest address of the pool that is neither in `allocated`
    /// nor covered by one of `subnets`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Exhausted`] if every host address is taken.
    pub fn allocate_outside(
        &self,
        allocated: &HashSet<IpAddr>,
        subnets: &[IpNet],
    ) -> Result<IpAddr> {
        let last = to_u128(self.network.broadcast());
        let mut candidate = self.first_host();
        loop {
            let addr = self.from_offset(candidate);
            let covering_end = subnets
                .iter()
                .filter(|net| net.contains(&addr))
                .map(|net| to_u128(net.broadcast()))
                .max();

            match covering_end {
                Some(end) if end >= last => return Err(RegistryError::exhausted(self.network)),
                Some(end) => {
                    candidate = end + 1;
                    continue;
                }
                None if !allocated.contains(&addr) => return Ok(addr),
                None => {}
            }
            if candidate == last {
                return Err(RegistryError::exhausted(self.network));
            }
            candidate += 1;
        }
    }

    /// Allocates an address outside `allocated` and `subnets` and wraps it
    /// as a single-host allowed IP.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Exhausted`] if every host address is taken.
    pub fn allocate_host(
        &self,
        allocated: &HashSet<IpAddr>,
        subnets: &[IpNet],
    ) -> Result<AllowedIp> {
        self.allocate_outside(allocated, subnets).map(AllowedIp::host)
    }

    fn first_host(&self) -> u128 {
        to_u128(self.network.network()) + RESERVED_HOSTS
    }

    fn from_offset(&self, value: u128) -> IpAddr {
        match self.family {
            // Values never leave the pool network, so the v4 case fits in 32 bits.
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

impl TryFrom<IpNet> for AddressPool {
    type Error = RegistryError;
    fn try_from(network: IpNet) -> Result<Self> {
        Self::new(network, AddressFamily::of(&network.addr()))
    }
}

impl From<AddressPool> for IpNet {
    fn from(pool: AddressPool) -> Self {
        pool.network
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}
