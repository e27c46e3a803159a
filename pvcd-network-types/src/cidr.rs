use std::net::{AddrParseError, Ipv4Addr, Ipv6Addr};

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CidrError {
    #[error("invalid netmask")]
    InvalidNetmask,
    #[error("invalid address: {0}")]
    Address(#[from] AddrParseError),
}

const IPV4_LENGTH: u8 = 32;
const IPV6_LENGTH: u8 = 128;

/// An IPv4 CIDR, e.g. `10.0.1.0/24`. Used for `/networks/<vni>/ip4_network`
/// and (with a full `/32` mask) for `/networks/<vni>/ip4_gateway`.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    mask: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, mask: u8) -> Result<Self, CidrError> {
        if mask > IPV4_LENGTH {
            return Err(CidrError::InvalidNetmask);
        }
        Ok(Self { addr, mask })
    }

    pub fn contains_address(&self, other: &Ipv4Addr) -> bool {
        let bits = u32::from_be_bytes(self.addr.octets());
        let other_bits = u32::from_be_bytes(other.octets());
        let shift_amount: u32 = IPV4_LENGTH.saturating_sub(self.mask).into();

        bits.checked_shr(shift_amount).unwrap_or(0) == other_bits.checked_shr(shift_amount).unwrap_or(0)
    }

    pub fn address(&self) -> &Ipv4Addr {
        &self.addr
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }
}

impl std::str::FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            None => Self {
                addr: s.parse()?,
                mask: IPV4_LENGTH,
            },
            Some((addr, mask)) => Self::new(
                addr.parse::<Ipv4Addr>()?,
                mask.parse::<u8>().map_err(|_| CidrError::InvalidNetmask)?,
            )?,
        })
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

/// An IPv6 CIDR, e.g. `fd00:1::/64`.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Ipv6Cidr {
    addr: Ipv6Addr,
    mask: u8,
}

impl Ipv6Cidr {
    pub fn new(addr: Ipv6Addr, mask: u8) -> Result<Self, CidrError> {
        if mask > IPV6_LENGTH {
            return Err(CidrError::InvalidNetmask);
        }
        Ok(Self { addr, mask })
    }

    pub fn address(&self) -> &Ipv6Addr {
        &self.addr
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }
}

impl std::str::FromStr for Ipv6Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            None => Self {
                addr: s.parse()?,
                mask: IPV6_LENGTH,
            },
            Some((addr, mask)) => Self::new(
                addr.parse::<Ipv6Addr>()?,
                mask.parse::<u8>().map_err(|_| CidrError::InvalidNetmask)?,
            )?,
        })
    }
}

impl std::fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_cidr_parses_and_displays() {
        let cidr: Ipv4Cidr = "10.0.1.0/24".parse().unwrap();
        assert_eq!(cidr.mask(), 24);
        assert_eq!(cidr.to_string(), "10.0.1.0/24");
        assert!(cidr.contains_address(&"10.0.1.200".parse().unwrap()));
        assert!(!cidr.contains_address(&"10.0.2.1".parse().unwrap()));
    }

    #[test]
    fn rejects_oversized_mask() {
        assert!(Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 33).is_err());
    }

    #[test]
    fn ipv6_cidr_parses_and_displays() {
        let cidr: Ipv6Cidr = "fd00:1::/64".parse().unwrap();
        assert_eq!(cidr.mask(), 64);
        assert_eq!(cidr.to_string(), "fd00:1::/64");
    }
}
