use std::fmt::Display;
use std::net::Ipv6Addr;

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MacAddressError {
    #[error("a MAC address must have exactly 6 colon-separated octets")]
    InvalidLength,
    #[error("the MAC address contains invalid symbols")]
    InvalidSymbols,
}

/// EUI-48 MAC Address, used as the key for DHCP reservations
/// (`/networks/<vni>/dhcp4_reservations/<mac>`).
#[derive(
    Clone, Copy, Debug, DeserializeFromStr, SerializeDisplay, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct MacAddress([u8; 6]);

static LOCAL_PART: [u8; 8] = [0xFE, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
static EUI64_MIDDLE_PART: [u8; 2] = [0xFF, 0xFE];

impl MacAddress {
    pub fn new(address: [u8; 6]) -> Self {
        Self(address)
    }

    /// Generates a link-local IPv6 address according to RFC 4291 (Appendix
    /// A). Used when a reservation wants an EUI-64 derived address instead
    /// of an explicit lease.
    pub fn eui64_link_local_address(&self) -> Ipv6Addr {
        let head = &self.0[..3];
        let tail = &self.0[3..];

        let mut eui64_address: Vec<u8> = LOCAL_PART
            .iter()
            .chain(head.iter())
            .chain(EUI64_MIDDLE_PART.iter())
            .chain(tail.iter())
            .copied()
            .collect();

        // flip the universal/local bit of the first EUI-64 byte
        eui64_address[8] ^= 0x02;

        Ipv6Addr::from(
            TryInto::<[u8; 16]>::try_into(eui64_address).expect("is an u8 array with 16 entries"),
        )
    }
}

impl std::str::FromStr for MacAddress {
    type Err = MacAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = s
            .split(':')
            .map(|elem| u8::from_str_radix(elem, 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| MacAddressError::InvalidSymbols)?;

        if parsed.len() != 6 {
            return Err(MacAddressError::InvalidLength);
        }

        Ok(Self(parsed.try_into().unwrap()))
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_and_round_trips() {
        for input in ["aa:aa:aa:11:22:33", "bc:24:11:aa:bb:ef"] {
            let mac = input.parse::<MacAddress>().expect("valid mac address");
            assert_eq!(input, mac.to_string());
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for input in [
            "aa:aa:aa:11:22:33:aa",
            "aa:bb:ff:11:22",
            "aa:bb:gg:11:22:33",
            "",
        ] {
            input
                .parse::<MacAddress>()
                .expect_err("invalid mac address");
        }
    }

    #[test]
    fn eui64_link_local_address() {
        let mac: MacAddress = "bc:24:11:49:8d:75".parse().expect("valid MAC address");
        let expected = Ipv6Addr::from_str("fe80::be24:11ff:fe49:8d75").unwrap();
        assert_eq!(expected, mac.eui64_link_local_address());
    }
}
