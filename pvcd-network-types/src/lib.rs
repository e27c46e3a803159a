//! Provides types for the overlay-network data model: DHCP reservation MAC
//! addresses and the IPv4/IPv6 CIDRs used for gateway and network ranges.

mod mac_address;
pub use mac_address::{MacAddress, MacAddressError};

mod cidr;
pub use cidr::{CidrError, Ipv4Cidr, Ipv6Cidr};
