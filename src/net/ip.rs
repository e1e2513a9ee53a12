//! Address values, tagged by family.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpVersion {
	V4,
	V6,
}

impl fmt::Display for IpVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			IpVersion::V4 => f.write_str("ipv4"),
			IpVersion::V6 => f.write_str("ipv6"),
		}
	}
}

/// An IP address, tagged by family. Ordering is family first, then
/// lexicographic over the address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpEndpoint {
	V4(Ipv4Addr),
	V6(Ipv6Addr),
}

impl IpEndpoint {
	pub const ANY_V4: IpEndpoint = IpEndpoint::V4(Ipv4Addr::UNSPECIFIED);
	pub const LOOPBACK_V4: IpEndpoint = IpEndpoint::V4(Ipv4Addr::LOCALHOST);
	pub const ANY_V6: IpEndpoint = IpEndpoint::V6(Ipv6Addr::UNSPECIFIED);
	pub const LOOPBACK_V6: IpEndpoint = IpEndpoint::V6(Ipv6Addr::LOCALHOST);

	pub fn version(&self) -> IpVersion {
		match self {
			IpEndpoint::V4(_) => IpVersion::V4,
			IpEndpoint::V6(_) => IpVersion::V6,
		}
	}

	/// The lexicographically previous address within the same family.
	/// Wraps at the minimum.
	pub fn prev(&self) -> IpEndpoint {
		match self {
			IpEndpoint::V4(addr) => {
				let mut octets = addr.octets();
				decrement(&mut octets);
				IpEndpoint::V4(Ipv4Addr::from(octets))
			},
			IpEndpoint::V6(addr) => {
				let mut octets = addr.octets();
				decrement(&mut octets);
				IpEndpoint::V6(Ipv6Addr::from(octets))
			},
		}
	}

	/// The lexicographically next address within the same family. Wraps at
	/// the maximum.
	pub fn next(&self) -> IpEndpoint {
		match self {
			IpEndpoint::V4(addr) => {
				let mut octets = addr.octets();
				increment(&mut octets);
				IpEndpoint::V4(Ipv4Addr::from(octets))
			},
			IpEndpoint::V6(addr) => {
				let mut octets = addr.octets();
				increment(&mut octets);
				IpEndpoint::V6(Ipv6Addr::from(octets))
			},
		}
	}
}

fn decrement(octets: &mut [u8]) {
	for byte in octets.iter_mut().rev() {
		let (value, borrow) = byte.overflowing_sub(1);
		*byte = value;
		if !borrow {
			break;
		}
	}
}

fn increment(octets: &mut [u8]) {
	for byte in octets.iter_mut().rev() {
		let (value, carry) = byte.overflowing_add(1);
		*byte = value;
		if !carry {
			break;
		}
	}
}

impl FromStr for IpEndpoint {
	type Err = Error;

	fn from_str(value: &str) -> Result<IpEndpoint> {
		value
			.parse::<IpAddr>()
			.map(IpEndpoint::from)
			.map_err(|_| Error::InvalidEndpoint(value.to_string()))
	}
}

impl fmt::Display for IpEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			IpEndpoint::V4(addr) => addr.fmt(f),
			IpEndpoint::V6(addr) => addr.fmt(f),
		}
	}
}

impl From<IpAddr> for IpEndpoint {
	fn from(addr: IpAddr) -> IpEndpoint {
		match addr {
			IpAddr::V4(addr) => IpEndpoint::V4(addr),
			IpAddr::V6(addr) => IpEndpoint::V6(addr),
		}
	}
}

impl From<IpEndpoint> for IpAddr {
	fn from(endpoint: IpEndpoint) -> IpAddr {
		match endpoint {
			IpEndpoint::V4(addr) => IpAddr::V4(addr),
			IpEndpoint::V6(addr) => IpAddr::V6(addr),
		}
	}
}

impl From<Ipv4Addr> for IpEndpoint {
	fn from(addr: Ipv4Addr) -> IpEndpoint {
		IpEndpoint::V4(addr)
	}
}

impl From<Ipv6Addr> for IpEndpoint {
	fn from(addr: Ipv6Addr) -> IpEndpoint {
		IpEndpoint::V6(addr)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_both_families() {
		let v4: IpEndpoint = "192.0.2.1".parse().unwrap();
		assert_eq!(v4.version(), IpVersion::V4);
		assert_eq!(v4.to_string(), "192.0.2.1");
		let v6: IpEndpoint = "2001:db8::1".parse().unwrap();
		assert_eq!(v6.version(), IpVersion::V6);
		assert_eq!(v6.to_string(), "2001:db8::1");
		assert!(matches!(
			"not-an-address".parse::<IpEndpoint>(),
			Err(Error::InvalidEndpoint(_))
		));
	}

	#[test]
	fn prev_of_next_roundtrips() {
		for text in ["0.0.0.1", "192.0.2.255", "10.0.255.255", "2001:db8::ffff"] {
			let addr: IpEndpoint = text.parse().unwrap();
			assert_eq!(addr.next().prev(), addr, "{text}");
			assert_eq!(addr.prev().next(), addr, "{text}");
		}
	}

	#[test]
	fn next_carries_across_octets() {
		let addr: IpEndpoint = "10.0.0.255".parse().unwrap();
		assert_eq!(addr.next().to_string(), "10.0.1.0");
		let addr: IpEndpoint = "10.0.1.0".parse().unwrap();
		assert_eq!(addr.prev().to_string(), "10.0.0.255");
	}

	#[test]
	fn ordering_is_lexicographic() {
		let a: IpEndpoint = "10.0.0.1".parse().unwrap();
		let b: IpEndpoint = "10.0.0.2".parse().unwrap();
		let c: IpEndpoint = "9.255.255.255".parse().unwrap();
		assert!(a < b);
		assert!(c < a);
	}

	#[test]
	fn well_known_constants() {
		assert_eq!(IpEndpoint::ANY_V4.to_string(), "0.0.0.0");
		assert_eq!(IpEndpoint::LOOPBACK_V4.to_string(), "127.0.0.1");
		assert_eq!(IpEndpoint::LOOPBACK_V6.to_string(), "::1");
	}
}
