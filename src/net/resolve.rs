//! Host, address and service resolution over the platform resolver.

use std::ffi::{CStr, CString};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ptr;

use crate::error::{Error, Result};
use crate::net::ip::IpEndpoint;

/// `NI_MAXSERV` as defined by POSIX `<netdb.h>`; not exposed by the `libc` crate for this target.
const NI_MAXSERV: usize = 32;

/// The protocols service names resolve under. Only service-name resolution
/// is offered for datagram use; there are no datagram sockets here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Tcp,
	Udp,
}

impl Protocol {
	fn sock_type(self) -> libc::c_int {
		match self {
			Protocol::Tcp => libc::SOCK_STREAM,
			Protocol::Udp => libc::SOCK_DGRAM,
		}
	}

	fn ni_flags(self) -> libc::c_int {
		match self {
			Protocol::Tcp => 0,
			Protocol::Udp => libc::NI_DGRAM,
		}
	}
}

/// Owns an `addrinfo` list for the duration of one lookup.
struct AddrInfoList {
	head: *mut libc::addrinfo,
}

impl AddrInfoList {
	fn iter(&self) -> AddrInfoIter<'_> {
		AddrInfoIter {
			next: self.head,
			_list: self,
		}
	}
}

impl Drop for AddrInfoList {
	fn drop(&mut self) {
		if !self.head.is_null() {
			unsafe { libc::freeaddrinfo(self.head) };
		}
	}
}

struct AddrInfoIter<'a> {
	next: *mut libc::addrinfo,
	_list: &'a AddrInfoList,
}

impl<'a> Iterator for AddrInfoIter<'a> {
	type Item = &'a libc::addrinfo;

	fn next(&mut self) -> Option<&'a libc::addrinfo> {
		if self.next.is_null() {
			return None;
		}
		let current = unsafe { &*self.next };
		self.next = current.ai_next;
		Some(current)
	}
}

fn resolver_error(label: &str, rv: libc::c_int) -> Error {
	let detail = unsafe { CStr::from_ptr(libc::gai_strerror(rv)) };
	Error::Resolver(format!("{label}: {}", detail.to_string_lossy()))
}

fn getaddrinfo(
	node: Option<&str>,
	service: Option<&str>,
	hints: &libc::addrinfo,
) -> Result<AddrInfoList, libc::c_int> {
	let node = node.map(|n| CString::new(n).map_err(|_| libc::EAI_NONAME));
	let node = match node {
		Some(Ok(node)) => Some(node),
		Some(Err(rv)) => return Err(rv),
		None => None,
	};
	let service = service.map(|s| CString::new(s).map_err(|_| libc::EAI_NONAME));
	let service = match service {
		Some(Ok(service)) => Some(service),
		Some(Err(rv)) => return Err(rv),
		None => None,
	};
	let mut head = ptr::null_mut();
	let rv = unsafe {
		libc::getaddrinfo(
			node.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
			service.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
			hints,
			&mut head,
		)
	};
	if rv == 0 {
		Ok(AddrInfoList { head })
	} else {
		Err(rv)
	}
}

fn host_hints(flags: libc::c_int) -> libc::addrinfo {
	let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
	hints.ai_flags = libc::AI_ADDRCONFIG | flags;
	hints.ai_family = libc::AF_UNSPEC;
	// without a socket type the resolver reports one record per type
	hints.ai_socktype = libc::SOCK_STREAM;
	hints
}

fn endpoint_from_addrinfo(info: &libc::addrinfo) -> Option<IpEndpoint> {
	match info.ai_family {
		libc::AF_INET => {
			let addr = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
			let octets = addr.sin_addr.s_addr.to_ne_bytes();
			Some(IpEndpoint::V4(Ipv4Addr::from(octets)))
		},
		libc::AF_INET6 => {
			let addr = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
			Some(IpEndpoint::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)))
		},
		// other address families are ignored
		_ => None,
	}
}

/// Resolves the canonical name of a host.
pub fn resolve_canonical(name: &str) -> Result<String> {
	let list = getaddrinfo(Some(name), None, &host_hints(libc::AI_CANONNAME))
		.map_err(|rv| resolver_error("canonical-host-lookup", rv))?;
	let canonical = list
		.iter()
		.next()
		.and_then(|info| {
			if info.ai_canonname.is_null() {
				None
			} else {
				Some(unsafe { CStr::from_ptr(info.ai_canonname) })
			}
		})
		.ok_or_else(|| Error::Resolver(format!("no canonical name for {name}")))?;
	Ok(canonical.to_string_lossy().into_owned())
}

/// Resolves all A/AAAA answers for a host name; other families are ignored.
pub fn resolve_endpoints(name: &str) -> Result<Vec<IpEndpoint>> {
	match getaddrinfo(Some(name), None, &host_hints(0)) {
		Ok(list) => Ok(list.iter().filter_map(endpoint_from_addrinfo).collect()),
		#[cfg(target_os = "linux")]
		Err(libc::EAI_NODATA) => Ok(Vec::new()),
		Err(rv) => Err(resolver_error("host-lookup", rv)),
	}
}

/// Reverse-resolves an address to a host name; fails when none exists.
pub fn resolve_name(endpoint: &IpEndpoint) -> Result<String> {
	let mut host = vec![0 as libc::c_char; libc::NI_MAXHOST as usize];
	let rv = match endpoint {
		IpEndpoint::V4(addr) => {
			let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
			sa.sin_family = libc::AF_INET as libc::sa_family_t;
			sa.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());
			unsafe {
				libc::getnameinfo(
					&sa as *const libc::sockaddr_in as *const libc::sockaddr,
					mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
					host.as_mut_ptr(),
					host.len() as libc::socklen_t,
					ptr::null_mut(),
					0,
					libc::NI_NAMEREQD,
				)
			}
		},
		IpEndpoint::V6(addr) => {
			let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
			sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
			sa.sin6_addr.s6_addr = addr.octets();
			unsafe {
				libc::getnameinfo(
					&sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
					mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
					host.as_mut_ptr(),
					host.len() as libc::socklen_t,
					ptr::null_mut(),
					0,
					libc::NI_NAMEREQD,
				)
			}
		},
	};
	if rv != 0 {
		return Err(resolver_error("address-lookup", rv));
	}
	let host = unsafe { CStr::from_ptr(host.as_ptr()) };
	Ok(host.to_string_lossy().into_owned())
}

/// Resolves a service name to a port for the given protocol. All resolver
/// answers must agree on the port; an unknown name is an
/// [`Error::InvalidService`].
pub fn resolve_service(name: &str, protocol: Protocol) -> Result<u16> {
	let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
	hints.ai_flags = libc::AI_ADDRCONFIG;
	hints.ai_family = libc::AF_UNSPEC;
	hints.ai_socktype = protocol.sock_type();
	let list = match getaddrinfo(None, Some(name), &hints) {
		Ok(list) => list,
		Err(rv) if rv == libc::EAI_NONAME || rv == libc::EAI_SERVICE => {
			return Err(Error::InvalidService(name.to_string()));
		},
		Err(rv) => return Err(resolver_error("service-lookup", rv)),
	};
	let mut port: Option<u16> = None;
	for info in list.iter() {
		if info.ai_socktype != protocol.sock_type() {
			continue;
		}
		let current = match info.ai_family {
			libc::AF_INET => {
				let addr = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
				u16::from_be(addr.sin_port)
			},
			libc::AF_INET6 => {
				let addr = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
				u16::from_be(addr.sin6_port)
			},
			_ => continue,
		};
		match port {
			None => port = Some(current),
			Some(previous) if previous == current => {},
			Some(previous) => {
				return Err(Error::Resolver(format!(
					"service {name} resolves to conflicting ports {previous} and {current}"
				)));
			},
		}
	}
	port.ok_or_else(|| Error::InvalidService(name.to_string()))
}

/// Resolves a port back to a service name for the given protocol.
pub fn resolve_service_name(port: u16, protocol: Protocol) -> Result<String> {
	let mut service = vec![0 as libc::c_char; NI_MAXSERV];
	let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
	sa.sin_family = libc::AF_INET as libc::sa_family_t;
	sa.sin_port = port.to_be();
	let rv = unsafe {
		libc::getnameinfo(
			&sa as *const libc::sockaddr_in as *const libc::sockaddr,
			mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
			ptr::null_mut(),
			0,
			service.as_mut_ptr(),
			service.len() as libc::socklen_t,
			protocol.ni_flags(),
		)
	};
	if rv == libc::EAI_NONAME {
		return Err(Error::InvalidService(port.to_string()));
	} else if rv != 0 {
		return Err(resolver_error("port-lookup", rv));
	}
	let service = unsafe { CStr::from_ptr(service.as_ptr()) };
	Ok(service.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn localhost_resolves_to_loopback() {
		// with address-configuration filtering, a loopback-only host may
		// legitimately report no answers at all
		let endpoints = resolve_endpoints("localhost").expect("resolve localhost");
		assert!(
			endpoints
				.iter()
				.all(|e| matches!(e, IpEndpoint::V4(a) if a.is_loopback())
					|| matches!(e, IpEndpoint::V6(a) if a.is_loopback()))
		);
	}

	#[test]
	fn unknown_service_is_invalid() {
		let err = resolve_service("no-such-service-wirebound", Protocol::Tcp).unwrap_err();
		assert!(matches!(
			err,
			Error::InvalidService(_) | Error::Resolver(_)
		));
	}

	#[test]
	fn tcp_and_udp_service_ports() {
		// well-known entries present in any services database
		if let Ok(port) = resolve_service("http", Protocol::Tcp) {
			assert_eq!(port, 80);
		}
		if let Ok(port) = resolve_service("domain", Protocol::Udp) {
			assert_eq!(port, 53);
		}
	}
}
