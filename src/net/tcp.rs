//! TCP sockets, connections and listeners as stream engines.
//!
//! Descriptors are always non-blocking and close-on-exec; there is no
//! benefit in blocking sockets for real applications. Blocking behavior is
//! layered on top through the stream's patience-driven retry loop.

use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use tracing::{debug, error};

use crate::chunk::{BulkSink, BulkSource};
use crate::engine::{Engine, INVALID_HANDLE};
use crate::error::{EngineError, Error, Result};
use crate::net::ip::{IpEndpoint, IpVersion};
use crate::patience::{Readiness, Wait};
use crate::stream::Stream;

/// An IP address paired with a TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpEndpoint {
	address: IpEndpoint,
	port: u16,
}

impl TcpEndpoint {
	pub const ANY: TcpEndpoint = TcpEndpoint {
		address: IpEndpoint::ANY_V4,
		port: 0,
	};

	pub fn new(address: IpEndpoint, port: u16) -> TcpEndpoint {
		TcpEndpoint { address, port }
	}

	pub fn address(&self) -> &IpEndpoint {
		&self.address
	}

	pub fn port(&self) -> u16 {
		self.port
	}
}

impl fmt::Display for TcpEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.address {
			IpEndpoint::V4(_) => write!(f, "{}:{}", self.address, self.port),
			IpEndpoint::V6(_) => write!(f, "[{}]:{}", self.address, self.port),
		}
	}
}

impl From<SocketAddr> for TcpEndpoint {
	fn from(addr: SocketAddr) -> TcpEndpoint {
		TcpEndpoint {
			address: IpEndpoint::from(addr.ip()),
			port: addr.port(),
		}
	}
}

impl From<TcpEndpoint> for SocketAddr {
	fn from(endpoint: TcpEndpoint) -> SocketAddr {
		SocketAddr::new(endpoint.address.into(), endpoint.port)
	}
}

/// Options applied between socket creation and bind. Additive; everything
/// defaults to off.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
	pub reuseaddr: bool,
	pub reuseport: bool,
	pub freebind: bool,
}

/// Priority class of the DSCP assured-forwarding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosPriority {
	Class1,
	Class2,
	Class3,
	Class4,
}

/// Drop precedence within a priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosDrop {
	Low,
	Med,
	High,
}

// assured-forwarding DSCP code points, from low-drop to high-drop
const DSCP_TABLE: [[u32; 3]; 4] = [
	[0x28, 0x30, 0x38], // class 1
	[0x48, 0x50, 0x58], // class 2
	[0x68, 0x70, 0x78], // class 3
	[0x88, 0x90, 0x98], // class 4
];

fn dscp_lookup(priority: QosPriority, drop: QosDrop) -> u32 {
	let row = match priority {
		QosPriority::Class1 => 0,
		QosPriority::Class2 => 1,
		QosPriority::Class3 => 2,
		QosPriority::Class4 => 3,
	};
	let col = match drop {
		QosDrop::Low => 0,
		QosDrop::Med => 1,
		QosDrop::High => 2,
	};
	DSCP_TABLE[row][col]
}

/// The shared descriptor holder. Accept and connect transitions hand the
/// holder from socket to connection so the descriptor's identity is
/// preserved; close goes through exactly one place.
struct SocketHolder {
	endpoint: TcpEndpoint,
	sock: Mutex<Option<Socket>>,
	raw: AtomicI32,
}

impl SocketHolder {
	fn create(endpoint: TcpEndpoint, version: IpVersion) -> Result<SocketHolder> {
		let domain = match version {
			IpVersion::V4 => Domain::IPV4,
			IpVersion::V6 => Domain::IPV6,
		};
		let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
			.map_err(|e| Error::sys("tcp-socket-creation", e))?;
		sock
			.set_nonblocking(true)
			.map_err(|e| Error::sys("tcp-socket-creation", e))?;
		Ok(SocketHolder::adopt(endpoint, sock))
	}

	fn adopt(endpoint: TcpEndpoint, sock: Socket) -> SocketHolder {
		let raw = sock.as_raw_fd();
		SocketHolder {
			endpoint,
			sock: Mutex::new(Some(sock)),
			raw: AtomicI32::new(raw),
		}
	}

	fn raw_fd(&self) -> RawFd {
		self.raw.load(Ordering::Acquire)
	}

	fn with_sock<T>(
		&self,
		label: &'static str,
		f: impl FnOnce(&Socket) -> std::io::Result<T>,
	) -> Result<T> {
		let guard = self
			.sock
			.lock()
			.map_err(|_| Error::runtime("poisoned-socket-holder"))?;
		let sock = guard
			.as_ref()
			.ok_or_else(|| Error::runtime("invalid-socket-state"))?;
		f(sock).map_err(|e| Error::sys(label, e))
	}

	fn getsockopt_int(&self, level: libc::c_int, option: libc::c_int) -> Result<libc::c_int> {
		let fd = self.raw_fd();
		let mut value: libc::c_int = 0;
		let mut length = mem::size_of::<libc::c_int>() as libc::socklen_t;
		let rv = unsafe {
			libc::getsockopt(
				fd,
				level,
				option,
				&mut value as *mut libc::c_int as *mut libc::c_void,
				&mut length,
			)
		};
		if rv != 0 {
			return Err(Error::last_os("query-socket-option"));
		}
		Ok(value)
	}

	/// Releases the descriptor. With `reset`, linger is zeroed first so the
	/// peer most likely observes a connection reset. A close failure leaves
	/// the process in an unknown descriptor state and is fatal.
	fn close_now(&self, reset: bool) -> Result<()> {
		let mut guard = self
			.sock
			.lock()
			.map_err(|_| Error::runtime("poisoned-socket-holder"))?;
		let sock = guard
			.take()
			.ok_or_else(|| Error::runtime("invalid-socket-state"))?;
		self.raw.store(INVALID_HANDLE, Ordering::Release);
		if reset {
			sock
				.set_linger(Some(Duration::ZERO))
				.map_err(|e| Error::sys("tcp-linger-reset", e))?;
		}
		let fd = sock.into_raw_fd();
		if unsafe { libc::close(fd) } != 0 {
			error!(fd, errno = ?std::io::Error::last_os_error(), "closing a socket descriptor failed");
			std::process::abort();
		}
		Ok(())
	}

	fn is_open(&self) -> bool {
		self.raw_fd() != INVALID_HANDLE
	}
}

impl Drop for SocketHolder {
	fn drop(&mut self) {
		if self.is_open() {
			let _ = self.close_now(false);
		}
	}
}

impl fmt::Debug for SocketHolder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SocketHolder")
			.field("endpoint", &self.endpoint)
			.field("fd", &self.raw_fd())
			.finish()
	}
}

/// Retries once on `EINTR` (non-blocking descriptors should not see it at
/// all), maps `EAGAIN`/`EWOULDBLOCK` to the transient signal, everything
/// else to a fatal error.
fn transfer(
	label: &'static str,
	unavailable: fn() -> EngineError,
	mut op: impl FnMut() -> libc::ssize_t,
) -> Result<usize, EngineError> {
	let mut restarted = false;
	loop {
		let rv = op();
		if rv != -1 {
			return Ok(rv as usize);
		}
		let err = std::io::Error::last_os_error();
		match err.raw_os_error() {
			Some(libc::EINTR) if !restarted => restarted = true,
			Some(libc::EAGAIN) => return Err(unavailable()),
			#[allow(unreachable_patterns)] // EWOULDBLOCK aliases EAGAIN on linux
			Some(libc::EWOULDBLOCK) => return Err(unavailable()),
			_ => return Err(EngineError::Fatal(Error::sys(label, err))),
		}
	}
}

/// The concrete engine over a connected TCP descriptor.
struct TcpEngine {
	socket: Arc<SocketHolder>,
	remote: TcpEndpoint,
}

impl TcpEngine {
	fn new(socket: Arc<SocketHolder>, remote: TcpEndpoint) -> TcpEngine {
		TcpEngine { socket, remote }
	}
}

impl Engine for TcpEngine {
	fn shutdown(&self) -> Result<(), EngineError> {
		// only the sending side: SHUT_RD appears to have no effect for TCP
		self
			.socket
			.with_sock("tcp-connection-shutdown", |s| {
				s.shutdown(std::net::Shutdown::Write)
			})
			.map_err(EngineError::Fatal)
	}

	fn hard_close(&self) -> Result<(), EngineError> {
		self.socket.close_now(false).map_err(EngineError::Fatal)
	}

	fn read_some(&self, chunk: &mut [u8]) -> Result<usize, EngineError> {
		let fd = self.socket.raw_fd();
		transfer("tcp-connection-read", || EngineError::Unreadable, || unsafe {
			libc::recv(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len(), 0)
		})
	}

	fn write_some(&self, chunk: &[u8]) -> Result<usize, EngineError> {
		let fd = self.socket.raw_fd();
		transfer("tcp-connection-write", || EngineError::Unwritable, || unsafe {
			libc::send(
				fd,
				chunk.as_ptr() as *const libc::c_void,
				chunk.len(),
				libc::MSG_NOSIGNAL,
			)
		})
	}

	fn read_some_bulk(&self, chunks: &mut BulkSink<'_, '_>) -> Result<usize, EngineError> {
		let fd = self.socket.raw_fd();
		let mut iov = chunks.iovecs();
		transfer("tcp-connection-readv", || EngineError::Unreadable, || {
			let mut msg: libc::msghdr = unsafe { mem::zeroed() };
			msg.msg_iov = iov.as_mut_ptr();
			msg.msg_iovlen = iov.len() as _;
			unsafe { libc::recvmsg(fd, &mut msg, 0) }
		})
	}

	fn write_some_bulk(&self, chunks: &mut BulkSource<'_, '_>) -> Result<usize, EngineError> {
		let fd = self.socket.raw_fd();
		let mut iov = chunks.iovecs();
		transfer("tcp-connection-writev", || EngineError::Unwritable, || {
			let mut msg: libc::msghdr = unsafe { mem::zeroed() };
			msg.msg_iov = iov.as_mut_ptr();
			msg.msg_iovlen = iov.len() as _;
			unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) }
		})
	}

	fn downgrade(&mut self) -> Result<Box<dyn Engine>, EngineError> {
		Err(EngineError::runtime("tcp-engine-has-no-inner-engine"))
	}

	fn underlying(&self) -> &dyn Engine {
		self
	}

	fn native_handle(&self) -> RawFd {
		self.socket.raw_fd()
	}
}

impl Drop for TcpEngine {
	fn drop(&mut self) {
		// a connection dropped while open goes away abortively
		if self.socket.is_open() {
			if let Err(err) = self.socket.close_now(true) {
				debug!(%err, remote = %self.remote, "reset-close on drop failed");
			}
		}
	}
}

/// An unconnected TCP socket: the starting point for both connect and
/// listen.
pub struct TcpSocket {
	holder: Arc<SocketHolder>,
}

impl TcpSocket {
	/// An unbound socket of the given family.
	pub fn new(version: IpVersion) -> Result<TcpSocket> {
		Ok(TcpSocket {
			holder: Arc::new(SocketHolder::create(TcpEndpoint::ANY, version)?),
		})
	}

	/// A socket bound to `endpoint` after applying `options`. IPv6 sockets
	/// are restricted to IPv6 only.
	pub fn bound(endpoint: TcpEndpoint, options: SocketOptions) -> Result<TcpSocket> {
		let holder = SocketHolder::create(endpoint, endpoint.address().version())?;
		holder.with_sock("tcp-socket-options", |s| {
			if options.reuseaddr {
				s.set_reuse_address(true)?;
			}
			if options.reuseport {
				s.set_reuse_port(true)?;
			}
			if options.freebind {
				s.set_freebind(true)?;
			}
			if endpoint.address().version() == IpVersion::V6 {
				s.set_only_v6(true)?;
			}
			Ok(())
		})?;
		holder.with_sock("tcp-socket-bind", |s| {
			s.bind(&SockAddr::from(SocketAddr::from(endpoint)))
		})?;
		Ok(TcpSocket {
			holder: Arc::new(holder),
		})
	}

	/// The endpoint this socket was bound to (port 0 until bound).
	pub fn endpoint(&self) -> &TcpEndpoint {
		&self.holder.endpoint
	}

	/// The endpoint actually assigned by the kernel.
	pub fn local(&self) -> Result<TcpEndpoint> {
		local_endpoint(&self.holder)
	}

	/// Establishes a connection, waiting for the handshake through the
	/// patience. Nagle's algorithm is disabled on success.
	pub fn connect(self, remote: TcpEndpoint, patience: &mut dyn Wait) -> Result<TcpConnection> {
		let addr = SockAddr::from(SocketAddr::from(remote));
		loop {
			let outcome = self.holder.with_sock("tcp-socket-connect", |s| {
				match s.connect(&addr) {
					Ok(()) => Ok(ConnectProgress::Done),
					Err(e) => match e.raw_os_error() {
						Some(libc::EINPROGRESS) => Ok(ConnectProgress::InProgress),
						Some(libc::EINTR) => Ok(ConnectProgress::Interrupted),
						_ => Err(e),
					},
				}
			})?;
			match outcome {
				ConnectProgress::Done => break,
				ConnectProgress::Interrupted => continue,
				ConnectProgress::InProgress => {
					patience.wait(self.holder.raw_fd(), Readiness::Write)?;
					let error = self.holder.getsockopt_int(libc::SOL_SOCKET, libc::SO_ERROR)?;
					if error != 0 {
						return Err(Error::sys(
							"tcp-socket-connect",
							std::io::Error::from_raw_os_error(error),
						));
					}
					break;
				},
			}
		}
		self
			.holder
			.with_sock("tcp-socket-connect", |s| s.set_nodelay(true))?;
		debug!(%remote, "connected");
		Ok(TcpConnection::new(self.holder, remote))
	}

	/// Starts listening, turning the socket into a listener.
	pub fn listen(self, backlog: i32) -> Result<TcpListener> {
		self
			.holder
			.with_sock("tcp-socket-listen", |s| s.listen(backlog))?;
		Ok(TcpListener {
			holder: self.holder,
		})
	}
}

enum ConnectProgress {
	Done,
	InProgress,
	Interrupted,
}

enum AcceptProgress {
	Accepted((Socket, SockAddr)),
	Unready,
	Interrupted,
}

/// A listening socket producing connections.
pub struct TcpListener {
	holder: Arc<SocketHolder>,
}

impl TcpListener {
	/// Accepts one connection, waiting through the patience once per unready
	/// attempt. Several threads may accept on the same listener; the
	/// kernel's wakeup order is not fair, and a woken thread that loses the
	/// race simply waits again.
	pub fn accept(&self, patience: &mut dyn Wait) -> Result<TcpConnection> {
		loop {
			let outcome = self.holder.with_sock("tcp-listener-accept", |s| {
				match s.accept() {
					Ok(accepted) => Ok(AcceptProgress::Accepted(accepted)),
					Err(e)
						if matches!(
							e.raw_os_error(),
							Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
						) =>
					{
						Ok(AcceptProgress::Unready)
					},
					Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
						Ok(AcceptProgress::Interrupted)
					},
					Err(e) => Err(e),
				}
			});
			match outcome? {
				AcceptProgress::Accepted((sock, addr)) => {
					let remote = addr
						.as_socket()
						.map(TcpEndpoint::from)
						.ok_or_else(|| Error::runtime("unexpected-accepted-address-family"))?;
					sock
						.set_nonblocking(true)
						.and_then(|()| sock.set_nodelay(true))
						.map_err(|e| Error::sys("tcp-listener-accept", e))?;
					debug!(%remote, "accepted");
					let holder = Arc::new(SocketHolder::adopt(self.holder.endpoint, sock));
					return Ok(TcpConnection::new(holder, remote));
				},
				AcceptProgress::Unready => {
					patience.wait(self.holder.raw_fd(), Readiness::Read)?;
				},
				AcceptProgress::Interrupted => {},
			}
		}
	}

	/// The endpoint the listener is bound to.
	pub fn local(&self) -> Result<TcpEndpoint> {
		local_endpoint(&self.holder)
	}
}

fn local_endpoint(holder: &Arc<SocketHolder>) -> Result<TcpEndpoint> {
	let addr = holder.with_sock("endpoint-identification", |s| s.local_addr())?;
	addr
		.as_socket()
		.map(TcpEndpoint::from)
		.ok_or_else(|| Error::runtime("unexpected-local-address-family"))
}

/// An established connection: a stream over a TCP engine, plus the
/// connection-level controls that survive engine upgrades.
pub struct TcpConnection {
	stream: Stream,
	socket: Arc<SocketHolder>,
	remote: TcpEndpoint,
}

impl TcpConnection {
	fn new(socket: Arc<SocketHolder>, remote: TcpEndpoint) -> TcpConnection {
		let engine = TcpEngine::new(socket.clone(), remote);
		TcpConnection {
			stream: Stream::new(Box::new(engine)),
			socket,
			remote,
		}
	}

	/// The local endpoint as reported by the kernel.
	pub fn local(&self) -> Result<TcpEndpoint> {
		local_endpoint(&self.socket)
	}

	/// The remote endpoint captured at connect/accept time.
	pub fn remote(&self) -> &TcpEndpoint {
		&self.remote
	}

	/// Sets the IP type-of-service byte from the assured-forwarding DSCP
	/// table.
	pub fn qos(&self, priority: QosPriority, drop: QosDrop) -> Result<()> {
		let value = dscp_lookup(priority, drop);
		self
			.socket
			.with_sock("tcp-connection-qos", |s| s.set_tos(value))
	}

	/// Enables keepalive probing with the given idle time, probe count and
	/// probe interval.
	pub fn keepalive(&self, idle: Duration, probes: u32, interval: Duration) -> Result<()> {
		let params = TcpKeepalive::new()
			.with_time(idle)
			.with_interval(interval)
			.with_retries(probes);
		self.socket.with_sock("tcp-connection-keepalive", |s| {
			s.set_keepalive(true)?;
			s.set_tcp_keepalive(&params)
		})
	}

	/// The CPU the socket last received traffic on.
	pub fn incoming_cpu(&self) -> Result<i32> {
		self
			.socket
			.getsockopt_int(libc::SOL_SOCKET, libc::SO_INCOMING_CPU)
	}

	/// Shuts down, drains, and closes; see [`Stream::graceful_close`].
	pub fn graceful_close(self, patience: &mut dyn Wait) -> Result<()> {
		self.stream.graceful_close(patience)
	}

	pub fn into_stream(self) -> Stream {
		self.stream
	}
}

impl Deref for TcpConnection {
	type Target = Stream;

	fn deref(&self) -> &Stream {
		&self.stream
	}
}

impl DerefMut for TcpConnection {
	fn deref_mut(&mut self) -> &mut Stream {
		&mut self.stream
	}
}

impl fmt::Debug for TcpConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TcpConnection")
			.field("socket", &self.socket)
			.field("remote", &self.remote)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_display_brackets_v6() {
		let v4 = TcpEndpoint::new("127.0.0.1".parse().unwrap(), 8080);
		assert_eq!(v4.to_string(), "127.0.0.1:8080");
		let v6 = TcpEndpoint::new("::1".parse().unwrap(), 443);
		assert_eq!(v6.to_string(), "[::1]:443");
	}

	#[test]
	fn endpoint_roundtrips_through_socketaddr() {
		let endpoint = TcpEndpoint::new("192.0.2.7".parse().unwrap(), 1234);
		let addr = SocketAddr::from(endpoint);
		assert_eq!(TcpEndpoint::from(addr), endpoint);
	}

	#[test]
	fn dscp_table_matches_assured_forwarding() {
		assert_eq!(dscp_lookup(QosPriority::Class1, QosDrop::Low), 0x28);
		assert_eq!(dscp_lookup(QosPriority::Class4, QosDrop::High), 0x98);
		assert_eq!(dscp_lookup(QosPriority::Class2, QosDrop::Med), 0x50);
	}

	#[test]
	fn bound_socket_reports_local_endpoint() {
		let endpoint = TcpEndpoint::new(IpEndpoint::LOOPBACK_V4, 0);
		let socket = TcpSocket::bound(
			endpoint,
			SocketOptions {
				reuseaddr: true,
				..Default::default()
			},
		)
		.unwrap();
		let local = socket.local().unwrap();
		assert_eq!(*local.address(), IpEndpoint::LOOPBACK_V4);
		assert_ne!(local.port(), 0);
	}
}
