//! Address values, resolution, and the TCP engines.

pub mod ip;
pub mod resolve;
pub mod tcp;

pub use ip::{IpEndpoint, IpVersion};
pub use resolve::{
	Protocol, resolve_canonical, resolve_endpoints, resolve_name, resolve_service,
	resolve_service_name,
};
pub use tcp::{
	QosDrop, QosPriority, SocketOptions, TcpConnection, TcpEndpoint, TcpListener, TcpSocket,
};
