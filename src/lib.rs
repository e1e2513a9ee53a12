//! Synchronous byte-stream engines over non-blocking descriptors.
//!
//! The central abstraction is the [`Engine`]: a polymorphic stream end that
//! never blocks and signals unavailability instead. A [`Stream`] owns one
//! engine and turns it into a blocking interface by waiting through a
//! [`Patience`] (the deadline policy governing every blocking operation)
//! and retrying. TCP connect/accept produce engines; a TLS context wraps an
//! existing engine with a cryptographic one, and `downgrade` peels it off
//! again after a clean session shutdown.
//!
//! ```no_run
//! use std::time::Duration;
//! use wirebound::{Buffer, Patience, SocketOptions, TcpEndpoint, TcpSocket};
//!
//! fn echo_once(endpoint: TcpEndpoint) -> wirebound::Result<()> {
//! 	let listener = TcpSocket::bound(endpoint, SocketOptions::default())?.listen(1)?;
//! 	let mut patience = Patience::deadline_after(Duration::from_secs(30))?;
//! 	let connection = listener.accept(&mut patience)?;
//! 	let mut buffer = Buffer::new();
//! 	loop {
//! 		buffer.reserve(1 << 14);
//! 		let count = connection.read_some(buffer.cold(), &mut patience)?;
//! 		if count == 0 {
//! 			break;
//! 		}
//! 		buffer.produce(count)?;
//! 		while buffer.available() > 0 {
//! 			let written = connection.write_some(buffer.warm(), &mut patience)?;
//! 			buffer.consume(written)?;
//! 		}
//! 	}
//! 	connection.graceful_close(&mut patience)
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod net;
pub mod patience;
pub mod stream;
pub mod tls;

pub use buffer::Buffer;
pub use chunk::{BulkSink, BulkSource};
pub use engine::{Engine, INVALID_HANDLE};
pub use error::{EngineError, Error, Result};
pub use net::{
	IpEndpoint, IpVersion, Protocol, QosDrop, QosPriority, SocketOptions, TcpConnection,
	TcpEndpoint, TcpListener, TcpSocket,
};
pub use patience::{DeadlinePatience, Patience, Readiness, SteadyPatience, Wait};
pub use stream::Stream;
pub use tls::{
	Authority, Certificate, ClientContext, Identity, SecureContext, ServerContext, SniDecision,
	TlsOptions, VerifyCallback,
};
