//! The TLS engine decorator.
//!
//! The record layer is sans-IO: it is fed wire bytes through the lower
//! engine and signals `want read`/`want write` through `WouldBlock`. The
//! bridge types translate between the lower engine's transient signals and
//! the record layer's I/O expectations, and the outer retry loop (handshake
//! here, the stream everywhere else) waits through a patience.

use std::io;
use std::io::{Read as _, Write as _};
use std::mem;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};

use rustls::Connection;
use tracing::{debug, trace};

use crate::chunk::{BulkSink, BulkSource};
use crate::engine::{Engine, INVALID_HANDLE};
use crate::error::{EngineError, Error, Result};
use crate::patience::{Readiness, Wait};

/// Session state tracked by the sentry.
///
/// The record layer's calls are stateful: after a transient failure the
/// caller must retry the exact same operation before anything else is
/// allowed. The sentry enforces this: re-entering under a different
/// operation while one is in progress is a hard runtime error, not a
/// recoverable condition. After a completed bidirectional shutdown, reads
/// emulate a half-closed socket and everything else reports the session as
/// shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Good,
	Bad,
	ReadInProgress,
	WriteInProgress,
	ShutdownInProgress,
	ShutdownCompleted,
}

struct TlsSession {
	conn: Connection,
	state: State,
	/// Plaintext already accepted by the record layer for an in-flight
	/// write. A retried `write_some` flushes instead of re-buffering.
	pending_write: usize,
	close_notify_sent: bool,
}

pub(crate) struct TlsEngine {
	session: Mutex<TlsSession>,
	lower: Option<Box<dyn Engine>>,
}

/// Forwards record-layer reads to the lower engine, translating transient
/// signals into `WouldBlock` and remembering which readiness was missing.
struct WireRead<'a> {
	engine: &'a dyn Engine,
	blocked: Option<Readiness>,
}

impl io::Read for WireRead<'_> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self.engine.read_some(buf) {
			Ok(n) => Ok(n),
			Err(EngineError::Unreadable) => {
				self.blocked = Some(Readiness::Read);
				Err(io::ErrorKind::WouldBlock.into())
			},
			Err(EngineError::Unwritable) => {
				self.blocked = Some(Readiness::Write);
				Err(io::ErrorKind::WouldBlock.into())
			},
			Err(err) => Err(io::Error::other(err)),
		}
	}
}

struct WireWrite<'a> {
	engine: &'a dyn Engine,
	blocked: Option<Readiness>,
}

impl io::Write for WireWrite<'_> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.engine.write_some(buf) {
			Ok(n) => Ok(n),
			Err(EngineError::Unreadable) => {
				self.blocked = Some(Readiness::Read);
				Err(io::ErrorKind::WouldBlock.into())
			},
			Err(EngineError::Unwritable) => {
				self.blocked = Some(Readiness::Write);
				Err(io::ErrorKind::WouldBlock.into())
			},
			Err(err) => Err(io::Error::other(err)),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// Drives the handshake to completion, waiting through the patience
/// whenever the record layer needs the wire.
pub(crate) fn drive_handshake(
	conn: &mut Connection,
	lower: &dyn Engine,
	patience: &mut dyn Wait,
) -> Result<()> {
	loop {
		while conn.wants_write() {
			let mut bridge = WireWrite {
				engine: lower,
				blocked: None,
			};
			match conn.write_tls(&mut bridge) {
				Ok(_) => {},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
					let readiness = bridge.blocked.unwrap_or(Readiness::Write);
					patience.wait(lower.native_handle(), readiness)?;
				},
				Err(e) => return Err(Error::sys("tls-handshake-write", e)),
			}
		}
		if !conn.is_handshaking() {
			debug!(
				protocol = ?conn.protocol_version(),
				cipher = ?conn.negotiated_cipher_suite(),
				"tls handshake completed"
			);
			return Ok(());
		}
		let mut bridge = WireRead {
			engine: lower,
			blocked: None,
		};
		match conn.read_tls(&mut bridge) {
			Ok(0) => return Err(Error::runtime("peer-closed-during-tls-handshake")),
			Ok(_) => {
				if let Err(err) = conn.process_new_packets() {
					// flush the alert describing the failure before giving up
					flush_best_effort(conn, lower);
					return Err(Error::Tls(err));
				}
			},
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				let readiness = bridge.blocked.unwrap_or(Readiness::Read);
				patience.wait(lower.native_handle(), readiness)?;
			},
			Err(e) => return Err(Error::sys("tls-handshake-read", e)),
		}
	}
}

fn flush_best_effort(conn: &mut Connection, lower: &dyn Engine) {
	while conn.wants_write() {
		let mut bridge = WireWrite {
			engine: lower,
			blocked: None,
		};
		if conn.write_tls(&mut bridge).is_err() {
			break;
		}
	}
}

/// Reads the ClientHello off the wire so the hostname the client offered
/// can steer the choice of context before the handshake proper.
pub(crate) fn read_client_hello(
	lower: &dyn Engine,
	patience: &mut dyn Wait,
) -> Result<rustls::server::Accepted> {
	let mut acceptor = rustls::server::Acceptor::default();
	loop {
		let mut bridge = WireRead {
			engine: lower,
			blocked: None,
		};
		match acceptor.read_tls(&mut bridge) {
			Ok(0) => return Err(Error::runtime("peer-closed-during-tls-handshake")),
			Ok(_) => {},
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				let readiness = bridge.blocked.unwrap_or(Readiness::Read);
				patience.wait(lower.native_handle(), readiness)?;
				continue;
			},
			Err(e) => return Err(Error::sys("tls-accept-read", e)),
		}
		match acceptor.accept() {
			Ok(Some(accepted)) => return Ok(accepted),
			Ok(None) => {},
			Err((err, alert)) => {
				send_alert(lower, alert);
				return Err(Error::Tls(err));
			},
		}
	}
}

/// Builds the server connection for an accepted ClientHello, forwarding the
/// refusal alert if the config rejects it.
pub(crate) fn accept_connection(
	accepted: rustls::server::Accepted,
	config: std::sync::Arc<rustls::ServerConfig>,
	lower: &dyn Engine,
) -> Result<rustls::ServerConnection> {
	match accepted.into_connection(config) {
		Ok(conn) => Ok(conn),
		Err((err, alert)) => {
			send_alert(lower, alert);
			Err(Error::Tls(err))
		},
	}
}

/// Best effort: the peer deserves to hear why the handshake failed, but a
/// congested or dead wire must not mask the original error.
fn send_alert(lower: &dyn Engine, mut alert: rustls::server::AcceptedAlert) {
	let mut bridge = WireWrite {
		engine: lower,
		blocked: None,
	};
	loop {
		match alert.write(&mut bridge) {
			Ok(0) | Err(_) => break,
			Ok(_) => {},
		}
	}
}

/// Performs the handshake over `lower` and wraps it with the TLS engine.
pub(crate) fn establish(
	mut conn: Connection,
	lower: Box<dyn Engine>,
	patience: &mut dyn Wait,
	require_peer_cert: bool,
) -> Result<Box<dyn Engine>> {
	drive_handshake(&mut conn, lower.as_ref(), patience)?;
	// the verifiers enforced this during the handshake; double-check the
	// post-conditions all the same
	if require_peer_cert && conn.peer_certificates().is_none_or(|c| c.is_empty()) {
		return Err(Error::runtime("tls-missing-peer-certificate"));
	}
	Ok(Box::new(TlsEngine {
		session: Mutex::new(TlsSession {
			conn,
			state: State::Good,
			pending_write: 0,
			close_notify_sent: false,
		}),
		lower: Some(lower),
	}))
}

enum Filled {
	Records,
	Eof,
}

impl TlsEngine {
	fn lower(&self) -> Result<&dyn Engine, EngineError> {
		self
			.lower
			.as_deref()
			.ok_or_else(|| EngineError::runtime("tls-engine-already-downgraded"))
	}

	/// Takes the session lock and checks the state against the attempted
	/// operation; see [`State`].
	fn sentry(&self, expected: State) -> Result<MutexGuard<'_, TlsSession>, EngineError> {
		let mut session = self
			.session
			.lock()
			.map_err(|_| EngineError::runtime("tls-session-poisoned"))?;
		match session.state {
			State::Good => {
				session.state = expected;
				Ok(session)
			},
			state if state == expected => Ok(session),
			State::ShutdownCompleted => Err(EngineError::AlreadyShutdown),
			_ => Err(EngineError::runtime("tls-engine-state-mismatch")),
		}
	}

	/// Sends every pending record; transient signals keep the in-progress
	/// state so the caller can retry.
	fn flush_locked(
		&self,
		session: &mut TlsSession,
		lower: &dyn Engine,
	) -> Result<(), EngineError> {
		while session.conn.wants_write() {
			let mut bridge = WireWrite {
				engine: lower,
				blocked: None,
			};
			match session.conn.write_tls(&mut bridge) {
				Ok(_) => {},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
					return Err(match bridge.blocked {
						Some(Readiness::Read) => EngineError::Unreadable,
						_ => EngineError::Unwritable,
					});
				},
				Err(e) => {
					session.state = State::Bad;
					return Err(EngineError::Fatal(Error::sys("tls-record-write", e)));
				},
			}
		}
		Ok(())
	}

	/// Pulls more records off the wire and processes them.
	fn fill_locked(
		&self,
		session: &mut TlsSession,
		lower: &dyn Engine,
	) -> Result<Filled, EngineError> {
		let mut bridge = WireRead {
			engine: lower,
			blocked: None,
		};
		match session.conn.read_tls(&mut bridge) {
			Ok(0) => {
				// wire end-of-stream; the record layer now knows
				if let Err(err) = session.conn.process_new_packets() {
					session.state = State::Bad;
					return Err(EngineError::Fatal(Error::Tls(err)));
				}
				Ok(Filled::Eof)
			},
			Ok(_) => match session.conn.process_new_packets() {
				Ok(_) => Ok(Filled::Records),
				Err(err) => {
					flush_best_effort(&mut session.conn, lower);
					session.state = State::Bad;
					Err(EngineError::Fatal(Error::Tls(err)))
				},
			},
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(match bridge.blocked {
				Some(Readiness::Write) => EngineError::Unwritable,
				_ => EngineError::Unreadable,
			}),
			Err(e) => {
				session.state = State::Bad;
				Err(EngineError::Fatal(Error::sys("tls-record-read", e)))
			},
		}
	}

	fn read_locked(
		&self,
		session: &mut TlsSession,
		chunk: &mut [u8],
	) -> Result<usize, EngineError> {
		let lower = self.lower()?;
		loop {
			// handshake or alert records may be pending at any time
			self.flush_locked(session, lower)?;
			match session.conn.reader().read(chunk) {
				Ok(0) => {
					// clean end of the session; the socket may still be open
					trace!("tls peer completed shutdown");
					session.state = State::ShutdownCompleted;
					return Ok(0);
				},
				Ok(n) => {
					session.state = State::Good;
					return Ok(n);
				},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
					self.fill_locked(session, lower)?;
				},
				Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
					// the peer closed without a proper session shutdown;
					// many implementations do, so it counts as end-of-stream
					trace!("tls peer closed without close_notify");
					session.state = State::ShutdownCompleted;
					return Ok(0);
				},
				Err(e) => {
					session.state = State::Bad;
					return Err(EngineError::Fatal(Error::sys("tls-read", e)));
				},
			}
		}
	}

	fn write_locked(&self, session: &mut TlsSession, chunk: &[u8]) -> Result<usize, EngineError> {
		let lower = self.lower()?;
		// drain earlier records first so the record layer has room
		self.flush_locked(session, lower)?;
		if session.pending_write == 0 && !chunk.is_empty() {
			// buffers at most the record layer's limit; the count reported
			// to the caller is what was accepted here
			let n = session.conn.writer().write(chunk).map_err(|e| {
				session.state = State::Bad;
				EngineError::Fatal(Error::sys("tls-write", e))
			})?;
			session.pending_write = n;
		}
		self.flush_locked(session, lower)?;
		session.state = State::Good;
		Ok(mem::take(&mut session.pending_write))
	}

	/// Bidirectional session shutdown: send our close_notify, then wait for
	/// the peer's. A wire end-of-stream without close_notify is tolerated.
	fn shutdown_locked(&self, session: &mut TlsSession, lower: &dyn Engine) -> Result<(), EngineError> {
		if !session.close_notify_sent {
			session.conn.send_close_notify();
			session.close_notify_sent = true;
		}
		self.flush_locked(session, lower)?;
		loop {
			match session.conn.process_new_packets() {
				Ok(io_state) if io_state.peer_has_closed() => break,
				Ok(_) => {},
				Err(err) => {
					session.state = State::Bad;
					return Err(EngineError::Fatal(Error::Tls(err)));
				},
			}
			match self.fill_locked(session, lower)? {
				Filled::Eof => break,
				Filled::Records => {},
			}
		}
		debug!("tls session shut down");
		session.state = State::ShutdownCompleted;
		Ok(())
	}
}

impl Engine for TlsEngine {
	fn shutdown(&self) -> Result<(), EngineError> {
		match self.sentry(State::ShutdownInProgress) {
			Ok(mut session) => {
				let lower = self.lower()?;
				self.shutdown_locked(&mut session, lower)?;
			},
			// an already-completed shutdown behaves like a plain socket
			// that was half-closed twice
			Err(EngineError::AlreadyShutdown) => {},
			Err(err) => return Err(err),
		}
		self.lower()?.shutdown()
	}

	fn hard_close(&self) -> Result<(), EngineError> {
		let mut session = self
			.session
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		session.state = State::Bad;
		drop(session);
		self.lower()?.hard_close()
	}

	fn read_some(&self, chunk: &mut [u8]) -> Result<usize, EngineError> {
		if chunk.is_empty() {
			return Ok(0);
		}
		match self.sentry(State::ReadInProgress) {
			Ok(mut session) => self.read_locked(&mut session, chunk),
			// emulate a half-closed plain socket
			Err(EngineError::AlreadyShutdown) => Ok(0),
			Err(err) => Err(err),
		}
	}

	fn write_some(&self, chunk: &[u8]) -> Result<usize, EngineError> {
		let mut session = self.sentry(State::WriteInProgress)?;
		self.write_locked(&mut session, chunk)
	}

	fn read_some_bulk(&self, chunks: &mut BulkSink<'_, '_>) -> Result<usize, EngineError> {
		// the record layer has no scatter/gather; use the first non-empty chunk
		let head = chunks.head_mut().map_err(EngineError::Fatal)?;
		self.read_some(head)
	}

	fn write_some_bulk(&self, chunks: &mut BulkSource<'_, '_>) -> Result<usize, EngineError> {
		let head = chunks.head().map_err(EngineError::Fatal)?;
		self.write_some(head)
	}

	fn downgrade(&mut self) -> Result<Box<dyn Engine>, EngineError> {
		{
			let mut session = self.sentry(State::ShutdownInProgress)?;
			let lower = self.lower()?;
			self.shutdown_locked(&mut session, lower)?;
		}
		self
			.lower
			.take()
			.ok_or_else(|| EngineError::runtime("tls-engine-already-downgraded"))
	}

	fn underlying(&self) -> &dyn Engine {
		match self.lower.as_deref() {
			Some(lower) => lower.underlying(),
			None => self,
		}
	}

	fn native_handle(&self) -> RawFd {
		self
			.lower
			.as_deref()
			.map_or(INVALID_HANDLE, |lower| lower.native_handle())
	}
}
