//! The user-facing stream: one engine plus the retry loop.

use tracing::{debug, trace};

use crate::chunk::{BulkSink, BulkSource};
use crate::engine::Engine;
use crate::error::{EngineError, Error, Result};
use crate::patience::{Readiness, Wait};

/// Owns exactly one engine and drives it through readiness retries.
///
/// Every operation takes a patience; transient engine failures are handled
/// here and never reach the caller. The engine slot becomes empty when an
/// upgrade transform fails, after which all operations report an invalid
/// stream state.
pub struct Stream {
	engine: Option<Box<dyn Engine>>,
}

impl Stream {
	pub fn new(engine: Box<dyn Engine>) -> Stream {
		Stream {
			engine: Some(engine),
		}
	}

	fn engine(&self) -> Result<&dyn Engine> {
		self
			.engine
			.as_deref()
			.ok_or_else(|| Error::runtime("invalid-stream-engine-state"))
	}

	/// Retries `op` until it stops signaling unavailability, waiting on the
	/// engine's handle in between.
	fn blocking<T>(
		&self,
		patience: &mut dyn Wait,
		mut op: impl FnMut(&dyn Engine) -> Result<T, EngineError>,
	) -> Result<T, EngineError> {
		let engine = self.engine().map_err(EngineError::Fatal)?;
		loop {
			match op(engine) {
				Err(EngineError::Unreadable) => {
					trace!("waiting for read readiness");
					patience
						.wait(engine.native_handle(), Readiness::Read)
						.map_err(EngineError::Fatal)?;
				},
				Err(EngineError::Unwritable) => {
					trace!("waiting for write readiness");
					patience
						.wait(engine.native_handle(), Readiness::Write)
						.map_err(EngineError::Fatal)?;
				},
				outcome => return outcome,
			}
		}
	}

	/// Half-closes the sending direction.
	pub fn shutdown(&self, patience: &mut dyn Wait) -> Result<()> {
		match self.blocking(patience, |e| e.shutdown()) {
			Ok(()) | Err(EngineError::AlreadyShutdown) => Ok(()),
			Err(EngineError::Fatal(err)) => Err(err),
			Err(signal) => Err(Error::runtime_caused("unexpected-engine-signal", signal)),
		}
	}

	/// Shuts down, drains until the peer also reaches end-of-stream, then
	/// closes hard. A peer that keeps sending after our shutdown is an
	/// error.
	pub fn graceful_close(self, patience: &mut dyn Wait) -> Result<()> {
		self.shutdown(patience)?;
		let mut discard = [0u8; 1];
		loop {
			match self.blocking(patience, |e| e.read_some(&mut discard)) {
				Ok(0) | Err(EngineError::AlreadyShutdown) => break,
				Ok(_) => return Err(Error::runtime("peer-kept-sending-after-shutdown")),
				Err(EngineError::Fatal(err)) => return Err(err),
				Err(signal) => {
					return Err(Error::runtime_caused("unexpected-engine-signal", signal));
				},
			}
		}
		debug!("stream drained, closing");
		match self.engine()?.hard_close() {
			Ok(()) => Ok(()),
			Err(EngineError::Fatal(err)) => Err(err),
			Err(signal) => Err(Error::runtime_caused("unexpected-engine-signal", signal)),
		}
	}

	/// Reads some bytes; `Ok(0)` is peer end-of-stream.
	pub fn read_some(&self, chunk: &mut [u8], patience: &mut dyn Wait) -> Result<usize> {
		flatten(self.blocking(patience, |e| e.read_some(chunk)))
	}

	pub fn write_some(&self, chunk: &[u8], patience: &mut dyn Wait) -> Result<usize> {
		flatten(self.blocking(patience, |e| e.write_some(chunk)))
	}

	pub fn read_some_bulk(
		&self,
		chunks: &mut BulkSink<'_, '_>,
		patience: &mut dyn Wait,
	) -> Result<usize> {
		flatten(self.blocking(patience, |e| e.read_some_bulk(chunks)))
	}

	pub fn write_some_bulk(
		&self,
		chunks: &mut BulkSource<'_, '_>,
		patience: &mut dyn Wait,
	) -> Result<usize> {
		flatten(self.blocking(patience, |e| e.write_some_bulk(chunks)))
	}

	/// Writes the whole chunk or fails. The engine is invoked at least
	/// once, so a zero-length write still reaches it.
	pub fn write_all(&self, chunk: &[u8], patience: &mut dyn Wait) -> Result<()> {
		let mut chunk = chunk;
		loop {
			let n = strict(self.blocking(patience, |e| e.write_some(chunk)))?;
			chunk = &chunk[n.min(chunk.len())..];
			if chunk.is_empty() {
				return Ok(());
			}
		}
	}

	/// Bulk variant of [`write_all`](Stream::write_all).
	pub fn write_all_bulk(
		&self,
		chunks: &mut BulkSource<'_, '_>,
		patience: &mut dyn Wait,
	) -> Result<()> {
		loop {
			let n = strict(self.blocking(patience, |e| e.write_some_bulk(chunks)))?;
			chunks.drain(n);
			if chunks.total() == 0 {
				return Ok(());
			}
		}
	}

	/// Replaces the engine with `transform(engine)`, typically wrapping it
	/// with a TLS decorator. If the transform fails the stream is left in a
	/// detectable invalid state.
	pub fn upgrade(
		&mut self,
		transform: impl FnOnce(Box<dyn Engine>) -> Result<Box<dyn Engine>>,
	) -> Result<()> {
		let engine = self
			.engine
			.take()
			.ok_or_else(|| Error::runtime("invalid-stream-engine-state"))?;
		self.engine = Some(transform(engine)?);
		Ok(())
	}

	/// Unwraps a decorating engine, re-installing the inner one.
	pub fn downgrade(&mut self, patience: &mut dyn Wait) -> Result<()> {
		let engine = self
			.engine
			.as_mut()
			.ok_or_else(|| Error::runtime("invalid-stream-engine-state"))?;
		let handle = engine.native_handle();
		let inner = loop {
			match engine.downgrade() {
				Ok(inner) => break inner,
				Err(EngineError::Unreadable) => patience.wait(handle, Readiness::Read)?,
				Err(EngineError::Unwritable) => patience.wait(handle, Readiness::Write)?,
				Err(EngineError::Fatal(err)) => return Err(err),
				Err(signal) => {
					return Err(Error::runtime_caused("unexpected-engine-signal", signal));
				},
			}
		};
		self.engine = Some(inner);
		Ok(())
	}

	/// The innermost engine, for capability queries.
	pub fn underlying(&self) -> Result<&dyn Engine> {
		Ok(self.engine()?.underlying())
	}
}

/// Transient signals never escape `blocking`; what remains is success,
/// the half-closed emulation, or a fatal error.
fn flatten(outcome: Result<usize, EngineError>) -> Result<usize> {
	match outcome {
		Ok(n) => Ok(n),
		Err(EngineError::AlreadyShutdown) => Ok(0),
		Err(EngineError::Fatal(err)) => Err(err),
		Err(signal) => Err(Error::runtime_caused("unexpected-engine-signal", signal)),
	}
}

/// Like `flatten`, but a session that reports itself shut down cannot make
/// write progress, so looping on zero would never terminate.
fn strict(outcome: Result<usize, EngineError>) -> Result<usize> {
	match outcome {
		Ok(n) => Ok(n),
		Err(EngineError::AlreadyShutdown) => {
			Err(Error::runtime("write-after-session-shutdown"))
		},
		Err(EngineError::Fatal(err)) => Err(err),
		Err(signal) => Err(Error::runtime_caused("unexpected-engine-signal", signal)),
	}
}

#[cfg(test)]
mod tests {
	use std::os::fd::RawFd;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use super::*;
	use crate::engine::INVALID_HANDLE;
	use crate::patience::Patience;

	/// Replays a scripted sequence of outcomes, so the retry loop can be
	/// checked against deterministic unavailability patterns.
	struct ScriptedEngine {
		script: Mutex<Vec<Script>>,
		calls: Arc<AtomicUsize>,
	}

	enum Script {
		Unreadable,
		Unwritable,
		Transfer(usize),
		Eof,
	}

	impl ScriptedEngine {
		fn new(script: Vec<Script>) -> ScriptedEngine {
			ScriptedEngine {
				script: Mutex::new(script),
				calls: Arc::new(AtomicUsize::new(0)),
			}
		}

		fn next(&self) -> Result<usize, EngineError> {
			self.calls.fetch_add(1, Ordering::Relaxed);
			match self.script.lock().unwrap().remove(0) {
				Script::Unreadable => Err(EngineError::Unreadable),
				Script::Unwritable => Err(EngineError::Unwritable),
				Script::Transfer(n) => Ok(n),
				Script::Eof => Ok(0),
			}
		}
	}

	impl Engine for ScriptedEngine {
		fn shutdown(&self) -> Result<(), EngineError> {
			Ok(())
		}
		fn hard_close(&self) -> Result<(), EngineError> {
			Ok(())
		}
		fn read_some(&self, _chunk: &mut [u8]) -> Result<usize, EngineError> {
			self.next()
		}
		fn write_some(&self, chunk: &[u8]) -> Result<usize, EngineError> {
			self.next().map(|n| n.min(chunk.len()))
		}
		fn read_some_bulk(&self, _chunks: &mut BulkSink<'_, '_>) -> Result<usize, EngineError> {
			self.next()
		}
		fn write_some_bulk(&self, chunks: &mut BulkSource<'_, '_>) -> Result<usize, EngineError> {
			self.next().map(|n| n.min(chunks.total()))
		}
		fn downgrade(&mut self) -> Result<Box<dyn Engine>, EngineError> {
			Err(EngineError::runtime("nothing-to-downgrade"))
		}
		fn underlying(&self) -> &dyn Engine {
			self
		}
		fn native_handle(&self) -> RawFd {
			INVALID_HANDLE
		}
	}

	/// Counts waits instead of polling; the scripted engine has no real
	/// descriptor behind it.
	struct CountingWait {
		waits: Arc<AtomicUsize>,
	}

	fn counting_patience() -> (Patience, Arc<AtomicUsize>) {
		let waits = Arc::new(AtomicUsize::new(0));
		let patience = Patience::Custom(Box::new(CountingWait {
			waits: waits.clone(),
		}));
		(patience, waits)
	}

	impl Wait for CountingWait {
		fn wait(&mut self, _handle: RawFd, _readiness: Readiness) -> Result<()> {
			self.waits.fetch_add(1, Ordering::Relaxed);
			Ok(())
		}
	}

	#[test]
	fn read_retries_through_unavailability() {
		let stream = Stream::new(Box::new(ScriptedEngine::new(vec![
			Script::Unreadable,
			Script::Unreadable,
			Script::Transfer(7),
		])));
		let (mut patience, waits) = counting_patience();
		let mut buf = [0u8; 16];
		assert_eq!(stream.read_some(&mut buf, &mut patience).unwrap(), 7);
		assert_eq!(waits.load(Ordering::Relaxed), 2);
	}

	#[test]
	fn write_all_drives_until_empty() {
		let engine = ScriptedEngine::new(vec![
			Script::Transfer(3),
			Script::Unwritable,
			Script::Transfer(4),
			Script::Transfer(5),
		]);
		let calls = engine.calls.clone();
		let stream = Stream::new(Box::new(engine));
		let (mut patience, waits) = counting_patience();
		stream.write_all(&[1u8; 12], &mut patience).unwrap();
		assert_eq!(calls.load(Ordering::Relaxed), 4);
		assert_eq!(waits.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn write_all_issues_at_least_one_call() {
		let engine = ScriptedEngine::new(vec![Script::Transfer(0)]);
		let calls = engine.calls.clone();
		let stream = Stream::new(Box::new(engine));
		let (mut patience, _) = counting_patience();
		stream.write_all(&[], &mut patience).unwrap();
		assert_eq!(calls.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn eof_is_returned_as_zero() {
		let stream = Stream::new(Box::new(ScriptedEngine::new(vec![
			Script::Unreadable,
			Script::Eof,
		])));
		let (mut patience, _) = counting_patience();
		let mut buf = [0u8; 4];
		assert_eq!(stream.read_some(&mut buf, &mut patience).unwrap(), 0);
	}

	#[test]
	fn failed_upgrade_leaves_detectable_state() {
		let mut stream = Stream::new(Box::new(ScriptedEngine::new(vec![])));
		let err = stream
			.upgrade(|_engine| Err(Error::runtime("handshake-failed")))
			.unwrap_err();
		assert!(matches!(err, Error::Runtime { .. }));
		let (mut patience, _) = counting_patience();
		let mut buf = [0u8; 1];
		assert!(stream.read_some(&mut buf, &mut patience).is_err());
	}

	#[test]
	fn downgrade_on_bare_engine_fails() {
		let mut stream = Stream::new(Box::new(ScriptedEngine::new(vec![])));
		let (mut patience, _) = counting_patience();
		assert!(stream.downgrade(&mut patience).is_err());
	}
}
