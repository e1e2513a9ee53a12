//! The polymorphic stream end.
//!
//! An engine never blocks on its descriptor. When a transfer cannot make
//! progress it fails with [`EngineError::Unreadable`] or
//! [`EngineError::Unwritable`]; the stream wrapper then waits through a
//! patience and retries the exact same operation. Decorating engines (TLS)
//! own their inner engine and hand it back on `downgrade`.

use std::os::fd::RawFd;

use crate::chunk::{BulkSink, BulkSource};
use crate::error::EngineError;

/// The invalid descriptor value.
pub const INVALID_HANDLE: RawFd = -1;

pub trait Engine: Send + Sync {
	/// Half-closes the sending direction. Reads may still succeed.
	fn shutdown(&self) -> Result<(), EngineError>;

	/// Abortive close: pending transfers are abandoned and the descriptor
	/// is released.
	fn hard_close(&self) -> Result<(), EngineError>;

	/// Reads into the chunk; `Ok(0)` is peer end-of-stream.
	fn read_some(&self, chunk: &mut [u8]) -> Result<usize, EngineError>;

	fn write_some(&self, chunk: &[u8]) -> Result<usize, EngineError>;

	/// Scatter read. Engines without native scatter/gather process the
	/// first non-empty chunk.
	fn read_some_bulk(&self, chunks: &mut BulkSink<'_, '_>) -> Result<usize, EngineError>;

	fn write_some_bulk(&self, chunks: &mut BulkSource<'_, '_>) -> Result<usize, EngineError>;

	/// Unwraps a decorating engine, returning the inner one. Fails for
	/// engines that decorate nothing.
	fn downgrade(&mut self) -> Result<Box<dyn Engine>, EngineError>;

	/// The innermost engine, for capability queries.
	fn underlying(&self) -> &dyn Engine;

	/// The descriptor all readiness waits go through.
	fn native_handle(&self) -> RawFd;
}
