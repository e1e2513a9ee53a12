//! Incrementally filled byte buffer, e.g. for reading from a socket.
//!
//! The data is split into two ranges: the warm range holds already produced
//! but not yet consumed bytes, the cold range is spare room for producing
//! more. `produce` moves the split point forward, `consume` drains from the
//! front of the warm range. Both cursors only ever advance; `reserve` is the
//! sole operation that rearranges memory.

use crate::error::{Error, Result};

const INITIAL_SIZE: usize = 32;
// below this total footprint a fresh allocation beats growing in place
const REALLOC_THRESHOLD: usize = 1 << 16;

#[derive(Default)]
pub struct Buffer {
	data: Vec<u8>,
	warm_pos: usize,
	cold_pos: usize,
}

impl Buffer {
	pub fn new() -> Buffer {
		Buffer::default()
	}

	/// Pointer to the beginning of the warm range.
	pub fn warm(&self) -> &[u8] {
		&self.data[self.warm_pos..self.cold_pos]
	}

	pub fn warm_mut(&mut self) -> &mut [u8] {
		&mut self.data[self.warm_pos..self.cold_pos]
	}

	/// Size of the warm range.
	pub fn available(&self) -> usize {
		self.cold_pos - self.warm_pos
	}

	/// Drains `n` bytes from the front of the warm range.
	pub fn consume(&mut self, n: usize) -> Result<()> {
		let pos = self
			.warm_pos
			.checked_add(n)
			.ok_or_else(|| Error::runtime("buffer-cursor-overflow"))?;
		if pos > self.cold_pos {
			return Err(Error::OutOfRange {
				label: "buffer-consume-overflow",
				detail: format!(
					"warm_pos={} cold_pos={} n={}",
					self.warm_pos, self.cold_pos, n
				),
			});
		}
		self.warm_pos = pos;
		Ok(())
	}

	/// The cold range, for producing more data.
	pub fn cold(&mut self) -> &mut [u8] {
		&mut self.data[self.cold_pos..]
	}

	/// Size of the cold range.
	pub fn capacity(&self) -> usize {
		self.data.len() - self.cold_pos
	}

	/// Marks `n` freshly produced bytes at the start of the cold range.
	pub fn produce(&mut self, n: usize) -> Result<()> {
		let pos = self
			.cold_pos
			.checked_add(n)
			.ok_or_else(|| Error::runtime("buffer-cursor-overflow"))?;
		if pos > self.data.len() {
			return Err(Error::OutOfRange {
				label: "buffer-produce-overflow",
				detail: format!(
					"cold_pos={} size={} n={}",
					self.cold_pos,
					self.data.len(),
					n
				),
			});
		}
		self.cold_pos = pos;
		Ok(())
	}

	/// Guarantees `capacity() >= required`, rearranging or growing as
	/// needed. The warm range is preserved byte for byte.
	pub fn reserve(&mut self, required: usize) -> &mut Buffer {
		let bias = self.warm_pos;
		let warm = self.cold_pos - self.warm_pos;
		let cold = self.data.len() - self.cold_pos;
		let free = bias + cold;
		if self.data.is_empty() && self.warm_pos == 0 {
			self.data.resize(required.max(INITIAL_SIZE), 0);
		} else if warm != 0 && cold >= required {
			// sufficient space at the tail; the warm range may well be
			// consumed before it runs out, so do not even move-to-front
		} else if free >= required && free >= warm {
			// moving at most half of the occupied bytes creates room
			self.data.copy_within(self.warm_pos..self.cold_pos, 0);
			self.warm_pos = 0;
			self.cold_pos = warm;
		} else if free + warm < REALLOC_THRESHOLD || free >= warm {
			// growing in place is unlikely to pay off; allocate fresh and
			// move the warm range to the front
			let needed = warm + required;
			let size = needed
				.checked_add(warm / 2)
				.and_then(|s| s.checked_add(cold))
				.unwrap_or(needed);
			let mut data = vec![0; size];
			data[..warm].copy_from_slice(&self.data[self.warm_pos..self.cold_pos]);
			self.data = data;
			self.warm_pos = 0;
			self.cold_pos = warm;
		} else {
			// grow at the tail, keeping the bias: with most free space in
			// front of a large warm range, moving would make things worse
			let needed = bias + warm + required;
			let size = needed
				.checked_add(warm / 2)
				.and_then(|s| s.checked_add(cold))
				.unwrap_or(needed);
			self.data.resize(size, 0);
		}
		self
	}

	/// O(1) exchange of the underlying storage.
	pub fn swap(&mut self, other: &mut Buffer) {
		std::mem::swap(self, other);
	}
}

/// Copying duplicates exactly the warm range, re-based to offset zero.
impl Clone for Buffer {
	fn clone(&self) -> Buffer {
		Buffer::from(self.warm())
	}
}

impl From<&[u8]> for Buffer {
	fn from(data: &[u8]) -> Buffer {
		Buffer {
			data: data.to_vec(),
			warm_pos: 0,
			cold_pos: data.len(),
		}
	}
}

impl std::fmt::Debug for Buffer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Buffer")
			.field("size", &self.data.len())
			.field("warm_pos", &self.warm_pos)
			.field("cold_pos", &self.cold_pos)
			.finish()
	}
}
