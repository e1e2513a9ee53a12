//! Bulk chunk views for scatter/gather transfers.
//!
//! A bulk view is an ordered sequence of byte chunks plus an offset marker.
//! Draining advances through the sequence, skipping chunks that have become
//! empty, and reports any excess that did not fit. The views own no bytes;
//! they borrow the caller's chunk list for the duration of a transfer.

use std::mem;

use crate::error::{Error, Result};

/// Chunks read from: the sources of a gathered write.
pub struct BulkSource<'a, 'b> {
	chunks: &'a mut [&'b [u8]],
	offset: usize,
}

/// Chunks written into: the destinations of a scattered read.
pub struct BulkSink<'a, 'b> {
	chunks: &'a mut [&'b mut [u8]],
	offset: usize,
}

impl<'a, 'b> BulkSource<'a, 'b> {
	pub fn new(chunks: &'a mut [&'b [u8]]) -> Self {
		BulkSource { chunks, offset: 0 }
	}

	/// Number of non-empty chunks at or after the offset.
	pub fn count(&self) -> usize {
		self.chunks[self.offset..]
			.iter()
			.filter(|c| !c.is_empty())
			.count()
	}

	/// Sum of the sizes of the remaining chunks.
	pub fn total(&self) -> usize {
		self.chunks[self.offset..].iter().map(|c| c.len()).sum()
	}

	/// The first non-empty chunk; fails if none remains.
	pub fn head(&self) -> Result<&[u8]> {
		self.chunks[self.offset..]
			.iter()
			.find(|c| !c.is_empty())
			.map(|c| &**c)
			.ok_or_else(|| Error::runtime("empty-bulk-head"))
	}

	/// Advances past `n` bytes, skipping emptied chunks, and returns the
	/// excess that the view could not absorb.
	pub fn drain(&mut self, n: usize) -> usize {
		let mut n = n;
		for i in self.offset..self.chunks.len() {
			if n == 0 {
				break;
			}
			let chunk = mem::take(&mut self.chunks[i]);
			let step = n.min(chunk.len());
			self.chunks[i] = &chunk[step..];
			n -= step;
		}
		while self.offset != self.chunks.len() && self.chunks[self.offset].is_empty() {
			self.offset += 1;
		}
		n
	}

	/// The remaining non-empty chunks as platform scatter/gather
	/// descriptors, in order.
	pub fn iovecs(&self) -> Vec<libc::iovec> {
		self.chunks[self.offset..]
			.iter()
			.filter(|c| !c.is_empty())
			.map(|c| libc::iovec {
				iov_base: c.as_ptr() as *mut libc::c_void,
				iov_len: c.len(),
			})
			.collect()
	}
}

impl<'a, 'b> BulkSink<'a, 'b> {
	pub fn new(chunks: &'a mut [&'b mut [u8]]) -> Self {
		BulkSink { chunks, offset: 0 }
	}

	pub fn count(&self) -> usize {
		self.chunks[self.offset..]
			.iter()
			.filter(|c| !c.is_empty())
			.count()
	}

	pub fn total(&self) -> usize {
		self.chunks[self.offset..].iter().map(|c| c.len()).sum()
	}

	/// The first non-empty chunk as a writable destination.
	pub fn head_mut(&mut self) -> Result<&mut [u8]> {
		self.chunks[self.offset..]
			.iter_mut()
			.find(|c| !c.is_empty())
			.map(|c| &mut **c)
			.ok_or_else(|| Error::runtime("empty-bulk-head"))
	}

	pub fn drain(&mut self, n: usize) -> usize {
		let mut n = n;
		for i in self.offset..self.chunks.len() {
			if n == 0 {
				break;
			}
			let chunk = mem::take(&mut self.chunks[i]);
			let step = n.min(chunk.len());
			self.chunks[i] = &mut chunk[step..];
			n -= step;
		}
		while self.offset != self.chunks.len() && self.chunks[self.offset].is_empty() {
			self.offset += 1;
		}
		n
	}

	pub fn iovecs(&mut self) -> Vec<libc::iovec> {
		self.chunks[self.offset..]
			.iter_mut()
			.filter(|c| !c.is_empty())
			.map(|c| libc::iovec {
				iov_base: c.as_mut_ptr() as *mut libc::c_void,
				iov_len: c.len(),
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn source_counts_skip_empty() {
		let mut parts: [&[u8]; 3] = [b"AAA", b"", b"BBBB"];
		let bulk = BulkSource::new(&mut parts);
		assert_eq!(bulk.count(), 2);
		assert_eq!(bulk.total(), 7);
		assert_eq!(bulk.head().unwrap(), b"AAA");
	}

	#[test]
	fn source_drain_advances_and_reports_excess() {
		let mut parts: [&[u8]; 3] = [b"AAA", b"", b"BBBB"];
		let mut bulk = BulkSource::new(&mut parts);
		assert_eq!(bulk.drain(4), 0);
		assert_eq!(bulk.total(), 3);
		assert_eq!(bulk.head().unwrap(), b"BBB");
		// more than remains: the excess comes back
		assert_eq!(bulk.drain(5), 2);
		assert_eq!(bulk.total(), 0);
		assert_eq!(bulk.count(), 0);
		assert!(bulk.head().is_err());
	}

	#[test]
	fn source_iovecs_filter_empty() {
		let mut parts: [&[u8]; 3] = [b"AAA", b"", b"BBBB"];
		let bulk = BulkSource::new(&mut parts);
		let iov = bulk.iovecs();
		assert_eq!(iov.len(), 2);
		assert_eq!(iov[0].iov_len, 3);
		assert_eq!(iov[1].iov_len, 4);
	}

	#[test]
	fn sink_head_and_drain() {
		let mut a = [0u8; 2];
		let mut b = [0u8; 0];
		let mut c = [0u8; 3];
		let mut parts: [&mut [u8]; 3] = [&mut a, &mut b, &mut c];
		let mut bulk = BulkSink::new(&mut parts);
		assert_eq!(bulk.count(), 2);
		assert_eq!(bulk.total(), 5);
		bulk.head_mut().unwrap()[0] = 1;
		assert_eq!(bulk.drain(2), 0);
		assert_eq!(bulk.total(), 3);
		assert_eq!(bulk.drain(9), 6);
	}
}
