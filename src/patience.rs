//! Deadline policies for blocking operations.
//!
//! A patience is consulted whenever an engine signals that a descriptor is
//! not ready for the requested transfer. It blocks the calling thread until
//! the descriptor has the readiness, the policy expires (raising
//! [`Error::Timeout`]), or a system error occurs. Signal interruptions are
//! never surfaced; every wait restarts transparently.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, ppoll};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::trace;

use crate::error::{Error, Result};

/// The readiness an engine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
	Read,
	Write,
}

impl Readiness {
	fn poll_flags(self) -> PollFlags {
		match self {
			Readiness::Read => PollFlags::POLLIN,
			Readiness::Write => PollFlags::POLLOUT,
		}
	}
}

impl fmt::Display for Readiness {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Readiness::Read => f.write_str("read"),
			Readiness::Write => f.write_str("write"),
		}
	}
}

/// User extension point: anything that can block until a handle is ready.
pub trait Wait: Send {
	fn wait(&mut self, handle: RawFd, readiness: Readiness) -> Result<()>;
}

/// The closed set of deadline policies, plus an escape hatch for
/// user-supplied ones.
pub enum Patience {
	/// Waits forever; returns only on readiness.
	Infinite,
	/// Compares a steady-clock deadline against a tracked "now".
	Steady(SteadyPatience),
	/// Backed by a kernel timer descriptor armed at construction.
	Deadline(DeadlinePatience),
	Custom(Box<dyn Wait>),
}

impl Patience {
	pub fn infinite() -> Patience {
		Patience::Infinite
	}

	pub fn steady(now: Instant, timeout: Duration) -> Patience {
		Patience::Steady(SteadyPatience::new(now, timeout))
	}

	pub fn deadline_after(timeout: Duration) -> Result<Patience> {
		Ok(Patience::Deadline(DeadlinePatience::after(timeout)?))
	}

	pub fn deadline_at(expires_at: SystemTime) -> Result<Patience> {
		Ok(Patience::Deadline(DeadlinePatience::at(expires_at)?))
	}

	pub fn wait(&mut self, handle: RawFd, readiness: Readiness) -> Result<()> {
		match self {
			Patience::Infinite => {
				poll_readiness(handle, readiness, None)?;
				Ok(())
			},
			Patience::Steady(steady) => steady.wait(handle, readiness),
			Patience::Deadline(deadline) => deadline.wait(handle, readiness),
			Patience::Custom(custom) => custom.wait(handle, readiness),
		}
	}
}

impl Wait for Patience {
	fn wait(&mut self, handle: RawFd, readiness: Readiness) -> Result<()> {
		Patience::wait(self, handle, readiness)
	}
}

/// Tracks a caller-seeded steady-clock instant against a fixed deadline.
/// The tracked "now" is refreshed from the clock whenever the wait restarts,
/// so repeated waits through the same patience share one deadline.
pub struct SteadyPatience {
	now: Instant,
	deadline: Instant,
	duration: Duration,
}

impl SteadyPatience {
	pub fn new(now: Instant, timeout: Duration) -> SteadyPatience {
		SteadyPatience {
			now,
			deadline: now + timeout,
			duration: timeout,
		}
	}

	pub fn until(now: Instant, deadline: Instant) -> SteadyPatience {
		SteadyPatience {
			now,
			deadline,
			duration: deadline.saturating_duration_since(now),
		}
	}

	fn wait(&mut self, handle: RawFd, readiness: Readiness) -> Result<()> {
		loop {
			let remaining = self.deadline.saturating_duration_since(self.now);
			let fd = unsafe { BorrowedFd::borrow_raw(handle) };
			let mut fds = [PollFd::new(fd, readiness.poll_flags())];
			match ppoll(&mut fds, Some(TimeSpec::from_duration(remaining)), None) {
				Ok(0) => {
					self.now = Instant::now();
					trace!(%readiness, duration = ?self.duration, "steady patience expired");
					return Err(Error::Timeout(readiness));
				},
				Ok(_) => {
					check_revents(&fds[0])?;
					return Ok(());
				},
				Err(Errno::EINTR) => {
					self.now = Instant::now();
				},
				Err(errno) => {
					return Err(Error::sys("steady-patience-poll", errno.into()));
				},
			}
		}
	}
}

/// Which kernel clock an armed timer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerClock {
	System,
	Steady,
}

impl TimerClock {
	fn clock_id(self) -> ClockId {
		match self {
			TimerClock::System => ClockId::CLOCK_REALTIME,
			TimerClock::Steady => ClockId::CLOCK_MONOTONIC,
		}
	}
}

/// Backed by a kernel timer file descriptor. The timer is created once and
/// re-armed on assignment whenever the clock kind matches, so a patience can
/// be reused across many waits and retargeted cheaply.
pub struct DeadlinePatience {
	timer: Option<ArmedTimer>,
}

struct ArmedTimer {
	clock: TimerClock,
	timer: TimerFd,
}

impl DeadlinePatience {
	/// A deadline patience without an expiry waits forever.
	pub fn unarmed() -> DeadlinePatience {
		DeadlinePatience { timer: None }
	}

	pub fn after(timeout: Duration) -> Result<DeadlinePatience> {
		let mut patience = DeadlinePatience::unarmed();
		patience.rearm_after(timeout)?;
		Ok(patience)
	}

	pub fn at(expires_at: SystemTime) -> Result<DeadlinePatience> {
		let mut patience = DeadlinePatience::unarmed();
		patience.rearm_at(expires_at)?;
		Ok(patience)
	}

	/// Re-arms for a system-clock expiry, reusing the timer if it already
	/// runs on the system clock.
	pub fn rearm_at(&mut self, expires_at: SystemTime) -> Result<()> {
		let since_epoch = expires_at
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::ZERO);
		self.arm(TimerClock::System, since_epoch, true)
	}

	/// Re-arms for an expiry relative to now on the steady clock.
	pub fn rearm_after(&mut self, timeout: Duration) -> Result<()> {
		self.arm(TimerClock::Steady, timeout, false)
	}

	/// Re-arms for a steady-clock instant. The instant is converted to a
	/// remaining duration at arm time.
	pub fn rearm_until(&mut self, expires_at: Instant) -> Result<()> {
		self.arm(
			TimerClock::Steady,
			expires_at.saturating_duration_since(Instant::now()),
			false,
		)
	}

	fn arm(&mut self, clock: TimerClock, expiry: Duration, absolute: bool) -> Result<()> {
		// a zero expiry would disarm the timer instead of firing it
		let expiry = expiry.max(Duration::from_nanos(1));
		match &self.timer {
			Some(armed) if armed.clock == clock => {},
			_ => {
				let timer =
					TimerFd::new(clock.clock_id(), TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK)
						.map_err(|errno| {
							Error::sys("deadline-timer-creation", errno.into())
						})?;
				self.timer = Some(ArmedTimer { clock, timer });
			},
		}
		let armed = self.timer.as_ref().expect("timer was just installed");
		let flags = if absolute {
			TimerSetTimeFlags::TFD_TIMER_ABSTIME
		} else {
			TimerSetTimeFlags::empty()
		};
		armed
			.timer
			.set(Expiration::OneShot(TimeSpec::from_duration(expiry)), flags)
			.map_err(|errno| Error::sys("deadline-timer-arm", errno.into()))
	}

	fn wait(&self, handle: RawFd, readiness: Readiness) -> Result<()> {
		match &self.timer {
			Some(armed) => {
				let timer_fd = armed.timer.as_fd().as_raw_fd();
				if poll_readiness(handle, readiness, Some(timer_fd))? == 1 {
					trace!(%readiness, "deadline patience expired");
					return Err(Error::Timeout(readiness));
				}
				Ok(())
			},
			None => {
				poll_readiness(handle, readiness, None)?;
				Ok(())
			},
		}
	}
}

/// Polls the user handle (and optionally a timer handle) without a timeout,
/// restarting on signal interruption. Returns the index of the descriptor
/// that became ready: 0 for the user handle, 1 for the timer.
fn poll_readiness(handle: RawFd, readiness: Readiness, timer: Option<RawFd>) -> Result<usize> {
	loop {
		let fd = unsafe { BorrowedFd::borrow_raw(handle) };
		let mut fds = Vec::with_capacity(2);
		fds.push(PollFd::new(fd, readiness.poll_flags()));
		if let Some(timer) = timer {
			let timer = unsafe { BorrowedFd::borrow_raw(timer) };
			fds.push(PollFd::new(timer, PollFlags::POLLIN));
		}
		match ppoll(&mut fds, None, None) {
			Ok(n) if n > 0 => {
				for pollfd in &fds {
					check_revents(pollfd)?;
				}
				for (i, pollfd) in fds.iter().enumerate() {
					if pollfd.revents().is_some_and(|r| !r.is_empty()) {
						return Ok(i);
					}
				}
				return Err(Error::runtime("unexpected-poll-status"));
			},
			Ok(_) => return Err(Error::runtime("unexpected-poll-status")),
			Err(Errno::EINTR) => {},
			Err(errno) => return Err(Error::sys("patience-poll", errno.into())),
		}
	}
}

/// Anything beyond the expected readiness, hangup and error bits indicates
/// a descriptor the caller should not be waiting on.
fn check_revents(pollfd: &PollFd<'_>) -> Result<()> {
	let valid = PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;
	match pollfd.revents() {
		Some(revents) if valid.contains(revents) => Ok(()),
		_ => Err(Error::runtime("invalid-poll-events")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::fd::AsRawFd;

	fn socketpair() -> (std::os::unix::net::UnixStream, std::os::unix::net::UnixStream) {
		std::os::unix::net::UnixStream::pair().expect("socketpair")
	}

	#[test]
	fn infinite_returns_on_readiness() {
		use std::io::Write;
		let (mut a, b) = socketpair();
		a.write_all(b"x").unwrap();
		let mut patience = Patience::infinite();
		patience.wait(b.as_raw_fd(), Readiness::Read).unwrap();
		// writable side is ready immediately
		patience.wait(a.as_raw_fd(), Readiness::Write).unwrap();
	}

	#[test]
	fn deadline_raises_timeout_within_bounds() {
		let (_a, b) = socketpair();
		let mut patience = Patience::deadline_after(Duration::from_millis(100)).unwrap();
		let start = Instant::now();
		let err = patience.wait(b.as_raw_fd(), Readiness::Read).unwrap_err();
		let elapsed = start.elapsed();
		assert!(matches!(err, Error::Timeout(Readiness::Read)));
		assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
		assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
	}

	#[test]
	fn steady_raises_timeout_and_tracks_now() {
		let (_a, b) = socketpair();
		let mut patience = Patience::steady(Instant::now(), Duration::from_millis(50));
		let err = patience.wait(b.as_raw_fd(), Readiness::Read).unwrap_err();
		assert!(matches!(err, Error::Timeout(Readiness::Read)));
		// a second wait through the same patience expires immediately
		let start = Instant::now();
		let err = patience.wait(b.as_raw_fd(), Readiness::Read).unwrap_err();
		assert!(matches!(err, Error::Timeout(Readiness::Read)));
		assert!(start.elapsed() < Duration::from_millis(40));
	}

	#[test]
	fn deadline_rearm_reuses_timer() {
		let (_a, b) = socketpair();
		let mut deadline = DeadlinePatience::after(Duration::from_millis(20)).unwrap();
		assert!(deadline.wait(b.as_raw_fd(), Readiness::Read).is_err());
		// same clock kind: the descriptor is re-armed, not recreated
		deadline.rearm_after(Duration::from_millis(20)).unwrap();
		assert!(deadline.wait(b.as_raw_fd(), Readiness::Read).is_err());
	}

	#[test]
	fn unarmed_deadline_waits_for_readiness() {
		use std::io::Write;
		let (mut a, b) = socketpair();
		a.write_all(b"y").unwrap();
		let deadline = DeadlinePatience::unarmed();
		deadline.wait(b.as_raw_fd(), Readiness::Read).unwrap();
	}
}
