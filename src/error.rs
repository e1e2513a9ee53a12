use std::panic::Location;

use crate::patience::Readiness;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that escape to the caller. Every variant carries enough context
/// for post-mortem logging; runtime errors additionally record the source
/// location they were raised from.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid endpoint: {0}")]
	InvalidEndpoint(String),
	#[error("unknown service: {0}")]
	InvalidService(String),
	#[error("timed out waiting for {0} readiness")]
	Timeout(Readiness),
	#[error("{label}: position out of range ({detail})")]
	OutOfRange {
		label: &'static str,
		detail: String,
	},
	#[error("{label} ({location})")]
	Runtime {
		label: &'static str,
		location: &'static Location<'static>,
		#[source]
		source: Option<Box<dyn std::error::Error + Send + Sync>>,
	},
	#[error("{label}")]
	Sys {
		label: &'static str,
		#[source]
		source: std::io::Error,
	},
	#[error("tls failure: {0}")]
	Tls(#[from] rustls::Error),
	#[error("resolver failure: {0}")]
	Resolver(String),
}

impl Error {
	#[track_caller]
	pub fn runtime(label: &'static str) -> Error {
		Error::Runtime {
			label,
			location: Location::caller(),
			source: None,
		}
	}

	#[track_caller]
	pub fn runtime_caused<E>(label: &'static str, source: E) -> Error
	where
		E: std::error::Error + Send + Sync + 'static,
	{
		Error::Runtime {
			label,
			location: Location::caller(),
			source: Some(Box::new(source)),
		}
	}

	pub fn sys(label: &'static str, source: std::io::Error) -> Error {
		Error::Sys { label, source }
	}

	/// Wraps the most recent OS error, as reported by the platform.
	pub fn last_os(label: &'static str) -> Error {
		Error::Sys {
			label,
			source: std::io::Error::last_os_error(),
		}
	}
}

/// Engine-level outcome. The transient variants signal "retry once the
/// descriptor has the corresponding readiness" and must never be surfaced
/// past the stream's retry loop.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
	#[error("engine is not readable yet")]
	Unreadable,
	#[error("engine is not writable yet")]
	Unwritable,
	#[error("session was already shut down")]
	AlreadyShutdown,
	#[error(transparent)]
	Fatal(#[from] Error),
}

impl EngineError {
	#[track_caller]
	pub fn runtime(label: &'static str) -> EngineError {
		EngineError::Fatal(Error::runtime(label))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn runtime_records_location() {
		let err = Error::runtime("bad-state");
		match err {
			Error::Runtime { label, location, .. } => {
				assert_eq!(label, "bad-state");
				assert!(location.file().ends_with("error.rs"));
			},
			other => panic!("unexpected variant: {other:?}"),
		}
	}

	#[test]
	fn sys_chains_cause() {
		let err = Error::sys(
			"socket-option",
			std::io::Error::from_raw_os_error(libc::EINVAL),
		);
		let source = std::error::Error::source(&err).expect("cause");
		assert!(source.to_string().to_lowercase().contains("invalid"));
	}
}
