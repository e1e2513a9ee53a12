//! Certificate verifier wrappers.
//!
//! The provider bakes chain verification into the session config, so the
//! knobs this library offers, skipping the peer-name check for clients
//! without a target hostname and letting an application hook override the
//! verdict, are expressed as verifiers wrapping the web-PKI ones. Only the
//! chain decision is touched; signature checks always delegate.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{trace, warn};

use crate::tls::{Certificate, VerifyCallback};

fn apply_override(
	callback: &VerifyCallback,
	preliminary: Result<(), rustls::Error>,
	end_entity: &CertificateDer<'_>,
) -> Result<(), rustls::Error> {
	let certificate = match Certificate::parse(end_entity) {
		Ok(certificate) => certificate,
		Err(err) => {
			warn!(%err, "peer certificate does not parse");
			return Err(rustls::Error::InvalidCertificate(
				rustls::CertificateError::BadEncoding,
			));
		},
	};
	let preverified = preliminary.is_ok();
	let verdict = callback(preverified, &certificate);
	trace!(preverified, verdict, "verify hook consulted");
	match (verdict, preliminary) {
		(true, _) => Ok(()),
		(false, Err(err)) => Err(err),
		(false, Ok(())) => Err(rustls::Error::InvalidCertificate(
			rustls::CertificateError::ApplicationVerificationFailure,
		)),
	}
}

/// Accepts certificates whose chain verifies even when they do not match
/// the offered server name. Used when the caller gave no target hostname:
/// there is nothing meaningful to match against.
#[derive(Debug)]
pub(crate) struct NoServerNameVerification {
	inner: Arc<WebPkiServerVerifier>,
}

impl NoServerNameVerification {
	pub(crate) fn new(inner: Arc<WebPkiServerVerifier>) -> Self {
		Self { inner }
	}
}

impl ServerCertVerifier for NoServerNameVerification {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		server_name: &ServerName<'_>,
		ocsp: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		match self
			.inner
			.verify_server_cert(end_entity, intermediates, server_name, ocsp, now)
		{
			Ok(verified) => Ok(verified),
			Err(rustls::Error::InvalidCertificate(err))
				if matches!(
					err,
					rustls::CertificateError::NotValidForName
						| rustls::CertificateError::NotValidForNameContext { .. }
				) =>
			{
				Ok(ServerCertVerified::assertion())
			},
			Err(err) => Err(err),
		}
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.inner.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}
}

/// Lets the application hook override the library's server-chain verdict.
pub(crate) struct OverridingServerVerifier {
	base: Arc<dyn ServerCertVerifier>,
	callback: VerifyCallback,
}

impl OverridingServerVerifier {
	pub(crate) fn new(base: Arc<dyn ServerCertVerifier>, callback: VerifyCallback) -> Self {
		Self { base, callback }
	}
}

impl std::fmt::Debug for OverridingServerVerifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OverridingServerVerifier").finish()
	}
}

impl ServerCertVerifier for OverridingServerVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		server_name: &ServerName<'_>,
		ocsp: &[u8],
		now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		let preliminary = self
			.base
			.verify_server_cert(end_entity, intermediates, server_name, ocsp, now)
			.map(|_| ());
		apply_override(&self.callback, preliminary, end_entity)
			.map(|()| ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.base.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.base.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.base.supported_verify_schemes()
	}
}

/// Lets the application hook override the client-chain verdict on a server
/// that requires client certificates.
pub(crate) struct OverridingClientVerifier {
	base: Arc<dyn ClientCertVerifier>,
	callback: VerifyCallback,
}

impl OverridingClientVerifier {
	pub(crate) fn new(base: Arc<dyn ClientCertVerifier>, callback: VerifyCallback) -> Self {
		Self { base, callback }
	}
}

impl std::fmt::Debug for OverridingClientVerifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OverridingClientVerifier").finish()
	}
}

impl ClientCertVerifier for OverridingClientVerifier {
	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		self.base.root_hint_subjects()
	}

	fn verify_client_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		now: UnixTime,
	) -> Result<ClientCertVerified, rustls::Error> {
		let preliminary = self
			.base
			.verify_client_cert(end_entity, intermediates, now)
			.map(|_| ());
		apply_override(&self.callback, preliminary, end_entity)
			.map(|()| ClientCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.base.verify_tls12_signature(message, cert, dss)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.base.verify_tls13_signature(message, cert, dss)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.base.supported_verify_schemes()
	}
}
