//! TLS session layering over an existing engine.
//!
//! Three context kinds compose the same way: each owns a session template
//! and, on upgrade, performs the handshake through the caller's patience and
//! produces an engine that decorates the lower one. `ServerContext` offers
//! the identity and an SNI decision hook, `SecureContext` additionally
//! requires client certificates, `ClientContext` validates the peer against
//! an authority with an optional client identity and target hostname.

mod engine;
mod verify;

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{ClientHello, NoServerSessionStorage, ResolvesServerCert, WebPkiClientVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::warn;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::patience::Wait;

/// Process-wide cryptographic state, initialized once on first use.
static PROVIDER: Lazy<Arc<CryptoProvider>> =
	Lazy::new(|| Arc::new(rustls::crypto::ring::default_provider()));

fn provider() -> Arc<CryptoProvider> {
	PROVIDER.clone()
}

/// Protocol versions to enable. Both default to on; at least one must
/// remain enabled.
#[derive(Debug, Clone, Copy)]
pub struct TlsOptions {
	pub tls12: bool,
	pub tls13: bool,
}

impl Default for TlsOptions {
	fn default() -> TlsOptions {
		TlsOptions {
			tls12: true,
			tls13: true,
		}
	}
}

impl TlsOptions {
	fn versions(&self) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
		let mut versions = Vec::new();
		if self.tls12 {
			versions.push(&rustls::version::TLS12);
		}
		if self.tls13 {
			versions.push(&rustls::version::TLS13);
		}
		if versions.is_empty() {
			return Err(Error::runtime("no-tls-protocol-versions-enabled"));
		}
		Ok(versions)
	}
}

/// A set of trust anchors, built up incrementally.
#[derive(Debug, Clone)]
pub struct Authority {
	roots: RootCertStore,
}

impl Authority {
	/// An authority without any anchors.
	pub fn empty() -> Authority {
		Authority {
			roots: RootCertStore::empty(),
		}
	}

	/// The platform's trusted certificate store.
	pub fn system() -> Result<Authority> {
		let loaded = rustls_native_certs::load_native_certs();
		if loaded.certs.is_empty() {
			if let Some(err) = loaded.errors.into_iter().next() {
				return Err(Error::runtime_caused("system-authority-unavailable", err));
			}
		}
		let mut roots = RootCertStore::empty();
		let (_, ignored) = roots.add_parsable_certificates(loaded.certs);
		if ignored != 0 {
			warn!(ignored, "skipped unparsable system trust anchors");
		}
		Ok(Authority { roots })
	}

	/// Adds every certificate found in a PEM file.
	pub fn with_file(mut self, pathname: impl AsRef<Path>) -> Result<Authority> {
		let file = File::open(pathname.as_ref())
			.map_err(|e| Error::sys("authority-file-open", e))?;
		let mut reader = BufReader::new(file);
		for cert in rustls_pemfile::certs(&mut reader) {
			let cert = cert.map_err(|e| Error::sys("authority-file-parse", e))?;
			self.roots.add(cert)?;
		}
		Ok(self)
	}

	/// Adds a single DER-encoded certificate.
	pub fn with_certificate(mut self, certificate: CertificateDer<'static>) -> Result<Authority> {
		self.roots.add(certificate)?;
		Ok(self)
	}

	fn into_roots(self) -> Arc<RootCertStore> {
		Arc::new(self.roots)
	}
}

/// A private key with its certificate chain.
pub struct Identity {
	chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
}

impl Identity {
	/// Loads key and certificate (plus an optional extra chain) from PEM
	/// files.
	pub fn from_pem_files(
		private_key: impl AsRef<Path>,
		certificate: impl AsRef<Path>,
		chain: Option<&Path>,
	) -> Result<Identity> {
		let key = {
			let file = File::open(private_key.as_ref())
				.map_err(|e| Error::sys("identity-key-open", e))?;
			rustls_pemfile::private_key(&mut BufReader::new(file))
				.map_err(|e| Error::sys("identity-key-parse", e))?
				.ok_or_else(|| Error::runtime("identity-key-missing"))?
		};
		let mut certs = Vec::new();
		for path in std::iter::once(certificate.as_ref()).chain(chain) {
			let file = File::open(path).map_err(|e| Error::sys("identity-certificate-open", e))?;
			for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
				certs.push(cert.map_err(|e| Error::sys("identity-certificate-parse", e))?);
			}
		}
		if certs.is_empty() {
			return Err(Error::runtime("identity-certificate-missing"));
		}
		Ok(Identity { chain: certs, key })
	}

	/// Builds an identity from DER-encoded parts.
	pub fn from_der(
		chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
	) -> Identity {
		Identity { chain, key }
	}
}

impl Clone for Identity {
	fn clone(&self) -> Identity {
		Identity {
			chain: self.chain.clone(),
			key: self.key.clone_key(),
		}
	}
}

impl fmt::Debug for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Identity")
			.field("chain_len", &self.chain.len())
			.finish()
	}
}

/// A parsed view over a peer certificate, for use from verify hooks.
pub struct Certificate<'a> {
	parsed: X509Certificate<'a>,
}

impl<'a> Certificate<'a> {
	pub(crate) fn parse(der: &'a [u8]) -> Result<Certificate<'a>> {
		let (_, parsed) = X509Certificate::from_der(der)
			.map_err(|_| Error::runtime("certificate-parse-error"))?;
		Ok(Certificate { parsed })
	}

	/// The last common-name entry of the subject, if any.
	pub fn common_name(&self) -> Option<String> {
		self
			.parsed
			.subject()
			.iter_common_name()
			.last()
			.and_then(|attr| attr.as_str().ok())
			.map(str::to_string)
	}

	/// RFC 6125 host matching: subject-alternative DNS names with a
	/// single-label wildcard, falling back to the common name only when the
	/// certificate carries no DNS names at all.
	pub fn matches_hostname(&self, hostname: &str) -> bool {
		let want = hostname.trim_end_matches('.').to_ascii_lowercase();
		let mut saw_dns_name = false;
		if let Ok(Some(san)) = self.parsed.subject_alternative_name() {
			for name in &san.value.general_names {
				if let GeneralName::DNSName(dns) = name {
					saw_dns_name = true;
					if dns_name_matches(dns, &want) {
						return true;
					}
				}
			}
		}
		if saw_dns_name {
			return false;
		}
		self
			.common_name()
			.map(|cn| dns_name_matches(&cn, &want))
			.unwrap_or(false)
	}
}

fn dns_name_matches(pattern: &str, host: &str) -> bool {
	let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
	if let Some(parent) = pattern.strip_prefix("*.") {
		// the wildcard covers exactly one left-most label
		match host.split_once('.') {
			Some((label, rest)) => !label.is_empty() && rest == parent,
			None => false,
		}
	} else {
		pattern == host
	}
}

/// Verdict hook consulted after the library's own chain verification. It
/// receives the preliminary result and the end-entity certificate and
/// returns the final decision.
pub type VerifyCallback = Arc<dyn Fn(bool, &Certificate<'_>) -> bool + Send + Sync>;

/// Answer of the SNI hook for the hostname the client offered.
pub enum SniDecision {
	/// Continue the handshake with this context.
	Stay,
	/// Continue the handshake with another server context.
	Switch(ServerContext),
	/// Refuse the handshake; the peer receives a handshake alert.
	Reject,
}

/// Resolves no certificate, so a rejected hostname fails the handshake with
/// a proper alert instead of a torn connection.
#[derive(Debug)]
struct RefuseAllCerts;

impl ResolvesServerCert for RefuseAllCerts {
	fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		None
	}
}

fn server_config_base(
	options: TlsOptions,
) -> Result<rustls::ConfigBuilder<ServerConfig, rustls::server::WantsServerCert>> {
	Ok(
		ServerConfig::builder_with_provider(provider())
			.with_protocol_versions(&options.versions()?)?
			.with_no_client_auth(),
	)
}

/// Clients should use connections efficiently instead of optimizing
/// connection setup; keep no session state around.
fn disable_server_resumption(config: &mut ServerConfig) {
	config.session_storage = Arc::new(NoServerSessionStorage {});
	config.send_tls13_tickets = 0;
}

/// A server-side context: an identity plus the SNI decision surface.
#[derive(Clone)]
pub struct ServerContext {
	config: Arc<ServerConfig>,
	reject: Arc<ServerConfig>,
}

impl ServerContext {
	pub fn new(identity: Identity, options: TlsOptions) -> Result<ServerContext> {
		let mut config = server_config_base(options)?
			.with_single_cert(identity.chain, identity.key)?;
		disable_server_resumption(&mut config);
		let mut reject = server_config_base(options)?.with_cert_resolver(Arc::new(RefuseAllCerts));
		disable_server_resumption(&mut reject);
		Ok(ServerContext {
			config: Arc::new(config),
			reject: Arc::new(reject),
		})
	}

	/// Wraps `lower` with a TLS engine, driving the server handshake
	/// through the patience. The callback sees the hostname the client
	/// offered, if any, and picks the context to continue with.
	pub fn upgrade(
		&self,
		lower: Box<dyn Engine>,
		patience: &mut dyn Wait,
		callback: &dyn Fn(&str) -> SniDecision,
	) -> Result<Box<dyn Engine>> {
		let accepted = engine::read_client_hello(lower.as_ref(), patience)?;
		let (config, rejected) = match accepted.client_hello().server_name() {
			// no hostname offered: continue with the current context
			None => (self.config.clone(), false),
			Some(hostname) => match callback(hostname) {
				SniDecision::Stay => (self.config.clone(), false),
				SniDecision::Switch(other) => (other.config.clone(), false),
				SniDecision::Reject => {
					warn!(hostname, "tls hostname rejected");
					(self.reject.clone(), true)
				},
			},
		};
		let conn = engine::accept_connection(accepted, config, lower.as_ref())?;
		let outcome = engine::establish(Connection::from(conn), lower, patience, false);
		match outcome {
			Err(err) if rejected => Err(Error::runtime_caused("tls-hostname-rejected", err)),
			outcome => outcome,
		}
	}
}

impl fmt::Debug for ServerContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerContext").finish()
	}
}

/// A server-side context that additionally demands and verifies client
/// certificates against an authority. The optional hook may override the
/// verdict.
#[derive(Clone)]
pub struct SecureContext {
	config: Arc<ServerConfig>,
}

impl SecureContext {
	pub fn new(
		authority: Authority,
		identity: Identity,
		options: TlsOptions,
		verify: Option<VerifyCallback>,
	) -> Result<SecureContext> {
		let verifier = WebPkiClientVerifier::builder_with_provider(authority.into_roots(), provider())
			.build()
			.map_err(|e| Error::runtime_caused("client-verifier-construction", e))?;
		let verifier: Arc<dyn rustls::server::danger::ClientCertVerifier> = match verify {
			Some(callback) => Arc::new(verify::OverridingClientVerifier::new(verifier, callback)),
			None => verifier,
		};
		let mut config = ServerConfig::builder_with_provider(provider())
			.with_protocol_versions(&options.versions()?)?
			.with_client_cert_verifier(verifier)
			.with_single_cert(identity.chain, identity.key)?;
		disable_server_resumption(&mut config);
		Ok(SecureContext {
			config: Arc::new(config),
		})
	}

	pub fn upgrade(
		&self,
		lower: Box<dyn Engine>,
		patience: &mut dyn Wait,
	) -> Result<Box<dyn Engine>> {
		let conn = ServerConnection::new(self.config.clone())?;
		engine::establish(Connection::from(conn), lower, patience, true)
	}
}

impl fmt::Debug for SecureContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SecureContext").finish()
	}
}

/// A client-side context: validates the peer against an authority, with an
/// optional client identity. The target hostname is supplied per upgrade;
/// without one, SNI is omitted and the peer-name check is relaxed.
#[derive(Clone)]
pub struct ClientContext {
	sni: Arc<ClientConfig>,
	no_sni: Arc<ClientConfig>,
}

impl ClientContext {
	pub fn new(
		authority: Authority,
		identity: Option<Identity>,
		options: TlsOptions,
		verify: Option<VerifyCallback>,
	) -> Result<ClientContext> {
		let roots = authority.into_roots();
		let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider())
			.build()
			.map_err(|e| Error::runtime_caused("server-verifier-construction", e))?;
		let strict: Arc<dyn rustls::client::danger::ServerCertVerifier> = match &verify {
			Some(callback) => Arc::new(verify::OverridingServerVerifier::new(
				webpki.clone(),
				callback.clone(),
			)),
			None => webpki.clone(),
		};
		let nameless_base = Arc::new(verify::NoServerNameVerification::new(webpki));
		let nameless: Arc<dyn rustls::client::danger::ServerCertVerifier> = match &verify {
			Some(callback) => Arc::new(verify::OverridingServerVerifier::new(
				nameless_base,
				callback.clone(),
			)),
			None => nameless_base,
		};
		let sni = Self::build_config(options, strict, &identity, true)?;
		let no_sni = Self::build_config(options, nameless, &identity, false)?;
		Ok(ClientContext {
			sni: Arc::new(sni),
			no_sni: Arc::new(no_sni),
		})
	}

	fn build_config(
		options: TlsOptions,
		verifier: Arc<dyn rustls::client::danger::ServerCertVerifier>,
		identity: &Option<Identity>,
		enable_sni: bool,
	) -> Result<ClientConfig> {
		let builder = ClientConfig::builder_with_provider(provider())
			.with_protocol_versions(&options.versions()?)?
			.dangerous()
			.with_custom_certificate_verifier(verifier);
		let mut config = match identity {
			Some(identity) => {
				builder.with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())?
			},
			None => builder.with_no_client_auth(),
		};
		config.enable_sni = enable_sni;
		config.resumption = Resumption::disabled();
		Ok(config)
	}

	/// Wraps `lower` with a TLS engine, driving the client handshake
	/// through the patience. `hostname` is used for SNI and the peer-name
	/// check when given.
	pub fn upgrade(
		&self,
		lower: Box<dyn Engine>,
		patience: &mut dyn Wait,
		hostname: Option<&str>,
	) -> Result<Box<dyn Engine>> {
		let (config, name) = match hostname {
			Some(hostname) => {
				let name = ServerName::try_from(hostname.to_string())
					.map_err(|_| Error::InvalidEndpoint(hostname.to_string()))?;
				(self.sni.clone(), name)
			},
			None => {
				// the verifier ignores the name and SNI is disabled; any
				// syntactically valid placeholder will do
				let name = ServerName::try_from(String::from("unverified.invalid"))
					.map_err(|_| Error::runtime("placeholder-server-name"))?;
				(self.no_sni.clone(), name)
			},
		};
		let conn = ClientConnection::new(config, name)?;
		engine::establish(Connection::from(conn), lower, patience, true)
	}
}

impl fmt::Debug for ClientContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientContext").finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const LOCALHOST_SAN: &[&str] = &["localhost", "*.example.test"];

	fn self_signed() -> (CertificateDer<'static>, Vec<u8>) {
		let key = rcgen::generate_simple_self_signed(
			LOCALHOST_SAN.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
		)
		.expect("self-signed certificate");
		(key.cert.der().clone(), key.key_pair.serialize_der())
	}

	#[test]
	fn certificate_hostname_matching() {
		let (der, _) = self_signed();
		let certificate = Certificate::parse(der.as_ref()).unwrap();
		assert!(certificate.matches_hostname("localhost"));
		assert!(certificate.matches_hostname("a.example.test"));
		// the wildcard covers exactly one label
		assert!(!certificate.matches_hostname("a.b.example.test"));
		assert!(!certificate.matches_hostname("example.test"));
		assert!(!certificate.matches_hostname("elsewhere.invalid"));
	}

	#[test]
	fn dns_matching_rules() {
		assert!(dns_name_matches("Example.COM", "example.com"));
		assert!(dns_name_matches("*.example.com", "www.example.com"));
		assert!(!dns_name_matches("*.example.com", "example.com"));
		assert!(!dns_name_matches("*.example.com", "a.b.example.com"));
		assert!(!dns_name_matches("example.com", "www.example.com"));
	}

	#[test]
	fn contexts_construct_from_der_identity() {
		let (cert, key) = self_signed();
		let identity = Identity::from_der(
			vec![cert.clone()],
			PrivateKeyDer::from(rustls::pki_types::PrivatePkcs8KeyDer::from(key.clone())),
		);
		ServerContext::new(identity.clone(), TlsOptions::default()).unwrap();
		let authority = Authority::empty().with_certificate(cert).unwrap();
		ClientContext::new(authority, None, TlsOptions::default(), None).unwrap();
	}

	#[test]
	fn disabling_all_versions_is_an_error() {
		let options = TlsOptions {
			tls12: false,
			tls13: false,
		};
		assert!(options.versions().is_err());
	}
}
