#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

/// Where the server's TLS identity comes from.
#[derive(Debug, Clone)]
pub enum TlsSource {
	/// Generated self-signed cert for `localhost`; development only.
	DevSelfSigned,
	Pem { cert_path: PathBuf, key_path: PathBuf },
}

/// QUIC listener settings for the sync service.
pub struct QuicServerConfig {
	pub bind_addr: SocketAddr,
	pub alpn_protocols: Vec<Vec<u8>>,
	/// Concurrent calls per connection; attached push streams count against this too.
	pub max_concurrent_bidi_streams: u32,
	pub keep_alive_interval: Duration,
}

impl QuicServerConfig {
	pub fn new(bind_addr: SocketAddr) -> Self {
		Self {
			bind_addr,
			alpn_protocols: vec![seqsync_protocol::ALPN.to_vec()],
			max_concurrent_bidi_streams: 256,
			keep_alive_interval: Duration::from_secs(10),
		}
	}

	/// Bind and return the endpoint plus the DER certificate it presents.
	pub fn bind(&self, tls: &TlsSource) -> anyhow::Result<(Endpoint, Vec<u8>)> {
		let (cert_chain, key) = match tls {
			TlsSource::DevSelfSigned => dev_identity()?,
			TlsSource::Pem { cert_path, key_path } => (load_cert_chain(cert_path)?, load_private_key(key_path)?),
		};
		let leaf_der = cert_chain
			.first()
			.map(|c| c.as_ref().to_vec())
			.ok_or_else(|| anyhow!("empty certificate chain"))?;

		let server_config = self.server_config(cert_chain, key)?;
		let endpoint = Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")?;
		Ok((endpoint, leaf_der))
	}

	fn server_config(
		&self,
		cert_chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
	) -> anyhow::Result<ServerConfig> {
		let mut tls_config = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(cert_chain, key)
			.context("build rustls server config")?;
		tls_config.alpn_protocols = self.alpn_protocols.clone();

		let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
			.context("convert rustls ServerConfig -> quinn QuicServerConfig")?;

		let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));

		let mut transport = quinn::TransportConfig::default();
		transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_bidi_streams));
		transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
		transport.keep_alive_interval(Some(self.keep_alive_interval));
		server_config.transport_config(Arc::new(transport));

		Ok(server_config)
	}
}

fn dev_identity() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;
	let cert = CertificateDer::from(ck.cert.der().to_vec());
	let key = PrivateKeyDer::try_from(ck.signing_key.serialize_der()).map_err(|e| anyhow!("parse private key der: {e}"))?;
	Ok((vec![cert], key))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let chain = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}
	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	private_key(&mut reader)
		.context("parse tls key")?
		.ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
