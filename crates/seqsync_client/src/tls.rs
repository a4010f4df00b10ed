#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use quinn::{ClientConfig, TransportConfig, VarInt};
use rustls::pki_types::CertificateDer;
use tracing::warn;

/// QUIC client config trusting exactly `pinned_der`, or anything at all when `None`.
pub(crate) fn client_config(pinned_der: Option<&[u8]>) -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let mut tls = match pinned_der {
		Some(der) => {
			let mut roots = rustls::RootCertStore::empty();
			roots
				.add(CertificateDer::from(der.to_vec()))
				.context("add pinned server certificate")?;
			rustls::ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		}
		None => {
			warn!("server certificate is not pinned; skipping TLS verification (dev only)");
			let mut tls = rustls::ClientConfig::builder()
				.with_root_certificates(rustls::RootCertStore::empty())
				.with_no_client_auth();
			tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
			tls
		}
	};
	tls.alpn_protocols = vec![seqsync_protocol::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = ClientConfig::new(Arc::new(quic_tls));

	// The server never opens streams towards the client.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(0));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(std::time::Duration::from_secs(10)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &rustls::pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls::pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Err(rustls::Error::General("TLS1.2 not supported".into()))
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		vec![
			rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
			rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA256,
			rustls::SignatureScheme::RSA_PSS_SHA384,
			rustls::SignatureScheme::RSA_PSS_SHA512,
			rustls::SignatureScheme::ED25519,
		]
	}
}
