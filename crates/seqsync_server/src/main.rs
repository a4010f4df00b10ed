#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use seqsync_util::endpoint::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::config::{QuicServerConfig, TlsSource};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::service::{SyncService, SyncServiceConfig};
use crate::server::store::Stores;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: seqsync_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: quic://127.0.0.1:18300)\n\
\t          Format: quic://host:port\n\
\t--config   Config file (default: ~/.seqsync/server.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind_addr: SocketAddr,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18300".to_string();
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind_addr = bind.socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind_addr, config_path }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,seqsync_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("seqsync_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_stores(cfg: &ServerConfig) -> anyhow::Result<Stores> {
	let retention_window = cfg.backfill.retention_window;
	if !cfg.persistence.enabled {
		warn!("persistence disabled: sequence state lives in memory and is lost on restart");
		return Ok(Stores::in_memory(retention_window));
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow!("persistence enabled but no database_url configured"));
	};
	let stores = Stores::connect(database_url, retention_window).await?;
	info!("persistent sequence store ready");
	Ok(stores)
}

fn tls_source(cfg: &ServerConfig) -> TlsSource {
	match (cfg.server.tls_cert_path.clone(), cfg.server.tls_key_path.clone()) {
		(Some(cert_path), Some(key_path)) => TlsSource::Pem { cert_path, key_path },
		_ => TlsSource::DevSelfSigned,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	// A server that cannot reach its sequence store must not accept calls.
	let stores = build_stores(&server_cfg).await?;
	let service = Arc::new(SyncService::new(
		stores,
		SyncServiceConfig {
			block_size: server_cfg.sequence.block_size,
			max_page: server_cfg.backfill.max_page,
			session_queue_capacity: server_cfg.push.session_queue_capacity,
		},
	));

	let tls = tls_source(&server_cfg);
	if let TlsSource::Pem { cert_path, key_path } = &tls {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
	}
	let (endpoint, server_cert_der) = QuicServerConfig::new(args.bind_addr).bind(&tls)?;
	info!(
		bind = %args.bind_addr,
		cert_der_len = server_cert_der.len(),
		"seqsync_server: QUIC endpoint ready"
	);

	let conn_settings = ConnectionSettings::default();
	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("seqsync_connections_total").increment(1);

		let service = Arc::clone(&service);
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, service, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
