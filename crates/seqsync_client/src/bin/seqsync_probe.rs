#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context as _;
use futures::StreamExt;
use seqsync_client::{DEFAULT_SERVER_ENDPOINT_QUIC, FeedItem, GapDetector, SyncClient, SyncClientConfig, SyncClientError};
use seqsync_domain::{Actor, AuthKeyId, SessionId, StreamKey, UserId};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: seqsync_probe --user id --auth-key id [--session id] [--connect quic://host:port] [--cert path]\n\
\n\
Options:\n\
	--connect   Server endpoint (default: quic://127.0.0.1:18300)\n\
	--user      User id to attach as\n\
	--auth-key  Authorization key id\n\
	--session   Session id (default: process id)\n\
	--cert      DER certificate to pin (default: no verification, dev only)\n\
	--help      Show this help\n\
\n\
Attaches as a live session and prints every update in pts order.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,seqsync_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	actor: Actor,
	cert: Option<PathBuf>,
}

fn parse_id(flag: &str, v: &str) -> i64 {
	v.parse().unwrap_or_else(|_| {
		eprintln!("Invalid {flag} value: {v}");
		usage_and_exit()
	})
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();
	let mut user_id = None;
	let mut auth_key_id = None;
	let mut session_id = i64::from(std::process::id());
	let mut cert = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = value(),
			"--user" => user_id = Some(parse_id("--user", &value())),
			"--auth-key" => auth_key_id = Some(parse_id("--auth-key", &value())),
			"--session" => session_id = parse_id("--session", &value()),
			"--cert" => cert = Some(PathBuf::from(value())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (Some(user_id), Some(auth_key_id)) = (user_id, auth_key_id) else {
		eprintln!("--user and --auth-key are required");
		usage_and_exit();
	};

	Args {
		endpoint,
		actor: Actor::new(AuthKeyId(auth_key_id), SessionId(session_id), UserId(user_id)),
		cert,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let mut cfg = SyncClientConfig::from_quic_endpoint(&args.endpoint)?;
	if let Some(path) = &args.cert {
		cfg.server_cert_der = Some(std::fs::read(path).with_context(|| format!("read cert {}", path.display()))?);
	}

	let client = SyncClient::connect(cfg).await?;
	let (feed, state) = client.attach_session(args.actor).await?;
	info!(session = %args.actor.session(), pts = state.pts, qts = state.qts, seq = state.seq, "attached");

	let mut gaps = GapDetector::new(client.clone(), StreamKey::User(args.actor.user_id), state.pts);

	let mut pushes = std::pin::pin!(feed.into_stream());
	while let Some(item) = pushes.next().await {
		let applied = match item? {
			FeedItem::Updates(updates) => gaps.accept_envelope(updates).await,
			FeedItem::Lagged { dropped } => {
				warn!(dropped, "push stream lagged; resyncing");
				gaps.on_lagged().await
			}
		};

		match applied {
			Ok(updates) => {
				for u in updates {
					println!("pts={} kind={} bytes={}", u.pts, u.kind, u.payload.len());
				}
			}
			Err(SyncClientError::GapUnresolvable { requested, floor }) => {
				let fresh = client
					.get_server_updates_state(args.actor.auth_key_id, args.actor.user_id)
					.await?;
				warn!(requested, floor, pts = fresh.pts, "history gone; restarting from server state");
				gaps.reset(fresh.pts);
			}
			Err(e) => return Err(e.into()),
		}
	}

	info!("server closed the push stream");
	Ok(())
}
