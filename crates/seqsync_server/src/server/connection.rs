#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use seqsync_domain::{Actor, AuthKeyId, SessionId, UserId};
use seqsync_protocol::pb::rpc_request::Call;
use seqsync_protocol::pb::rpc_response::Reply;
use seqsync_protocol::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, decode_frame, encode_frame, pb};
use tracing::{debug, info, warn};

use crate::server::rpc::{dispatch, response, validate_request};
use crate::server::service::SyncService;
use crate::server::session_hub::PushItem;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

async fn send_response(
	send: &mut quinn::SendStream,
	resp: &pb::RpcResponse,
	max_frame_bytes: usize,
) -> anyhow::Result<()> {
	let frame = encode_frame(resp, max_frame_bytes).map_err(|e| anyhow!(e))?;
	send.write_all(&frame).await.context("write frame")?;
	Ok(())
}

/// Serve one QUIC connection: every bidirectional stream carries one call.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	service: Arc<SyncService>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("seqsync_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("seqsync_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	loop {
		let (send, recv) = match connection.accept_bi().await {
			Ok(streams) => streams,
			Err(quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed) => {
				debug!(conn_id, "connection closed");
				return Ok(());
			}
			Err(e) => return Err(anyhow!(e).context("accept bidirectional stream")),
		};

		let connection = connection.clone();
		let service = Arc::clone(&service);
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_stream(conn_id, connection, send, recv, service, settings).await {
				warn!(conn_id, error = %e, "stream handler exited with error");
			}
		});
	}
}

async fn handle_stream(
	conn_id: u64,
	connection: quinn::Connection,
	mut send: quinn::SendStream,
	mut recv: quinn::RecvStream,
	service: Arc<SyncService>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let bytes = recv
		.read_to_end(settings.max_frame_bytes + FRAME_HEADER_LEN)
		.await
		.context("read request")?;
	let (req, _) = decode_frame::<pb::RpcRequest>(&bytes, settings.max_frame_bytes).context("decode request")?;

	let attach = match validate_request(&req) {
		Ok(Call::AttachSession(a)) => Some(*a),
		Ok(_) => None,
		Err(resp) => {
			send_response(&mut send, &resp, settings.max_frame_bytes).await?;
			send.finish().ok();
			return Ok(());
		}
	};

	match attach {
		Some(a) => serve_attach(conn_id, connection, send, req.call_id, a, service, settings).await,
		None => {
			let resp = dispatch(&service, req).await;
			send_response(&mut send, &resp, settings.max_frame_bytes).await?;
			send.finish().ok();
			Ok(())
		}
	}
}

/// Keep an attach stream open, forwarding queued pushes until either side goes away.
async fn serve_attach(
	conn_id: u64,
	connection: quinn::Connection,
	mut send: quinn::SendStream,
	call_id: u64,
	req: pb::AttachSession,
	service: Arc<SyncService>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	metrics::counter!("seqsync_rpc_requests_total", "method" => "attach_session").increment(1);

	let actor = Actor::new(AuthKeyId(req.auth_key_id), SessionId(req.session_id), UserId(req.user_id));
	let (mut attachment, state) = match service.attach(actor).await {
		Ok(v) => v,
		Err(e) => {
			metrics::counter!("seqsync_rpc_errors_total", "code" => e.code()).increment(1);
			send_response(&mut send, &response(call_id, Reply::Error(e.to_pb())), settings.max_frame_bytes).await?;
			send.finish().ok();
			return Ok(());
		}
	};

	let result = async {
		let attached = pb::Attached {
			state: Some(state.into()),
		};
		send_response(&mut send, &response(call_id, Reply::Attached(attached)), settings.max_frame_bytes).await?;

		loop {
			let item = tokio::select! {
				item = attachment.rx.recv() => item,
				_ = connection.closed() => None,
				_ = send.stopped() => None,
			};
			let Some(item) = item else {
				return Ok::<(), anyhow::Error>(());
			};

			let pushed = match item {
				PushItem::Updates(updates) => pb::PushedUpdates {
					updates: Some(updates.as_ref().clone()),
					lagged_dropped: 0,
				},
				PushItem::Lagged { dropped } => {
					debug!(conn_id, session = %actor.session(), dropped, "session lagged");
					pb::PushedUpdates {
						updates: None,
						lagged_dropped: dropped,
					}
				}
			};
			send_response(&mut send, &response(call_id, Reply::Pushed(pushed)), settings.max_frame_bytes).await?;
		}
	}
	.await;

	service.detach(actor, attachment.registration).await;
	info!(conn_id, session = %actor.session(), "session detached");
	result
}
