#![forbid(unsafe_code)]

use seqsync_domain::{AuthKeyId, ChannelId, UserId};
use seqsync_protocol::pb::rpc_request::Call;
use seqsync_protocol::pb::rpc_response::Reply;
use seqsync_protocol::{PROTOCOL_VERSION, call_name, codes, pb};
use tracing::{debug, warn};

use crate::server::error::SyncError;
use crate::server::service::SyncService;

pub fn response(call_id: u64, reply: Reply) -> pb::RpcResponse {
	pb::RpcResponse {
		version: PROTOCOL_VERSION,
		call_id,
		result: Some(reply),
	}
}

pub fn error_response(call_id: u64, code: &str, message: impl Into<String>) -> pb::RpcResponse {
	response(
		call_id,
		Reply::Error(pb::RpcError {
			code: code.to_string(),
			message: message.into(),
			floor_pts: 0,
		}),
	)
}

/// Check the framing-level fields every request must carry.
pub fn validate_request(req: &pb::RpcRequest) -> Result<&Call, pb::RpcResponse> {
	if req.version != PROTOCOL_VERSION {
		metrics::counter!("seqsync_rpc_errors_total", "code" => codes::UNSUPPORTED_VERSION).increment(1);
		return Err(error_response(
			req.call_id,
			codes::UNSUPPORTED_VERSION,
			format!("unsupported protocol version {} (expected {PROTOCOL_VERSION})", req.version),
		));
	}
	req.call.as_ref().ok_or_else(|| {
		metrics::counter!("seqsync_rpc_errors_total", "code" => codes::INVALID_REQUEST).increment(1);
		error_response(req.call_id, codes::INVALID_REQUEST, "missing call")
	})
}

/// Run one unary call and build its response. Failures become `RpcError` replies.
pub async fn dispatch(service: &SyncService, req: pb::RpcRequest) -> pb::RpcResponse {
	let call = match validate_request(&req) {
		Ok(call) => call.clone(),
		Err(resp) => return resp,
	};

	let method = call_name(&call);
	metrics::counter!("seqsync_rpc_requests_total", "method" => method).increment(1);

	match handle_unary(service, call).await {
		Ok(reply) => {
			debug!(method, call_id = req.call_id, "rpc ok");
			response(req.call_id, reply)
		}
		Err(e) => {
			let code = e.code();
			metrics::counter!("seqsync_rpc_errors_total", "code" => code).increment(1);
			match &e {
				SyncError::InvalidRequest(_) | SyncError::GapUnresolvable { .. } => {
					debug!(method, call_id = req.call_id, code, error = %e, "rpc rejected");
				}
				SyncError::Sequence(_) | SyncError::Store(_) => {
					warn!(method, call_id = req.call_id, code, error = %e, "rpc failed");
				}
			}
			response(req.call_id, Reply::Error(e.to_pb()))
		}
	}
}

async fn handle_unary(service: &SyncService, call: Call) -> Result<Reply, SyncError> {
	match call {
		Call::SyncUpdatesData(req) => service.sync_updates(req).await.map(Reply::ClientUpdatesState),
		Call::PushUpdatesData(req) => service.push_updates(req).await.map(|()| Reply::Void(pb::Void {})),
		Call::GetUserGtPtsUpdatesData(req) => service
			.user_updates_since(UserId(req.user_id), req.pts, req.limit)
			.await
			.map(Reply::UpdateList),
		Call::GetChannelGtPtsUpdatesData(req) => service
			.channel_updates_since(ChannelId(req.channel_id), req.pts, req.limit)
			.await
			.map(Reply::UpdateList),
		Call::GetServerUpdatesState(req) => service
			.server_state(AuthKeyId(req.auth_key_id), UserId(req.user_id))
			.await
			.map(|st| Reply::UpdatesState(st.into())),
		Call::UpdateUpdatesState(req) => service
			.commit_state(AuthKeyId(req.auth_key_id), UserId(req.user_id), req.pts, req.qts)
			.await
			.map(|_| Reply::Void(pb::Void {})),
		Call::GetCurrentChannelPts(req) => service
			.current_channel_pts(ChannelId(req.channel_id))
			.await
			.map(|st| Reply::SeqId(pb::SeqId { pts: st.pts })),
		Call::AttachSession(_) => Err(SyncError::invalid("attach_session must open its own stream")),
	}
}
