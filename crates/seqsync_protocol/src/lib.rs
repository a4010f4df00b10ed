#![forbid(unsafe_code)]

pub mod convert;
pub mod envelope;
pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FramingError, decode_frame, encode_frame, encode_frame_default,
	encode_frame_into, try_decode_frame_from_buffer,
};

/// Protobuf types (`seqsync.v1`).
#[allow(clippy::large_enum_variant)]
pub mod pb;

/// Wire protocol version carried in `RpcRequest.version` / `RpcResponse.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// TLS ALPN identifier for the QUIC transport.
pub const ALPN: &[u8] = b"seqsync-v1";

/// Stable `RpcError.code` values.
pub mod codes {
	pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
	pub const SEQUENCE_ALLOCATION_FAILED: &str = "SEQUENCE_ALLOCATION_FAILED";
	/// Requested pts predates retained history; the consumer must resync full state.
	pub const GAP_UNRESOLVABLE: &str = "GAP_UNRESOLVABLE";
	pub const STORE_FAILURE: &str = "STORE_FAILURE";
	pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
}

/// Short method label for a call, used in logs and metrics.
pub fn call_name(call: &pb::rpc_request::Call) -> &'static str {
	use pb::rpc_request::Call;
	match call {
		Call::SyncUpdatesData(_) => "sync_updates_data",
		Call::PushUpdatesData(_) => "push_updates_data",
		Call::GetUserGtPtsUpdatesData(_) => "get_user_gt_pts_updates_data",
		Call::GetChannelGtPtsUpdatesData(_) => "get_channel_gt_pts_updates_data",
		Call::GetServerUpdatesState(_) => "get_server_updates_state",
		Call::UpdateUpdatesState(_) => "update_updates_state",
		Call::GetCurrentChannelPts(_) => "get_current_channel_pts",
		Call::AttachSession(_) => "attach_session",
	}
}
