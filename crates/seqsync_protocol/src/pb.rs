//! Protobuf message set for `seqsync.v1`, declared with prost derives.
//!
//! Tag numbers are part of the wire contract; never renumber a field.

/// Which counter an update consumes when it is published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SeqClass {
	/// Ephemeral; no counter is advanced and the update is not retained.
	None = 0,
	Pts = 1,
	Qts = 2,
	Channel = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PushType {
	Unspecified = 0,
	User = 1,
	UserMe = 2,
	UserNotMe = 3,
	RpcResult = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Update {
	#[prost(string, tag = "1")]
	pub kind: ::prost::alloc::string::String,
	#[prost(bytes = "vec", tag = "2")]
	pub payload: ::prost::alloc::vec::Vec<u8>,
	#[prost(enumeration = "SeqClass", tag = "3")]
	pub seq_class: i32,
	#[prost(uint32, tag = "4")]
	pub pts: u32,
	#[prost(uint32, tag = "5")]
	pub pts_count: u32,
	#[prost(uint32, tag = "6")]
	pub qts: u32,
	#[prost(int64, tag = "7")]
	pub channel_id: i64,
	#[prost(int64, tag = "8")]
	pub date: i64,
}

/// Compact shape for exactly one update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateShort {
	#[prost(message, optional, tag = "1")]
	pub update: ::core::option::Option<Update>,
	#[prost(int64, tag = "2")]
	pub date: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdatesBatch {
	#[prost(message, repeated, tag = "1")]
	pub updates: ::prost::alloc::vec::Vec<Update>,
	#[prost(int64, tag = "2")]
	pub date: i64,
	#[prost(uint32, tag = "3")]
	pub seq: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Updates {
	#[prost(oneof = "updates::Shape", tags = "1, 2")]
	pub shape: ::core::option::Option<updates::Shape>,
}

pub mod updates {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Shape {
		#[prost(message, tag = "1")]
		Short(super::UpdateShort),
		#[prost(message, tag = "2")]
		Batch(super::UpdatesBatch),
	}
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AffectedMessages {
	#[prost(uint32, tag = "1")]
	pub pts: u32,
	#[prost(uint32, tag = "2")]
	pub pts_count: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AffectedHistory {
	#[prost(uint32, tag = "1")]
	pub pts: u32,
	#[prost(uint32, tag = "2")]
	pub pts_count: u32,
	#[prost(int32, tag = "3")]
	pub offset: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResultData {
	#[prost(oneof = "rpc_result_data::Outcome", tags = "1, 2")]
	pub outcome: ::core::option::Option<rpc_result_data::Outcome>,
}

pub mod rpc_result_data {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Outcome {
		#[prost(message, tag = "1")]
		AffectedMessages(super::AffectedMessages),
		#[prost(message, tag = "2")]
		AffectedHistory(super::AffectedHistory),
	}
}

/// Body of `SyncUpdatesData` and `PushUpdatesData`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdatesRequest {
	#[prost(enumeration = "PushType", tag = "1")]
	pub push_type: i32,
	#[prost(string, tag = "2")]
	pub server_id: ::prost::alloc::string::String,
	#[prost(int64, tag = "3")]
	pub auth_key_id: i64,
	#[prost(int64, tag = "4")]
	pub session_id: i64,
	#[prost(int64, tag = "5")]
	pub push_user_id: i64,
	#[prost(int64, tag = "6")]
	pub client_msg_id: i64,
	#[prost(message, optional, tag = "7")]
	pub updates: ::core::option::Option<Updates>,
	#[prost(message, optional, tag = "8")]
	pub rpc_result: ::core::option::Option<RpcResultData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientUpdatesState {
	#[prost(uint32, tag = "1")]
	pub pts: u32,
	#[prost(uint32, tag = "2")]
	pub pts_count: u32,
	#[prost(uint32, tag = "3")]
	pub qts: u32,
	#[prost(uint32, tag = "4")]
	pub seq: u32,
	#[prost(int64, tag = "5")]
	pub date: i64,
	#[prost(message, optional, tag = "6")]
	pub rpc_result: ::core::option::Option<RpcResultData>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UserGtPtsUpdatesRequest {
	#[prost(int64, tag = "1")]
	pub user_id: i64,
	#[prost(uint32, tag = "2")]
	pub pts: u32,
	/// Zero means the server's page size.
	#[prost(uint32, tag = "3")]
	pub limit: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ChannelGtPtsUpdatesRequest {
	#[prost(int64, tag = "1")]
	pub channel_id: i64,
	#[prost(uint32, tag = "2")]
	pub pts: u32,
	#[prost(uint32, tag = "3")]
	pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateList {
	#[prost(message, repeated, tag = "1")]
	pub updates: ::prost::alloc::vec::Vec<Update>,
	/// Highest pts the server vouches for in this reply.
	#[prost(uint32, tag = "2")]
	pub current_pts: u32,
	#[prost(bool, tag = "3")]
	pub has_more: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UpdatesStateRequest {
	#[prost(int64, tag = "1")]
	pub auth_key_id: i64,
	#[prost(int64, tag = "2")]
	pub user_id: i64,
	#[prost(uint32, tag = "3")]
	pub pts: u32,
	#[prost(uint32, tag = "4")]
	pub qts: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UpdatesState {
	#[prost(uint32, tag = "1")]
	pub pts: u32,
	#[prost(uint32, tag = "2")]
	pub qts: u32,
	#[prost(uint32, tag = "3")]
	pub seq: u32,
	#[prost(int64, tag = "4")]
	pub date: i64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ChannelPtsRequest {
	#[prost(int64, tag = "1")]
	pub channel_id: i64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SeqId {
	#[prost(uint32, tag = "1")]
	pub pts: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Void {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AttachSession {
	#[prost(int64, tag = "1")]
	pub auth_key_id: i64,
	#[prost(int64, tag = "2")]
	pub session_id: i64,
	#[prost(int64, tag = "3")]
	pub user_id: i64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Attached {
	#[prost(message, optional, tag = "1")]
	pub state: ::core::option::Option<UpdatesState>,
}

/// One item on an attached session's push stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushedUpdates {
	#[prost(message, optional, tag = "1")]
	pub updates: ::core::option::Option<Updates>,
	/// Pushes dropped for this session since the previous item.
	#[prost(uint64, tag = "2")]
	pub lagged_dropped: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
	#[prost(string, tag = "1")]
	pub code: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
	/// Set with `GAP_UNRESOLVABLE`: the lowest pts a backfill may start from.
	#[prost(uint32, tag = "3")]
	pub floor_pts: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	#[prost(uint64, tag = "2")]
	pub call_id: u64,
	#[prost(oneof = "rpc_request::Call", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
	pub call: ::core::option::Option<rpc_request::Call>,
}

pub mod rpc_request {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Call {
		#[prost(message, tag = "10")]
		SyncUpdatesData(super::UpdatesRequest),
		#[prost(message, tag = "11")]
		PushUpdatesData(super::UpdatesRequest),
		#[prost(message, tag = "12")]
		GetUserGtPtsUpdatesData(super::UserGtPtsUpdatesRequest),
		#[prost(message, tag = "13")]
		GetChannelGtPtsUpdatesData(super::ChannelGtPtsUpdatesRequest),
		#[prost(message, tag = "14")]
		GetServerUpdatesState(super::UpdatesStateRequest),
		#[prost(message, tag = "15")]
		UpdateUpdatesState(super::UpdatesStateRequest),
		#[prost(message, tag = "16")]
		GetCurrentChannelPts(super::ChannelPtsRequest),
		#[prost(message, tag = "17")]
		AttachSession(super::AttachSession),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	#[prost(uint64, tag = "2")]
	pub call_id: u64,
	#[prost(oneof = "rpc_response::Reply", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
	pub result: ::core::option::Option<rpc_response::Reply>,
}

pub mod rpc_response {
	#[allow(clippy::large_enum_variant)]
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Reply {
		#[prost(message, tag = "10")]
		ClientUpdatesState(super::ClientUpdatesState),
		#[prost(message, tag = "11")]
		Void(super::Void),
		#[prost(message, tag = "12")]
		UpdateList(super::UpdateList),
		#[prost(message, tag = "13")]
		UpdatesState(super::UpdatesState),
		#[prost(message, tag = "14")]
		SeqId(super::SeqId),
		#[prost(message, tag = "15")]
		Attached(super::Attached),
		#[prost(message, tag = "16")]
		Pushed(super::PushedUpdates),
		#[prost(message, tag = "17")]
		Error(super::RpcError),
	}
}
