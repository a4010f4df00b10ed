#![forbid(unsafe_code)]

//! Sync client facade.
//!
//! One [`SyncClient`] per process, connected once at startup and shared by every
//! request handler. Each method is an independent remote call with its own deadline;
//! failures are returned as-is, without retries or local caching.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use quinn::Endpoint;
use seqsync_domain::{Actor, AuthKeyId, ChannelId, PushType, RpcCorrelation, StreamKey, UpdatesState, UserId};
use seqsync_protocol::convert::{correlation_from_pb, correlation_to_pb};
use seqsync_protocol::pb::rpc_request::Call;
use seqsync_protocol::pb::rpc_response::Reply;
use seqsync_protocol::{
	DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FramingError, PROTOCOL_VERSION, call_name, codes, decode_frame,
	encode_frame, envelope, pb,
};
use seqsync_util::endpoint::{EndpointError, QuicEndpoint};
use tracing::{debug, info};

pub mod gap;
pub mod session;
mod tls;

pub use gap::{Backfill, GapDetector};
pub use session::{FeedItem, SessionFeed};

/// Default server endpoint for local development.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18300";

/// Default page size asked for by backfill helpers; the server caps it further.
pub const DEFAULT_BACKFILL_LIMIT: u32 = 1_000;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
	/// Remote server host (DNS name or IP literal); also the TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// DER certificate the server must present. `None` disables verification (dev only).
	pub server_cert_der: Option<Vec<u8>>,

	/// Identifies the calling service in push/sync requests.
	pub server_id: String,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,

	/// Deadline for each remote call.
	pub call_timeout: Duration,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,
}

impl SyncClientConfig {
	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, SyncClientError> {
		let e = QuicEndpoint::parse(endpoint)?;
		Ok(Self {
			server_host: e.server_name().to_string(),
			server_port: e.port,
			server_addr: e.socket_addr().ok(),
			..Self::default()
		})
	}
}

impl Default for SyncClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18300,
			server_addr: Some(SocketAddr::from(([127, 0, 0, 1], 18300))),
			server_cert_der: None,
			server_id: format!("seqsync-client/{}", env!("CARGO_PKG_VERSION")),
			connect_timeout: Duration::from_secs(10),
			call_timeout: Duration::from_secs(5),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SyncClientError {
	#[error("invalid endpoint: {0}")]
	InvalidEndpoint(#[from] EndpointError),

	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error("connection error: {0}")]
	Connection(#[from] quinn::ConnectionError),

	#[error("write failed: {0}")]
	Write(#[from] quinn::WriteError),

	#[error("read failed: {0}")]
	ReadToEnd(#[from] quinn::ReadToEndError),

	#[error("read failed: {0}")]
	Read(#[from] quinn::ReadError),

	#[error("stream already closed")]
	ClosedStream(#[from] quinn::ClosedStream),

	#[error("{method} timed out after {after:?}")]
	Timeout { method: &'static str, after: Duration },

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected reply shape or ordering.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("remote error {code}: {message}")]
	Remote { code: String, message: String },

	/// Requested history is gone; the caller must resync full state.
	#[error("pts {requested} predates retained history (floor {floor})")]
	GapUnresolvable { requested: u32, floor: u32 },
}

fn remote_error(err: pb::RpcError, requested: u32) -> SyncClientError {
	if err.code == codes::GAP_UNRESOLVABLE {
		SyncClientError::GapUnresolvable {
			requested,
			floor: err.floor_pts,
		}
	} else {
		SyncClientError::Remote {
			code: err.code,
			message: err.message,
		}
	}
}

fn unexpected(method: &str, reply: Reply) -> SyncClientError {
	SyncClientError::Protocol(format!("{method}: unexpected reply {reply:?}"))
}

/// Correlation carried by an RPC_RESULT reply, if any.
pub fn rpc_correlation(state: &pb::ClientUpdatesState) -> Option<RpcCorrelation> {
	state.rpc_result.as_ref().and_then(correlation_from_pb)
}

/// Shared handle on one QUIC connection. Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct SyncClient {
	_endpoint: Endpoint,
	conn: quinn::Connection,
	next_call_id: Arc<AtomicU64>,
	server_id: String,
	call_timeout: Duration,
	max_frame_bytes: usize,
}

impl SyncClient {
	/// Connect; an unreachable server is an error for the caller's startup to act on.
	pub async fn connect(cfg: SyncClientConfig) -> Result<Self, SyncClientError> {
		let endpoint = make_client_endpoint().map_err(|e| SyncClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg =
			tls::client_config(cfg.server_cert_der.as_deref()).map_err(|e| SyncClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| SyncClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(SyncClientError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| SyncClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			SyncClientError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected to sync server");

		Ok(Self {
			_endpoint: endpoint,
			conn,
			next_call_id: Arc::new(AtomicU64::new(1)),
			server_id: cfg.server_id,
			call_timeout: cfg.call_timeout,
			max_frame_bytes: cfg.max_frame_bytes,
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}

	fn request(&self, call: Call) -> pb::RpcRequest {
		pb::RpcRequest {
			version: PROTOCOL_VERSION,
			call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
			call: Some(call),
		}
	}

	/// Send one request on a fresh stream and read its single response.
	async fn round_trip(&self, call: Call) -> Result<Reply, SyncClientError> {
		let method = call_name(&call);
		let req = self.request(call);
		let call_id = req.call_id;

		let exchange = async {
			let (mut send, mut recv) = self.conn.open_bi().await?;
			let frame = encode_frame(&req, self.max_frame_bytes)?;
			send.write_all(&frame).await?;
			send.finish()?;
			let bytes = recv.read_to_end(self.max_frame_bytes + FRAME_HEADER_LEN).await?;
			let (resp, _) = decode_frame::<pb::RpcResponse>(&bytes, self.max_frame_bytes)?;
			Ok::<_, SyncClientError>(resp)
		};

		let resp = tokio::time::timeout(self.call_timeout, exchange)
			.await
			.map_err(|_| SyncClientError::Timeout {
				method,
				after: self.call_timeout,
			})??;

		if resp.call_id != call_id {
			return Err(SyncClientError::Protocol(format!(
				"{method}: response for call {} on call {call_id}",
				resp.call_id
			)));
		}
		debug!(method, call_id, "call completed");
		resp.result
			.ok_or_else(|| SyncClientError::Protocol(format!("{method}: empty response")))
	}

	/// Raw call; error replies become [`SyncClientError::Remote`].
	pub async fn call(&self, call: Call) -> Result<Reply, SyncClientError> {
		match self.round_trip(call).await? {
			Reply::Error(e) => Err(remote_error(e, 0)),
			other => Ok(other),
		}
	}

	fn updates_request(
		&self,
		push_type: PushType,
		actor: Option<Actor>,
		user_id: UserId,
		client_msg_id: i64,
		updates: Vec<pb::Update>,
		correlation: Option<RpcCorrelation>,
	) -> pb::UpdatesRequest {
		pb::UpdatesRequest {
			push_type: pb::PushType::from(push_type) as i32,
			server_id: self.server_id.clone(),
			auth_key_id: actor.map(|a| a.auth_key_id.get()).unwrap_or(0),
			session_id: actor.map(|a| a.session_id.get()).unwrap_or(0),
			push_user_id: user_id.get(),
			client_msg_id,
			updates: Some(envelope::wrap(updates, 0, 0)),
			rpc_result: correlation.as_ref().and_then(correlation_to_pb),
		}
	}

	async fn sync(&self, req: pb::UpdatesRequest) -> Result<pb::ClientUpdatesState, SyncClientError> {
		match self.call(Call::SyncUpdatesData(req)).await? {
			Reply::ClientUpdatesState(st) => Ok(st),
			other => Err(unexpected("sync_updates_data", other)),
		}
	}

	async fn push(&self, req: pb::UpdatesRequest) -> Result<(), SyncClientError> {
		match self.call(Call::PushUpdatesData(req)).await? {
			Reply::Void(_) => Ok(()),
			other => Err(unexpected("push_updates_data", other)),
		}
	}

	/// Publish on behalf of `actor`: the reply carries `correlation` filled with the
	/// issued pts, and the user's other sessions get a push.
	pub async fn sync_rpc_result(
		&self,
		actor: Actor,
		client_msg_id: i64,
		updates: Vec<pb::Update>,
		correlation: RpcCorrelation,
	) -> Result<pb::ClientUpdatesState, SyncClientError> {
		let req = self.updates_request(
			PushType::RpcResult,
			Some(actor),
			actor.user_id,
			client_msg_id,
			updates,
			Some(correlation),
		);
		self.sync(req).await
	}

	async fn sync_one_correlated(
		&self,
		actor: Actor,
		client_msg_id: i64,
		update: pb::Update,
		template: RpcCorrelation,
	) -> Result<RpcCorrelation, SyncClientError> {
		let st = self.sync_rpc_result(actor, client_msg_id, vec![update], template).await?;
		rpc_correlation(&st)
			.ok_or_else(|| SyncClientError::Protocol("sync_updates_data: reply without rpc_result".to_string()))
	}

	pub async fn sync_one_update_affected_messages(
		&self,
		actor: Actor,
		client_msg_id: i64,
		update: pb::Update,
	) -> Result<RpcCorrelation, SyncClientError> {
		self.sync_one_correlated(actor, client_msg_id, update, RpcCorrelation::affected_messages())
			.await
	}

	pub async fn sync_one_update_affected_history(
		&self,
		actor: Actor,
		client_msg_id: i64,
		update: pb::Update,
		offset: i32,
	) -> Result<RpcCorrelation, SyncClientError> {
		self.sync_one_correlated(actor, client_msg_id, update, RpcCorrelation::affected_history(offset))
			.await
	}

	/// Publish for all of the actor's user sessions except the actor, returning the new state.
	pub async fn sync_updates(
		&self,
		actor: Actor,
		client_msg_id: i64,
		updates: Vec<pb::Update>,
	) -> Result<pb::ClientUpdatesState, SyncClientError> {
		let req = self.updates_request(PushType::UserNotMe, Some(actor), actor.user_id, client_msg_id, updates, None);
		self.sync(req).await
	}

	pub async fn sync_one_update(
		&self,
		actor: Actor,
		client_msg_id: i64,
		update: pb::Update,
	) -> Result<pb::ClientUpdatesState, SyncClientError> {
		self.sync_updates(actor, client_msg_id, vec![update]).await
	}

	pub async fn push_to_user_not_me_updates(&self, actor: Actor, updates: Vec<pb::Update>) -> Result<(), SyncClientError> {
		let req = self.updates_request(PushType::UserNotMe, Some(actor), actor.user_id, 0, updates, None);
		self.push(req).await
	}

	pub async fn push_to_user_not_me_update(&self, actor: Actor, update: pb::Update) -> Result<(), SyncClientError> {
		self.push_to_user_not_me_updates(actor, vec![update]).await
	}

	pub async fn push_to_user_me_updates(&self, actor: Actor, updates: Vec<pb::Update>) -> Result<(), SyncClientError> {
		let req = self.updates_request(PushType::UserMe, Some(actor), actor.user_id, 0, updates, None);
		self.push(req).await
	}

	pub async fn push_to_user_me_update(&self, actor: Actor, update: pb::Update) -> Result<(), SyncClientError> {
		self.push_to_user_me_updates(actor, vec![update]).await
	}

	/// Push to every live session of `user_id`.
	pub async fn push_to_user_updates(&self, user_id: UserId, updates: Vec<pb::Update>) -> Result<(), SyncClientError> {
		let req = self.updates_request(PushType::User, None, user_id, 0, updates, None);
		self.push(req).await
	}

	pub async fn push_to_user_update(&self, user_id: UserId, update: pb::Update) -> Result<(), SyncClientError> {
		self.push_to_user_updates(user_id, vec![update]).await
	}

	pub async fn get_current_channel_pts(&self, channel_id: ChannelId) -> Result<u32, SyncClientError> {
		let call = Call::GetCurrentChannelPts(pb::ChannelPtsRequest {
			channel_id: channel_id.get(),
		});
		match self.call(call).await? {
			Reply::SeqId(id) => Ok(id.pts),
			other => Err(unexpected("get_current_channel_pts", other)),
		}
	}

	async fn backfill(&self, call: Call, pts: u32) -> Result<pb::UpdateList, SyncClientError> {
		match self.round_trip(call).await? {
			Reply::UpdateList(list) => Ok(list),
			Reply::Error(e) => Err(remote_error(e, pts)),
			other => Err(unexpected("backfill", other)),
		}
	}

	/// Updates on the user's pts stream with pts greater than `pts`, oldest first.
	pub async fn get_user_updates_since(
		&self,
		user_id: UserId,
		pts: u32,
		limit: u32,
	) -> Result<pb::UpdateList, SyncClientError> {
		let call = Call::GetUserGtPtsUpdatesData(pb::UserGtPtsUpdatesRequest {
			user_id: user_id.get(),
			pts,
			limit,
		});
		self.backfill(call, pts).await
	}

	pub async fn get_channel_updates_since(
		&self,
		channel_id: ChannelId,
		pts: u32,
		limit: u32,
	) -> Result<pb::UpdateList, SyncClientError> {
		let call = Call::GetChannelGtPtsUpdatesData(pb::ChannelGtPtsUpdatesRequest {
			channel_id: channel_id.get(),
			pts,
			limit,
		});
		self.backfill(call, pts).await
	}

	/// Current server counters for a user; `user_id` may be zero when the key is bound.
	pub async fn get_server_updates_state(
		&self,
		auth_key_id: AuthKeyId,
		user_id: UserId,
	) -> Result<UpdatesState, SyncClientError> {
		let call = Call::GetServerUpdatesState(pb::UpdatesStateRequest {
			auth_key_id: auth_key_id.get(),
			user_id: user_id.get(),
			pts: 0,
			qts: 0,
		});
		match self.call(call).await? {
			Reply::UpdatesState(st) => Ok(st.into()),
			other => Err(unexpected("get_server_updates_state", other)),
		}
	}

	/// Persist an acknowledged `(pts, qts)` for an auth key without emitting any update.
	pub async fn update_auth_state_seq(
		&self,
		auth_key_id: AuthKeyId,
		user_id: UserId,
		pts: u32,
		qts: u32,
	) -> Result<(), SyncClientError> {
		let call = Call::UpdateUpdatesState(pb::UpdatesStateRequest {
			auth_key_id: auth_key_id.get(),
			user_id: user_id.get(),
			pts,
			qts,
		});
		match self.call(call).await? {
			Reply::Void(_) => Ok(()),
			other => Err(unexpected("update_updates_state", other)),
		}
	}

	/// Register `actor` as a live session and return its push feed plus starting state.
	///
	/// Every update published after the returned state is delivered on the feed.
	pub async fn attach_session(&self, actor: Actor) -> Result<(SessionFeed, UpdatesState), SyncClientError> {
		let req = self.request(Call::AttachSession(pb::AttachSession {
			auth_key_id: actor.auth_key_id.get(),
			session_id: actor.session_id.get(),
			user_id: actor.user_id.get(),
		}));
		let call_id = req.call_id;

		let open = async {
			let (mut send, recv) = self.conn.open_bi().await?;
			send.write_all(&encode_frame(&req, self.max_frame_bytes)?).await?;
			send.finish()?;

			let mut feed = SessionFeed::new(recv, call_id, self.max_frame_bytes);
			let first = feed.next_reply().await?;
			Ok::<_, SyncClientError>((feed, first))
		};

		let (feed, first) = tokio::time::timeout(self.call_timeout, open)
			.await
			.map_err(|_| SyncClientError::Timeout {
				method: "attach_session",
				after: self.call_timeout,
			})??;

		match first {
			Some(Reply::Attached(a)) => {
				let state = a.state.map(UpdatesState::from).unwrap_or_default();
				info!(session = %actor.session(), pts = state.pts, "session attached");
				Ok((feed, state))
			}
			Some(Reply::Error(e)) => Err(remote_error(e, 0)),
			Some(other) => Err(unexpected("attach_session", other)),
			None => Err(SyncClientError::Protocol(
				"attach_session: stream closed before Attached".to_string(),
			)),
		}
	}
}

#[async_trait::async_trait]
impl Backfill for SyncClient {
	async fn updates_since(&self, stream: StreamKey, pts: u32, limit: u32) -> Result<pb::UpdateList, SyncClientError> {
		match stream {
			StreamKey::User(user_id) => self.get_user_updates_since(user_id, pts, limit).await,
			StreamKey::Channel(channel_id) => self.get_channel_updates_since(channel_id, pts, limit).await,
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}
