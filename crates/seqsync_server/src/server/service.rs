#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use seqsync_domain::{
	Actor, AuthKeyId, ChannelId, ChannelState, PushType, RpcCorrelation, SeqKey, SessionId, SessionRef, StreamKey, UpdatesState, UserId,
};
use seqsync_protocol::convert::{correlation_from_pb, correlation_to_pb, push_type_from_wire};
use seqsync_protocol::envelope::{self, Issued};
use seqsync_protocol::pb;
use seqsync_util::time::unix_secs_now;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::server::auth_state::AuthState;
use crate::server::error::SyncError;
use crate::server::routing::plan_delivery;
use crate::server::sequence::SequenceAuthority;
use crate::server::session_hub::{Attachment, SessionHub, SessionHubConfig};
use crate::server::store::Stores;

#[derive(Debug, Clone)]
pub struct SyncServiceConfig {
	pub block_size: u32,
	pub max_page: u32,
	pub session_queue_capacity: usize,
}

impl Default for SyncServiceConfig {
	fn default() -> Self {
		Self {
			block_size: 100,
			max_page: 1_000,
			session_queue_capacity: 1024,
		}
	}
}

/// Serialises publication and backfill per stream.
///
/// A call takes every stream lock it needs in `StreamKey` order, so a user lock always
/// comes before channel locks and two calls cannot deadlock.
#[derive(Default)]
struct StreamLocks {
	locks: DashMap<StreamKey, Arc<Mutex<()>>>,
}

impl StreamLocks {
	async fn lock(&self, streams: BTreeSet<StreamKey>) -> Vec<OwnedMutexGuard<()>> {
		let mut guards = Vec::with_capacity(streams.len());
		for stream in streams {
			let lock = self.locks.entry(stream).or_default().clone();
			guards.push(lock.lock_owned().await);
		}
		guards
	}
}

/// Result of publishing one `UpdatesRequest`.
#[derive(Debug, Clone)]
pub struct Published {
	pub state: pb::ClientUpdatesState,
	pub envelope: Arc<pb::Updates>,
	pub pushed_to: usize,
}

/// A validated push/sync request.
struct Publication {
	push_type: PushType,
	user_id: UserId,
	actor: Option<SessionRef>,
	changes: Vec<pb::Update>,
	correlation: Option<RpcCorrelation>,
}

impl Publication {
	fn parse(req: pb::UpdatesRequest) -> Result<Self, SyncError> {
		let push_type = push_type_from_wire(req.push_type)
			.ok_or_else(|| SyncError::invalid(format!("unknown push_type {}", req.push_type)))?;

		let user_id = UserId(req.push_user_id);
		if !user_id.is_set() {
			return Err(SyncError::invalid("push_user_id is required"));
		}

		let auth_key_id = AuthKeyId(req.auth_key_id);
		let actor = auth_key_id
			.is_set()
			.then(|| SessionRef::new(auth_key_id, SessionId(req.session_id)));
		if push_type.requires_actor() && actor.is_none() {
			return Err(SyncError::invalid(format!("{push_type} requires auth_key_id")));
		}

		let changes = envelope::into_vec(req.updates.unwrap_or_default());
		if changes.is_empty() {
			return Err(SyncError::invalid("no updates in request"));
		}
		for u in &changes {
			match pb::SeqClass::try_from(u.seq_class) {
				Ok(pb::SeqClass::Channel) if u.channel_id == 0 => {
					return Err(SyncError::invalid(format!("channel update {:?} without channel_id", u.kind)));
				}
				Ok(_) => {}
				Err(_) => return Err(SyncError::invalid(format!("unknown seq_class {}", u.seq_class))),
			}
		}

		let correlation = (push_type == PushType::RpcResult).then(|| {
			req.rpc_result
				.as_ref()
				.and_then(correlation_from_pb)
				.unwrap_or_else(RpcCorrelation::affected_messages)
		});

		Ok(Self {
			push_type,
			user_id,
			actor,
			changes,
			correlation,
		})
	}

	fn streams(&self) -> BTreeSet<StreamKey> {
		let mut streams = BTreeSet::from([StreamKey::User(self.user_id)]);
		streams.extend(
			self.changes
				.iter()
				.filter(|u| u.seq_class() == pb::SeqClass::Channel)
				.map(|u| StreamKey::Channel(ChannelId(u.channel_id))),
		);
		streams
	}
}

/// Sequence authority, update log and push fan-out behind the remote call surface.
pub struct SyncService {
	authority: SequenceAuthority,
	stores: Stores,
	hub: SessionHub,
	locks: StreamLocks,
	max_page: u32,
}

impl SyncService {
	pub fn new(stores: Stores, cfg: SyncServiceConfig) -> Self {
		Self {
			authority: SequenceAuthority::new(Arc::clone(&stores.seq_gen), cfg.block_size),
			hub: SessionHub::new(SessionHubConfig {
				session_queue_capacity: cfg.session_queue_capacity,
			}),
			stores,
			locks: StreamLocks::default(),
			max_page: cfg.max_page.max(1),
		}
	}

	pub fn authority(&self) -> &SequenceAuthority {
		&self.authority
	}

	pub fn hub(&self) -> &SessionHub {
		&self.hub
	}

	/// `SyncUpdatesData`.
	pub async fn sync_updates(&self, req: pb::UpdatesRequest) -> Result<pb::ClientUpdatesState, SyncError> {
		Ok(self.publish(req).await?.state)
	}

	/// `PushUpdatesData`: same publication, the caller only needs success.
	pub async fn push_updates(&self, req: pb::UpdatesRequest) -> Result<(), SyncError> {
		self.publish(req).await.map(|_| ())
	}

	pub async fn publish(&self, req: pb::UpdatesRequest) -> Result<Published, SyncError> {
		let p = Publication::parse(req)?;
		let user_id = p.user_id;
		let _guards = self.locks.lock(p.streams()).await;

		let date = unix_secs_now();
		let mut sealed = Vec::with_capacity(p.changes.len());
		let mut logged: Vec<(StreamKey, pb::Update)> = Vec::new();
		let mut pts_total: u32 = 0;
		let mut last_pts: Option<u32> = None;
		// Correlation covers every pts stream the call advanced, channels included.
		let mut corr_pts: Option<u32> = None;
		let mut corr_count: u32 = 0;
		let mut any_counter = false;

		// A failure past this point burns whatever was issued; nothing is logged or pushed.
		for change in &p.changes {
			let issued = match change.seq_class() {
				pb::SeqClass::Pts => {
					let n = envelope::effective_pts_count(change);
					let pts = self.authority.advance_by(SeqKey::user_pts(user_id), n).await?;
					pts_total = pts_total.saturating_add(n);
					last_pts = Some(pts);
					corr_pts = Some(pts);
					corr_count = corr_count.saturating_add(n);
					Issued::Pts { pts, pts_count: n }
				}
				pb::SeqClass::Qts => Issued::Qts {
					qts: self.authority.advance_by(SeqKey::user_qts(user_id), 1).await?,
				},
				pb::SeqClass::Channel => {
					let channel_id = ChannelId(change.channel_id);
					let n = envelope::effective_pts_count(change);
					let pts = self.authority.advance_by(SeqKey::Channel(channel_id), n).await?;
					corr_pts = Some(pts);
					corr_count = corr_count.saturating_add(n);
					Issued::Channel {
						channel_id,
						pts,
						pts_count: n,
					}
				}
				pb::SeqClass::None => Issued::Ephemeral,
			};

			let update = envelope::seal(change, issued, date);
			match issued {
				Issued::Pts { .. } => logged.push((StreamKey::User(user_id), update.clone())),
				Issued::Channel { channel_id, .. } => logged.push((StreamKey::Channel(channel_id), update.clone())),
				Issued::Qts { .. } | Issued::Ephemeral => {}
			}
			any_counter |= issued.consumes_counter();
			sealed.push(update);
		}

		let seq = if any_counter {
			self.authority.advance_by(SeqKey::user_seq(user_id), 1).await?
		} else {
			self.authority.current(SeqKey::user_seq(user_id)).await?
		};

		if !logged.is_empty() {
			self.stores.log.append(&logged).await.map_err(SyncError::Store)?;
		}

		let envelope = Arc::new(envelope::wrap(sealed, date, seq));
		let live = self.hub.live_sessions(user_id).await;
		let plan = plan_delivery(p.push_type, p.actor, &live);
		let stats = self.hub.deliver(user_id, &plan.push_targets, Arc::clone(&envelope)).await;

		let pts = match last_pts {
			Some(pts) => pts,
			None => self.authority.current(SeqKey::user_pts(user_id)).await?,
		};
		let qts = self.authority.current(SeqKey::user_qts(user_id)).await?;

		let rpc_result = p
			.correlation
			.map(|c| c.filled(corr_pts.unwrap_or(pts), corr_count))
			.and_then(|c| correlation_to_pb(&c));

		debug!(
			user_id = %user_id,
			push_type = %p.push_type,
			pts,
			pts_count = pts_total,
			qts,
			seq,
			live = live.len(),
			pushed = stats.delivered,
			dropped = stats.dropped,
			"published updates"
		);

		Ok(Published {
			state: pb::ClientUpdatesState {
				pts,
				pts_count: pts_total,
				qts,
				seq,
				date,
				rpc_result,
			},
			envelope,
			pushed_to: stats.delivered,
		})
	}

	/// `GetUserGtPtsUpdatesData`.
	pub async fn user_updates_since(&self, user_id: UserId, pts: u32, limit: u32) -> Result<pb::UpdateList, SyncError> {
		if !user_id.is_set() {
			return Err(SyncError::invalid("user_id is required"));
		}
		self.updates_since(StreamKey::User(user_id), pts, limit).await
	}

	/// `GetChannelGtPtsUpdatesData`.
	pub async fn channel_updates_since(
		&self,
		channel_id: ChannelId,
		pts: u32,
		limit: u32,
	) -> Result<pb::UpdateList, SyncError> {
		if !channel_id.is_set() {
			return Err(SyncError::invalid("channel_id is required"));
		}
		self.updates_since(StreamKey::Channel(channel_id), pts, limit).await
	}

	async fn updates_since(&self, stream: StreamKey, pts: u32, limit: u32) -> Result<pb::UpdateList, SyncError> {
		let _guard = self.locks.lock(BTreeSet::from([stream])).await;

		let floor = self.stores.log.floor(stream).await.map_err(SyncError::Store)?;
		if pts < floor {
			return Err(SyncError::GapUnresolvable { requested: pts, floor });
		}

		let limit = if limit == 0 { self.max_page } else { limit.min(self.max_page) };
		let page = self
			.stores
			.log
			.read_after(stream, pts, limit)
			.await
			.map_err(SyncError::Store)?;

		// With more pages pending only the returned prefix is vouched for; otherwise the
		// whole stream is, holes from burned numbers included.
		let current_pts = match (page.has_more, page.updates.last()) {
			(true, Some(last)) => last.pts,
			_ => self.authority.current(stream.pts_key()).await?.max(pts),
		};

		Ok(pb::UpdateList {
			updates: page.updates,
			current_pts,
			has_more: page.has_more,
		})
	}

	/// `GetCurrentChannelPts`.
	pub async fn current_channel_pts(&self, channel_id: ChannelId) -> Result<ChannelState, SyncError> {
		if !channel_id.is_set() {
			return Err(SyncError::invalid("channel_id is required"));
		}
		let pts = self.authority.current(SeqKey::Channel(channel_id)).await?;
		Ok(ChannelState { channel_id, pts })
	}

	async fn resolve_user(&self, auth_key_id: AuthKeyId, user_id: UserId) -> Result<Option<AuthState>, SyncError> {
		let bound = if auth_key_id.is_set() {
			self.stores.auth.get(auth_key_id).await.map_err(SyncError::Store)?
		} else {
			None
		};

		if let Some(st) = bound
			&& st.user_id.is_set()
			&& user_id.is_set()
			&& st.user_id != user_id
		{
			return Err(SyncError::invalid(format!(
				"auth key {auth_key_id} is bound to another user"
			)));
		}
		Ok(bound)
	}

	async fn user_state(&self, user_id: UserId) -> Result<UpdatesState, SyncError> {
		Ok(UpdatesState {
			pts: self.authority.current(SeqKey::user_pts(user_id)).await?,
			qts: self.authority.current(SeqKey::user_qts(user_id)).await?,
			seq: self.authority.current(SeqKey::user_seq(user_id)).await?,
			date: unix_secs_now(),
		})
	}

	/// `GetServerUpdatesState`: the user's current counters.
	pub async fn server_state(&self, auth_key_id: AuthKeyId, user_id: UserId) -> Result<UpdatesState, SyncError> {
		let bound = self.resolve_user(auth_key_id, user_id).await?;
		let user_id = if user_id.is_set() {
			user_id
		} else {
			bound
				.map(|st| st.user_id)
				.filter(|u| u.is_set())
				.ok_or_else(|| SyncError::invalid("user_id is required for an unbound auth key"))?
		};
		self.user_state(user_id).await
	}

	/// `UpdateUpdatesState`: acknowledge `(pts, qts)` for an auth key. Never moves backwards.
	pub async fn commit_state(
		&self,
		auth_key_id: AuthKeyId,
		user_id: UserId,
		pts: u32,
		qts: u32,
	) -> Result<AuthState, SyncError> {
		if !auth_key_id.is_set() {
			return Err(SyncError::invalid("auth_key_id is required"));
		}

		let bound = self.resolve_user(auth_key_id, user_id).await?;
		let owner = bound.map(|st| st.user_id).filter(|u| u.is_set()).unwrap_or(user_id);

		if owner.is_set() {
			let current = self.user_state(owner).await?;
			if !current.covers(pts, qts) {
				return Err(SyncError::invalid(format!(
					"commit ({pts}, {qts}) is ahead of server state ({}, {})",
					current.pts, current.qts
				)));
			}
		}

		self.stores
			.auth
			.commit(auth_key_id, owner, pts, qts)
			.await
			.map_err(SyncError::Store)
	}

	/// Bind the auth key, register the session and snapshot its starting state.
	///
	/// Registration and the snapshot happen under the user's stream lock, so every later
	/// publication is queued for the session and none is reflected in the snapshot twice.
	pub async fn attach(&self, actor: Actor) -> Result<(Attachment, UpdatesState), SyncError> {
		if !actor.auth_key_id.is_set() || !actor.user_id.is_set() {
			return Err(SyncError::invalid("auth_key_id and user_id are required"));
		}

		let st = self
			.stores
			.auth
			.bind(actor.auth_key_id, actor.user_id)
			.await
			.map_err(SyncError::Store)?;
		if st.user_id != actor.user_id {
			return Err(SyncError::invalid(format!(
				"auth key {} is bound to another user",
				actor.auth_key_id
			)));
		}

		let _guard = self.locks.lock(BTreeSet::from([StreamKey::User(actor.user_id)])).await;
		let attachment = self.hub.attach(actor.user_id, actor.session()).await;
		let state = self.user_state(actor.user_id).await?;

		info!(
			user_id = %actor.user_id,
			session = %actor.session(),
			pts = state.pts,
			"session attached"
		);
		Ok((attachment, state))
	}

	pub async fn detach(&self, actor: Actor, registration: u64) {
		self.hub.detach(actor.user_id, actor.session(), registration).await;
	}
}
