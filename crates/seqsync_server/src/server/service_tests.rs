#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use seqsync_domain::{Actor, AuthKeyId, ChannelId, PushType, RpcCorrelation, StreamKey, SeqKey, SessionId, UserId};
use seqsync_protocol::convert::correlation_to_pb;
use seqsync_protocol::envelope;
use seqsync_protocol::pb;
use tokio::time::timeout;

use crate::server::auth_state::InMemoryAuthStateStore;
use crate::server::error::SyncError;
use crate::server::sequence::InMemorySeqGenStore;
use crate::server::service::{SyncService, SyncServiceConfig};
use crate::server::session_hub::{Attachment, PushItem};
use crate::server::store::Stores;
use crate::server::update_log::{InMemoryUpdateLog, LogPage, UpdateLog};

const USER: UserId = UserId(100);

fn service() -> SyncService {
	service_with(Stores::in_memory(10_000), SyncServiceConfig::default())
}

fn service_with(stores: Stores, cfg: SyncServiceConfig) -> SyncService {
	SyncService::new(stores, cfg)
}

fn actor(auth: i64, session: i64) -> Actor {
	Actor::new(AuthKeyId(auth), SessionId(session), USER)
}

fn request(push_type: PushType, actor: Option<Actor>, changes: Vec<pb::Update>) -> pb::UpdatesRequest {
	let (auth_key_id, session_id) = actor.map(|a| (a.auth_key_id.get(), a.session_id.get())).unwrap_or_default();
	pb::UpdatesRequest {
		push_type: pb::PushType::from(push_type) as i32,
		server_id: "test".to_string(),
		auth_key_id,
		session_id,
		push_user_id: USER.get(),
		client_msg_id: 0,
		updates: Some(envelope::wrap(changes, 0, 0)),
		rpc_result: None,
	}
}

fn message(text: &str) -> pb::Update {
	envelope::pts_change("new_message", text.as_bytes().to_vec())
}

async fn next_updates(att: &mut Attachment) -> Vec<pb::Update> {
	let item = timeout(Duration::from_millis(250), att.rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	match item {
		PushItem::Updates(u) => envelope::as_slice(&u).to_vec(),
		PushItem::Lagged { dropped } => panic!("unexpected lag marker ({dropped})"),
	}
}

async fn assert_silent(att: &mut Attachment) {
	let got = timeout(Duration::from_millis(50), att.rx.recv()).await;
	assert!(got.is_err(), "session unexpectedly received {got:?}");
}

#[tokio::test]
async fn rpc_result_answers_the_actor_and_pushes_companions() {
	let svc = service();
	let s1 = actor(1, 11);
	let s2 = actor(2, 22);
	let (mut a1, _) = svc.attach(s1).await.unwrap();
	let (mut a2, _) = svc.attach(s2).await.unwrap();

	let st = svc
		.sync_updates(request(PushType::RpcResult, Some(s1), vec![message("hi")]))
		.await
		.unwrap();
	assert_eq!(st.pts, 1);
	assert_eq!(st.pts_count, 1);
	assert_eq!(
		st.rpc_result,
		correlation_to_pb(&seqsync_domain::RpcCorrelation::AffectedMessages { pts: 1, pts_count: 1 })
	);

	let pushed = next_updates(&mut a2).await;
	assert_eq!(pushed.len(), 1);
	assert_eq!(pushed[0].pts, 1);
	assert_eq!(pushed[0].payload, b"hi");

	assert_silent(&mut a1).await;
}

#[tokio::test]
async fn affected_history_keeps_its_offset() {
	let svc = service();
	let s1 = actor(1, 11);
	let mut req = request(
		PushType::RpcResult,
		Some(s1),
		vec![envelope::pts_change_counted("delete_history", Vec::<u8>::new(), 3)],
	);
	req.rpc_result = correlation_to_pb(&RpcCorrelation::affected_history(40));

	let st = svc.sync_updates(req).await.unwrap();
	assert_eq!((st.pts, st.pts_count), (3, 3));
	assert_eq!(
		st.rpc_result,
		correlation_to_pb(&RpcCorrelation::AffectedHistory {
			pts: 3,
			pts_count: 3,
			offset: 40,
		})
	);
}

#[tokio::test]
async fn not_me_skips_only_the_actor() {
	let svc = service();
	let s1 = actor(1, 11);
	let s2 = actor(1, 12);
	let (mut a1, _) = svc.attach(s1).await.unwrap();
	let (mut a2, _) = svc.attach(s2).await.unwrap();

	let published = svc
		.publish(request(PushType::UserNotMe, Some(s1), vec![message("a")]))
		.await
		.unwrap();
	assert_eq!(published.pushed_to, 1);
	assert_eq!(next_updates(&mut a2).await[0].pts, 1);
	assert_silent(&mut a1).await;
}

#[tokio::test]
async fn user_me_reaches_sessions_on_the_same_key() {
	let svc = service();
	let (mut same_a, _) = svc.attach(actor(1, 11)).await.unwrap();
	let (mut same_b, _) = svc.attach(actor(1, 12)).await.unwrap();
	let (mut other, _) = svc.attach(actor(2, 21)).await.unwrap();

	svc.push_updates(request(PushType::UserMe, Some(actor(1, 11)), vec![message("m")]))
		.await
		.unwrap();

	assert_eq!(next_updates(&mut same_a).await[0].pts, 1);
	assert_eq!(next_updates(&mut same_b).await[0].pts, 1);
	assert_silent(&mut other).await;
}

#[tokio::test]
async fn offline_session_backfills_missed_updates_in_order() {
	let svc = service();
	for i in 1..=10 {
		svc.push_updates(request(PushType::User, None, vec![message(&format!("m{i}"))]))
			.await
			.unwrap();
	}

	// pts 11..=13 happen while the session is offline.
	for i in 11..=13 {
		svc.push_updates(request(PushType::User, None, vec![message(&format!("m{i}"))]))
			.await
			.unwrap();
	}

	let (mut live, state) = svc.attach(actor(2, 22)).await.unwrap();
	assert_eq!(state.pts, 13);

	svc.push_updates(request(PushType::User, None, vec![message("m14")]))
		.await
		.unwrap();
	let pushed = next_updates(&mut live).await;
	assert_eq!(pushed[0].pts, 14);

	let page = svc.user_updates_since(USER, 10, 0).await.unwrap();
	let pts: Vec<u32> = page.updates.iter().map(|u| u.pts).collect();
	assert_eq!(pts, vec![11, 12, 13, 14]);
	assert_eq!(page.current_pts, 14);
	assert!(!page.has_more);
}

#[tokio::test]
async fn backfill_pages_report_the_last_returned_pts() {
	let svc = service_with(
		Stores::in_memory(10_000),
		SyncServiceConfig {
			max_page: 2,
			..SyncServiceConfig::default()
		},
	);
	for i in 0..5 {
		svc.push_updates(request(PushType::User, None, vec![message(&format!("m{i}"))]))
			.await
			.unwrap();
	}

	let first = svc.user_updates_since(USER, 0, 100).await.unwrap();
	assert_eq!(first.updates.len(), 2);
	assert!(first.has_more);
	assert_eq!(first.current_pts, 2);

	let last = svc.user_updates_since(USER, 4, 0).await.unwrap();
	assert_eq!(last.updates.len(), 1);
	assert!(!last.has_more);
	assert_eq!(last.current_pts, 5);

	let caught_up = svc.user_updates_since(USER, 5, 0).await.unwrap();
	assert!(caught_up.updates.is_empty());
	assert_eq!(caught_up.current_pts, 5);
}

#[tokio::test]
async fn backfill_before_the_floor_is_unresolvable() {
	let svc = service_with(Stores::in_memory(3), SyncServiceConfig::default());
	for i in 0..8 {
		svc.push_updates(request(PushType::User, None, vec![message(&format!("m{i}"))]))
			.await
			.unwrap();
	}

	let err = svc.user_updates_since(USER, 1, 0).await.unwrap_err();
	match err {
		SyncError::GapUnresolvable { requested, floor } => {
			assert_eq!(requested, 1);
			assert_eq!(floor, 5);
		}
		other => panic!("expected GapUnresolvable, got {other:?}"),
	}

	let ok = svc.user_updates_since(USER, 5, 0).await.unwrap();
	let pts: Vec<u32> = ok.updates.iter().map(|u| u.pts).collect();
	assert_eq!(pts, vec![6, 7, 8]);
}

#[tokio::test]
async fn channel_pts_is_current_right_after_an_edit() {
	let svc = service();
	let channel = ChannelId(77);
	let change = |n| envelope::channel_change(channel, "edit_channel", Vec::<u8>::new(), n);

	svc.push_updates(request(PushType::User, None, vec![change(5)])).await.unwrap();
	assert_eq!(svc.current_channel_pts(channel).await.unwrap().pts, 5);

	svc.push_updates(request(PushType::User, None, vec![change(1)])).await.unwrap();
	assert_eq!(svc.current_channel_pts(channel).await.unwrap().pts, 6);

	let page = svc.channel_updates_since(channel, 5, 0).await.unwrap();
	assert_eq!(page.updates.len(), 1);
	assert_eq!(page.updates[0].channel_id, channel.get());
	assert_eq!(page.current_pts, 6);

	// Channel changes do not touch the user's own pts.
	assert_eq!(svc.authority().current(SeqKey::user_pts(USER)).await.unwrap(), 0);
}

#[tokio::test]
async fn channel_rpc_result_correlates_the_channel_pts() {
	let svc = service();
	let s1 = actor(1, 11);
	for i in 0..3 {
		svc.push_updates(request(PushType::User, None, vec![message(&format!("m{i}"))]))
			.await
			.unwrap();
	}

	let channel = ChannelId(4);
	let mut req = request(
		PushType::RpcResult,
		Some(s1),
		vec![envelope::channel_change(channel, "delete_channel_messages", Vec::<u8>::new(), 2)],
	);
	req.rpc_result = correlation_to_pb(&RpcCorrelation::affected_messages());
	let st = svc.sync_updates(req).await.unwrap();

	assert_eq!(svc.current_channel_pts(channel).await.unwrap().pts, 2);
	// The reply state stays on the user's own pts stream.
	assert_eq!(st.pts, 3);
	assert_eq!(st.pts_count, 0);
	assert_eq!(
		st.rpc_result,
		correlation_to_pb(&RpcCorrelation::AffectedMessages { pts: 2, pts_count: 2 })
	);
}

/// Fails the first append, then behaves like the in-memory log.
struct FailOnceLog {
	inner: InMemoryUpdateLog,
	failed: AtomicBool,
}

#[async_trait::async_trait]
impl UpdateLog for FailOnceLog {
	async fn append(&self, entries: &[(StreamKey, pb::Update)]) -> anyhow::Result<()> {
		if !self.failed.swap(true, Ordering::SeqCst) {
			anyhow::bail!("disk full");
		}
		self.inner.append(entries).await
	}

	async fn floor(&self, stream: StreamKey) -> anyhow::Result<u32> {
		self.inner.floor(stream).await
	}

	async fn read_after(&self, stream: StreamKey, after: u32, limit: u32) -> anyhow::Result<LogPage> {
		self.inner.read_after(stream, after, limit).await
	}
}

#[tokio::test]
async fn failed_persist_burns_the_issued_pts() {
	let stores = Stores {
		seq_gen: Arc::new(InMemorySeqGenStore::default()),
		log: Arc::new(FailOnceLog {
			inner: InMemoryUpdateLog::new(10_000),
			failed: AtomicBool::new(false),
		}),
		auth: Arc::new(InMemoryAuthStateStore::default()),
	};
	let svc = service_with(stores, SyncServiceConfig::default());

	let err = svc
		.push_updates(request(PushType::User, None, vec![message("lost")]))
		.await
		.unwrap_err();
	assert!(matches!(err, SyncError::Store(_)), "expected a store error, got {err:?}");

	let st = svc
		.sync_updates(request(PushType::User, None, vec![message("kept")]))
		.await
		.unwrap();
	assert_eq!(st.pts, 2);

	let page = svc.user_updates_since(USER, 0, 0).await.unwrap();
	let pts: Vec<u32> = page.updates.iter().map(|u| u.pts).collect();
	assert_eq!(pts, vec![2]);
	assert_eq!(page.current_pts, 2);
}

#[tokio::test]
async fn batches_carry_seq_and_ephemeral_only_keeps_it() {
	let svc = service();
	let (mut att, _) = svc.attach(actor(1, 1)).await.unwrap();

	let published = svc
		.publish(request(
			PushType::User,
			None,
			vec![message("a"), envelope::qts_change("secret", Vec::<u8>::new())],
		))
		.await
		.unwrap();
	assert_eq!(envelope::batch_seq(&published.envelope), Some(1));
	assert_eq!((published.state.pts, published.state.qts, published.state.seq), (1, 1, 1));

	let got = next_updates(&mut att).await;
	assert_eq!(got.len(), 2);
	assert_eq!(got[1].qts, 1);

	let typing = svc
		.publish(request(
			PushType::User,
			None,
			vec![
				envelope::ephemeral("typing", Vec::<u8>::new()),
				envelope::ephemeral("typing", Vec::<u8>::new()),
			],
		))
		.await
		.unwrap();
	assert_eq!(envelope::batch_seq(&typing.envelope), Some(1));
	assert_eq!(typing.state.pts, 1);

	// Neither the qts update nor the ephemeral ones land in the pts log.
	let page = svc.user_updates_since(USER, 0, 0).await.unwrap();
	assert_eq!(page.updates.len(), 1);
}

#[tokio::test]
async fn commit_is_idempotent_and_never_ahead_of_the_server() {
	let svc = service();
	let s1 = actor(1, 11);
	svc.attach(s1).await.unwrap();
	for _ in 0..3 {
		svc.push_updates(request(PushType::User, None, vec![message("x")]))
			.await
			.unwrap();
	}

	let once = svc.commit_state(s1.auth_key_id, USER, 2, 0).await.unwrap();
	let twice = svc.commit_state(s1.auth_key_id, USER, 2, 0).await.unwrap();
	assert_eq!(once, twice);

	let lower = svc.commit_state(s1.auth_key_id, USER, 1, 0).await.unwrap();
	assert_eq!(lower.pts, 2, "commit never moves backwards");

	let ahead = svc.commit_state(s1.auth_key_id, USER, 9, 0).await.unwrap_err();
	assert!(matches!(ahead, SyncError::InvalidRequest(_)), "{ahead:?}");

	let wrong_user = svc.commit_state(s1.auth_key_id, UserId(5), 1, 0).await.unwrap_err();
	assert!(matches!(wrong_user, SyncError::InvalidRequest(_)), "{wrong_user:?}");
}

#[tokio::test]
async fn server_state_resolves_the_user_from_the_binding() {
	let svc = service();
	let s1 = actor(1, 11);
	svc.attach(s1).await.unwrap();
	svc.push_updates(request(PushType::User, None, vec![message("x")]))
		.await
		.unwrap();

	let st = svc.server_state(s1.auth_key_id, UserId(0)).await.unwrap();
	assert_eq!((st.pts, st.qts, st.seq), (1, 0, 1));

	let unknown = svc.server_state(AuthKeyId(999), UserId(0)).await.unwrap_err();
	assert!(matches!(unknown, SyncError::InvalidRequest(_)));
}

#[tokio::test]
async fn malformed_requests_are_rejected_without_burning_numbers() {
	let svc = service();

	let mut no_user = request(PushType::User, None, vec![message("x")]);
	no_user.push_user_id = 0;
	assert!(matches!(svc.push_updates(no_user).await, Err(SyncError::InvalidRequest(_))));

	let no_actor = request(PushType::UserNotMe, None, vec![message("x")]);
	assert!(matches!(svc.push_updates(no_actor).await, Err(SyncError::InvalidRequest(_))));

	let empty = request(PushType::User, None, Vec::new());
	assert!(matches!(svc.push_updates(empty).await, Err(SyncError::InvalidRequest(_))));

	let mut bad_type = request(PushType::User, None, vec![message("x")]);
	bad_type.push_type = 99;
	assert!(matches!(svc.push_updates(bad_type).await, Err(SyncError::InvalidRequest(_))));

	let orphan_channel = request(
		PushType::User,
		None,
		vec![envelope::channel_change(ChannelId(0), "edit", Vec::<u8>::new(), 1)],
	);
	assert!(matches!(svc.push_updates(orphan_channel).await, Err(SyncError::InvalidRequest(_))));

	assert_eq!(svc.authority().current(SeqKey::user_pts(USER)).await.unwrap(), 0);
}

#[tokio::test]
async fn attach_rejects_a_key_bound_to_someone_else() {
	let svc = service();
	svc.attach(actor(1, 11)).await.unwrap();

	let intruder = Actor::new(AuthKeyId(1), SessionId(12), UserId(555));
	assert!(matches!(svc.attach(intruder).await, Err(SyncError::InvalidRequest(_))));
}

#[tokio::test]
async fn concurrent_publishers_never_share_a_pts() {
	let svc = Arc::new(service());
	let handles = (0..8).map(|t| {
		let svc = Arc::clone(&svc);
		tokio::spawn(async move {
			let mut pts = Vec::new();
			for i in 0..20 {
				let st = svc
					.sync_updates(request(PushType::User, None, vec![message(&format!("{t}-{i}"))]))
					.await
					.expect("sync");
				pts.push(st.pts);
			}
			pts
		})
	});

	let mut all: Vec<u32> = join_all(handles)
		.await
		.into_iter()
		.flat_map(|h| h.expect("join"))
		.collect();
	all.sort_unstable();
	assert_eq!(all, (1..=160).collect::<Vec<u32>>());

	let page = svc.user_updates_since(USER, 0, 0).await.unwrap();
	let logged: Vec<u32> = page.updates.iter().map(|u| u.pts).collect();
	assert_eq!(logged, (1..=160).collect::<Vec<u32>>());
}
