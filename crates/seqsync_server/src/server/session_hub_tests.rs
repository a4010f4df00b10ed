#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use seqsync_domain::{AuthKeyId, SessionId, SessionRef, UserId};
use seqsync_protocol::envelope;
use seqsync_protocol::pb;
use tokio::time::timeout;

use crate::server::session_hub::{PushItem, SessionHub, SessionHubConfig};

fn session(auth: i64, id: i64) -> SessionRef {
	SessionRef::new(AuthKeyId(auth), SessionId(id))
}

fn updates(seq: u32) -> Arc<pb::Updates> {
	Arc::new(envelope::wrap(
		vec![envelope::ephemeral("typing", Vec::<u8>::new()), envelope::ephemeral("typing", Vec::<u8>::new())],
		0,
		seq,
	))
}

fn seq_of(item: &PushItem) -> Option<u32> {
	match item {
		PushItem::Updates(u) => envelope::batch_seq(u),
		PushItem::Lagged { .. } => None,
	}
}

#[tokio::test]
async fn delivers_only_to_targets() {
	let hub = SessionHub::new(SessionHubConfig::default());
	let user = UserId(1);
	let mut a = hub.attach(user, session(1, 1)).await;
	let mut b = hub.attach(user, session(1, 2)).await;

	let stats = hub.deliver(user, &[session(1, 2)], updates(1)).await;
	assert_eq!(stats.delivered, 1);

	let item = timeout(Duration::from_millis(250), b.rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	assert_eq!(seq_of(&item), Some(1));

	let got_unexpected = timeout(Duration::from_millis(50), a.rx.recv()).await;
	assert!(got_unexpected.is_err(), "non-target session received a push");
}

#[tokio::test]
async fn full_queue_drops_then_marks_lag_before_next_push() {
	let hub = SessionHub::new(SessionHubConfig {
		session_queue_capacity: 2,
	});
	let user = UserId(7);
	let slow = session(7, 1);
	let mut att = hub.attach(user, slow).await;

	for seq in 1..=5 {
		hub.deliver(user, &[slow], updates(seq)).await;
	}

	// Two fit; three were dropped.
	assert_eq!(seq_of(&att.rx.recv().await.expect("open")), Some(1));
	assert_eq!(seq_of(&att.rx.recv().await.expect("open")), Some(2));

	let stats = hub.deliver(user, &[slow], updates(6)).await;
	assert_eq!(stats.delivered, 1);

	match att.rx.recv().await.expect("open") {
		PushItem::Lagged { dropped } => assert_eq!(dropped, 3),
		other => panic!("expected lag marker, got {other:?}"),
	}
	assert_eq!(seq_of(&att.rx.recv().await.expect("open")), Some(6));
}

#[tokio::test]
async fn slow_session_does_not_block_others() {
	let hub = SessionHub::new(SessionHubConfig {
		session_queue_capacity: 2,
	});
	let user = UserId(3);
	let _slow = hub.attach(user, session(3, 1)).await;
	let mut fast = hub.attach(user, session(3, 2)).await;
	let targets = [session(3, 1), session(3, 2)];

	for seq in 1..=10 {
		let deliver = hub.deliver(user, &targets, updates(seq));
		timeout(Duration::from_millis(250), deliver)
			.await
			.expect("deliver must not wait on a full queue");
		let item = fast.rx.recv().await.expect("open");
		assert_eq!(seq_of(&item), Some(seq));
	}
}

#[tokio::test]
async fn reattach_replaces_the_previous_registration() {
	let hub = SessionHub::new(SessionHubConfig::default());
	let user = UserId(4);
	let s = session(4, 1);

	let mut first = hub.attach(user, s).await;
	let second = hub.attach(user, s).await;
	assert_ne!(first.registration, second.registration);
	assert_eq!(hub.attached_count(user).await, 1);
	assert!(first.rx.recv().await.is_none(), "replaced receiver observes a closed channel");

	// Detaching the stale registration leaves the new one alone.
	hub.detach(user, s, first.registration).await;
	assert_eq!(hub.live_sessions(user).await, vec![s]);

	hub.detach(user, s, second.registration).await;
	assert!(hub.live_sessions(user).await.is_empty());
}

#[tokio::test]
async fn dropped_receivers_are_pruned() {
	let hub = SessionHub::new(SessionHubConfig::default());
	let user = UserId(5);
	let gone = hub.attach(user, session(5, 1)).await;
	let _kept = hub.attach(user, session(5, 2)).await;
	drop(gone);

	assert_eq!(hub.live_sessions(user).await, vec![session(5, 2)]);
	let stats = hub.deliver(user, &[session(5, 1)], updates(1)).await;
	assert_eq!(stats.delivered, 0);
}
