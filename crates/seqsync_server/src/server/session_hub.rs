#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use seqsync_domain::{SessionRef, UserId};
use seqsync_protocol::pb;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Live-session registry and push fan-out, keyed by user.
#[derive(Debug, Clone)]
pub struct SessionHub {
	inner: Arc<Mutex<Inner>>,
	cfg: SessionHubConfig,
}

#[derive(Debug, Clone)]
pub struct SessionHubConfig {
	/// Maximum queued items per session.
	pub session_queue_capacity: usize,
}

impl Default for SessionHubConfig {
	fn default() -> Self {
		Self {
			session_queue_capacity: 1024,
		}
	}
}

/// Items on an attached session's queue.
#[derive(Debug, Clone)]
pub enum PushItem {
	Updates(Arc<pb::Updates>),

	/// Pushes were dropped for this session; always queued ahead of the next `Updates`.
	Lagged { dropped: u64 },
}

/// Receiving half handed to the attach stream.
#[derive(Debug)]
pub struct Attachment {
	pub rx: mpsc::Receiver<PushItem>,
	pub registration: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
	pub delivered: usize,
	pub dropped: usize,
}

#[derive(Debug, Default)]
struct Inner {
	next_registration: u64,
	users: HashMap<UserId, Vec<SessionEntry>>,
}

#[derive(Debug)]
struct SessionEntry {
	session: SessionRef,
	registration: u64,
	tx: mpsc::Sender<PushItem>,
	pending_lag: u64,
}

impl SessionHub {
	pub fn new(cfg: SessionHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a live session. A second attach of the same session replaces the first,
	/// whose receiver then observes a closed channel.
	pub async fn attach(&self, user_id: UserId, session: SessionRef) -> Attachment {
		// Room for a lag marker plus one push.
		let (tx, rx) = mpsc::channel(self.cfg.session_queue_capacity.max(2));

		let mut inner = self.inner.lock().await;
		inner.next_registration += 1;
		let registration = inner.next_registration;

		let entries = inner.users.entry(user_id).or_default();
		entries.retain(|e| e.session != session && !e.tx.is_closed());
		entries.push(SessionEntry {
			session,
			registration,
			tx,
			pending_lag: 0,
		});

		let total: usize = inner.users.values().map(Vec::len).sum();
		metrics::gauge!("seqsync_attached_sessions").set(total as f64);
		debug!(user_id = %user_id, session = %session, registration, "session hub: attached");

		Attachment { rx, registration }
	}

	/// Remove a registration; a newer registration of the same session is left alone.
	pub async fn detach(&self, user_id: UserId, session: SessionRef, registration: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(entries) = inner.users.get_mut(&user_id) {
			entries.retain(|e| !(e.session == session && e.registration == registration));
			if entries.is_empty() {
				inner.users.remove(&user_id);
			}
		}

		let total: usize = inner.users.values().map(Vec::len).sum();
		metrics::gauge!("seqsync_attached_sessions").set(total as f64);
	}

	pub async fn live_sessions(&self, user_id: UserId) -> Vec<SessionRef> {
		let mut inner = self.inner.lock().await;
		let Some(entries) = inner.users.get_mut(&user_id) else {
			return Vec::new();
		};
		entries.retain(|e| !e.tx.is_closed());
		entries.iter().map(|e| e.session).collect()
	}

	/// Queue `updates` for each target without waiting on any of them.
	pub async fn deliver(&self, user_id: UserId, targets: &[SessionRef], updates: Arc<pb::Updates>) -> DeliveryStats {
		let mut stats = DeliveryStats::default();
		if targets.is_empty() {
			return stats;
		}

		let mut inner = self.inner.lock().await;
		let Some(entries) = inner.users.get_mut(&user_id) else {
			return stats;
		};

		for entry in entries.iter_mut().filter(|e| targets.contains(&e.session)) {
			if offer(entry, &updates) {
				stats.delivered += 1;
			} else {
				stats.dropped += 1;
			}
		}

		entries.retain(|e| !e.tx.is_closed());
		if entries.is_empty() {
			inner.users.remove(&user_id);
		}

		metrics::counter!("seqsync_push_delivered_total").increment(stats.delivered as u64);
		if stats.dropped > 0 {
			metrics::counter!("seqsync_push_dropped_total").increment(stats.dropped as u64);
			debug!(user_id = %user_id, dropped = stats.dropped, "session hub: dropped due to full session queues");
		}
		stats
	}

	pub async fn attached_count(&self, user_id: UserId) -> usize {
		let inner = self.inner.lock().await;
		inner
			.users
			.get(&user_id)
			.map(|v| v.iter().filter(|e| !e.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

/// Try to queue one push for `entry`, preceded by a lag marker if drops are pending.
fn offer(entry: &mut SessionEntry, updates: &Arc<pb::Updates>) -> bool {
	if entry.tx.is_closed() {
		return false;
	}

	// The hub lock makes us the only sender, so free capacity can only grow.
	let needed = if entry.pending_lag > 0 { 2 } else { 1 };
	if entry.tx.capacity() < needed {
		entry.pending_lag = entry.pending_lag.saturating_add(1);
		return false;
	}

	if entry.pending_lag > 0 {
		if entry
			.tx
			.try_send(PushItem::Lagged {
				dropped: entry.pending_lag,
			})
			.is_err()
		{
			entry.pending_lag = entry.pending_lag.saturating_add(1);
			return false;
		}
		entry.pending_lag = 0;
	}

	match entry.tx.try_send(PushItem::Updates(Arc::clone(updates))) {
		Ok(()) => true,
		Err(_) => {
			entry.pending_lag = entry.pending_lag.saturating_add(1);
			false
		}
	}
}
