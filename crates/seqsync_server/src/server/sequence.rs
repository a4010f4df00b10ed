#![forbid(unsafe_code)]

//! Sequence authority: issues pts/qts/seq and channel pts.
//!
//! Each counter is a slot guarded by its own mutex, so different keys never contend.
//! A slot issues from a block reserved in the next-sequence store; the block is written
//! durably before any value inside it is handed out, so a restart (or an eviction) can
//! only skip values, never reissue them.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use seqsync_domain::{ChannelId, SeqKey, SeqKind, UserId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::server::error::SequenceError;

/// Durable backing for the "next sequence generator" table.
#[async_trait::async_trait]
pub trait SeqGenStore: Send + Sync {
	/// Highest value ever reserved for `key`; zero if none.
	async fn load(&self, key: SeqKey) -> anyhow::Result<u32>;

	/// Record that values up to `through` may be issued. Must never lower the stored value.
	async fn reserve(&self, key: SeqKey, through: u32) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemorySeqGenStore {
	inner: Mutex<HashMap<SeqKey, u32>>,
}

#[async_trait::async_trait]
impl SeqGenStore for InMemorySeqGenStore {
	async fn load(&self, key: SeqKey) -> anyhow::Result<u32> {
		Ok(self.inner.lock().await.get(&key).copied().unwrap_or(0))
	}

	async fn reserve(&self, key: SeqKey, through: u32) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		let v = guard.entry(key).or_insert(0);
		*v = (*v).max(through);
		Ok(())
	}
}

#[derive(Debug, Default)]
struct Slot {
	loaded: bool,
	current: u32,
	reserved_through: u32,
}

pub struct SequenceAuthority {
	slots: DashMap<SeqKey, Arc<Mutex<Slot>>>,
	store: Arc<dyn SeqGenStore>,
	block_size: u32,
}

impl SequenceAuthority {
	pub fn new(store: Arc<dyn SeqGenStore>, block_size: u32) -> Self {
		Self {
			slots: DashMap::new(),
			store,
			block_size: block_size.max(1),
		}
	}

	fn slot(&self, key: SeqKey) -> Arc<Mutex<Slot>> {
		Arc::clone(&self.slots.entry(key).or_default())
	}

	async fn ensure_loaded(&self, key: SeqKey, slot: &mut Slot) -> Result<(), SequenceError> {
		if slot.loaded {
			return Ok(());
		}

		let reserved = self.store.load(key).await.map_err(|e| {
			warn!(%key, error = %format!("{e:#}"), "sequence load failed");
			SequenceError::Store {
				key,
				reason: format!("load: {e:#}"),
			}
		})?;

		// Anything up to `reserved` may already have been issued by a previous owner.
		slot.current = reserved;
		slot.reserved_through = reserved;
		slot.loaded = true;
		debug!(%key, reserved, "sequence slot loaded");
		Ok(())
	}

	/// Issue the next `n` consecutive values of `key` and return the last one.
	pub async fn advance_by(&self, key: SeqKey, n: u32) -> Result<u32, SequenceError> {
		let n = n.max(1);
		let slot = self.slot(key);
		let mut slot = slot.lock().await;
		self.ensure_loaded(key, &mut slot).await?;

		let next = slot.current.checked_add(n).ok_or(SequenceError::Exhausted { key })?;

		if next > slot.reserved_through {
			let through = next.saturating_add(self.block_size - 1);
			self.store.reserve(key, through).await.map_err(|e| {
				warn!(%key, through, error = %format!("{e:#}"), "sequence reserve failed");
				SequenceError::Store {
					key,
					reason: format!("reserve: {e:#}"),
				}
			})?;
			slot.reserved_through = through;
		}

		slot.current = next;
		metrics::counter!("seqsync_sequence_allocations_total", "kind" => key.label()).increment(u64::from(n));
		Ok(next)
	}

	pub async fn advance(&self, user_id: UserId, kind: SeqKind) -> Result<u32, SequenceError> {
		self.advance_by(SeqKey::User { user_id, kind }, 1).await
	}

	pub async fn advance_channel(&self, channel_id: ChannelId) -> Result<u32, SequenceError> {
		self.advance_by(SeqKey::Channel(channel_id), 1).await
	}

	/// Last value issued for `key` (as far as this process knows).
	pub async fn current(&self, key: SeqKey) -> Result<u32, SequenceError> {
		let slot = self.slot(key);
		let mut slot = slot.lock().await;
		self.ensure_loaded(key, &mut slot).await?;
		Ok(slot.current)
	}

	/// Drop the cached value; the next use reloads from the durable store.
	pub async fn evict(&self, key: SeqKey) {
		if let Some(slot) = self.slots.get(&key).map(|s| Arc::clone(&s)) {
			let mut slot = slot.lock().await;
			slot.loaded = false;
		}
	}
}
