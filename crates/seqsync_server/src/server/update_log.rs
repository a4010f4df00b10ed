#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use seqsync_domain::StreamKey;
use seqsync_protocol::pb;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogPage {
	pub updates: Vec<pb::Update>,
	pub has_more: bool,
}

/// Retained, pts-ordered history per stream, served to backfill.
///
/// Callers append a stream's updates in ascending pts order. Each stream keeps the last
/// `retention_window` pts; the highest trimmed pts becomes the stream's floor.
#[async_trait::async_trait]
pub trait UpdateLog: Send + Sync {
	/// Append sealed updates, all or none.
	async fn append(&self, entries: &[(StreamKey, pb::Update)]) -> anyhow::Result<()>;

	/// Requests starting below the floor cannot be answered from history.
	async fn floor(&self, stream: StreamKey) -> anyhow::Result<u32>;

	/// Up to `limit` updates with pts strictly greater than `after`, ascending.
	async fn read_after(&self, stream: StreamKey, after: u32, limit: u32) -> anyhow::Result<LogPage>;
}

/// Lowest pts that stays retained once `newest` is appended; `None` while the window is not full.
pub(crate) fn retention_cutoff(newest: u32, retention_window: u32) -> Option<u32> {
	newest.checked_sub(retention_window).filter(|c| *c > 0)
}

#[derive(Debug, Default)]
struct StreamLog {
	floor: u32,
	entries: VecDeque<pb::Update>,
}

pub struct InMemoryUpdateLog {
	retention_window: u32,
	streams: Mutex<HashMap<StreamKey, StreamLog>>,
}

impl InMemoryUpdateLog {
	pub fn new(retention_window: u32) -> Self {
		Self {
			retention_window,
			streams: Mutex::new(HashMap::new()),
		}
	}
}

#[async_trait::async_trait]
impl UpdateLog for InMemoryUpdateLog {
	async fn append(&self, entries: &[(StreamKey, pb::Update)]) -> anyhow::Result<()> {
		let mut streams = self.streams.lock().await;

		for (stream, update) in entries {
			let log = streams.entry(*stream).or_default();
			log.entries.push_back(update.clone());

			let Some(cutoff) = retention_cutoff(update.pts, self.retention_window) else {
				continue;
			};
			while let Some(front) = log.entries.front() {
				if front.pts > cutoff {
					break;
				}
				log.floor = log.floor.max(front.pts);
				log.entries.pop_front();
			}
		}
		Ok(())
	}

	async fn floor(&self, stream: StreamKey) -> anyhow::Result<u32> {
		Ok(self.streams.lock().await.get(&stream).map(|l| l.floor).unwrap_or(0))
	}

	async fn read_after(&self, stream: StreamKey, after: u32, limit: u32) -> anyhow::Result<LogPage> {
		let streams = self.streams.lock().await;
		let Some(log) = streams.get(&stream) else {
			return Ok(LogPage::default());
		};

		let limit = limit as usize;
		let mut newer = log.entries.iter().filter(|u| u.pts > after);
		let updates: Vec<pb::Update> = newer.by_ref().take(limit).cloned().collect();
		let has_more = newer.next().is_some();

		Ok(LogPage { updates, has_more })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use seqsync_domain::{ChannelId, UserId};
	use seqsync_protocol::envelope::{self, Issued};

	fn sealed(pts: u32) -> pb::Update {
		envelope::seal(
			&envelope::pts_change("n", Vec::new()),
			Issued::Pts { pts, pts_count: 1 },
			0,
		)
	}

	#[tokio::test]
	async fn read_after_pages_in_order() {
		let log = InMemoryUpdateLog::new(100);
		let s = StreamKey::User(UserId(1));
		let entries: Vec<_> = (1..=5).map(|p| (s, sealed(p))).collect();
		log.append(&entries).await.unwrap();

		let page = log.read_after(s, 1, 2).await.unwrap();
		assert_eq!(page.updates.iter().map(|u| u.pts).collect::<Vec<_>>(), vec![2, 3]);
		assert!(page.has_more);

		let page = log.read_after(s, 3, 10).await.unwrap();
		assert_eq!(page.updates.iter().map(|u| u.pts).collect::<Vec<_>>(), vec![4, 5]);
		assert!(!page.has_more);

		assert!(log.read_after(StreamKey::Channel(ChannelId(1)), 0, 10).await.unwrap().updates.is_empty());
	}

	#[tokio::test]
	async fn trimming_raises_floor_to_highest_trimmed_pts() {
		let log = InMemoryUpdateLog::new(3);
		let s = StreamKey::User(UserId(9));
		for p in 1..=6 {
			log.append(&[(s, sealed(p))]).await.unwrap();
		}

		// newest 6, window 3: pts 1..=3 trimmed.
		assert_eq!(log.floor(s).await.unwrap(), 3);
		let page = log.read_after(s, 3, 10).await.unwrap();
		assert_eq!(page.updates.iter().map(|u| u.pts).collect::<Vec<_>>(), vec![4, 5, 6]);
	}

	#[test]
	fn cutoff_waits_for_a_full_window() {
		assert_eq!(retention_cutoff(5, 10), None);
		assert_eq!(retention_cutoff(10, 10), None);
		assert_eq!(retention_cutoff(12, 10), Some(2));
	}
}
