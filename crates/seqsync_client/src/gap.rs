#![forbid(unsafe_code)]

//! Consumer-side gap detection.
//!
//! A consumer never applies update N before every update below N on the same stream.
//! [`GapDetector`] sits between a push feed and the code that applies updates: in-order
//! updates pass straight through, duplicates are dropped, and a jump triggers a
//! backfill whose results are returned ahead of the live update.

use seqsync_domain::{ChannelId, StreamKey};
use seqsync_protocol::{envelope, pb};
use tracing::{debug, warn};

use crate::{DEFAULT_BACKFILL_LIMIT, SyncClientError};

/// Source of missed updates, normally the [`crate::SyncClient`] itself.
#[async_trait::async_trait]
pub trait Backfill: Send + Sync {
	async fn updates_since(&self, stream: StreamKey, pts: u32, limit: u32) -> Result<pb::UpdateList, SyncClientError>;
}

#[async_trait::async_trait]
impl<'a, B: Backfill + ?Sized> Backfill for &'a B {
	async fn updates_since(&self, stream: StreamKey, pts: u32, limit: u32) -> Result<pb::UpdateList, SyncClientError> {
		(**self).updates_since(stream, pts, limit).await
	}
}

/// Tracks one stream's applied pts.
pub struct GapDetector<B> {
	backfill: B,
	stream: StreamKey,
	local_pts: u32,
	page_limit: u32,
}

impl<B: Backfill> GapDetector<B> {
	/// Start from `local_pts`, usually the `pts` returned when the session attached.
	pub fn new(backfill: B, stream: StreamKey, local_pts: u32) -> Self {
		Self {
			backfill,
			stream,
			local_pts,
			page_limit: DEFAULT_BACKFILL_LIMIT,
		}
	}

	pub fn with_page_limit(mut self, limit: u32) -> Self {
		self.page_limit = limit.max(1);
		self
	}

	pub fn local_pts(&self) -> u32 {
		self.local_pts
	}

	pub fn stream(&self) -> StreamKey {
		self.stream
	}

	/// Restart tracking after a full-state resync.
	pub fn reset(&mut self, pts: u32) {
		self.local_pts = pts;
	}

	fn on_stream(&self, update: &pb::Update) -> bool {
		match (self.stream, update.seq_class()) {
			(StreamKey::User(_), pb::SeqClass::Pts) => true,
			(StreamKey::Channel(id), pb::SeqClass::Channel) => ChannelId(update.channel_id) == id,
			_ => false,
		}
	}

	/// Updates to apply, in order, for one incoming update.
	///
	/// Updates belonging to other streams (qts, ephemeral, other channels) pass through.
	pub async fn accept(&mut self, update: pb::Update) -> Result<Vec<pb::Update>, SyncClientError> {
		if !self.on_stream(&update) {
			return Ok(vec![update]);
		}

		if update.pts <= self.local_pts {
			debug!(stream = %self.stream, pts = update.pts, local_pts = self.local_pts, "duplicate update dropped");
			return Ok(Vec::new());
		}

		let count = envelope::effective_pts_count(&update);
		if self.local_pts.checked_add(count) == Some(update.pts) {
			self.local_pts = update.pts;
			return Ok(vec![update]);
		}

		debug!(
			stream = %self.stream,
			local_pts = self.local_pts,
			pts = update.pts,
			pts_count = count,
			"gap detected"
		);
		let mut out = self.resync().await?;
		if update.pts > self.local_pts {
			self.local_pts = update.pts;
			out.push(update);
		}
		Ok(out)
	}

	/// Run every update of an envelope through [`Self::accept`].
	pub async fn accept_envelope(&mut self, updates: pb::Updates) -> Result<Vec<pb::Update>, SyncClientError> {
		let mut out = Vec::new();
		for update in envelope::into_vec(updates) {
			out.extend(self.accept(update).await?);
		}
		Ok(out)
	}

	/// Pushes were dropped; fetch whatever is missing.
	pub async fn on_lagged(&mut self) -> Result<Vec<pb::Update>, SyncClientError> {
		self.resync().await
	}

	/// Page through the backfill until the server reports nothing more.
	async fn resync(&mut self) -> Result<Vec<pb::Update>, SyncClientError> {
		let mut out = Vec::new();
		loop {
			let before = self.local_pts;
			let page = self
				.backfill
				.updates_since(self.stream, self.local_pts, self.page_limit)
				.await?;

			for u in page.updates {
				if u.pts > self.local_pts {
					self.local_pts = u.pts;
					out.push(u);
				}
			}
			// Holes left by burned numbers are covered by current_pts.
			self.local_pts = self.local_pts.max(page.current_pts);

			if !page.has_more {
				break;
			}
			if self.local_pts == before {
				warn!(stream = %self.stream, "backfill reported more pages but returned none");
				return Err(SyncClientError::Protocol("backfill made no progress".to_string()));
			}
		}
		debug!(stream = %self.stream, fetched = out.len(), local_pts = self.local_pts, "resync complete");
		Ok(out)
	}
}
