#![forbid(unsafe_code)]

use bytes::BytesMut;
use futures::Stream;
use seqsync_protocol::pb::rpc_response::Reply;
use seqsync_protocol::{pb, try_decode_frame_from_buffer};
use tracing::{debug, info};

use crate::{SyncClientError, remote_error, unexpected};

/// One item from an attached session's push stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
	Updates(pb::Updates),

	/// The server dropped `dropped` pushes for this session; resync before trusting pts.
	Lagged { dropped: u64 },
}

/// Push stream of an attached session. Dropping it detaches the session.
pub struct SessionFeed {
	recv: quinn::RecvStream,
	call_id: u64,
	max_frame_bytes: usize,
	buf: BytesMut,
}

impl SessionFeed {
	pub(crate) fn new(recv: quinn::RecvStream, call_id: u64, max_frame_bytes: usize) -> Self {
		Self {
			recv,
			call_id,
			max_frame_bytes,
			buf: BytesMut::with_capacity(16 * 1024),
		}
	}

	pub(crate) async fn next_reply(&mut self) -> Result<Option<Reply>, SyncClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			// Try decoding first in case buffer already has a full frame.
			if let Some(resp) = try_decode_frame_from_buffer::<pb::RpcResponse>(&mut self.buf, self.max_frame_bytes)? {
				if resp.call_id != self.call_id {
					return Err(SyncClientError::Protocol(format!(
						"push stream for call {} carried call {}",
						self.call_id, resp.call_id
					)));
				}
				return Ok(resp.result);
			}

			match self.recv.read(&mut tmp).await? {
				Some(n) => self.buf.extend_from_slice(&tmp[..n]),
				None if self.buf.is_empty() => {
					info!(call_id = self.call_id, "push stream closed");
					return Ok(None);
				}
				None => {
					return Err(SyncClientError::Protocol(
						"push stream closed mid-frame".to_string(),
					));
				}
			}
		}
	}

	/// Next pushed item; `Ok(None)` once the server closes the stream.
	pub async fn next(&mut self) -> Result<Option<FeedItem>, SyncClientError> {
		loop {
			let Some(reply) = self.next_reply().await? else {
				return Ok(None);
			};

			match reply {
				Reply::Pushed(p) if p.lagged_dropped > 0 => {
					debug!(dropped = p.lagged_dropped, "push stream lagged");
					return Ok(Some(FeedItem::Lagged {
						dropped: p.lagged_dropped,
					}));
				}
				Reply::Pushed(pb::PushedUpdates {
					updates: Some(updates), ..
				}) => return Ok(Some(FeedItem::Updates(updates))),
				// Empty push: nothing to hand out.
				Reply::Pushed(_) => continue,
				Reply::Error(e) => return Err(remote_error(e, 0)),
				other => return Err(unexpected("attach_session", other)),
			}
		}
	}

	/// The feed as a `Stream`; it ends after the server closes the stream or on the first error.
	pub fn into_stream(self) -> impl Stream<Item = Result<FeedItem, SyncClientError>> {
		futures::stream::unfold(Some(self), |feed| async move {
			let mut feed = feed?;
			match feed.next().await {
				Ok(Some(item)) => Some((Ok(item), Some(feed))),
				Ok(None) => None,
				Err(e) => Some((Err(e), None)),
			}
		})
	}
}
