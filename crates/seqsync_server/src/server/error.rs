#![forbid(unsafe_code)]

use seqsync_domain::SeqKey;
use seqsync_protocol::{codes, pb};
use thiserror::Error;

/// The authority could not issue a value; the counter itself is left untouched.
#[derive(Debug, Error)]
pub enum SequenceError {
	#[error("sequence store failed for {key}: {reason}")]
	Store { key: SeqKey, reason: String },

	#[error("sequence space exhausted for {key}")]
	Exhausted { key: SeqKey },
}

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error(transparent)]
	Sequence(#[from] SequenceError),

	#[error("pts {requested} predates retained history (floor {floor})")]
	GapUnresolvable { requested: u32, floor: u32 },

	#[error("store failure: {0:#}")]
	Store(anyhow::Error),
}

impl SyncError {
	pub fn invalid(msg: impl Into<String>) -> Self {
		SyncError::InvalidRequest(msg.into())
	}

	pub fn code(&self) -> &'static str {
		match self {
			SyncError::InvalidRequest(_) => codes::INVALID_REQUEST,
			SyncError::Sequence(_) => codes::SEQUENCE_ALLOCATION_FAILED,
			SyncError::GapUnresolvable { .. } => codes::GAP_UNRESOLVABLE,
			SyncError::Store(_) => codes::STORE_FAILURE,
		}
	}

	pub fn to_pb(&self) -> pb::RpcError {
		pb::RpcError {
			code: self.code().to_string(),
			message: self.to_string(),
			floor_pts: match self {
				SyncError::GapUnresolvable { floor, .. } => *floor,
				_ => 0,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use seqsync_domain::UserId;

	#[test]
	fn codes_are_stable() {
		let gap = SyncError::GapUnresolvable {
			requested: 3,
			floor: 40,
		};
		let e = gap.to_pb();
		assert_eq!(e.code, "GAP_UNRESOLVABLE");
		assert_eq!(e.floor_pts, 40);

		let seq = SyncError::from(SequenceError::Exhausted {
			key: SeqKey::user_pts(UserId(1)),
		});
		assert_eq!(seq.code(), "SEQUENCE_ALLOCATION_FAILED");
		assert!(seq.to_string().contains("user_pts:1"));

		assert_eq!(SyncError::Store(anyhow::anyhow!("down")).code(), "STORE_FAILURE");
	}
}
