#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and tags from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown push type: {0}")]
	UnknownPushType(String),
}

macro_rules! int_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub i64);

		impl $name {
			#[inline]
			pub const fn get(self) -> i64 {
				self.0
			}

			/// Zero is the wire encoding of "unset".
			#[inline]
			pub const fn is_set(self) -> bool {
				self.0 != 0
			}
		}

		impl From<i64> for $name {
			fn from(v: i64) -> Self {
				Self(v)
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<i64>()
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(s.to_string()))
			}
		}
	};
}

int_id!(
	/// Account identifier of the user whose state stream is being advanced.
	UserId
);
int_id!(
	/// Channel identifier; channels carry their own pts stream.
	ChannelId
);
int_id!(
	/// Authorization key identifier (one per device install).
	AuthKeyId
);
int_id!(
	/// Client session identifier, scoped to an authorization key.
	SessionId
);

/// A live session as seen by the push router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
	pub auth_key_id: AuthKeyId,
	pub session_id: SessionId,
}

impl SessionRef {
	pub fn new(auth_key_id: AuthKeyId, session_id: SessionId) -> Self {
		Self { auth_key_id, session_id }
	}
}

impl fmt::Display for SessionRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.auth_key_id, self.session_id)
	}
}

/// The session on whose behalf a business-logic call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
	pub auth_key_id: AuthKeyId,
	pub session_id: SessionId,
	pub user_id: UserId,
}

impl Actor {
	pub fn new(auth_key_id: AuthKeyId, session_id: SessionId, user_id: UserId) -> Self {
		Self {
			auth_key_id,
			session_id,
			user_id,
		}
	}

	pub fn session(&self) -> SessionRef {
		SessionRef::new(self.auth_key_id, self.session_id)
	}
}

/// Routing policy tag for a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushType {
	/// Every live session of the target user, the acting one included.
	User,
	/// Sessions sharing the acting session's authorization key.
	UserMe,
	/// Every live session of the target user except the acting one.
	UserNotMe,
	/// The acting session learns through its RPC reply only.
	RpcResult,
}

impl PushType {
	pub const fn as_str(self) -> &'static str {
		match self {
			PushType::User => "user",
			PushType::UserMe => "user_me",
			PushType::UserNotMe => "user_notme",
			PushType::RpcResult => "rpc_result",
		}
	}

	/// Whether this policy needs the acting session's identity to be known.
	pub const fn requires_actor(self) -> bool {
		!matches!(self, PushType::User)
	}
}

impl fmt::Display for PushType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PushType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"user" => Ok(PushType::User),
			"user_me" => Ok(PushType::UserMe),
			"user_notme" | "user_not_me" => Ok(PushType::UserNotMe),
			"rpc_result" => Ok(PushType::RpcResult),
			other => Err(ParseIdError::UnknownPushType(other.to_string())),
		}
	}
}

/// Per-user counter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeqKind {
	Pts,
	Qts,
	Seq,
}

/// Identifies one counter owned by the sequence authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeqKey {
	User { user_id: UserId, kind: SeqKind },
	Channel(ChannelId),
}

impl SeqKey {
	pub const fn user_pts(user_id: UserId) -> Self {
		SeqKey::User {
			user_id,
			kind: SeqKind::Pts,
		}
	}

	pub const fn user_qts(user_id: UserId) -> Self {
		SeqKey::User {
			user_id,
			kind: SeqKind::Qts,
		}
	}

	pub const fn user_seq(user_id: UserId) -> Self {
		SeqKey::User {
			user_id,
			kind: SeqKind::Seq,
		}
	}

	/// Stable label used as the durable table discriminator.
	pub const fn label(self) -> &'static str {
		match self {
			SeqKey::User { kind: SeqKind::Pts, .. } => "user_pts",
			SeqKey::User { kind: SeqKind::Qts, .. } => "user_qts",
			SeqKey::User { kind: SeqKind::Seq, .. } => "user_seq",
			SeqKey::Channel(_) => "channel_pts",
		}
	}

	pub const fn owner_id(self) -> i64 {
		match self {
			SeqKey::User { user_id, .. } => user_id.0,
			SeqKey::Channel(channel_id) => channel_id.0,
		}
	}
}

impl fmt::Display for SeqKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.label(), self.owner_id())
	}
}

/// An ordered pts stream: a user's stream or a channel's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKey {
	User(UserId),
	Channel(ChannelId),
}

impl StreamKey {
	pub const fn label(self) -> &'static str {
		match self {
			StreamKey::User(_) => "user",
			StreamKey::Channel(_) => "channel",
		}
	}

	pub const fn owner_id(self) -> i64 {
		match self {
			StreamKey::User(u) => u.0,
			StreamKey::Channel(c) => c.0,
		}
	}

	/// The counter that numbers this stream.
	pub const fn pts_key(self) -> SeqKey {
		match self {
			StreamKey::User(u) => SeqKey::user_pts(u),
			StreamKey::Channel(c) => SeqKey::Channel(c),
		}
	}
}

impl fmt::Display for StreamKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.label(), self.owner_id())
	}
}

/// Sequence state of a user (or of what an authorization key has acknowledged).
///
/// `pts` and `qts` never decrease over the lifetime of an authorization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdatesState {
	pub pts: u32,
	pub qts: u32,
	pub seq: u32,
	pub date: i64,
}

impl UpdatesState {
	/// Merge an acknowledgement; returns true when anything moved forward.
	pub fn merge_commit(&mut self, pts: u32, qts: u32) -> bool {
		let before = (self.pts, self.qts);
		self.pts = self.pts.max(pts);
		self.qts = self.qts.max(qts);
		before != (self.pts, self.qts)
	}

	/// True when `(pts, qts)` does not run ahead of this state.
	pub fn covers(&self, pts: u32, qts: u32) -> bool {
		pts <= self.pts && qts <= self.qts
	}
}

/// Sequence state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
	pub channel_id: ChannelId,
	pub pts: u32,
}

/// Summary attached to an RPC reply so the acting session can advance its
/// local state without also receiving a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RpcCorrelation {
	AffectedMessages { pts: u32, pts_count: u32 },
	AffectedHistory { pts: u32, pts_count: u32, offset: i32 },
}

impl RpcCorrelation {
	pub const fn affected_messages() -> Self {
		RpcCorrelation::AffectedMessages { pts: 0, pts_count: 0 }
	}

	pub const fn affected_history(offset: i32) -> Self {
		RpcCorrelation::AffectedHistory {
			pts: 0,
			pts_count: 0,
			offset,
		}
	}

	/// Same variant (and offset) with the issued sequence values filled in.
	pub fn filled(self, pts: u32, pts_count: u32) -> Self {
		match self {
			RpcCorrelation::AffectedMessages { .. } => RpcCorrelation::AffectedMessages { pts, pts_count },
			RpcCorrelation::AffectedHistory { offset, .. } => RpcCorrelation::AffectedHistory { pts, pts_count, offset },
		}
	}

	pub const fn pts(&self) -> u32 {
		match self {
			RpcCorrelation::AffectedMessages { pts, .. } | RpcCorrelation::AffectedHistory { pts, .. } => *pts,
		}
	}

	pub const fn pts_count(&self) -> u32 {
		match self {
			RpcCorrelation::AffectedMessages { pts_count, .. } | RpcCorrelation::AffectedHistory { pts_count, .. } => {
				*pts_count
			}
		}
	}
}
