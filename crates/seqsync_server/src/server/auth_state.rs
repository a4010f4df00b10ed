#![forbid(unsafe_code)]

use std::collections::HashMap;

use seqsync_domain::{AuthKeyId, UserId};
use tokio::sync::Mutex;

/// What an authorization key is bound to and has acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthState {
	pub auth_key_id: AuthKeyId,
	/// Zero until the key is bound to a user.
	pub user_id: UserId,
	pub pts: u32,
	pub qts: u32,
}

impl AuthState {
	fn new(auth_key_id: AuthKeyId, user_id: UserId) -> Self {
		Self {
			auth_key_id,
			user_id,
			pts: 0,
			qts: 0,
		}
	}

	fn adopt_user(&mut self, user_id: UserId) {
		if !self.user_id.is_set() {
			self.user_id = user_id;
		}
	}

	fn merge(&mut self, pts: u32, qts: u32) {
		self.pts = self.pts.max(pts);
		self.qts = self.qts.max(qts);
	}
}

#[async_trait::async_trait]
pub trait AuthStateStore: Send + Sync {
	/// Create the record on first sight and bind an unbound key to `user_id`.
	/// Returns the stored record, which may name a different user.
	async fn bind(&self, auth_key_id: AuthKeyId, user_id: UserId) -> anyhow::Result<AuthState>;

	async fn get(&self, auth_key_id: AuthKeyId) -> anyhow::Result<Option<AuthState>>;

	/// Max-merge `(pts, qts)` into the record, creating it if needed.
	async fn commit(&self, auth_key_id: AuthKeyId, user_id: UserId, pts: u32, qts: u32) -> anyhow::Result<AuthState>;
}

#[derive(Default)]
pub struct InMemoryAuthStateStore {
	inner: Mutex<HashMap<AuthKeyId, AuthState>>,
}

#[async_trait::async_trait]
impl AuthStateStore for InMemoryAuthStateStore {
	async fn bind(&self, auth_key_id: AuthKeyId, user_id: UserId) -> anyhow::Result<AuthState> {
		let mut guard = self.inner.lock().await;
		let st = guard
			.entry(auth_key_id)
			.or_insert_with(|| AuthState::new(auth_key_id, user_id));
		st.adopt_user(user_id);
		Ok(*st)
	}

	async fn get(&self, auth_key_id: AuthKeyId) -> anyhow::Result<Option<AuthState>> {
		Ok(self.inner.lock().await.get(&auth_key_id).copied())
	}

	async fn commit(&self, auth_key_id: AuthKeyId, user_id: UserId, pts: u32, qts: u32) -> anyhow::Result<AuthState> {
		let mut guard = self.inner.lock().await;
		let st = guard
			.entry(auth_key_id)
			.or_insert_with(|| AuthState::new(auth_key_id, user_id));
		st.adopt_user(user_id);
		st.merge(pts, qts);
		Ok(*st)
	}
}
