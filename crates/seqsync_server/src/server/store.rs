#![forbid(unsafe_code)]

//! Durable stores on sqlx (SQLite or Postgres).
//!
//! One pool serves the next-sequence table, the update log and the per-auth-key state.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use prost::Message;
use seqsync_domain::{AuthKeyId, SeqKey, StreamKey, UserId};
use seqsync_protocol::pb;
use seqsync_util::time::unix_secs_now;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::server::auth_state::{AuthState, AuthStateStore, InMemoryAuthStateStore};
use crate::server::sequence::{InMemorySeqGenStore, SeqGenStore};
use crate::server::update_log::{InMemoryUpdateLog, LogPage, UpdateLog, retention_cutoff};

/// The three store seams the sync service depends on.
#[derive(Clone)]
pub struct Stores {
	pub seq_gen: Arc<dyn SeqGenStore>,
	pub log: Arc<dyn UpdateLog>,
	pub auth: Arc<dyn AuthStateStore>,
}

impl Stores {
	/// Process-local stores; counters do not survive a restart.
	pub fn in_memory(retention_window: u32) -> Self {
		Self {
			seq_gen: Arc::new(InMemorySeqGenStore::default()),
			log: Arc::new(InMemoryUpdateLog::new(retention_window)),
			auth: Arc::new(InMemoryAuthStateStore::default()),
		}
	}

	/// Connect and migrate; any failure here should abort startup.
	pub async fn connect(database_url: &str, retention_window: u32) -> anyhow::Result<Self> {
		let sql = Arc::new(SqlStore::connect(database_url, retention_window).await?);
		Ok(Self {
			seq_gen: sql.clone(),
			log: sql.clone(),
			auth: sql,
		})
	}
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
	retention_window: u32,
}

type AuthRow = (i64, i64, i64, i64);

fn auth_from_row((auth_key_id, user_id, pts, qts): AuthRow) -> AuthState {
	AuthState {
		auth_key_id: AuthKeyId(auth_key_id),
		user_id: UserId(user_id),
		pts: pts as u32,
		qts: qts as u32,
	}
}

fn decode_payloads(rows: Vec<(Vec<u8>,)>) -> anyhow::Result<Vec<pb::Update>> {
	rows.into_iter()
		.map(|(payload,)| pb::Update::decode(payload.as_slice()).context("decode logged update"))
		.collect()
}

impl SqlStore {
	pub async fn connect(database_url: &str, retention_window: u32) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// Every connection to `:memory:` is a separate database.
			let pool = if database_url.contains(":memory:") {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect_with(opts)
					.await
			} else {
				SqlitePoolOptions::new().connect_with(opts).await
			}
			.context("connect sqlite")?;

			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Backend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Backend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"));
		};

		info!(backend = backend.name(), retention_window, "sql store ready");
		Ok(Self {
			backend,
			retention_window,
		})
	}
}

impl Backend {
	fn name(&self) -> &'static str {
		match self {
			Backend::Sqlite(_) => "sqlite",
			Backend::Postgres(_) => "postgres",
		}
	}
}

#[async_trait::async_trait]
impl SeqGenStore for SqlStore {
	async fn load(&self, key: SeqKey) -> anyhow::Result<u32> {
		let row: Option<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT reserved_through FROM seq_updates_ngen WHERE seq_kind = ? AND owner_id = ?")
					.bind(key.label())
					.bind(key.owner_id())
					.fetch_optional(pool)
					.await
					.context("select reserved_through (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT reserved_through FROM seq_updates_ngen WHERE seq_kind = $1 AND owner_id = $2")
					.bind(key.label())
					.bind(key.owner_id())
					.fetch_optional(pool)
					.await
					.context("select reserved_through (postgres)")?
			}
		};
		Ok(row.map(|(v,)| v as u32).unwrap_or(0))
	}

	async fn reserve(&self, key: SeqKey, through: u32) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO seq_updates_ngen (seq_kind, owner_id, reserved_through) VALUES (?, ?, ?) \
					ON CONFLICT(seq_kind, owner_id) DO UPDATE SET reserved_through = MAX(reserved_through, excluded.reserved_through)",
				)
				.bind(key.label())
				.bind(key.owner_id())
				.bind(i64::from(through))
				.execute(pool)
				.await
				.context("reserve sequence block (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO seq_updates_ngen (seq_kind, owner_id, reserved_through) VALUES ($1, $2, $3) \
					ON CONFLICT (seq_kind, owner_id) DO UPDATE SET reserved_through = GREATEST(seq_updates_ngen.reserved_through, EXCLUDED.reserved_through)",
				)
				.bind(key.label())
				.bind(key.owner_id())
				.bind(i64::from(through))
				.execute(pool)
				.await
				.context("reserve sequence block (postgres)")?;
			}
		}
		Ok(())
	}
}

/// Highest pts appended per stream in one batch.
fn newest_per_stream(entries: &[(StreamKey, pb::Update)]) -> Vec<(StreamKey, u32)> {
	let mut out: Vec<(StreamKey, u32)> = Vec::new();
	for (stream, u) in entries {
		match out.iter_mut().find(|(s, _)| s == stream) {
			Some((_, newest)) => *newest = (*newest).max(u.pts),
			None => out.push((*stream, u.pts)),
		}
	}
	out
}

#[async_trait::async_trait]
impl UpdateLog for SqlStore {
	async fn append(&self, entries: &[(StreamKey, pb::Update)]) -> anyhow::Result<()> {
		let now = unix_secs_now();
		let trims: Vec<(StreamKey, u32)> = newest_per_stream(entries)
			.into_iter()
			.filter_map(|(s, newest)| retention_cutoff(newest, self.retention_window).map(|c| (s, c)))
			.collect();

		match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				for (stream, u) in entries {
					sqlx::query(
						"INSERT INTO sync_updates (stream_kind, stream_id, pts, pts_count, payload, created_at) VALUES (?, ?, ?, ?, ?, ?)",
					)
					.bind(stream.label())
					.bind(stream.owner_id())
					.bind(i64::from(u.pts))
					.bind(i64::from(u.pts_count))
					.bind(u.encode_to_vec())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("insert update (sqlite)")?;
				}

				for (stream, cutoff) in trims {
					let (trimmed,): (Option<i64>,) = sqlx::query_as(
						"SELECT MAX(pts) FROM sync_updates WHERE stream_kind = ? AND stream_id = ? AND pts <= ?",
					)
					.bind(stream.label())
					.bind(stream.owner_id())
					.bind(i64::from(cutoff))
					.fetch_one(&mut *tx)
					.await
					.context("select trim point (sqlite)")?;
					let Some(trimmed) = trimmed else {
						continue;
					};

					sqlx::query("DELETE FROM sync_updates WHERE stream_kind = ? AND stream_id = ? AND pts <= ?")
						.bind(stream.label())
						.bind(stream.owner_id())
						.bind(trimmed)
						.execute(&mut *tx)
						.await
						.context("trim updates (sqlite)")?;
					sqlx::query(
						"INSERT INTO sync_update_floors (stream_kind, stream_id, floor_pts) VALUES (?, ?, ?) \
						ON CONFLICT(stream_kind, stream_id) DO UPDATE SET floor_pts = MAX(floor_pts, excluded.floor_pts)",
					)
					.bind(stream.label())
					.bind(stream.owner_id())
					.bind(trimmed)
					.execute(&mut *tx)
					.await
					.context("raise floor (sqlite)")?;
				}

				tx.commit().await.context("commit sqlite tx")?;
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				for (stream, u) in entries {
					sqlx::query(
						"INSERT INTO sync_updates (stream_kind, stream_id, pts, pts_count, payload, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
					)
					.bind(stream.label())
					.bind(stream.owner_id())
					.bind(i64::from(u.pts))
					.bind(i64::from(u.pts_count))
					.bind(u.encode_to_vec())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("insert update (postgres)")?;
				}

				for (stream, cutoff) in trims {
					let (trimmed,): (Option<i64>,) = sqlx::query_as(
						"SELECT MAX(pts) FROM sync_updates WHERE stream_kind = $1 AND stream_id = $2 AND pts <= $3",
					)
					.bind(stream.label())
					.bind(stream.owner_id())
					.bind(i64::from(cutoff))
					.fetch_one(&mut *tx)
					.await
					.context("select trim point (postgres)")?;
					let Some(trimmed) = trimmed else {
						continue;
					};

					sqlx::query("DELETE FROM sync_updates WHERE stream_kind = $1 AND stream_id = $2 AND pts <= $3")
						.bind(stream.label())
						.bind(stream.owner_id())
						.bind(trimmed)
						.execute(&mut *tx)
						.await
						.context("trim updates (postgres)")?;
					sqlx::query(
						"INSERT INTO sync_update_floors (stream_kind, stream_id, floor_pts) VALUES ($1, $2, $3) \
						ON CONFLICT (stream_kind, stream_id) DO UPDATE SET floor_pts = GREATEST(sync_update_floors.floor_pts, EXCLUDED.floor_pts)",
					)
					.bind(stream.label())
					.bind(stream.owner_id())
					.bind(trimmed)
					.execute(&mut *tx)
					.await
					.context("raise floor (postgres)")?;
				}

				tx.commit().await.context("commit postgres tx")?;
			}
		}
		Ok(())
	}

	async fn floor(&self, stream: StreamKey) -> anyhow::Result<u32> {
		let row: Option<(i64,)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT floor_pts FROM sync_update_floors WHERE stream_kind = ? AND stream_id = ?")
					.bind(stream.label())
					.bind(stream.owner_id())
					.fetch_optional(pool)
					.await
					.context("select floor (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT floor_pts FROM sync_update_floors WHERE stream_kind = $1 AND stream_id = $2")
					.bind(stream.label())
					.bind(stream.owner_id())
					.fetch_optional(pool)
					.await
					.context("select floor (postgres)")?
			}
		};
		Ok(row.map(|(v,)| v as u32).unwrap_or(0))
	}

	async fn read_after(&self, stream: StreamKey, after: u32, limit: u32) -> anyhow::Result<LogPage> {
		// One extra row tells whether another page exists.
		let fetch = i64::from(limit) + 1;
		let rows: Vec<(Vec<u8>,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT payload FROM sync_updates WHERE stream_kind = ? AND stream_id = ? AND pts > ? ORDER BY pts ASC LIMIT ?",
			)
			.bind(stream.label())
			.bind(stream.owner_id())
			.bind(i64::from(after))
			.bind(fetch)
			.fetch_all(pool)
			.await
			.context("select updates (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT payload FROM sync_updates WHERE stream_kind = $1 AND stream_id = $2 AND pts > $3 ORDER BY pts ASC LIMIT $4",
			)
			.bind(stream.label())
			.bind(stream.owner_id())
			.bind(i64::from(after))
			.bind(fetch)
			.fetch_all(pool)
			.await
			.context("select updates (postgres)")?,
		};

		let mut updates = decode_payloads(rows)?;
		let has_more = updates.len() > limit as usize;
		updates.truncate(limit as usize);
		Ok(LogPage { updates, has_more })
	}
}

#[async_trait::async_trait]
impl AuthStateStore for SqlStore {
	async fn bind(&self, auth_key_id: AuthKeyId, user_id: UserId) -> anyhow::Result<AuthState> {
		let now = unix_secs_now();
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO auth_updates_state (auth_key_id, user_id, pts, qts, updated_at) VALUES (?, ?, 0, 0, ?) \
					ON CONFLICT(auth_key_id) DO UPDATE SET user_id = excluded.user_id, updated_at = excluded.updated_at \
					WHERE auth_updates_state.user_id = 0",
				)
				.bind(auth_key_id.get())
				.bind(user_id.get())
				.bind(now)
				.execute(pool)
				.await
				.context("bind auth key (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO auth_updates_state (auth_key_id, user_id, pts, qts, updated_at) VALUES ($1, $2, 0, 0, $3) \
					ON CONFLICT (auth_key_id) DO UPDATE SET user_id = EXCLUDED.user_id, updated_at = EXCLUDED.updated_at \
					WHERE auth_updates_state.user_id = 0",
				)
				.bind(auth_key_id.get())
				.bind(user_id.get())
				.bind(now)
				.execute(pool)
				.await
				.context("bind auth key (postgres)")?;
			}
		}

		self.get(auth_key_id)
			.await?
			.ok_or_else(|| anyhow!("auth key {auth_key_id} missing after bind"))
	}

	async fn get(&self, auth_key_id: AuthKeyId) -> anyhow::Result<Option<AuthState>> {
		let row: Option<AuthRow> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT auth_key_id, user_id, pts, qts FROM auth_updates_state WHERE auth_key_id = ?")
					.bind(auth_key_id.get())
					.fetch_optional(pool)
					.await
					.context("select auth state (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT auth_key_id, user_id, pts, qts FROM auth_updates_state WHERE auth_key_id = $1")
					.bind(auth_key_id.get())
					.fetch_optional(pool)
					.await
					.context("select auth state (postgres)")?
			}
		};
		Ok(row.map(auth_from_row))
	}

	async fn commit(&self, auth_key_id: AuthKeyId, user_id: UserId, pts: u32, qts: u32) -> anyhow::Result<AuthState> {
		let now = unix_secs_now();
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO auth_updates_state (auth_key_id, user_id, pts, qts, updated_at) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(auth_key_id) DO UPDATE SET \
					user_id = CASE WHEN user_id = 0 THEN excluded.user_id ELSE user_id END, \
					pts = MAX(pts, excluded.pts), qts = MAX(qts, excluded.qts), updated_at = excluded.updated_at",
				)
				.bind(auth_key_id.get())
				.bind(user_id.get())
				.bind(i64::from(pts))
				.bind(i64::from(qts))
				.bind(now)
				.execute(pool)
				.await
				.context("commit auth state (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO auth_updates_state (auth_key_id, user_id, pts, qts, updated_at) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (auth_key_id) DO UPDATE SET \
					user_id = CASE WHEN auth_updates_state.user_id = 0 THEN EXCLUDED.user_id ELSE auth_updates_state.user_id END, \
					pts = GREATEST(auth_updates_state.pts, EXCLUDED.pts), qts = GREATEST(auth_updates_state.qts, EXCLUDED.qts), \
					updated_at = EXCLUDED.updated_at",
				)
				.bind(auth_key_id.get())
				.bind(user_id.get())
				.bind(i64::from(pts))
				.bind(i64::from(qts))
				.bind(now)
				.execute(pool)
				.await
				.context("commit auth state (postgres)")?;
			}
		}

		self.get(auth_key_id)
			.await?
			.ok_or_else(|| anyhow!("auth key {auth_key_id} missing after commit"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use seqsync_domain::{ChannelId, SeqKind};
	use seqsync_protocol::envelope::{self, Issued};

	async fn memory_store(retention_window: u32) -> SqlStore {
		SqlStore::connect("sqlite::memory:", retention_window)
			.await
			.expect("sqlite memory store")
	}

	#[tokio::test]
	async fn reserve_never_lowers() {
		let store = memory_store(100).await;
		let key = SeqKey::User {
			user_id: UserId(3),
			kind: SeqKind::Qts,
		};

		assert_eq!(store.load(key).await.unwrap(), 0);
		store.reserve(key, 200).await.unwrap();
		store.reserve(key, 100).await.unwrap();
		assert_eq!(store.load(key).await.unwrap(), 200);
		assert_eq!(store.load(SeqKey::Channel(ChannelId(3))).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn log_roundtrips_payloads_and_trims() {
		let store = memory_store(2).await;
		let s = StreamKey::Channel(ChannelId(8));
		let entries: Vec<_> = (1..=4)
			.map(|p| {
				(
					s,
					envelope::seal(
						&envelope::channel_change(ChannelId(8), "edit", vec![p as u8], 1),
						Issued::Channel {
							channel_id: ChannelId(8),
							pts: p,
							pts_count: 1,
						},
						0,
					),
				)
			})
			.collect();
		store.append(&entries).await.unwrap();

		assert_eq!(store.floor(s).await.unwrap(), 2);
		let page = store.read_after(s, 2, 1).await.unwrap();
		assert_eq!(page.updates.len(), 1);
		assert_eq!(page.updates[0].pts, 3);
		assert_eq!(page.updates[0].payload, vec![3u8]);
		assert!(page.has_more);
	}

	#[tokio::test]
	async fn auth_state_binds_once_and_merges() {
		let store = memory_store(10).await;
		let st = store.commit(AuthKeyId(11), UserId(0), 5, 1).await.unwrap();
		assert_eq!(st.user_id, UserId(0));

		let st = store.bind(AuthKeyId(11), UserId(4)).await.unwrap();
		assert_eq!(st.user_id, UserId(4));
		let st = store.bind(AuthKeyId(11), UserId(9)).await.unwrap();
		assert_eq!(st.user_id, UserId(4));

		let st = store.commit(AuthKeyId(11), UserId(4), 3, 2).await.unwrap();
		assert_eq!((st.pts, st.qts), (5, 2));
	}
}
