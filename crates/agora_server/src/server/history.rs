#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agora_domain::{PublicMessage, StoredMessage};
use anyhow::{Context, anyhow};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

/// Settings for the bounded public history list.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
	/// Key of the list in the backing store.
	pub list_key: String,
	/// Maximum number of retained messages.
	pub max_len: usize,
}

impl Default for HistoryConfig {
	fn default() -> Self {
		Self {
			list_key: "chat:geral".to_string(),
			max_len: 50,
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("history store unavailable: {0}")]
	Unavailable(String),
}

/// Ordered list storage with an atomic push-and-trim.
///
/// Implementations store newest-first; `snapshot` returns oldest-first.
#[async_trait::async_trait]
pub trait HistoryBackend: Send + Sync {
	/// Insert `msg` as the newest entry of `key` and drop everything past `max_len`, all-or-nothing.
	async fn append(&self, key: &str, msg: &PublicMessage, max_len: usize) -> anyhow::Result<()>;

	/// Up to `max_len` entries of `key`, oldest first.
	async fn snapshot(&self, key: &str, max_len: usize) -> anyhow::Result<Vec<PublicMessage>>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryBackend {
	lists: Mutex<HashMap<String, VecDeque<PublicMessage>>>,
}

#[async_trait::async_trait]
impl HistoryBackend for InMemoryHistoryBackend {
	async fn append(&self, key: &str, msg: &PublicMessage, max_len: usize) -> anyhow::Result<()> {
		let mut lists = self.lists.lock().await;
		let list = lists.entry(key.to_string()).or_default();
		list.push_front(msg.clone());
		list.truncate(max_len);
		Ok(())
	}

	async fn snapshot(&self, key: &str, max_len: usize) -> anyhow::Result<Vec<PublicMessage>> {
		let lists = self.lists.lock().await;
		let Some(list) = lists.get(key) else {
			return Ok(Vec::new());
		};
		Ok(list.iter().take(max_len).rev().cloned().collect())
	}
}

#[derive(Clone)]
pub struct PersistentHistoryBackend {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl PersistentHistoryBackend {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			// Every connection to an in-memory database is a separate database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: PersistentBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: PersistentBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

fn encode_record(msg: &PublicMessage) -> anyhow::Result<String> {
	serde_json::to_string(&StoredMessage::from(msg.clone())).context("encode history record")
}

/// Decode rows (newest first) into oldest-first messages, skipping unreadable records.
fn decode_records(key: &str, rows: Vec<(String,)>) -> Vec<PublicMessage> {
	let mut out = Vec::with_capacity(rows.len());
	for (payload,) in rows.into_iter().rev() {
		match serde_json::from_str::<StoredMessage>(&payload) {
			Ok(record) => out.push(record.message),
			Err(e) => {
				metrics::counter!("agora_history_corrupt_records_total").increment(1);
				warn!(list_key = key, error = %e, "skipping unreadable history record");
			}
		}
	}
	out
}

#[async_trait::async_trait]
impl HistoryBackend for PersistentHistoryBackend {
	async fn append(&self, key: &str, msg: &PublicMessage, max_len: usize) -> anyhow::Result<()> {
		let payload = encode_record(msg)?;
		let created_at = msg.date.timestamp_millis();

		// The cutoff is the newest id that falls outside the retained window.
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query("INSERT INTO chat_history (list_key, payload, created_at) VALUES (?, ?, ?)")
					.bind(key)
					.bind(&payload)
					.bind(created_at)
					.execute(&mut *tx)
					.await
					.context("insert history (sqlite)")?;

				let cutoff: Option<(i64,)> =
					sqlx::query_as("SELECT id FROM chat_history WHERE list_key = ? ORDER BY id DESC LIMIT 1 OFFSET ?")
						.bind(key)
						.bind(max_len as i64)
						.fetch_optional(&mut *tx)
						.await
						.context("select trim cutoff (sqlite)")?;

				if let Some((cutoff,)) = cutoff {
					sqlx::query("DELETE FROM chat_history WHERE list_key = ? AND id <= ?")
						.bind(key)
						.bind(cutoff)
						.execute(&mut *tx)
						.await
						.context("trim history (sqlite)")?;
				}

				tx.commit().await.context("commit sqlite tx")?;
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
					.bind(key)
					.execute(&mut *tx)
					.await
					.context("lock history list (postgres)")?;

				sqlx::query("INSERT INTO chat_history (list_key, payload, created_at) VALUES ($1, $2, $3)")
					.bind(key)
					.bind(&payload)
					.bind(created_at)
					.execute(&mut *tx)
					.await
					.context("insert history (postgres)")?;

				let cutoff: Option<(i64,)> =
					sqlx::query_as("SELECT id FROM chat_history WHERE list_key = $1 ORDER BY id DESC LIMIT 1 OFFSET $2")
						.bind(key)
						.bind(max_len as i64)
						.fetch_optional(&mut *tx)
						.await
						.context("select trim cutoff (postgres)")?;

				if let Some((cutoff,)) = cutoff {
					sqlx::query("DELETE FROM chat_history WHERE list_key = $1 AND id <= $2")
						.bind(key)
						.bind(cutoff)
						.execute(&mut *tx)
						.await
						.context("trim history (postgres)")?;
				}

				tx.commit().await.context("commit postgres tx")?;
			}
			PersistentBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				sqlx::query("INSERT INTO chat_history (list_key, payload, created_at) VALUES (?, ?, ?)")
					.bind(key)
					.bind(&payload)
					.bind(created_at)
					.execute(&mut *tx)
					.await
					.context("insert history (mysql)")?;

				let cutoff: Option<(i64,)> =
					sqlx::query_as("SELECT id FROM chat_history WHERE list_key = ? ORDER BY id DESC LIMIT 1 OFFSET ?")
						.bind(key)
						.bind(max_len as i64)
						.fetch_optional(&mut *tx)
						.await
						.context("select trim cutoff (mysql)")?;

				if let Some((cutoff,)) = cutoff {
					sqlx::query("DELETE FROM chat_history WHERE list_key = ? AND id <= ?")
						.bind(key)
						.bind(cutoff)
						.execute(&mut *tx)
						.await
						.context("trim history (mysql)")?;
				}

				tx.commit().await.context("commit mysql tx")?;
			}
		}

		Ok(())
	}

	async fn snapshot(&self, key: &str, max_len: usize) -> anyhow::Result<Vec<PublicMessage>> {
		let rows: Vec<(String,)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT payload FROM chat_history WHERE list_key = ? ORDER BY id DESC LIMIT ?")
					.bind(key)
					.bind(max_len as i64)
					.fetch_all(pool)
					.await
					.context("select history (sqlite)")?
			}
			PersistentBackend::Postgres(pool) => {
				sqlx::query_as("SELECT payload FROM chat_history WHERE list_key = $1 ORDER BY id DESC LIMIT $2")
					.bind(key)
					.bind(max_len as i64)
					.fetch_all(pool)
					.await
					.context("select history (postgres)")?
			}
			PersistentBackend::Mysql(pool) => {
				sqlx::query_as("SELECT payload FROM chat_history WHERE list_key = ? ORDER BY id DESC LIMIT ?")
					.bind(key)
					.bind(max_len as i64)
					.fetch_all(pool)
					.await
					.context("select history (mysql)")?
			}
		};

		Ok(decode_records(key, rows))
	}
}

/// Bounded public history shared by every connection.
#[derive(Clone)]
pub struct HistoryService {
	backend: Arc<dyn HistoryBackend>,
	cfg: HistoryConfig,
}

impl HistoryService {
	pub fn new_in_memory(cfg: HistoryConfig) -> Self {
		Self::with_backend(Arc::new(InMemoryHistoryBackend::default()), cfg)
	}

	pub fn new_persistent(backend: PersistentHistoryBackend, cfg: HistoryConfig) -> Self {
		Self::with_backend(Arc::new(backend), cfg)
	}

	pub fn with_backend(backend: Arc<dyn HistoryBackend>, cfg: HistoryConfig) -> Self {
		Self { backend, cfg }
	}

	pub fn config(&self) -> &HistoryConfig {
		&self.cfg
	}

	pub async fn append(&self, msg: &PublicMessage) -> Result<(), StoreError> {
		match self.backend.append(&self.cfg.list_key, msg, self.cfg.max_len).await {
			Ok(()) => {
				metrics::counter!("agora_history_appends_total").increment(1);
				Ok(())
			}
			Err(e) => {
				metrics::counter!("agora_history_append_failures_total").increment(1);
				Err(StoreError::Unavailable(format!("{e:#}")))
			}
		}
	}

	pub async fn snapshot(&self) -> Result<Vec<PublicMessage>, StoreError> {
		metrics::counter!("agora_history_reads_total").increment(1);
		self.backend
			.snapshot(&self.cfg.list_key, self.cfg.max_len)
			.await
			.map_err(|e| {
				metrics::counter!("agora_history_read_failures_total").increment(1);
				StoreError::Unavailable(format!("{e:#}"))
			})
	}
}
