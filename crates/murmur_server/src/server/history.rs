#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, anyhow};
use murmur_domain::{ChatMessage, MessageId, SessionId};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Durable copy of the room's message log.
///
/// The in-memory store is authoritative; a backend only needs to return the
/// last saved snapshot on startup.
#[async_trait::async_trait]
pub trait HistoryBackend: Send + Sync {
	async fn load(&self) -> anyhow::Result<Vec<ChatMessage>>;

	/// Replace the stored snapshot.
	async fn save(&self, messages: &[ChatMessage]) -> anyhow::Result<()>;
}

/// Backend used when persistence is off.
#[derive(Debug, Default)]
pub struct DisabledHistoryBackend;

#[async_trait::async_trait]
impl HistoryBackend for DisabledHistoryBackend {
	async fn load(&self) -> anyhow::Result<Vec<ChatMessage>> {
		Ok(Vec::new())
	}

	async fn save(&self, _messages: &[ChatMessage]) -> anyhow::Result<()> {
		Ok(())
	}
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryBackend {
	inner: Mutex<Vec<ChatMessage>>,
	fail_writes: AtomicBool,
	saves: AtomicU64,
}

impl InMemoryHistoryBackend {
	pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
		Self {
			inner: Mutex::new(messages),
			..Self::default()
		}
	}

	/// Make every subsequent `save` fail.
	pub fn set_fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::SeqCst);
	}

	pub fn save_count(&self) -> u64 {
		self.saves.load(Ordering::SeqCst)
	}

	pub async fn saved(&self) -> Vec<ChatMessage> {
		self.inner.lock().await.clone()
	}
}

#[async_trait::async_trait]
impl HistoryBackend for InMemoryHistoryBackend {
	async fn load(&self) -> anyhow::Result<Vec<ChatMessage>> {
		Ok(self.inner.lock().await.clone())
	}

	async fn save(&self, messages: &[ChatMessage]) -> anyhow::Result<()> {
		if self.fail_writes.load(Ordering::SeqCst) {
			return Err(anyhow!("in-memory history write failure"));
		}
		*self.inner.lock().await = messages.to_vec();
		self.saves.fetch_add(1, Ordering::SeqCst);
		Ok(())
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

type MessageRow = (String, String, String, Option<String>, i64, Option<i64>, String);

impl PersistentHistoryBackend {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
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

fn row_to_message(row: MessageRow) -> Option<ChatMessage> {
	let (message_id, session_id, content, nickname, created_at_ms, edited_at_ms, signature) = row;
	let message_id = MessageId::new(message_id).ok()?;
	let session_id = SessionId::new(session_id).ok()?;
	Some(ChatMessage {
		message_id,
		content,
		session_id,
		timestamp: created_at_ms,
		edited_at: edited_at_ms,
		nickname,
		signature,
	})
}

fn rows_to_messages(rows: Vec<MessageRow>) -> Vec<ChatMessage> {
	let total = rows.len();
	let messages = rows.into_iter().filter_map(row_to_message).collect::<Vec<_>>();
	if messages.len() != total {
		warn!(skipped = total - messages.len(), "history: skipped malformed stored rows");
	}
	messages
}

#[async_trait::async_trait]
impl HistoryBackend for PersistentHistoryBackend {
	async fn load(&self) -> anyhow::Result<Vec<ChatMessage>> {
		const SELECT: &str = "SELECT message_id, session_id, content, nickname, created_at_ms, edited_at_ms, signature \
			FROM chat_messages ORDER BY seq ASC";

		let rows = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as::<_, MessageRow>(SELECT)
				.fetch_all(pool)
				.await
				.context("select chat messages (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as::<_, MessageRow>(SELECT)
				.fetch_all(pool)
				.await
				.context("select chat messages (postgres)")?,
			PersistentBackend::Mysql(pool) => sqlx::query_as::<_, MessageRow>(SELECT)
				.fetch_all(pool)
				.await
				.context("select chat messages (mysql)")?,
		};

		Ok(rows_to_messages(rows))
	}

	async fn save(&self, messages: &[ChatMessage]) -> anyhow::Result<()> {
		match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query("DELETE FROM chat_messages")
					.execute(&mut *tx)
					.await
					.context("clear chat messages (sqlite)")?;

				for (seq, m) in messages.iter().enumerate() {
					sqlx::query(
						"INSERT INTO chat_messages (seq, message_id, session_id, content, nickname, created_at_ms, edited_at_ms, signature) \
						VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
					)
					.bind(seq as i64)
					.bind(m.message_id.as_str())
					.bind(m.session_id.as_str())
					.bind(&m.content)
					.bind(m.nickname.as_deref())
					.bind(m.timestamp)
					.bind(m.edited_at)
					.bind(&m.signature)
					.execute(&mut *tx)
					.await
					.context("insert chat message (sqlite)")?;
				}

				tx.commit().await.context("commit sqlite tx")?;
			}
			PersistentBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query("DELETE FROM chat_messages")
					.execute(&mut *tx)
					.await
					.context("clear chat messages (postgres)")?;

				for (seq, m) in messages.iter().enumerate() {
					sqlx::query(
						"INSERT INTO chat_messages (seq, message_id, session_id, content, nickname, created_at_ms, edited_at_ms, signature) \
						VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
					)
					.bind(seq as i64)
					.bind(m.message_id.as_str())
					.bind(m.session_id.as_str())
					.bind(&m.content)
					.bind(m.nickname.as_deref())
					.bind(m.timestamp)
					.bind(m.edited_at)
					.bind(&m.signature)
					.execute(&mut *tx)
					.await
					.context("insert chat message (postgres)")?;
				}

				tx.commit().await.context("commit postgres tx")?;
			}
			PersistentBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				sqlx::query("DELETE FROM chat_messages")
					.execute(&mut *tx)
					.await
					.context("clear chat messages (mysql)")?;

				for (seq, m) in messages.iter().enumerate() {
					sqlx::query(
						"INSERT INTO chat_messages (seq, message_id, session_id, content, nickname, created_at_ms, edited_at_ms, signature) \
						VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
					)
					.bind(seq as i64)
					.bind(m.message_id.as_str())
					.bind(m.session_id.as_str())
					.bind(&m.content)
					.bind(m.nickname.as_deref())
					.bind(m.timestamp)
					.bind(m.edited_at)
					.bind(&m.signature)
					.execute(&mut *tx)
					.await
					.context("insert chat message (mysql)")?;
				}

				tx.commit().await.context("commit mysql tx")?;
			}
		}

		Ok(())
	}
}

/// Fire-and-forget writer in front of a `HistoryBackend`.
///
/// Snapshots queued while a write is in flight are coalesced; only the newest
/// one is written next.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
	tx: mpsc::UnboundedSender<Vec<ChatMessage>>,
}

impl HistoryWriter {
	pub fn spawn(backend: Arc<dyn HistoryBackend>) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<Vec<ChatMessage>>();

		tokio::spawn(async move {
			while let Some(mut snapshot) = rx.recv().await {
				while let Ok(newer) = rx.try_recv() {
					snapshot = newer;
				}

				match backend.save(&snapshot).await {
					Ok(()) => {
						metrics::counter!("murmur_server_history_writes_total").increment(1);
						debug!(messages = snapshot.len(), "history: snapshot persisted");
					}
					Err(e) => {
						metrics::counter!("murmur_server_history_write_errors_total").increment(1);
						warn!(error = %e, "history: failed to persist snapshot");
					}
				}
			}
			debug!("history writer exiting");
		});

		Self { tx }
	}

	/// Queue a snapshot; never waits on storage.
	pub fn persist(&self, snapshot: Vec<ChatMessage>) {
		if self.tx.send(snapshot).is_err() {
			warn!("history: writer task is gone; snapshot dropped");
		}
	}
}
