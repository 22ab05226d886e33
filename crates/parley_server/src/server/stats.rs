#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use parley_domain::Pseudonym;
use sqlx::Row as _;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::bus::{ServiceEvent, ServiceEventObserver};

/// Lifetime counters kept per pseudonym.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsRow {
	pub pseudonym: String,
	pub nb_connections: i64,
	pub tx_messages: i64,
	pub cumulative_connection_seconds: i64,
}

/// Statistics sink backed by SQLite, or a no-op when persistence is off.
#[derive(Clone)]
pub struct StatisticsStore {
	pool: Option<sqlx::SqlitePool>,
}

impl StatisticsStore {
	/// Open (and create on first use) the statistics database. Only
	/// `sqlite:` URLs are supported.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url for statistics: {database_url}"));
		}

		// SQLite serializes writers anyway; a single pooled connection also
		// keeps `sqlite::memory:` coherent under test
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect(database_url)
			.await
			.context("connect sqlite")?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS chat_statistics (\
			pseudonym TEXT PRIMARY KEY, \
			nb_connections INTEGER NOT NULL DEFAULT 0, \
			tx_messages INTEGER NOT NULL DEFAULT 0, \
			cumulative_connection_seconds INTEGER NOT NULL DEFAULT 0)",
		)
		.execute(&pool)
		.await
		.context("create chat_statistics table")?;

		Ok(Self { pool: Some(pool) })
	}

	pub fn disabled() -> Self {
		Self { pool: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.pool.is_some()
	}

	pub async fn record_connection(&self, pseudonym: &str) -> anyhow::Result<()> {
		let Some(pool) = &self.pool else {
			return Ok(());
		};

		sqlx::query(
			"INSERT INTO chat_statistics (pseudonym, nb_connections, tx_messages, cumulative_connection_seconds) \
			VALUES (?, 1, 0, 0) \
			ON CONFLICT(pseudonym) DO UPDATE SET nb_connections = nb_connections + 1",
		)
		.bind(pseudonym)
		.execute(pool)
		.await
		.context("record connection")?;

		Ok(())
	}

	pub async fn record_disconnect(&self, pseudonym: &str, seconds: u64) -> anyhow::Result<()> {
		let Some(pool) = &self.pool else {
			return Ok(());
		};

		sqlx::query(
			"INSERT INTO chat_statistics (pseudonym, nb_connections, tx_messages, cumulative_connection_seconds) \
			VALUES (?, 0, 0, ?) \
			ON CONFLICT(pseudonym) DO UPDATE SET \
			cumulative_connection_seconds = cumulative_connection_seconds + excluded.cumulative_connection_seconds",
		)
		.bind(pseudonym)
		.bind(seconds as i64)
		.execute(pool)
		.await
		.context("record disconnect")?;

		Ok(())
	}

	pub async fn record_message(&self, pseudonym: &str) -> anyhow::Result<()> {
		let Some(pool) = &self.pool else {
			return Ok(());
		};

		sqlx::query(
			"INSERT INTO chat_statistics (pseudonym, nb_connections, tx_messages, cumulative_connection_seconds) \
			VALUES (?, 0, 1, 0) \
			ON CONFLICT(pseudonym) DO UPDATE SET tx_messages = tx_messages + 1",
		)
		.bind(pseudonym)
		.execute(pool)
		.await
		.context("record message")?;

		Ok(())
	}

	pub async fn snapshot(&self) -> anyhow::Result<Vec<StatisticsRow>> {
		let Some(pool) = &self.pool else {
			return Ok(Vec::new());
		};

		let rows = sqlx::query(
			"SELECT pseudonym, nb_connections, tx_messages, cumulative_connection_seconds \
			FROM chat_statistics ORDER BY pseudonym",
		)
		.fetch_all(pool)
		.await
		.context("read chat_statistics")?;

		Ok(rows
			.into_iter()
			.map(|row| StatisticsRow {
				pseudonym: row.get(0),
				nb_connections: row.get(1),
				tx_messages: row.get(2),
				cumulative_connection_seconds: row.get(3),
			})
			.collect())
	}

	/// Log the table content, the startup summary a deployment reads first.
	pub async fn log_snapshot(&self) -> anyhow::Result<()> {
		for row in self.snapshot().await? {
			info!(
				pseudonym = %row.pseudonym,
				nb_connections = row.nb_connections,
				tx_messages = row.tx_messages,
				cumulative_connection_seconds = row.cumulative_connection_seconds,
				"statistics"
			);
		}
		Ok(())
	}
}

#[derive(Debug)]
enum StatsUpdate {
	Connected { pseudonym: Pseudonym },
	Disconnected { pseudonym: Pseudonym, seconds: u64 },
	MessageSent { pseudonym: Pseudonym },
}

/// Bus observer mapping events onto persistent counters.
///
/// Updates travel over a channel to a writer task so the message path
/// never waits on the database; store failures are logged and swallowed.
pub struct StatisticsObserver {
	tx: mpsc::UnboundedSender<StatsUpdate>,
}

impl StatisticsObserver {
	pub fn spawn(store: StatisticsStore) -> Arc<Self> {
		let (tx, mut rx) = mpsc::unbounded_channel::<StatsUpdate>();

		tokio::spawn(async move {
			while let Some(update) = rx.recv().await {
				let result = match &update {
					StatsUpdate::Connected { pseudonym } => store.record_connection(pseudonym.as_str()).await,
					StatsUpdate::Disconnected { pseudonym, seconds } => {
						store.record_disconnect(pseudonym.as_str(), *seconds).await
					}
					StatsUpdate::MessageSent { pseudonym } => store.record_message(pseudonym.as_str()).await,
				};

				if let Err(e) = result {
					metrics::counter!("parley_server_statistics_failures_total").increment(1);
					warn!(error = %e, "statistics update failed");
				}
			}
		});

		Arc::new(Self { tx })
	}
}

impl ServiceEventObserver for StatisticsObserver {
	fn handle(&self, event: &ServiceEvent) {
		let update = match event {
			ServiceEvent::ClientConnected { pseudonym, .. } => StatsUpdate::Connected {
				pseudonym: pseudonym.clone(),
			},
			ServiceEvent::ClientDisconnected {
				pseudonym,
				connection_duration,
				..
			} => StatsUpdate::Disconnected {
				pseudonym: pseudonym.clone(),
				seconds: connection_duration.as_secs(),
			},
			ServiceEvent::MessageSent { pseudonym, .. } => StatsUpdate::MessageSent {
				pseudonym: pseudonym.clone(),
			},
			ServiceEvent::PrivateMessageSent { sender_pseudonym, .. } => StatsUpdate::MessageSent {
				pseudonym: sender_pseudonym.clone(),
			},
		};

		// writer gone means shutdown; the observer degrades to a no-op
		if self.tx.send(update).is_err() {
			debug!("statistics writer stopped; dropping update");
		}
	}
}
