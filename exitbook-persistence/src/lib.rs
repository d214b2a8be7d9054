//! Relational persistence for the ingestion core (spec §6, §2.10-§2.11).
//!
//! One [`Store`] wraps a single `sqlx` pool; every table gets its own
//! module of free functions taking a pool or an open transaction, rather
//! than a repository trait per table — the teacher's own persistence code
//! (`engine/src/db/persistent.rs`) is a single struct with table-shaped
//! methods, not a repository-per-type hierarchy, and a relational store
//! with eight small tables doesn't need more ceremony than that.

pub mod accounts;
pub mod error;
pub mod links;
pub mod locks;
pub mod overrides;
pub mod prices;
pub mod raw_transactions;
pub mod sessions;
pub mod transactions;

use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, SqlitePool};

pub use error::PersistenceError;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// The ingestion core's persistence handle. Cheap to clone (an `sqlx` pool
/// is already reference-counted internally); callers share one `Store`
/// across every concurrent import the process is running (spec §5).
#[derive(Clone)]
pub struct Store {
	pool: SqlitePool,
}

impl Store {
	/// Opens (creating if necessary) a SQLite database at `url`, e.g.
	/// `sqlite://exitbook.db` or `sqlite::memory:` for tests.
	pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
		let pool = SqlitePoolOptions::new().max_connections(8).connect(url).await?;
		let store = Self { pool };
		store.migrate().await?;
		Ok(store)
	}

	pub async fn migrate(&self) -> Result<(), PersistenceError> {
		MIGRATOR.run(&self.pool).await?;
		Ok(())
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	#[cfg(any(test, feature = "test-util"))]
	pub async fn in_memory() -> Self {
		Self::connect("sqlite::memory:").await.expect("in-memory sqlite connects and migrates")
	}
}
