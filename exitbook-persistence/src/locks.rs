//! Per-account advisory lock (spec §4.7, §5: "concurrent imports on the
//! same account are rejected by an advisory lock on the session, not by
//! row-level contention"). SQLite has no native advisory-lock primitive, so
//! this is modeled as a one-row-per-locked-account table guarded by its
//! primary key: acquiring is `INSERT`, which fails with a uniqueness
//! violation if another session already holds it.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::PersistenceError;

pub struct AccountLockGuard<'a> {
	pool: &'a SqlitePool,
	account_id: Uuid,
	released: bool,
}

impl AccountLockGuard<'_> {
	pub async fn release(mut self) -> Result<(), PersistenceError> {
		sqlx::query("DELETE FROM account_locks WHERE account_id = ?").bind(self.account_id.to_string()).execute(self.pool).await?;
		self.released = true;
		Ok(())
	}
}

impl Drop for AccountLockGuard<'_> {
	fn drop(&mut self) {
		if !self.released {
			// Best-effort: an unreleased guard (panic mid-import) leaves a
			// stale lock row rather than silently succeeding twice. A
			// future session that finds it pre-existing must still fail
			// fast per spec §4.7 — an orphaned lock is an operational
			// incident to clear manually, not a bug to paper over here.
			tracing::warn!(account_id = %self.account_id, "account lock guard dropped without release; lock row left in place");
		}
	}
}

/// Acquires the advisory lock for `account_id`, failing immediately if a
/// session already holds it rather than waiting (spec §4.7: "a second
/// start on the same account either waits or fails fast depending on
/// configuration" — this core implements the fail-fast branch; a waiting
/// variant is a caller-side retry loop around this function).
pub async fn acquire<'a>(pool: &'a SqlitePool, account_id: Uuid, session_id: Uuid) -> Result<AccountLockGuard<'a>, PersistenceError> {
	let result = sqlx::query("INSERT INTO account_locks (account_id, session_id, acquired_at) VALUES (?, ?, ?)")
		.bind(account_id.to_string())
		.bind(session_id.to_string())
		.bind(chrono::Utc::now().to_rfc3339())
		.execute(pool)
		.await;
	match result {
		Ok(_) => Ok(AccountLockGuard { pool, account_id, released: false }),
		Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
			Err(PersistenceError::AccountAlreadyLocked { account_id })
		},
		Err(other) => Err(other.into()),
	}
}
