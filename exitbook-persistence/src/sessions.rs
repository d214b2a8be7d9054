//! `import_sessions` and `import_session_errors` tables (spec §3
//! `ImportSession`, §2.10 supplemental error log).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use exitbook_domain::{error::ErrorDetails, session::SessionStatus, ImportSession};
use serde::de::Error as _;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::PersistenceError;

fn status_to_str(status: SessionStatus) -> &'static str {
	match status {
		SessionStatus::Started => "started",
		SessionStatus::Completed => "completed",
		SessionStatus::Failed => "failed",
		SessionStatus::Cancelled => "cancelled",
	}
}

fn status_from_str(s: &str) -> Result<SessionStatus, PersistenceError> {
	match s {
		"started" => Ok(SessionStatus::Started),
		"completed" => Ok(SessionStatus::Completed),
		"failed" => Ok(SessionStatus::Failed),
		"cancelled" => Ok(SessionStatus::Cancelled),
		other => Err(PersistenceError::json("import_sessions.status", serde_json::Error::custom(format!("unknown status {other:?}")))),
	}
}

#[derive(FromRow)]
struct SessionRow {
	id: String,
	account_id: String,
	status: String,
	started_at: String,
	completed_at: Option<String>,
	duration_ms: Option<i64>,
	transactions_imported: i64,
	transactions_failed: i64,
	error_message: Option<String>,
	error_details: Option<String>,
	import_result_metadata: String,
}

impl TryFrom<SessionRow> for ImportSession {
	type Error = PersistenceError;

	fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
		Ok(ImportSession {
			id: Uuid::from_str(&row.id).map_err(|e| PersistenceError::json("import_sessions.id", serde_json::Error::custom(e)))?,
			account_id: Uuid::from_str(&row.account_id)
				.map_err(|e| PersistenceError::json("import_sessions.account_id", serde_json::Error::custom(e)))?,
			status: status_from_str(&row.status)?,
			started_at: DateTime::parse_from_rfc3339(&row.started_at)
				.map_err(|e| PersistenceError::json("import_sessions.started_at", serde_json::Error::custom(e)))?
				.with_timezone(&Utc),
			completed_at: row
				.completed_at
				.map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
				.transpose()
				.map_err(|e| PersistenceError::json("import_sessions.completed_at", serde_json::Error::custom(e)))?,
			duration_ms: row.duration_ms,
			transactions_imported: row.transactions_imported as u64,
			transactions_failed: row.transactions_failed as u64,
			error_message: row.error_message,
			error_details: row
				.error_details
				.map(|s| serde_json::from_str(&s))
				.transpose()
				.map_err(|e| PersistenceError::json("import_sessions.error_details", e))?,
			import_result_metadata: serde_json::from_str(&row.import_result_metadata)
				.map_err(|e| PersistenceError::json("import_sessions.import_result_metadata", e))?,
		})
	}
}

pub async fn start(pool: &SqlitePool, session: &ImportSession) -> Result<(), PersistenceError> {
	sqlx::query(
		"INSERT INTO import_sessions \
		 (id, account_id, status, started_at, completed_at, duration_ms, transactions_imported, transactions_failed, \
		  error_message, error_details, import_result_metadata) \
		 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
	)
	.bind(session.id.to_string())
	.bind(session.account_id.to_string())
	.bind(status_to_str(session.status))
	.bind(session.started_at.to_rfc3339())
	.bind(session.completed_at.map(|dt| dt.to_rfc3339()))
	.bind(session.duration_ms)
	.bind(session.transactions_imported as i64)
	.bind(session.transactions_failed as i64)
	.bind(&session.error_message)
	.bind(session.error_details.as_ref().map(|d| serde_json::to_string(d).expect("ErrorDetails serializes infallibly")))
	.bind(serde_json::to_string(&session.import_result_metadata).expect("json value serializes infallibly"))
	.execute(pool)
	.await?;
	Ok(())
}

/// Persists a session already transitioned to a terminal state, and the
/// committed counts alongside it (spec §3 invariant: "counts reflect
/// records actually committed, never records merely fetched").
pub async fn finish(pool: &SqlitePool, session: &ImportSession) -> Result<(), PersistenceError> {
	sqlx::query(
		"UPDATE import_sessions SET status = ?, completed_at = ?, duration_ms = ?, transactions_imported = ?, \
		 transactions_failed = ?, error_message = ?, error_details = ?, import_result_metadata = ? WHERE id = ?",
	)
	.bind(status_to_str(session.status))
	.bind(session.completed_at.map(|dt| dt.to_rfc3339()))
	.bind(session.duration_ms)
	.bind(session.transactions_imported as i64)
	.bind(session.transactions_failed as i64)
	.bind(&session.error_message)
	.bind(session.error_details.as_ref().map(|d| serde_json::to_string(d).expect("ErrorDetails serializes infallibly")))
	.bind(serde_json::to_string(&session.import_result_metadata).expect("json value serializes infallibly"))
	.bind(session.id.to_string())
	.execute(pool)
	.await?;
	Ok(())
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<ImportSession, PersistenceError> {
	let row = sqlx::query_as::<_, SessionRow>(
		"SELECT id, account_id, status, started_at, completed_at, duration_ms, transactions_imported, transactions_failed, \
		 error_message, error_details, import_result_metadata FROM import_sessions WHERE id = ?",
	)
	.bind(id.to_string())
	.fetch_optional(pool)
	.await?
	.ok_or(PersistenceError::NotFound("import_sessions"))?;
	ImportSession::try_from(row)
}

pub async fn list_for_account(pool: &SqlitePool, account_id: Uuid) -> Result<Vec<ImportSession>, PersistenceError> {
	let rows = sqlx::query_as::<_, SessionRow>(
		"SELECT id, account_id, status, started_at, completed_at, duration_ms, transactions_imported, transactions_failed, \
		 error_message, error_details, import_result_metadata FROM import_sessions WHERE account_id = ? ORDER BY started_at DESC",
	)
	.bind(account_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(ImportSession::try_from).collect()
}

/// Records one partial failure against a session without touching the
/// session row itself (spec §2.10: the "first N failures" log a
/// `fail`-mode price enrichment or best-effort import run accumulates
/// while continuing past individual record failures).
pub async fn record_error(pool: &SqlitePool, session_id: Uuid, error: &ErrorDetails) -> Result<(), PersistenceError> {
	sqlx::query("INSERT INTO import_session_errors (id, session_id, code, message, context, created_at) VALUES (?, ?, ?, ?, ?, ?)")
		.bind(Uuid::new_v4().to_string())
		.bind(session_id.to_string())
		.bind(&error.code)
		.bind(&error.message)
		.bind(serde_json::to_string(&error.context).expect("json value serializes infallibly"))
		.bind(Utc::now().to_rfc3339())
		.execute(pool)
		.await?;
	Ok(())
}

pub async fn count_errors(pool: &SqlitePool, session_id: Uuid) -> Result<i64, PersistenceError> {
	let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM import_session_errors WHERE session_id = ?")
		.bind(session_id.to_string())
		.fetch_one(pool)
		.await?;
	Ok(row.0)
}
