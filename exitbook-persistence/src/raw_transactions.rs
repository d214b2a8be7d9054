//! `raw_transactions` table and the one transactional operation at the
//! heart of the import service's correctness contract (spec §4.7 step 4,
//! §8): dedup-insert a batch and advance the account's cursor for the same
//! operation in one transaction, so a crash between the two is impossible.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use exitbook_domain::{cursor::CursorState, raw_transaction::ProcessingStatus, RawTransaction};
use serde::de::Error as _;
use sqlx::{FromRow, Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::PersistenceError;

fn status_to_str(status: ProcessingStatus) -> &'static str {
	match status {
		ProcessingStatus::Pending => "pending",
		ProcessingStatus::Processed => "processed",
		ProcessingStatus::Failed => "failed",
	}
}

fn status_from_str(s: &str) -> Result<ProcessingStatus, PersistenceError> {
	match s {
		"pending" => Ok(ProcessingStatus::Pending),
		"processed" => Ok(ProcessingStatus::Processed),
		"failed" => Ok(ProcessingStatus::Failed),
		other => Err(PersistenceError::json(
			"raw_transactions.processing_status",
			serde_json::Error::custom(format!("unknown processing_status {other:?}")),
		)),
	}
}

#[derive(FromRow)]
struct RawTransactionRow {
	id: String,
	account_id: String,
	provider_name: String,
	source_address: Option<String>,
	transaction_type_hint: Option<String>,
	event_id: String,
	blockchain_transaction_hash: Option<String>,
	timestamp: String,
	provider_data: String,
	normalized_data: String,
	processing_status: String,
	processed_at: Option<String>,
	created_at: String,
}

impl TryFrom<RawTransactionRow> for RawTransaction {
	type Error = PersistenceError;

	fn try_from(row: RawTransactionRow) -> Result<Self, Self::Error> {
		Ok(RawTransaction {
			id: Uuid::from_str(&row.id).map_err(|e| PersistenceError::json("raw_transactions.id", serde_json::Error::custom(e)))?,
			account_id: Uuid::from_str(&row.account_id)
				.map_err(|e| PersistenceError::json("raw_transactions.account_id", serde_json::Error::custom(e)))?,
			provider_name: row.provider_name,
			source_address: row.source_address,
			transaction_type_hint: row.transaction_type_hint,
			event_id: row.event_id,
			blockchain_transaction_hash: row.blockchain_transaction_hash,
			timestamp: DateTime::parse_from_rfc3339(&row.timestamp)
				.map_err(|e| PersistenceError::json("raw_transactions.timestamp", serde_json::Error::custom(e)))?
				.with_timezone(&Utc),
			provider_data: serde_json::from_str(&row.provider_data).map_err(|e| PersistenceError::json("raw_transactions.provider_data", e))?,
			normalized_data: serde_json::from_str(&row.normalized_data)
				.map_err(|e| PersistenceError::json("raw_transactions.normalized_data", e))?,
			processing_status: status_from_str(&row.processing_status)?,
			processed_at: row
				.processed_at
				.map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
				.transpose()
				.map_err(|e| PersistenceError::json("raw_transactions.processed_at", serde_json::Error::custom(e)))?,
			created_at: DateTime::parse_from_rfc3339(&row.created_at)
				.map_err(|e| PersistenceError::json("raw_transactions.created_at", serde_json::Error::custom(e)))?
				.with_timezone(&Utc),
		})
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchPersistOutcome {
	pub inserted: u64,
	pub duplicates: u64,
}

/// The correctness-critical operation (spec §4.7 step 4, §8 cursor
/// monotonicity property): within one transaction, dedup-insert every raw
/// in `batch` and advance `account_id`'s cursor for `operation` to
/// `new_cursor`. A raw whose `(account_id, event_id)` already exists is a
/// silent no-op (spec: "On conflict ... treat the conflict rows as no-ops
/// and continue"), not an error — the importer cannot tell a genuine
/// cross-run race from its own provider-failover duplicate window, and
/// both resolve the same way.
pub async fn insert_batch_and_advance_cursor(
	pool: &SqlitePool,
	account_id: Uuid,
	operation: &str,
	batch: &[RawTransaction],
	new_cursor: &CursorState,
) -> Result<BatchPersistOutcome, PersistenceError> {
	let mut tx = pool.begin().await?;
	let mut outcome = BatchPersistOutcome::default();

	for raw in batch {
		let rows_affected = insert_one_ignoring_conflict(&mut tx, raw).await?;
		if rows_affected == 1 {
			outcome.inserted += 1;
		} else {
			outcome.duplicates += 1;
		}
	}

	advance_cursor_in_tx(&mut tx, account_id, operation, new_cursor).await?;
	tx.commit().await?;
	Ok(outcome)
}

async fn insert_one_ignoring_conflict(tx: &mut Transaction<'_, Sqlite>, raw: &RawTransaction) -> Result<u64, PersistenceError> {
	let provider_data = serde_json::to_string(&raw.provider_data).expect("json value serializes infallibly");
	let normalized_data = serde_json::to_string(&raw.normalized_data).expect("json value serializes infallibly");
	let result = sqlx::query(
		"INSERT OR IGNORE INTO raw_transactions \
		 (id, account_id, provider_name, source_address, transaction_type_hint, event_id, blockchain_transaction_hash, \
		  timestamp, provider_data, normalized_data, processing_status, processed_at, created_at) \
		 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
	)
	.bind(raw.id.to_string())
	.bind(raw.account_id.to_string())
	.bind(&raw.provider_name)
	.bind(&raw.source_address)
	.bind(&raw.transaction_type_hint)
	.bind(&raw.event_id)
	.bind(&raw.blockchain_transaction_hash)
	.bind(raw.timestamp.to_rfc3339())
	.bind(provider_data)
	.bind(normalized_data)
	.bind(status_to_str(raw.processing_status))
	.bind(raw.processed_at.map(|dt| dt.to_rfc3339()))
	.bind(raw.created_at.to_rfc3339())
	.execute(&mut **tx)
	.await?;
	Ok(result.rows_affected())
}

async fn advance_cursor_in_tx(
	tx: &mut Transaction<'_, Sqlite>,
	account_id: Uuid,
	operation: &str,
	new_cursor: &CursorState,
) -> Result<(), PersistenceError> {
	let row = sqlx::query("SELECT last_cursor FROM accounts WHERE id = ?")
		.bind(account_id.to_string())
		.fetch_optional(&mut **tx)
		.await?
		.ok_or(PersistenceError::NotFound("accounts"))?;
	let raw_cursor: String = row.get("last_cursor");
	let mut cursors: std::collections::BTreeMap<String, CursorState> =
		serde_json::from_str(&raw_cursor).map_err(|e| PersistenceError::json("accounts.last_cursor", e))?;

	if let Some(previous) = cursors.get(operation) {
		if !new_cursor.is_non_regressing_from(previous) {
			return Err(PersistenceError::CursorWouldRegress { account_id, operation: operation.to_string() });
		}
	}
	cursors.insert(operation.to_string(), new_cursor.clone());
	let serialized = serde_json::to_string(&cursors).expect("CursorState map serializes infallibly");
	sqlx::query("UPDATE accounts SET last_cursor = ? WHERE id = ?")
		.bind(serialized)
		.bind(account_id.to_string())
		.execute(&mut **tx)
		.await?;
	Ok(())
}

pub async fn list_pending_for_account(pool: &SqlitePool, account_id: Uuid) -> Result<Vec<RawTransaction>, PersistenceError> {
	let rows = sqlx::query_as::<_, RawTransactionRow>(
		"SELECT id, account_id, provider_name, source_address, transaction_type_hint, event_id, blockchain_transaction_hash, \
		 timestamp, provider_data, normalized_data, processing_status, processed_at, created_at \
		 FROM raw_transactions WHERE account_id = ? AND processing_status = 'pending' ORDER BY timestamp ASC",
	)
	.bind(account_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(RawTransaction::try_from).collect()
}

/// Marks every raw in `ids` as processed in a single statement (spec
/// §4.8: "After writing, raws are marked processed in one bulk
/// statement").
pub async fn mark_processed_bulk(pool: &SqlitePool, ids: &[Uuid]) -> Result<(), PersistenceError> {
	if ids.is_empty() {
		return Ok(());
	}
	let now = Utc::now().to_rfc3339();
	let mut tx = pool.begin().await?;
	for id in ids {
		sqlx::query("UPDATE raw_transactions SET processing_status = 'processed', processed_at = ? WHERE id = ?")
			.bind(&now)
			.bind(id.to_string())
			.execute(&mut *tx)
			.await?;
	}
	tx.commit().await?;
	Ok(())
}
