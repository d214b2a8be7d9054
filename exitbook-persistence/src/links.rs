//! `transaction_links` table (spec §3 `TransactionLink`, §4.9 Stage 1/4
//! price propagation).

use std::str::FromStr;

use exitbook_domain::{link::LinkStatus, TransactionLink};
use serde::de::Error as _;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::PersistenceError;

fn status_to_str(status: LinkStatus) -> &'static str {
	match status {
		LinkStatus::Suggested => "suggested",
		LinkStatus::Confirmed => "confirmed",
		LinkStatus::Rejected => "rejected",
	}
}

fn status_from_str(s: &str) -> Result<LinkStatus, PersistenceError> {
	match s {
		"suggested" => Ok(LinkStatus::Suggested),
		"confirmed" => Ok(LinkStatus::Confirmed),
		"rejected" => Ok(LinkStatus::Rejected),
		other => Err(PersistenceError::json("transaction_links.status", serde_json::Error::custom(format!("unknown status {other:?}")))),
	}
}

#[derive(FromRow)]
struct LinkRow {
	id: String,
	from_transaction_id: String,
	to_transaction_id: String,
	status: String,
}

impl TryFrom<LinkRow> for TransactionLink {
	type Error = PersistenceError;

	fn try_from(row: LinkRow) -> Result<Self, Self::Error> {
		Ok(TransactionLink {
			id: Uuid::from_str(&row.id).map_err(|e| PersistenceError::json("transaction_links.id", serde_json::Error::custom(e)))?,
			from_transaction_id: Uuid::from_str(&row.from_transaction_id)
				.map_err(|e| PersistenceError::json("transaction_links.from_transaction_id", serde_json::Error::custom(e)))?,
			to_transaction_id: Uuid::from_str(&row.to_transaction_id)
				.map_err(|e| PersistenceError::json("transaction_links.to_transaction_id", serde_json::Error::custom(e)))?,
			status: status_from_str(&row.status)?,
		})
	}
}

pub async fn create(pool: &SqlitePool, link: &TransactionLink) -> Result<(), PersistenceError> {
	sqlx::query("INSERT INTO transaction_links (id, from_transaction_id, to_transaction_id, status) VALUES (?, ?, ?, ?)")
		.bind(link.id.to_string())
		.bind(link.from_transaction_id.to_string())
		.bind(link.to_transaction_id.to_string())
		.bind(status_to_str(link.status))
		.execute(pool)
		.await?;
	Ok(())
}

pub async fn set_status(pool: &SqlitePool, link_id: Uuid, status: LinkStatus) -> Result<(), PersistenceError> {
	sqlx::query("UPDATE transaction_links SET status = ? WHERE id = ?")
		.bind(status_to_str(status))
		.bind(link_id.to_string())
		.execute(pool)
		.await?;
	Ok(())
}

/// Every link touching `transaction_id` on either side, confirmed or
/// not — callers filter with [`TransactionLink::is_propagation_eligible`]
/// before treating one as a propagation source (spec §4.9 Stage 1/4: only
/// `Confirmed` links propagate a price to their other side).
pub async fn list_for_transaction(pool: &SqlitePool, transaction_id: Uuid) -> Result<Vec<TransactionLink>, PersistenceError> {
	let rows = sqlx::query_as::<_, LinkRow>(
		"SELECT id, from_transaction_id, to_transaction_id, status FROM transaction_links \
		 WHERE from_transaction_id = ? OR to_transaction_id = ?",
	)
	.bind(transaction_id.to_string())
	.bind(transaction_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(TransactionLink::try_from).collect()
}
