//! `overrides` table (spec §3 `OverrideEvent`): append-only, never updated
//! or deleted. The effective state consumers act on is always derived by
//! folding the full log, never by reading a single row.

use std::{
	collections::{HashMap, HashSet},
	str::FromStr,
};

use chrono::{DateTime, Utc};
use exitbook_domain::{
	overrides::{OverrideEvent, OverrideRecord, PriceOverride, UnlinkOverride},
	price::Money,
};
use serde::de::Error as _;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::PersistenceError;

fn event_kind(event: &OverrideEvent) -> &'static str {
	match event {
		OverrideEvent::Unlink(_) => "unlink",
		OverrideEvent::Price(_) => "price",
		OverrideEvent::ScamFlag { .. } => "scam_flag",
	}
}

#[derive(FromRow)]
struct OverrideRow {
	id: String,
	user_id: String,
	event_payload: String,
	created_at: String,
}

impl TryFrom<OverrideRow> for OverrideRecord {
	type Error = PersistenceError;

	fn try_from(row: OverrideRow) -> Result<Self, Self::Error> {
		Ok(OverrideRecord {
			id: Uuid::from_str(&row.id).map_err(|e| PersistenceError::json("overrides.id", serde_json::Error::custom(e)))?,
			user_id: Uuid::from_str(&row.user_id).map_err(|e| PersistenceError::json("overrides.user_id", serde_json::Error::custom(e)))?,
			event: serde_json::from_str(&row.event_payload).map_err(|e| PersistenceError::json("overrides.event_payload", e))?,
			created_at: DateTime::parse_from_rfc3339(&row.created_at)
				.map_err(|e| PersistenceError::json("overrides.created_at", serde_json::Error::custom(e)))?
				.with_timezone(&Utc),
		})
	}
}

pub async fn append(pool: &SqlitePool, record: &OverrideRecord) -> Result<(), PersistenceError> {
	let payload = serde_json::to_string(&record.event).expect("OverrideEvent serializes infallibly");
	sqlx::query("INSERT INTO overrides (id, user_id, event_kind, event_payload, created_at) VALUES (?, ?, ?, ?, ?)")
		.bind(record.id.to_string())
		.bind(record.user_id.to_string())
		.bind(event_kind(&record.event))
		.bind(payload)
		.bind(record.created_at.to_rfc3339())
		.execute(pool)
		.await?;
	Ok(())
}

pub async fn list_for_user(pool: &SqlitePool, user_id: Uuid) -> Result<Vec<OverrideRecord>, PersistenceError> {
	let rows = sqlx::query_as::<_, OverrideRow>(
		"SELECT id, user_id, event_payload, created_at FROM overrides WHERE user_id = ? ORDER BY created_at ASC",
	)
	.bind(user_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(OverrideRecord::try_from).collect()
}

/// The effective state a user's override log folds down to (spec §3,
/// §4.9 Stage 1: unlinks suppress propagation, price overrides win
/// unconditionally over anything the pipeline itself derives, scam flags
/// exclude a transaction from accounting).
#[derive(Debug, Default)]
pub struct EffectiveOverrides {
	pub unlinked_fingerprints: HashSet<String>,
	pub price_overrides: HashMap<(Uuid, String), Money>,
	pub scam_flagged: HashSet<Uuid>,
}

impl EffectiveOverrides {
	pub fn is_unlinked(&self, fingerprint: &str) -> bool {
		self.unlinked_fingerprints.contains(fingerprint)
	}

	pub fn price_for(&self, transaction_id: Uuid, asset_symbol: &str) -> Option<&Money> {
		self.price_overrides.get(&(transaction_id, asset_symbol.to_string()))
	}

	pub fn is_scam_flagged(&self, transaction_id: Uuid) -> bool {
		self.scam_flagged.contains(&transaction_id)
	}
}

/// Loads and folds `user_id`'s entire override log. Later events win
/// where there's a conflict (e.g. two price overrides for the same
/// transaction/asset pair), since the log is read oldest-first.
pub async fn fold_effective_state(pool: &SqlitePool, user_id: Uuid) -> Result<EffectiveOverrides, PersistenceError> {
	let records = list_for_user(pool, user_id).await?;
	let mut state = EffectiveOverrides::default();
	for record in records {
		match record.event {
			OverrideEvent::Unlink(UnlinkOverride { fingerprint, .. }) => {
				state.unlinked_fingerprints.insert(fingerprint);
			},
			OverrideEvent::Price(PriceOverride { transaction_id, asset_symbol, price }) => {
				state.price_overrides.insert((transaction_id, asset_symbol), price);
			},
			OverrideEvent::ScamFlag { transaction_id } => {
				state.scam_flagged.insert(transaction_id);
			},
		}
	}
	Ok(state)
}
