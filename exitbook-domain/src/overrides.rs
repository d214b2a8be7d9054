use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::price::Money;

/// A stable, symmetric identity for a (transaction, transaction, asset)
/// triple, used to key user overrides without depending on database ids
/// (spec §3, GLOSSARY "Fingerprint"). Computed by sorting the two
/// transaction `(source, external_id)` identifiers lexicographically before
/// hashing, so the fingerprint for `(a, b)` equals the one for `(b, a)`.
pub fn unlink_fingerprint(
	tx_a: (&str, &str),
	tx_b: (&str, &str),
	asset_symbol: &str,
) -> String {
	let mut pair = [format!("{}:{}", tx_a.0, tx_a.1), format!("{}:{}", tx_b.0, tx_b.1)];
	pair.sort();
	let mut hasher = Sha256::new();
	hasher.update(pair[0].as_bytes());
	hasher.update(b"|");
	hasher.update(pair[1].as_bytes());
	hasher.update(b"|");
	hasher.update(asset_symbol.as_bytes());
	hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkOverride {
	pub fingerprint: String,
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceOverride {
	pub transaction_id: Uuid,
	pub asset_symbol: String,
	pub price: Money,
}

/// Append-only user intent (spec §3). Never mutated or deleted once
/// recorded; the current effective state is always derived by folding the
/// event log, not by updating a row in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OverrideEvent {
	Unlink(UnlinkOverride),
	Price(PriceOverride),
	ScamFlag { transaction_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
	pub id: Uuid,
	pub user_id: Uuid,
	pub event: OverrideEvent,
	pub created_at: DateTime<Utc>,
}
