use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
	Pending,
	Processed,
	Failed,
}

/// A single provider-emitted record, persisted verbatim alongside a
/// normalized projection (spec §3).
///
/// Invariant: `(account_id, event_id)` is unique — this is the dedup key
/// enforced both by the streaming manager's in-memory LRU (spec §4.5) and,
/// durably, by the persistence layer's unique index (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
	pub id: Uuid,
	pub account_id: Uuid,
	pub provider_name: String,
	/// Set when an account tracks more than one address (e.g. an xpub
	/// account's children share one logical account row upstream of the
	/// per-child accounts the orchestrator actually creates — kept here so
	/// a single address's records remain traceable after consolidation).
	pub source_address: Option<String>,
	/// e.g. "normal" / "internal" / "token" for EVM (spec §8 scenario 2).
	pub transaction_type_hint: Option<String>,
	pub event_id: String,
	pub blockchain_transaction_hash: Option<String>,
	pub timestamp: DateTime<Utc>,
	pub provider_data: serde_json::Value,
	pub normalized_data: serde_json::Value,
	pub processing_status: ProcessingStatus,
	pub processed_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

impl RawTransaction {
	pub fn dedup_key(&self) -> (Uuid, &str) {
		(self.account_id, self.event_id.as_str())
	}
}
