//! Exchange ledger sources (spec §4.6, §8 scenario 1): anything that yields
//! a flat, already-denominated ledger of trades/deposits/withdrawals/fees,
//! whether read over REST or parsed from a CSV export.

mod kraken_api;
mod kraken_csv;

pub use kraken_api::KrakenApiClient;
pub use kraken_csv::KrakenCsvClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exitbook_domain::{
	cursor::{CursorState, CursorType, CursorValue},
	error::IngestError,
};
use exitbook_providers::{ResolvedProvider, StreamBatch, StreamingOperation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
	Trade,
	Deposit,
	Withdrawal,
	Transfer,
	Fee,
	Reward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryStatus {
	Pending,
	Success,
	Failed,
}

/// One exchange-native ledger entry, normalized just enough to be
/// cursor-addressable and dedupable (spec §4.6: "convert raw ledger items
/// into a normalized `ExchangeLedgerEntry`"). Source-specific fields (order
/// ID, trade pair, etc) stay in `raw` for the processor to consult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeLedgerEntry {
	pub id: String,
	pub correlation_id: Option<String>,
	pub timestamp: DateTime<Utc>,
	pub entry_type: LedgerEntryType,
	pub asset: String,
	pub amount: f64,
	pub fee: Option<f64>,
	pub fee_currency: Option<String>,
	pub status: LedgerEntryStatus,
	pub raw: serde_json::Value,
}

/// Shared fetch contract for exchange ledgers, whatever the transport
/// (REST pagination or CSV rows) — one `ExchangeLedgerOperation<T>` below
/// turns any implementer into a `StreamingOperation` the provider manager
/// can drive.
#[async_trait]
pub trait ExchangeLedgerSource: Send + Sync {
	async fn fetch_ledger(
		&self,
		provider: &ResolvedProvider,
		cursor: Option<&CursorState>,
	) -> Result<StreamBatch<ExchangeLedgerEntry>, IngestError>;
}

/// Adapts any [`ExchangeLedgerSource`] into a [`StreamingOperation`]. Cursor
/// extraction and the dedup key are identical for every exchange ledger —
/// an exchange-assigned entry `id` is already globally unique per account,
/// unlike an EVM transfer where (hash, trace/log index) must be composed.
pub struct ExchangeLedgerOperation<T: ExchangeLedgerSource>(pub T);

#[async_trait]
impl<T: ExchangeLedgerSource> StreamingOperation for ExchangeLedgerOperation<T> {
	type Record = ExchangeLedgerEntry;

	async fn fetch_batch(
		&self,
		provider: &ResolvedProvider,
		cursor: Option<&CursorState>,
	) -> Result<StreamBatch<Self::Record>, IngestError> {
		self.0.fetch_ledger(provider, cursor).await
	}

	fn event_id(&self, record: &Self::Record) -> String {
		record.id.clone()
	}

	fn extract_cursors(&self, record: &Self::Record) -> BTreeMap<CursorType, CursorValue> {
		let mut cursors = BTreeMap::new();
		cursors.insert(CursorType::Timestamp, CursorValue::Timestamp(record.timestamp));
		cursors
	}
}
