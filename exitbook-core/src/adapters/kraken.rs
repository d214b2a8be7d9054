//! Kraken exchange ledger adapter (spec §4.8, §8 scenario 1): groups
//! ledger rows sharing a `correlation_id` (e.g. the two legs of one trade)
//! into a [`GroupMaterial`], and maps one fetched
//! [`ExchangeLedgerEntry`] into a [`RawTransaction`].

use exitbook_domain::{
	error::IngestError,
	transaction::{Fee, FeeScope, FeeSettlement, Movement, Movements, TxStatus},
	RawTransaction,
};
use exitbook_import::service::RawTransactionMapper;
use exitbook_processor::{GroupMaterial, SourceAdapter};
use exitbook_sources::{ExchangeLedgerEntry, ExchangeLedgerOperation, ExchangeLedgerSource, LedgerEntryStatus};
use uuid::Uuid;

pub struct KrakenSourceAdapter;

impl SourceAdapter for KrakenSourceAdapter {
	fn source(&self) -> &str {
		"kraken"
	}

	fn source_type(&self) -> &str {
		"exchange"
	}

	fn correlation_key(&self, raw: &RawTransaction) -> String {
		let entry: ExchangeLedgerEntry = serde_json::from_value(raw.normalized_data.clone()).expect("written by our own mapper");
		entry.correlation_id.unwrap_or(entry.id)
	}

	fn build(&self, group: &[RawTransaction]) -> Result<GroupMaterial, IngestError> {
		let first = group.first().ok_or_else(|| IngestError::internal_invariant("kraken.empty_group", "correlated group was empty"))?;
		let entries: Vec<ExchangeLedgerEntry> = group
			.iter()
			.map(|raw| {
				serde_json::from_value(raw.normalized_data.clone())
					.map_err(|e| IngestError::validation("kraken.malformed_normalized_data", e.to_string()))
			})
			.collect::<Result<_, _>>()?;

		let mut movements = Movements::default();
		let mut fees = Vec::new();
		for entry in &entries {
			if entry.amount > 0.0 {
				movements.push_inflow(Movement::new(entry.asset.clone(), entry.asset.clone(), entry.amount));
			} else if entry.amount < 0.0 {
				movements.push_outflow(Movement::new(entry.asset.clone(), entry.asset.clone(), entry.amount.abs()));
			}
			if let Some(fee_amount) = entry.fee.filter(|f| *f != 0.0) {
				fees.push(Fee {
					asset_symbol: entry.fee_currency.clone().unwrap_or_else(|| entry.asset.clone()),
					amount: fee_amount,
					scope: FeeScope::Platform,
					settlement: FeeSettlement::Balance,
					price_at_tx_time: None,
				});
			}
		}

		let status = if entries.iter().any(|e| e.status == LedgerEntryStatus::Failed) { TxStatus::Failed } else { TxStatus::Confirmed };
		let external_id = entries[0].correlation_id.clone().unwrap_or_else(|| entries[0].id.clone());

		Ok(GroupMaterial {
			external_id,
			datetime: first.timestamp,
			timestamp: first.timestamp.timestamp(),
			status,
			from: None,
			to: None,
			movements,
			fees,
			blockchain: None,
		})
	}
}

/// Maps one fetched ledger entry into a [`RawTransaction`] (spec §4.7).
/// Generic over any [`ExchangeLedgerSource`] so the same mapper serves
/// both `KrakenApiClient` and `KrakenCsvClient` (spec §8 scenario 1).
pub struct KrakenRawTransactionMapper;

impl<T: ExchangeLedgerSource> RawTransactionMapper<ExchangeLedgerOperation<T>> for KrakenRawTransactionMapper {
	fn to_raw(&self, record: &ExchangeLedgerEntry, account_id: Uuid, provider_name: &str, event_id: String) -> RawTransaction {
		RawTransaction {
			id: Uuid::new_v4(),
			account_id,
			provider_name: provider_name.to_string(),
			source_address: None,
			transaction_type_hint: Some(format!("{:?}", record.entry_type).to_lowercase()),
			event_id,
			blockchain_transaction_hash: None,
			timestamp: record.timestamp,
			provider_data: record.raw.clone(),
			normalized_data: serde_json::to_value(record).expect("ExchangeLedgerEntry serializes infallibly"),
			processing_status: exitbook_domain::ProcessingStatus::Pending,
			processed_at: None,
			created_at: chrono::Utc::now(),
		}
	}
}
