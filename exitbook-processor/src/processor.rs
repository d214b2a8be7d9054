//! Groups one account's pending raws, classifies and consolidates them
//! into canonical transactions, and writes them atomically (spec §4.8).

use std::collections::{HashMap, HashSet};

use exitbook_domain::{error::IngestError, Transaction};
use exitbook_persistence::{raw_transactions, transactions, Store};
use uuid::Uuid;

use crate::classify::SourceAdapter;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessOutcome {
	pub transactions_written: u64,
	pub raws_marked_processed: u64,
}

pub struct Processor {
	store: Store,
}

impl Processor {
	pub fn new(store: Store) -> Self {
		Self { store }
	}

	/// Runs one account's pending raws through `adapter` to completion.
	/// `user_addresses` is every address/identifier the account's owner
	/// controls, across all their accounts — the self-transfer signal for
	/// the default classification rule. On any save failure the whole
	/// batch is left untouched: raws stay `pending` for a retry rather
	/// than risking a half-saved account (spec §4.8).
	pub async fn process_account(
		&self,
		account_id: Uuid,
		adapter: &dyn SourceAdapter,
		user_addresses: &HashSet<String>,
		quote_assets: &HashSet<String>,
	) -> Result<ProcessOutcome, IngestError> {
		let pool = self.store.pool();
		let pending = raw_transactions::list_pending_for_account(pool, account_id).await?;
		if pending.is_empty() {
			return Ok(ProcessOutcome::default());
		}

		let groups = group_by_correlation(pending, adapter);

		let mut built = Vec::with_capacity(groups.len());
		let mut raw_ids = Vec::new();
		for mut group in groups {
			group.sort_by_key(|raw| raw.timestamp);
			raw_ids.extend(group.iter().map(|raw| raw.id));

			let material = adapter.build(&group)?;
			let (operation, notes) = adapter.classify(&material, user_addresses, quote_assets);

			built.push(Transaction {
				id: Uuid::new_v4(),
				account_id,
				external_id: material.external_id,
				datetime: material.datetime,
				timestamp: material.timestamp,
				source: adapter.source().to_string(),
				source_type: adapter.source_type().to_string(),
				status: material.status,
				from: material.from,
				to: material.to,
				movements: material.movements,
				fees: material.fees,
				operation,
				notes,
				blockchain: material.blockchain,
				is_spam: false,
				excluded_from_accounting: false,
			});
		}

		transactions::upsert_all(pool, &built).await?;
		raw_transactions::mark_processed_bulk(pool, &raw_ids).await?;

		Ok(ProcessOutcome { transactions_written: built.len() as u64, raws_marked_processed: raw_ids.len() as u64 })
	}
}

fn group_by_correlation(
	pending: Vec<exitbook_domain::RawTransaction>,
	adapter: &dyn SourceAdapter,
) -> Vec<Vec<exitbook_domain::RawTransaction>> {
	let mut order = Vec::new();
	let mut index: HashMap<String, usize> = HashMap::new();
	for raw in pending {
		let key = adapter.correlation_key(&raw);
		match index.get(&key) {
			Some(&pos) => order[pos].1.push(raw),
			None => {
				index.insert(key.clone(), order.len());
				order.push((key, vec![raw]));
			},
		}
	}
	order.into_iter().map(|(_, group)| group).collect()
}
