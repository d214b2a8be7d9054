//! `transactions` table (spec §3 `Transaction`, §6).
//!
//! Movements, fees and notes are stored as JSON arrays on the row rather
//! than normalized child tables — every other boundary in this workspace
//! already moves a `Transaction` as one `serde_json`-shaped value, so
//! splitting movements out here would buy nothing but join complexity.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use exitbook_domain::transaction::{BlockchainInfo, Fee, Movements, Note, Operation, OperationCategory, OperationType, TxStatus};
use exitbook_domain::Transaction;
use serde::de::Error as _;
use sqlx::{FromRow, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::PersistenceError;

fn status_to_str(status: &TxStatus) -> &'static str {
	match status {
		TxStatus::Pending => "pending",
		TxStatus::Confirmed => "confirmed",
		TxStatus::Failed => "failed",
	}
}

fn status_from_str(s: &str) -> Result<TxStatus, PersistenceError> {
	match s {
		"pending" => Ok(TxStatus::Pending),
		"confirmed" => Ok(TxStatus::Confirmed),
		"failed" => Ok(TxStatus::Failed),
		other => Err(PersistenceError::json("transactions.status", serde_json::Error::custom(format!("unknown status {other:?}")))),
	}
}

fn category_to_str(c: &OperationCategory) -> &'static str {
	match c {
		OperationCategory::Trade => "trade",
		OperationCategory::Transfer => "transfer",
		OperationCategory::Reward => "reward",
		OperationCategory::Fee => "fee",
	}
}

fn category_from_str(s: &str) -> Result<OperationCategory, PersistenceError> {
	match s {
		"trade" => Ok(OperationCategory::Trade),
		"transfer" => Ok(OperationCategory::Transfer),
		"reward" => Ok(OperationCategory::Reward),
		"fee" => Ok(OperationCategory::Fee),
		other => {
			Err(PersistenceError::json("transactions.operation_category", serde_json::Error::custom(format!("unknown category {other:?}"))))
		},
	}
}

fn op_type_to_str(t: &OperationType) -> &'static str {
	match t {
		OperationType::Buy => "buy",
		OperationType::Sell => "sell",
		OperationType::Swap => "swap",
		OperationType::Deposit => "deposit",
		OperationType::Withdrawal => "withdrawal",
		OperationType::InternalTransfer => "internal_transfer",
		OperationType::StakingReward => "staking_reward",
		OperationType::Airdrop => "airdrop",
		OperationType::FeeOnly => "fee_only",
	}
}

fn op_type_from_str(s: &str) -> Result<OperationType, PersistenceError> {
	match s {
		"buy" => Ok(OperationType::Buy),
		"sell" => Ok(OperationType::Sell),
		"swap" => Ok(OperationType::Swap),
		"deposit" => Ok(OperationType::Deposit),
		"withdrawal" => Ok(OperationType::Withdrawal),
		"internal_transfer" => Ok(OperationType::InternalTransfer),
		"staking_reward" => Ok(OperationType::StakingReward),
		"airdrop" => Ok(OperationType::Airdrop),
		"fee_only" => Ok(OperationType::FeeOnly),
		other => Err(PersistenceError::json("transactions.operation_type", serde_json::Error::custom(format!("unknown op type {other:?}")))),
	}
}

#[derive(FromRow)]
struct TransactionRow {
	id: String,
	account_id: String,
	external_id: String,
	datetime: String,
	timestamp: i64,
	source: String,
	source_type: String,
	status: String,
	from_address: Option<String>,
	to_address: Option<String>,
	movements: String,
	fees: String,
	operation_category: String,
	operation_type: String,
	notes: String,
	blockchain: Option<String>,
	is_spam: i64,
	excluded_from_accounting: i64,
}

impl TryFrom<TransactionRow> for Transaction {
	type Error = PersistenceError;

	fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
		let movements: Movements = serde_json::from_str(&row.movements).map_err(|e| PersistenceError::json("transactions.movements", e))?;
		let fees: Vec<Fee> = serde_json::from_str(&row.fees).map_err(|e| PersistenceError::json("transactions.fees", e))?;
		let notes: Vec<Note> = serde_json::from_str(&row.notes).map_err(|e| PersistenceError::json("transactions.notes", e))?;
		let blockchain: Option<BlockchainInfo> =
			row.blockchain.map(|s| serde_json::from_str(&s)).transpose().map_err(|e| PersistenceError::json("transactions.blockchain", e))?;
		Ok(Transaction {
			id: Uuid::from_str(&row.id).map_err(|e| PersistenceError::json("transactions.id", serde_json::Error::custom(e)))?,
			account_id: Uuid::from_str(&row.account_id)
				.map_err(|e| PersistenceError::json("transactions.account_id", serde_json::Error::custom(e)))?,
			external_id: row.external_id,
			datetime: DateTime::parse_from_rfc3339(&row.datetime)
				.map_err(|e| PersistenceError::json("transactions.datetime", serde_json::Error::custom(e)))?
				.with_timezone(&Utc),
			timestamp: row.timestamp,
			source: row.source,
			source_type: row.source_type,
			status: status_from_str(&row.status)?,
			from: row.from_address,
			to: row.to_address,
			movements,
			fees,
			operation: Operation { category: category_from_str(&row.operation_category)?, op_type: op_type_from_str(&row.operation_type)? },
			notes,
			blockchain,
			is_spam: row.is_spam != 0,
			excluded_from_accounting: row.excluded_from_accounting != 0,
		})
	}
}

/// Inserts a canonical transaction, or updates it in place if `(source,
/// external_id)` already exists (spec §3: "`external_id` is stable across
/// re-runs so `(source, external_id)` can be the persistence uniqueness
/// key that makes re-processing idempotent"). The processor calls this
/// unconditionally — it never needs to check existence first.
pub async fn upsert(pool: &SqlitePool, tx: &Transaction) -> Result<(), PersistenceError> {
	upsert_on(pool, tx).await
}

/// Upserts every transaction in `txs` within one transaction, so the
/// processor's "abort the whole account run on any save failure, no
/// partial canonical state" rule (spec §4.8) holds without the caller
/// managing a transaction handle itself.
pub async fn upsert_all(pool: &SqlitePool, txs: &[Transaction]) -> Result<(), PersistenceError> {
	let mut txn = pool.begin().await?;
	for t in txs {
		upsert_on(&mut *txn, t).await?;
	}
	txn.commit().await?;
	Ok(())
}

async fn upsert_on<'c, E>(executor: E, tx: &Transaction) -> Result<(), PersistenceError>
where
	E: sqlx::Executor<'c, Database = Sqlite>,
{
	let movements = serde_json::to_string(&tx.movements).expect("Movements serializes infallibly");
	let fees = serde_json::to_string(&tx.fees).expect("Vec<Fee> serializes infallibly");
	let notes = serde_json::to_string(&tx.notes).expect("Vec<Note> serializes infallibly");
	let blockchain = tx.blockchain.as_ref().map(|b| serde_json::to_string(b).expect("BlockchainInfo serializes infallibly"));

	sqlx::query(
		"INSERT INTO transactions \
		 (id, account_id, external_id, source, source_type, datetime, timestamp, status, from_address, to_address, \
		  movements, fees, operation_category, operation_type, notes, blockchain, is_spam, excluded_from_accounting) \
		 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
		 ON CONFLICT (source, external_id) DO UPDATE SET \
		 account_id = excluded.account_id, datetime = excluded.datetime, timestamp = excluded.timestamp, status = excluded.status, \
		 from_address = excluded.from_address, to_address = excluded.to_address, movements = excluded.movements, fees = excluded.fees, \
		 operation_category = excluded.operation_category, operation_type = excluded.operation_type, notes = excluded.notes, \
		 blockchain = excluded.blockchain, is_spam = excluded.is_spam, excluded_from_accounting = excluded.excluded_from_accounting",
	)
	.bind(tx.id.to_string())
	.bind(tx.account_id.to_string())
	.bind(&tx.external_id)
	.bind(&tx.source)
	.bind(&tx.source_type)
	.bind(tx.datetime.to_rfc3339())
	.bind(tx.timestamp)
	.bind(status_to_str(&tx.status))
	.bind(&tx.from)
	.bind(&tx.to)
	.bind(movements)
	.bind(fees)
	.bind(category_to_str(&tx.operation.category))
	.bind(op_type_to_str(&tx.operation.op_type))
	.bind(notes)
	.bind(blockchain)
	.bind(tx.is_spam as i64)
	.bind(tx.excluded_from_accounting as i64)
	.execute(executor)
	.await?;
	Ok(())
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Transaction, PersistenceError> {
	let row = sqlx::query_as::<_, TransactionRow>(
		"SELECT id, account_id, external_id, datetime, timestamp, source, source_type, status, from_address, to_address, \
		 movements, fees, operation_category, operation_type, notes, blockchain, is_spam, excluded_from_accounting \
		 FROM transactions WHERE id = ?",
	)
	.bind(id.to_string())
	.fetch_optional(pool)
	.await?
	.ok_or(PersistenceError::NotFound("transactions"))?;
	Transaction::try_from(row)
}

pub async fn find_by_identity(pool: &SqlitePool, source: &str, external_id: &str) -> Result<Option<Transaction>, PersistenceError> {
	let row = sqlx::query_as::<_, TransactionRow>(
		"SELECT id, account_id, external_id, datetime, timestamp, source, source_type, status, from_address, to_address, \
		 movements, fees, operation_category, operation_type, notes, blockchain, is_spam, excluded_from_accounting \
		 FROM transactions WHERE source = ? AND external_id = ?",
	)
	.bind(source)
	.bind(external_id)
	.fetch_optional(pool)
	.await?;
	row.map(Transaction::try_from).transpose()
}

pub async fn list_for_account(pool: &SqlitePool, account_id: Uuid) -> Result<Vec<Transaction>, PersistenceError> {
	let rows = sqlx::query_as::<_, TransactionRow>(
		"SELECT id, account_id, external_id, datetime, timestamp, source, source_type, status, from_address, to_address, \
		 movements, fees, operation_category, operation_type, notes, blockchain, is_spam, excluded_from_accounting \
		 FROM transactions WHERE account_id = ? ORDER BY timestamp ASC",
	)
	.bind(account_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(Transaction::try_from).collect()
}

/// Every transaction carrying at least one unpriced movement or fee,
/// across all accounts — the working set for price enrichment Stage 3
/// (spec §4.9). A cheap substring probe on the JSON blob stands in for a
/// proper partial index; correct because `"price_at_tx_time":null` is
/// the only way a present-but-unpriced field serializes.
pub async fn list_with_unpriced_items(pool: &SqlitePool) -> Result<Vec<Transaction>, PersistenceError> {
	let rows = sqlx::query_as::<_, TransactionRow>(
		"SELECT id, account_id, external_id, datetime, timestamp, source, source_type, status, from_address, to_address, \
		 movements, fees, operation_category, operation_type, notes, blockchain, is_spam, excluded_from_accounting \
		 FROM transactions WHERE movements LIKE '%\"price_at_tx_time\":null%' OR fees LIKE '%\"price_at_tx_time\":null%' \
		 ORDER BY timestamp ASC",
	)
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(Transaction::try_from).collect()
}

#[cfg(test)]
mod tests {
	use exitbook_domain::transaction::{Movement, OperationCategory, OperationType};

	use super::*;
	use crate::{accounts, Store};

	async fn seeded_account(store: &Store) -> Uuid {
		let account =
			exitbook_domain::Account::new(Uuid::new_v4(), Uuid::new_v4(), exitbook_domain::AccountType::Blockchain, "ethereum", "0xabc");
		accounts::create(store.pool(), &account).await.unwrap();
		account.id
	}

	fn sample(account_id: Uuid, external_id: &str) -> Transaction {
		let mut movements = Movements::default();
		movements.push_inflow(Movement::new("eth", "ETH", 1.5));
		Transaction {
			id: Uuid::new_v4(),
			account_id,
			external_id: external_id.to_string(),
			datetime: Utc::now(),
			timestamp: Utc::now().timestamp(),
			source: "etherscan-like".to_string(),
			source_type: "blockchain".to_string(),
			status: TxStatus::Confirmed,
			from: Some("0xabc".to_string()),
			to: Some("0xdef".to_string()),
			movements,
			fees: vec![],
			operation: Operation { category: OperationCategory::Transfer, op_type: OperationType::Deposit },
			notes: vec![],
			blockchain: Some(BlockchainInfo {
				name: "ethereum".to_string(),
				block_height: Some(100),
				transaction_hash: "0xhash".to_string(),
				is_confirmed: true,
			}),
			is_spam: false,
			excluded_from_accounting: false,
		}
	}

	#[tokio::test]
	async fn round_trips_a_transaction_through_storage() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let tx = sample(account_id, "0xhash");
		upsert(store.pool(), &tx).await.unwrap();

		let found = find_by_identity(store.pool(), "etherscan-like", "0xhash").await.unwrap().unwrap();
		assert_eq!(found.movements.inflows.len(), 1);
		assert_eq!(found.movements.inflows[0].asset_symbol, "ETH");
	}

	#[tokio::test]
	async fn reprocessing_the_same_external_id_updates_in_place_rather_than_duplicating() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let mut tx = sample(account_id, "0xhash");
		upsert(store.pool(), &tx).await.unwrap();

		tx.status = TxStatus::Failed;
		upsert(store.pool(), &tx).await.unwrap();

		let all = list_for_account(store.pool(), account_id).await.unwrap();
		assert_eq!(all.len(), 1);
		assert_eq!(all[0].status, TxStatus::Failed);
	}

	#[tokio::test]
	async fn unpriced_transactions_are_found_for_enrichment() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		upsert(store.pool(), &sample(account_id, "0xhash")).await.unwrap();

		let unpriced = list_with_unpriced_items(store.pool()).await.unwrap();
		assert_eq!(unpriced.len(), 1);
	}
}
