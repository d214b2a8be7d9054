//! `accounts` table (spec §3 `Account`, §6).

use std::{collections::BTreeMap, str::FromStr};

use chrono::Utc;
use exitbook_domain::{account::Credentials, cursor::CursorState, Account, AccountType};
use serde::de::Error as _;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::PersistenceError;

#[derive(FromRow)]
struct AccountRow {
	id: String,
	user_id: String,
	parent_account_id: Option<String>,
	account_type: String,
	source_name: String,
	identifier: String,
	credentials: Option<String>,
	last_cursor: String,
}

fn account_type_to_str(t: AccountType) -> &'static str {
	match t {
		AccountType::Blockchain => "blockchain",
		AccountType::ExchangeApi => "exchange-api",
		AccountType::ExchangeCsv => "exchange-csv",
	}
}

fn account_type_from_str(s: &str) -> Result<AccountType, PersistenceError> {
	match s {
		"blockchain" => Ok(AccountType::Blockchain),
		"exchange-api" => Ok(AccountType::ExchangeApi),
		"exchange-csv" => Ok(AccountType::ExchangeCsv),
		other => Err(PersistenceError::json(
			"accounts.account_type",
			serde::de::Error::custom(format!("unknown account_type {other:?}")),
		)),
	}
}

impl TryFrom<AccountRow> for Account {
	type Error = PersistenceError;

	fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
		let last_cursor: BTreeMap<String, CursorState> =
			serde_json::from_str(&row.last_cursor).map_err(|e| PersistenceError::json("accounts.last_cursor", e))?;
		let credentials = row
			.credentials
			.map(|raw| serde_json::from_str::<serde_json::Value>(&raw).map(Credentials))
			.transpose()
			.map_err(|e| PersistenceError::json("accounts.credentials", e))?;
		Ok(Account {
			id: Uuid::from_str(&row.id).map_err(|e| PersistenceError::json("accounts.id", serde::de::Error::custom(e)))?,
			user_id: Uuid::from_str(&row.user_id)
				.map_err(|e| PersistenceError::json("accounts.user_id", serde::de::Error::custom(e)))?,
			parent_account_id: row
				.parent_account_id
				.map(|s| Uuid::from_str(&s))
				.transpose()
				.map_err(|e| PersistenceError::json("accounts.parent_account_id", serde::de::Error::custom(e)))?,
			account_type: account_type_from_str(&row.account_type)?,
			source_name: row.source_name,
			identifier: row.identifier,
			credentials,
			last_cursor,
		})
	}
}

/// Inserts a brand-new account. Callers resolve an existing one first with
/// [`find_by_identity`] since `(user_id, account_type, source_name,
/// identifier)` is a uniqueness invariant (spec §3), not something this
/// function enforces by catching a constraint violation.
pub async fn create(pool: &SqlitePool, account: &Account) -> Result<(), PersistenceError> {
	let last_cursor = serde_json::to_string(&account.last_cursor).expect("CursorState serializes infallibly");
	let credentials = account.credentials.as_ref().map(|c| serde_json::to_string(&c.0).expect("json value serializes infallibly"));
	sqlx::query(
		"INSERT INTO accounts (id, user_id, parent_account_id, account_type, source_name, identifier, credentials, last_cursor, created_at) \
		 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
	)
	.bind(account.id.to_string())
	.bind(account.user_id.to_string())
	.bind(account.parent_account_id.map(|id| id.to_string()))
	.bind(account_type_to_str(account.account_type))
	.bind(&account.source_name)
	.bind(&account.identifier)
	.bind(credentials)
	.bind(last_cursor)
	.bind(Utc::now().to_rfc3339())
	.execute(pool)
	.await?;
	Ok(())
}

pub async fn find_by_identity(
	pool: &SqlitePool,
	user_id: Uuid,
	account_type: AccountType,
	source_name: &str,
	identifier: &str,
) -> Result<Option<Account>, PersistenceError> {
	let row = sqlx::query_as::<_, AccountRow>(
		"SELECT id, user_id, parent_account_id, account_type, source_name, identifier, credentials, last_cursor \
		 FROM accounts WHERE user_id = ? AND account_type = ? AND source_name = ? AND identifier = ?",
	)
	.bind(user_id.to_string())
	.bind(account_type_to_str(account_type))
	.bind(source_name)
	.bind(identifier)
	.fetch_optional(pool)
	.await?;
	row.map(Account::try_from).transpose()
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Account, PersistenceError> {
	let row = sqlx::query_as::<_, AccountRow>(
		"SELECT id, user_id, parent_account_id, account_type, source_name, identifier, credentials, last_cursor FROM accounts WHERE id = ?",
	)
	.bind(id.to_string())
	.fetch_optional(pool)
	.await?
	.ok_or(PersistenceError::NotFound("accounts"))?;
	Account::try_from(row)
}

/// Children of an xpub parent account, in creation order (spec §4.7
/// fan-out).
pub async fn children_of(pool: &SqlitePool, parent_account_id: Uuid) -> Result<Vec<Account>, PersistenceError> {
	let rows = sqlx::query_as::<_, AccountRow>(
		"SELECT id, user_id, parent_account_id, account_type, source_name, identifier, credentials, last_cursor \
		 FROM accounts WHERE parent_account_id = ? ORDER BY rowid",
	)
	.bind(parent_account_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(Account::try_from).collect()
}

/// Overwrites one operation's cursor on an already-loaded `Account` value
/// and persists the full `last_cursor` map. Used outside the
/// raw-transaction-batch critical section (spec §4.7 step 4 does the
/// transactional version via [`crate::raw_transactions::insert_batch_and_advance_cursor`]);
/// this standalone setter exists for the orchestrator's own bookkeeping
/// (e.g. recording a provider credential refresh) where no raw batch is
/// involved.
pub async fn save_cursor(pool: &SqlitePool, account_id: Uuid, operation: &str, cursor: &CursorState) -> Result<(), PersistenceError> {
	let mut account = get(pool, account_id).await?;
	if let Some(previous) = account.last_cursor.get(operation) {
		if !cursor.is_non_regressing_from(previous) {
			return Err(PersistenceError::CursorWouldRegress { account_id, operation: operation.to_string() });
		}
	}
	account.last_cursor.insert(operation.to_string(), cursor.clone());
	let last_cursor = serde_json::to_string(&account.last_cursor).expect("CursorState serializes infallibly");
	sqlx::query("UPDATE accounts SET last_cursor = ? WHERE id = ?")
		.bind(last_cursor)
		.bind(account_id.to_string())
		.execute(pool)
		.await?;
	Ok(())
}

/// Every top-level account for a user, i.e. excluding xpub-derived children
/// (whose raws belong to the parent's fan-out, per spec §4.7). Used by
/// `processAllPending` (spec §6) to enumerate the accounts it must sweep,
/// and by callers that need "every address this user controls" for
/// fund-flow classification (spec §4.8) — children are folded in via
/// [`children_of`] by the caller where that distinction matters.
pub async fn list_all_for_user(pool: &SqlitePool, user_id: Uuid) -> Result<Vec<Account>, PersistenceError> {
	let rows = sqlx::query_as::<_, AccountRow>(
		"SELECT id, user_id, parent_account_id, account_type, source_name, identifier, credentials, last_cursor \
		 FROM accounts WHERE user_id = ? AND parent_account_id IS NULL ORDER BY rowid",
	)
	.bind(user_id.to_string())
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(Account::try_from).collect()
}

/// Every account in the system, parents and xpub-derived children alike.
/// `processAllPending` (spec §6) has no declared user scope, so it sweeps
/// every account; per-user entry points use [`list_all_for_user`] instead.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Account>, PersistenceError> {
	let rows = sqlx::query_as::<_, AccountRow>(
		"SELECT id, user_id, parent_account_id, account_type, source_name, identifier, credentials, last_cursor \
		 FROM accounts ORDER BY rowid",
	)
	.fetch_all(pool)
	.await?;
	rows.into_iter().map(Account::try_from).collect()
}

#[cfg(test)]
mod tests {
	use exitbook_domain::cursor::CursorValue;

	use super::*;
	use crate::Store;

	#[tokio::test]
	async fn round_trips_an_account_through_storage() {
		let store = Store::in_memory().await;
		let account = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::Blockchain, "ethereum", "0xabc");
		create(store.pool(), &account).await.unwrap();

		let found = find_by_identity(store.pool(), account.user_id, AccountType::Blockchain, "ethereum", "0xabc")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(found.id, account.id);
		assert_eq!(found.identifier, "0xabc");
	}

	#[tokio::test]
	async fn save_cursor_rejects_a_regression() {
		let store = Store::in_memory().await;
		let account = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::Blockchain, "ethereum", "0xabc");
		create(store.pool(), &account).await.unwrap();

		let ahead = CursorState::new(CursorValue::BlockNumber(100), "p1", Utc::now());
		save_cursor(store.pool(), account.id, "fetch_transfers", &ahead).await.unwrap();

		let behind = CursorState::new(CursorValue::BlockNumber(50), "p1", Utc::now());
		let err = save_cursor(store.pool(), account.id, "fetch_transfers", &behind).await.unwrap_err();
		assert!(matches!(err, PersistenceError::CursorWouldRegress { .. }));
	}

	#[tokio::test]
	async fn lists_children_of_an_xpub_parent_in_creation_order() {
		let store = Store::in_memory().await;
		let user_id = Uuid::new_v4();
		let parent = Account::new(Uuid::new_v4(), user_id, AccountType::Blockchain, "bitcoin", "xpub6...");
		create(store.pool(), &parent).await.unwrap();

		for i in 0..3 {
			let child = Account::new(Uuid::new_v4(), user_id, AccountType::Blockchain, "bitcoin", format!("addr-{i}"))
				.as_child_of(parent.id);
			create(store.pool(), &child).await.unwrap();
		}

		let children = children_of(store.pool(), parent.id).await.unwrap();
		assert_eq!(children.len(), 3);
		assert_eq!(children[0].identifier, "addr-0");
	}

	#[tokio::test]
	async fn list_all_for_user_excludes_xpub_children_but_list_all_includes_them() {
		let store = Store::in_memory().await;
		let user_id = Uuid::new_v4();
		let other_user = Uuid::new_v4();
		let parent = Account::new(Uuid::new_v4(), user_id, AccountType::Blockchain, "bitcoin", "xpub6...");
		create(store.pool(), &parent).await.unwrap();
		let child = Account::new(Uuid::new_v4(), user_id, AccountType::Blockchain, "bitcoin", "addr-0").as_child_of(parent.id);
		create(store.pool(), &child).await.unwrap();
		let other = Account::new(Uuid::new_v4(), other_user, AccountType::ExchangeApi, "kraken", "key-1");
		create(store.pool(), &other).await.unwrap();

		let mine = list_all_for_user(store.pool(), user_id).await.unwrap();
		assert_eq!(mine.len(), 1);
		assert_eq!(mine[0].id, parent.id);

		let everyone = list_all(store.pool()).await.unwrap();
		assert_eq!(everyone.len(), 3);
	}
}
