use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::CursorState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
	Blockchain,
	ExchangeApi,
	ExchangeCsv,
}

/// Opaque, schema-validated credentials for an exchange-api account. The
/// schema itself is declared per exchange adapter (spec §1 non-goals: the
/// core does not prescribe any one exchange's credential shape); this crate
/// only carries the already-validated JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials(pub serde_json::Value);

/// A user-scoped binding to a source (spec §3).
///
/// Invariant: `(user_id, account_type, source_name, identifier)` is unique.
/// A parent xpub account and each of its derived children share
/// `source_name` and `user_id` but not `identifier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
	pub id: Uuid,
	pub user_id: Uuid,
	pub parent_account_id: Option<Uuid>,
	pub account_type: AccountType,
	pub source_name: String,
	pub identifier: String,
	pub credentials: Option<Credentials>,
	/// Keyed by operation name (e.g. `"fetch_ledger"`, `"witness_deposits"`)
	/// since a single account can run more than one kind of streaming
	/// operation against its source.
	pub last_cursor: BTreeMap<String, CursorState>,
}

impl Account {
	pub fn new(
		id: Uuid,
		user_id: Uuid,
		account_type: AccountType,
		source_name: impl Into<String>,
		identifier: impl Into<String>,
	) -> Self {
		Self {
			id,
			user_id,
			parent_account_id: None,
			account_type,
			source_name: source_name.into(),
			identifier: identifier.into(),
			credentials: None,
			last_cursor: BTreeMap::new(),
		}
	}

	pub fn as_child_of(mut self, parent_account_id: Uuid) -> Self {
		self.parent_account_id = Some(parent_account_id);
		self
	}

	pub fn cursor_for(&self, operation: &str) -> Option<&CursorState> {
		self.last_cursor.get(operation)
	}

	/// Identity tuple used to enforce the account uniqueness invariant at
	/// the persistence boundary.
	pub fn identity_key(&self) -> (Uuid, AccountType, &str, &str) {
		(self.user_id, self.account_type, self.source_name.as_str(), self.identifier.as_str())
	}
}
