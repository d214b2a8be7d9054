//! Account resolution and xpub fan-out (spec §4.7 "The orchestrator
//! resolves the account").

use async_trait::async_trait;
use exitbook_domain::{error::IngestError, Account, AccountType};
use exitbook_persistence::{accounts, Store};
use uuid::Uuid;

/// Recognized extended-public-key prefixes across the common derivation
/// schemes (BIP32/44/49/84, mainnet and testnet). Detection, not parsing —
/// actual derivation is delegated to [`XpubDeriver`].
const XPUB_PREFIXES: [&str; 6] = ["xpub", "ypub", "zpub", "tpub", "upub", "vpub"];

pub fn is_xpub(identifier: &str) -> bool {
	XPUB_PREFIXES.iter().any(|prefix| identifier.starts_with(prefix))
}

/// Derives a child address from an extended public key (spec §2.7:
/// "a small internal BIP32-ish derivation trait object ... so the
/// orchestrator does not hardcode any one blockchain's derivation
/// scheme"). One implementation per blockchain adapter.
pub trait XpubDeriver: Send + Sync {
	fn derive_address(&self, xpub: &str, index: u32) -> Result<String, IngestError>;
}

/// Tells the fan-out whether a derived address has ever been used, so it
/// knows when to stop deriving (spec §4.7: "unused derivations up to a gap
/// limit terminate the fan-out"). Checking activity is inherently
/// network-shaped (a balance/history probe against the same provider the
/// import itself will use), so it is injected rather than owned here.
#[async_trait]
pub trait AddressActivityProbe: Send + Sync {
	async fn has_activity(&self, address: &str) -> Result<bool, IngestError>;
}

pub struct Orchestrator {
	store: Store,
}

impl Orchestrator {
	pub fn new(store: Store) -> Self {
		Self { store }
	}

	pub fn store(&self) -> &Store {
		&self.store
	}

	/// Resolves an account by its identity tuple, creating it on first
	/// sight. Idempotent: a second call with the same identity returns the
	/// already-existing account rather than erroring.
	pub async fn resolve_account(
		&self,
		user_id: Uuid,
		account_type: AccountType,
		source_name: &str,
		identifier: &str,
	) -> Result<Account, IngestError> {
		if let Some(existing) = accounts::find_by_identity(self.store.pool(), user_id, account_type, source_name, identifier).await? {
			return Ok(existing);
		}
		let account = Account::new(Uuid::new_v4(), user_id, account_type, source_name, identifier);
		accounts::create(self.store.pool(), &account).await?;
		Ok(account)
	}

	/// Fans `parent` out into its derived child accounts, stopping once
	/// `gap_limit` consecutive derived addresses show no activity (spec
	/// §4.7). A non-xpub `parent` is a no-op — warned, not failed, per
	/// spec §9's open question on `xpubGap` given for a non-xpub address.
	pub async fn fan_out_xpub(
		&self,
		parent: &Account,
		deriver: &dyn XpubDeriver,
		probe: &dyn AddressActivityProbe,
		gap_limit: u32,
	) -> Result<Vec<Account>, IngestError> {
		if !is_xpub(&parent.identifier) {
			tracing::warn!(account_id = %parent.id, identifier = %parent.identifier, "xpubGap given for a non-xpub address; skipping fan-out");
			return Ok(Vec::new());
		}

		let mut children = Vec::new();
		let mut consecutive_unused = 0u32;
		let mut index = 0u32;
		while consecutive_unused < gap_limit {
			let address = deriver.derive_address(&parent.identifier, index)?;
			index += 1;
			if !probe.has_activity(&address).await? {
				consecutive_unused += 1;
				continue;
			}
			consecutive_unused = 0;
			let child = self.resolve_child(parent, &address).await?;
			children.push(child);
		}
		Ok(children)
	}

	async fn resolve_child(&self, parent: &Account, address: &str) -> Result<Account, IngestError> {
		if let Some(existing) =
			accounts::find_by_identity(self.store.pool(), parent.user_id, parent.account_type, &parent.source_name, address).await?
		{
			return Ok(existing);
		}
		let child = Account::new(Uuid::new_v4(), parent.user_id, parent.account_type, parent.source_name.clone(), address.to_string())
			.as_child_of(parent.id);
		accounts::create(self.store.pool(), &child).await?;
		Ok(child)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;

	#[test]
	fn recognizes_common_xpub_prefixes_and_rejects_plain_addresses() {
		assert!(is_xpub("xpub6CUGRUonZSQ4TWtTMmzXdrXDtyP"));
		assert!(is_xpub("zpub6rtS9PHPuUJZR8qUJLfNKGgp"));
		assert!(!is_xpub("0x1234abcd"));
		assert!(!is_xpub("bc1qexampleaddress"));
	}

	struct SequentialDeriver;

	impl XpubDeriver for SequentialDeriver {
		fn derive_address(&self, xpub: &str, index: u32) -> Result<String, IngestError> {
			Ok(format!("{xpub}-addr-{index}"))
		}
	}

	struct FixedActivity {
		active_indices: HashSet<u32>,
	}

	#[async_trait]
	impl AddressActivityProbe for FixedActivity {
		async fn has_activity(&self, address: &str) -> Result<bool, IngestError> {
			let index: u32 = address.rsplit('-').next().unwrap().parse().unwrap();
			Ok(self.active_indices.contains(&index))
		}
	}

	#[tokio::test]
	async fn resolve_account_is_idempotent() {
		let store = Store::in_memory().await;
		let orchestrator = Orchestrator::new(store);
		let user_id = Uuid::new_v4();

		let first = orchestrator.resolve_account(user_id, AccountType::Blockchain, "ethereum", "0xabc").await.unwrap();
		let second = orchestrator.resolve_account(user_id, AccountType::Blockchain, "ethereum", "0xabc").await.unwrap();
		assert_eq!(first.id, second.id);
	}

	#[tokio::test]
	async fn fan_out_stops_after_the_gap_limit_of_unused_addresses() {
		let store = Store::in_memory().await;
		let orchestrator = Orchestrator::new(store);
		let user_id = Uuid::new_v4();
		let parent = orchestrator.resolve_account(user_id, AccountType::Blockchain, "bitcoin", "xpub6CUGRUonZSQ4TWtTMmzXdrXDtyP").await.unwrap();

		let deriver = SequentialDeriver;
		let probe = FixedActivity { active_indices: [0, 1, 3].into_iter().collect() };

		let children = orchestrator.fan_out_xpub(&parent, &deriver, &probe, 2).await.unwrap();
		// indices 0, 1 active, 2 unused (gap=1), 3 active resets the gap,
		// 4, 5 unused (gap=2) stops the fan-out.
		assert_eq!(children.len(), 3);
	}

	#[tokio::test]
	async fn fan_out_is_a_warned_no_op_for_a_non_xpub_address() {
		let store = Store::in_memory().await;
		let orchestrator = Orchestrator::new(store);
		let user_id = Uuid::new_v4();
		let parent = orchestrator.resolve_account(user_id, AccountType::Blockchain, "ethereum", "0xabc").await.unwrap();
		let deriver = SequentialDeriver;
		let probe = FixedActivity { active_indices: HashSet::new() };

		let children = orchestrator.fan_out_xpub(&parent, &deriver, &probe, 5).await.unwrap();
		assert!(children.is_empty());
	}
}
