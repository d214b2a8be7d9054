use uuid::Uuid;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
	Suggested,
	Confirmed,
	Rejected,
}

/// An inferred relationship between two transactions, e.g. an exchange
/// withdrawal matched to a blockchain deposit (spec §3). The inference
/// itself is out of scope (spec §1 non-goals); this crate only carries the
/// result so Stage 1/4 of price enrichment (spec §4.9) can propagate a
/// price from one side to the other when `status == Confirmed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLink {
	pub id: Uuid,
	pub from_transaction_id: Uuid,
	pub to_transaction_id: Uuid,
	pub status: LinkStatus,
}

impl TransactionLink {
	pub fn is_propagation_eligible(&self) -> bool {
		self.status == LinkStatus::Confirmed
	}

	pub fn other_side(&self, transaction_id: Uuid) -> Option<Uuid> {
		if transaction_id == self.from_transaction_id {
			Some(self.to_transaction_id)
		} else if transaction_id == self.to_transaction_id {
			Some(self.from_transaction_id)
		} else {
			None
		}
	}
}
