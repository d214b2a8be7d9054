use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::price::PriceAtTxTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeScope {
	Network,
	Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSettlement {
	Balance,
	External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
	Pending,
	Confirmed,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
	Trade,
	Transfer,
	Reward,
	Fee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
	Buy,
	Sell,
	Swap,
	Deposit,
	Withdrawal,
	InternalTransfer,
	StakingReward,
	Airdrop,
	FeeOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
	pub category: OperationCategory,
	pub op_type: OperationType,
}

/// A single asset's involvement on one side (inflow or outflow) of a
/// transaction (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
	pub asset_id: String,
	pub asset_symbol: String,
	pub gross_amount: f64,
	pub net_amount: f64,
	pub price_at_tx_time: Option<PriceAtTxTime>,
}

impl Movement {
	pub fn new(asset_id: impl Into<String>, asset_symbol: impl Into<String>, amount: f64) -> Self {
		Self {
			asset_id: asset_id.into(),
			asset_symbol: asset_symbol.into(),
			gross_amount: amount,
			net_amount: amount,
			price_at_tx_time: None,
		}
	}

	/// Merges `other` into `self`, assuming both carry the same asset
	/// symbol. Used to enforce the "no duplicate symbol per side"
	/// invariant (spec §3, §8) during consolidation.
	fn merge(&mut self, other: &Movement) {
		self.gross_amount += other.gross_amount;
		self.net_amount += other.net_amount;
		if self.price_at_tx_time.is_none() {
			self.price_at_tx_time = other.price_at_tx_time.clone();
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fee {
	pub asset_symbol: String,
	pub amount: f64,
	pub scope: FeeScope,
	pub settlement: FeeSettlement,
	pub price_at_tx_time: Option<PriceAtTxTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Movements {
	pub inflows: Vec<Movement>,
	pub outflows: Vec<Movement>,
}

impl Movements {
	/// Consolidates duplicate asset symbols within one side, per the
	/// processor invariant in spec §3/§4.8/§8: at most one inflow and one
	/// outflow row per asset symbol.
	pub fn push_inflow(&mut self, movement: Movement) {
		push_consolidated(&mut self.inflows, movement);
	}

	pub fn push_outflow(&mut self, movement: Movement) {
		push_consolidated(&mut self.outflows, movement);
	}

	/// Verifies the no-duplicate-symbol invariant. Intended for tests and
	/// defensive assertions, not routine control flow — consolidation
	/// should make violation impossible by construction.
	pub fn has_duplicate_symbols(&self) -> bool {
		has_duplicates(&self.inflows) || has_duplicates(&self.outflows)
	}
}

fn push_consolidated(side: &mut Vec<Movement>, movement: Movement) {
	if let Some(existing) = side.iter_mut().find(|m| m.asset_symbol == movement.asset_symbol) {
		existing.merge(&movement);
	} else {
		side.push(movement);
	}
}

fn has_duplicates(side: &[Movement]) -> bool {
	let mut seen = BTreeMap::new();
	for m in side {
		*seen.entry(m.asset_symbol.as_str()).or_insert(0u32) += 1;
	}
	seen.values().any(|count| *count > 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainInfo {
	pub name: String,
	pub block_height: Option<u64>,
	pub transaction_hash: String,
	pub is_confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NoteSeverity {
	Info,
	Warning,
	Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
	pub severity: NoteSeverity,
	pub message: String,
}

/// The processor's canonical output (spec §3).
///
/// Invariant: within one transaction, movements are consolidated per asset —
/// no duplicate symbol in inflows or in outflows. `external_id` is stable
/// across re-runs so `(source, external_id)` can be the persistence
/// uniqueness key (spec §6) that makes re-processing idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
	pub id: Uuid,
	pub account_id: Uuid,
	pub external_id: String,
	pub datetime: DateTime<Utc>,
	pub timestamp: i64,
	pub source: String,
	pub source_type: String,
	pub status: TxStatus,
	pub from: Option<String>,
	pub to: Option<String>,
	pub movements: Movements,
	pub fees: Vec<Fee>,
	pub operation: Operation,
	pub notes: Vec<Note>,
	pub blockchain: Option<BlockchainInfo>,
	pub is_spam: bool,
	pub excluded_from_accounting: bool,
}

impl Transaction {
	/// `(source, external_id)` is the stable identity used for
	/// idempotent re-processing (spec §3 Lifecycles, §8 round-trip
	/// property).
	pub fn identity_key(&self) -> (&str, &str) {
		(self.source.as_str(), self.external_id.as_str())
	}
}
