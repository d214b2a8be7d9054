//! [`SourceAdapter`]: the source-specific seam the processor is generic
//! over (spec §4.8 "classification rules are declared per source").

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use exitbook_domain::{
	error::IngestError,
	transaction::{BlockchainInfo, Fee, Movements, Note, NoteSeverity, Operation, OperationCategory, OperationType, TxStatus},
	RawTransaction,
};

/// Everything one correlated group of raws contributes to its eventual
/// `Transaction`, short of the identity/bookkeeping fields the processor
/// fills in itself (id, account_id, source, notes, operation).
#[derive(Debug, Clone)]
pub struct GroupMaterial {
	pub external_id: String,
	pub datetime: DateTime<Utc>,
	pub timestamp: i64,
	pub status: TxStatus,
	pub from: Option<String>,
	pub to: Option<String>,
	pub movements: Movements,
	pub fees: Vec<Fee>,
	pub blockchain: Option<BlockchainInfo>,
}

/// The per-source half of spec §4.8: how raws for this source correlate
/// into one logical transaction, and how a correlated group's normalized
/// data turns into movements. One implementation per blockchain or
/// exchange adapter, supplied by `exitbook-core` at wiring time.
pub trait SourceAdapter: Send + Sync {
	/// Written onto every `Transaction.source` this adapter produces.
	fn source(&self) -> &str;

	fn source_type(&self) -> &str;

	/// The key raws in one account's pending set are grouped by before
	/// classification (spec §4.8: an exchange `correlationId`, an EVM
	/// transaction hash). Raws that don't correlate with anything else
	/// get a key unique to themselves (e.g. their own `event_id`).
	fn correlation_key(&self, raw: &RawTransaction) -> String;

	/// Builds the movements/fees/addressing for one correlated group.
	/// `group` is never empty and is sorted by `timestamp` ascending.
	fn build(&self, group: &[RawTransaction]) -> Result<GroupMaterial, IngestError>;

	/// Classifies the operation (category × type) for a built group. The
	/// default is spec §4.8's fund-flow rule; a source overrides this
	/// where its own raws carry a more specific signal (e.g. an exchange
	/// ledger entry already tagged `reward`).
	fn classify(&self, material: &GroupMaterial, user_addresses: &HashSet<String>, quote_assets: &HashSet<String>) -> (Operation, Vec<Note>) {
		default_classify(&material.movements, material.from.as_deref(), material.to.as_deref(), user_addresses, quote_assets)
	}
}

/// Spec §4.8's default classification rule: "1 inflow + 1 outflow = trade
/// (buy if inflow is the tracked quote asset, else sell/swap); only
/// outflows = withdrawal/fee; only inflows = deposit/reward; same-asset
/// round-trip across user-owned addresses = internal_transfer."
pub fn default_classify(
	movements: &Movements,
	from: Option<&str>,
	to: Option<&str>,
	user_addresses: &HashSet<String>,
	quote_assets: &HashSet<String>,
) -> (Operation, Vec<Note>) {
	let mut notes = Vec::new();
	let inflows = movements.inflows.len();
	let outflows = movements.outflows.len();

	let both_user_owned = from.is_some_and(|a| user_addresses.contains(a)) && to.is_some_and(|a| user_addresses.contains(a));
	let same_asset_round_trip = inflows == 1 && outflows == 1 && movements.inflows[0].asset_symbol == movements.outflows[0].asset_symbol;

	if same_asset_round_trip && both_user_owned {
		return (Operation { category: OperationCategory::Transfer, op_type: OperationType::InternalTransfer }, notes);
	}

	let op = match (inflows, outflows) {
		(0, 0) => {
			notes.push(Note { severity: NoteSeverity::Warning, message: "no movements on either side; defaulted to fee_only".to_string() });
			Operation { category: OperationCategory::Fee, op_type: OperationType::FeeOnly }
		},
		(_, 0) => Operation { category: OperationCategory::Transfer, op_type: OperationType::Deposit },
		(0, _) => Operation { category: OperationCategory::Transfer, op_type: OperationType::Withdrawal },
		(1, 1) => {
			let op_type = if quote_assets.contains(&movements.inflows[0].asset_symbol) {
				OperationType::Buy
			} else if quote_assets.contains(&movements.outflows[0].asset_symbol) {
				OperationType::Sell
			} else {
				OperationType::Swap
			};
			Operation { category: OperationCategory::Trade, op_type }
		},
		_ => {
			notes.push(Note {
				severity: NoteSeverity::Info,
				message: format!("multi-leg fund flow ({inflows} inflow(s), {outflows} outflow(s)); classified as swap"),
			});
			Operation { category: OperationCategory::Trade, op_type: OperationType::Swap }
		},
	};
	(op, notes)
}

#[cfg(test)]
mod tests {
	use exitbook_domain::transaction::Movement;

	use super::*;

	fn movement_set(inflow: Option<(&str, f64)>, outflow: Option<(&str, f64)>) -> Movements {
		let mut m = Movements::default();
		if let Some((asset, amount)) = inflow {
			m.push_inflow(Movement::new(asset, asset, amount));
		}
		if let Some((asset, amount)) = outflow {
			m.push_outflow(Movement::new(asset, asset, amount));
		}
		m
	}

	#[test]
	fn one_inflow_one_outflow_with_quote_inflow_is_a_buy() {
		let movements = movement_set(Some(("USD", 4000.0)), Some(("BTC", 0.1)));
		let quote: HashSet<String> = ["USD".to_string()].into_iter().collect();
		let (op, _) = default_classify(&movements, None, None, &HashSet::new(), &quote);
		assert_eq!(op.category, OperationCategory::Trade);
		assert_eq!(op.op_type, OperationType::Buy);
	}

	#[test]
	fn one_inflow_one_outflow_with_quote_outflow_is_a_sell() {
		let movements = movement_set(Some(("BTC", 0.1)), Some(("USD", 4000.0)));
		let quote: HashSet<String> = ["USD".to_string()].into_iter().collect();
		let (op, _) = default_classify(&movements, None, None, &HashSet::new(), &quote);
		assert_eq!(op.category, OperationCategory::Trade);
		assert_eq!(op.op_type, OperationType::Sell);
	}

	#[test]
	fn only_inflow_is_a_deposit() {
		let movements = movement_set(Some(("ETH", 1.0)), None);
		let (op, _) = default_classify(&movements, None, None, &HashSet::new(), &HashSet::new());
		assert_eq!(op.op_type, OperationType::Deposit);
	}

	#[test]
	fn only_outflow_is_a_withdrawal() {
		let movements = movement_set(None, Some(("ETH", 1.0)));
		let (op, _) = default_classify(&movements, None, None, &HashSet::new(), &HashSet::new());
		assert_eq!(op.op_type, OperationType::Withdrawal);
	}

	#[test]
	fn same_asset_round_trip_between_user_owned_addresses_is_an_internal_transfer() {
		let movements = movement_set(Some(("ETH", 1.0)), Some(("ETH", 1.0)));
		let user_addresses: HashSet<String> = ["0xa".to_string(), "0xb".to_string()].into_iter().collect();
		let (op, _) = default_classify(&movements, Some("0xa"), Some("0xb"), &user_addresses, &HashSet::new());
		assert_eq!(op.op_type, OperationType::InternalTransfer);
	}

	#[test]
	fn same_asset_round_trip_to_an_unowned_address_is_a_trade_not_a_transfer() {
		let movements = movement_set(Some(("ETH", 1.0)), Some(("ETH", 1.0)));
		let user_addresses: HashSet<String> = ["0xa".to_string()].into_iter().collect();
		let (op, _) = default_classify(&movements, Some("0xa"), Some("0xc"), &user_addresses, &HashSet::new());
		assert_ne!(op.op_type, OperationType::InternalTransfer);
	}

	#[test]
	fn no_movements_falls_back_to_fee_only_with_a_warning_note() {
		let movements = Movements::default();
		let (op, notes) = default_classify(&movements, None, None, &HashSet::new(), &HashSet::new());
		assert_eq!(op.op_type, OperationType::FeeOnly);
		assert_eq!(notes.len(), 1);
	}
}
