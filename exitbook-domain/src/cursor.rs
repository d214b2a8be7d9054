use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of value a cursor carries. A record can usually be addressed by
/// more than one of these at once (a block has both a block number and a
/// timestamp), which is what makes cross-provider failover possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorType {
	Timestamp,
	BlockNumber,
	PageToken,
	Offset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorValue {
	Timestamp(DateTime<Utc>),
	BlockNumber(u64),
	PageToken(String),
	Offset(u64),
}

impl CursorValue {
	pub fn cursor_type(&self) -> CursorType {
		match self {
			Self::Timestamp(_) => CursorType::Timestamp,
			Self::BlockNumber(_) => CursorType::BlockNumber,
			Self::PageToken(_) => CursorType::PageToken,
			Self::Offset(_) => CursorType::Offset,
		}
	}

	/// Natural ordering per cursor type, used to enforce the
	/// non-regression invariant (spec §3, §8). `PageToken` has no natural
	/// order and always compares as non-regressing.
	pub fn is_at_least(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Timestamp(a), Self::Timestamp(b)) => a >= b,
			(Self::BlockNumber(a), Self::BlockNumber(b)) => a >= b,
			(Self::Offset(a), Self::Offset(b)) => a >= b,
			(Self::PageToken(_), Self::PageToken(_)) => true,
			_ => true,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorMetadata {
	pub provider_name: String,
	pub updated_at: DateTime<Utc>,
	pub is_complete: bool,
	/// Provider-specific extras (offset, page token, etc) that don't fit
	/// the primary/alternatives model but are needed to resume exactly.
	pub extras: serde_json::Value,
}

/// A resumable pagination marker (spec §3). One `CursorState` exists per
/// (account, operation) pair, stored in `accounts.last_cursor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorState {
	pub primary: CursorValue,
	/// Every other cursor type derivable from the same record, keyed by
	/// type, enabling a provider that prefers a different cursor type to
	/// resume without the importer knowing about it up front.
	pub alternatives: BTreeMap<CursorType, CursorValue>,
	pub last_transaction_id: Option<String>,
	pub total_fetched: u64,
	pub metadata: CursorMetadata,
}

impl CursorState {
	pub fn new(primary: CursorValue, provider_name: impl Into<String>, now: DateTime<Utc>) -> Self {
		Self {
			primary,
			alternatives: BTreeMap::new(),
			last_transaction_id: None,
			total_fetched: 0,
			metadata: CursorMetadata {
				provider_name: provider_name.into(),
				updated_at: now,
				is_complete: false,
				extras: serde_json::Value::Null,
			},
		}
	}

	pub fn with_alternative(mut self, value: CursorValue) -> Self {
		self.alternatives.insert(value.cursor_type(), value);
		self
	}

	/// Looks up a cursor value of the given type, preferring the primary
	/// slot, falling back to alternatives. Used by the provider manager
	/// when it fails over to a provider that prefers a cursor type the
	/// previous provider only emitted as an alternative.
	pub fn value_for(&self, cursor_type: CursorType) -> Option<&CursorValue> {
		if self.primary.cursor_type() == cursor_type {
			Some(&self.primary)
		} else {
			self.alternatives.get(&cursor_type)
		}
	}

	/// Enforces the invariant from spec §3: after any successful batch
	/// persist, an account's cursor for an operation must not regress.
	pub fn is_non_regressing_from(&self, previous: &CursorState) -> bool {
		self.primary.is_at_least(&previous.primary)
	}
}

/// Parses a `--since` style import bound into a millisecond Unix timestamp
/// (spec §8: `parseSinceDate("0") = 0`; any ISO-8601 datetime round-trips).
/// `"0"` means "no lower bound" and is kept as the literal epoch rather than
/// `None` so a caller can feed it straight back into a timestamp cursor.
pub fn parse_since_date(input: &str) -> Result<i64, chrono::ParseError> {
	if input == "0" {
		return Ok(0);
	}
	DateTime::parse_from_rfc3339(input).map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// Inverse of [`parse_since_date`] for a non-zero timestamp: the ISO-8601
/// string that `parse_since_date` would parse back to the same value.
pub fn format_since_date(timestamp_millis: i64) -> String {
	DateTime::<Utc>::from_timestamp_millis(timestamp_millis).unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap()).to_rfc3339()
}

#[cfg(test)]
mod since_date_tests {
	use super::*;

	#[test]
	fn zero_parses_to_the_epoch() {
		assert_eq!(parse_since_date("0").unwrap(), 0);
	}

	#[test]
	fn an_iso8601_datetime_round_trips() {
		let original = "2024-03-05T12:30:00+00:00";
		let millis = parse_since_date(original).unwrap();
		let formatted = format_since_date(millis);
		assert_eq!(parse_since_date(&formatted).unwrap(), millis);
	}
}
