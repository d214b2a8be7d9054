use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceGranularity {
	Exact,
	Minute,
	Hour,
	Day,
}

/// Write-priority source of a price (spec §4.9). Ordering on this enum
/// follows declaration order, which is also priority order — `derive()`
/// gives us `PartialOrd`/`Ord` for free, matching the priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
	FiatExecutionTentative,
	MarketProvider,
	DerivedRatio,
	ExchangeExecution,
	/// Not in the pipeline's own vocabulary but reachable via the override
	/// store (spec §3 `OverrideEvent::price_override`); shares
	/// `ExchangeExecution`'s priority per the priority table's
	/// "exchange-execution / user-provided" row.
	UserProvided,
}

impl PriceSource {
	/// Numeric priority matching spec §4.9's table (0..=3). `UserProvided`
	/// shares `ExchangeExecution`'s priority 3 by declaration, even though
	/// its `Ord` position differs, so look this up rather than relying on
	/// derived ordering when the exact priority number matters (e.g. when
	/// logging or serializing it).
	pub fn priority(self) -> u8 {
		match self {
			Self::FiatExecutionTentative => 0,
			Self::MarketProvider => 1,
			Self::DerivedRatio => 2,
			Self::ExchangeExecution | Self::UserProvided => 3,
		}
	}

	/// Whether a write from `self` is allowed to overwrite an existing
	/// price written with `existing`. Never downgrades (spec §4.9 state
	/// machine): equal-or-lower priority is untouched, strictly higher
	/// priority overwrites.
	pub fn may_overwrite(self, existing: PriceSource) -> bool {
		self.priority() > existing.priority()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Money {
	pub amount: f64,
	pub currency: String,
}

impl Money {
	pub fn new(amount: f64, currency: impl Into<String>) -> Self {
		Self { amount, currency: currency.into() }
	}
}

/// A price attached to a movement or fee at the moment it was enriched
/// (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAtTxTime {
	pub price: Money,
	pub source: PriceSource,
	pub fetched_at: DateTime<Utc>,
	pub granularity: PriceGranularity,
	pub fx_rate_to_usd: Option<f64>,
	pub fx_source: Option<String>,
	pub fx_timestamp: Option<DateTime<Utc>>,
}

impl PriceAtTxTime {
	pub fn new(
		price: Money,
		source: PriceSource,
		fetched_at: DateTime<Utc>,
		granularity: PriceGranularity,
	) -> Self {
		Self {
			price,
			source,
			fetched_at,
			granularity,
			fx_rate_to_usd: None,
			fx_source: None,
			fx_timestamp: None,
		}
	}

	pub fn with_fx(mut self, rate: f64, source: impl Into<String>, at: DateTime<Utc>) -> Self {
		self.fx_rate_to_usd = Some(rate);
		self.fx_source = Some(source.into());
		self.fx_timestamp = Some(at);
		self
	}

	/// Applies the priority-monotonic write rule from spec §4.9: returns
	/// `Some(new)` only if `new` is allowed to replace `existing` (or there
	/// is no existing price at all).
	pub fn resolve_write<'a>(
		existing: Option<&'a PriceAtTxTime>,
		new: &'a PriceAtTxTime,
	) -> Option<&'a PriceAtTxTime> {
		match existing {
			None => Some(new),
			Some(prev) if new.source.may_overwrite(prev.source) => Some(new),
			Some(_) => None,
		}
	}
}
