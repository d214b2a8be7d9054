//! `price_cache` table: a fetched-provider-price memo so repeated
//! `enrichPrices` runs over an already-resolved timestamp don't re-hit a
//! crypto price provider (spec §4.9 Stage 3).

use chrono::{DateTime, Utc};
use exitbook_domain::price::{Money, PriceGranularity};
use serde::de::Error as _;
use sqlx::{FromRow, SqlitePool};

use crate::error::PersistenceError;

fn granularity_to_str(g: PriceGranularity) -> &'static str {
	match g {
		PriceGranularity::Exact => "exact",
		PriceGranularity::Minute => "minute",
		PriceGranularity::Hour => "hour",
		PriceGranularity::Day => "day",
	}
}

fn granularity_from_str(s: &str) -> Result<PriceGranularity, PersistenceError> {
	match s {
		"exact" => Ok(PriceGranularity::Exact),
		"minute" => Ok(PriceGranularity::Minute),
		"hour" => Ok(PriceGranularity::Hour),
		"day" => Ok(PriceGranularity::Day),
		other => {
			Err(PersistenceError::json("price_cache.granularity", serde_json::Error::custom(format!("unknown granularity {other:?}"))))
		},
	}
}

#[derive(Debug, Clone)]
pub struct CachedPrice {
	pub price: Money,
	pub source: String,
	pub fetched_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct PriceCacheRow {
	price_amount: f64,
	currency: String,
	source: String,
	fetched_at: String,
}

impl TryFrom<PriceCacheRow> for CachedPrice {
	type Error = PersistenceError;

	fn try_from(row: PriceCacheRow) -> Result<Self, Self::Error> {
		Ok(CachedPrice {
			price: Money::new(row.price_amount, row.currency),
			source: row.source,
			fetched_at: DateTime::parse_from_rfc3339(&row.fetched_at)
				.map_err(|e| PersistenceError::json("price_cache.fetched_at", serde_json::Error::custom(e)))?
				.with_timezone(&Utc),
		})
	}
}

/// Looks up a memoized price for `asset_symbol` priced in `currency` at
/// `bucket_timestamp` (already rounded to `granularity` by the caller —
/// this module does not do the rounding itself, since the right bucket
/// width depends on the provider, not on storage).
pub async fn get(
	pool: &SqlitePool,
	asset_symbol: &str,
	currency: &str,
	bucket_timestamp: i64,
	granularity: PriceGranularity,
) -> Result<Option<CachedPrice>, PersistenceError> {
	let row = sqlx::query_as::<_, PriceCacheRow>(
		"SELECT price_amount, currency, source, fetched_at FROM price_cache \
		 WHERE asset_symbol = ? AND currency = ? AND bucket_timestamp = ? AND granularity = ?",
	)
	.bind(asset_symbol)
	.bind(currency)
	.bind(bucket_timestamp)
	.bind(granularity_to_str(granularity))
	.fetch_optional(pool)
	.await?;
	row.map(CachedPrice::try_from).transpose()
}

pub async fn put(
	pool: &SqlitePool,
	asset_symbol: &str,
	bucket_timestamp: i64,
	granularity: PriceGranularity,
	price: &CachedPrice,
) -> Result<(), PersistenceError> {
	sqlx::query(
		"INSERT INTO price_cache (asset_symbol, currency, bucket_timestamp, granularity, price_amount, source, fetched_at) \
		 VALUES (?, ?, ?, ?, ?, ?, ?) \
		 ON CONFLICT (asset_symbol, currency, bucket_timestamp, granularity) DO UPDATE SET \
		 price_amount = excluded.price_amount, source = excluded.source, fetched_at = excluded.fetched_at",
	)
	.bind(asset_symbol)
	.bind(&price.price.currency)
	.bind(bucket_timestamp)
	.bind(granularity_to_str(granularity))
	.bind(price.price.amount)
	.bind(&price.source)
	.bind(price.fetched_at.to_rfc3339())
	.execute(pool)
	.await?;
	Ok(())
}
