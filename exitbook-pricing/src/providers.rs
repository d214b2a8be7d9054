//! Injected provider seams (spec §9: "FX provider and crypto price
//! provider ... just another provider"). `exitbook-core` supplies concrete
//! implementations, typically wrapping
//! [`exitbook_providers::ProviderManager::execute_with_failover`] — this
//! crate only needs the narrow async contract, not the failover machinery
//! itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exitbook_domain::{error::IngestError, price::Money};

/// Converts a non-USD fiat currency to USD at a point in time (spec §4.9
/// Stage 2). Returns `Ok(None)` for "rate not available", distinct from an
/// `Err` which means the provider itself failed (network, bad response).
#[async_trait]
pub trait FxRateProvider: Send + Sync {
	/// USD value of one unit of `currency` at `at`.
	async fn rate_to_usd(&self, currency: &str, at: DateTime<Utc>) -> Result<Option<f64>, IngestError>;
}

/// Last-resort manual rate entry when [`FxRateProvider`] comes back empty
/// and the caller runs in `prompt` mode (spec §4.9 Stage 2: "optional
/// interactive fallback for missing rates"). A headless run simply has
/// none configured.
#[async_trait]
pub trait InteractiveFxPrompt: Send + Sync {
	async fn prompt_for_rate(&self, currency: &str, at: DateTime<Utc>) -> Result<Option<f64>, IngestError>;
}

/// Looks up a crypto asset's price in `currency` at a point in time (spec
/// §4.9 Stage 3).
#[async_trait]
pub trait CryptoPriceProvider: Send + Sync {
	async fn price_at(&self, asset_symbol: &str, currency: &str, at: DateTime<Utc>) -> Result<Option<Money>, IngestError>;
}
