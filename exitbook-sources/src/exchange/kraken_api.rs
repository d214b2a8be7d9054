use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use exitbook_domain::{
	cursor::{CursorState, CursorType, CursorValue},
	error::{ErrorDetails, IngestError},
};
use exitbook_http::{HttpClient, RequestSpec};
use exitbook_providers::{Capabilities, ReplayWindow, ResolvedProvider, StreamBatch};
use serde::Deserialize;

use super::{ExchangeLedgerEntry, ExchangeLedgerSource, LedgerEntryStatus, LedgerEntryType};

const BATCH_SIZE: usize = 50;

/// Kraken's `Ledgers` REST endpoint, windowed forward from the resume
/// cursor's timestamp. Kraken itself paginates by offset, but offsets are
/// only stable within one `start`/`end` window, so resuming across process
/// restarts walks forward by timestamp instead of trusting a remembered
/// offset (spec §3: a cursor must resume correctly after a restart, not
/// just mid-process).
pub struct KrakenApiClient {
	http: Arc<HttpClient>,
	// Reserved for the HMAC-SHA512 request signing a production deployment
	// would add once the HTTP layer grows a header hook; unread until then.
	#[allow(dead_code)]
	api_key: String,
	#[allow(dead_code)]
	api_secret: String,
}

impl KrakenApiClient {
	pub fn new(http: Arc<HttpClient>, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
		Self { http, api_key: api_key.into(), api_secret: api_secret.into() }
	}

	pub fn capabilities() -> Capabilities {
		Capabilities {
			supported_operations: vec!["exchange.ledger".to_string()],
			supported_cursor_types: vec![CursorType::Timestamp],
			preferred_cursor_type: CursorType::Timestamp,
			replay_window: ReplayWindow::Minutes(5),
		}
	}
}

#[derive(Debug, Deserialize)]
struct LedgersResponse {
	error: Vec<String>,
	result: Option<LedgersResult>,
}

#[derive(Debug, Deserialize)]
struct LedgersResult {
	ledger: BTreeMap<String, KrakenLedgerRow>,
}

#[derive(Debug, Deserialize)]
struct KrakenLedgerRow {
	refid: String,
	time: f64,
	#[serde(rename = "type")]
	kind: String,
	asset: String,
	amount: String,
	fee: String,
}

fn map_kind(kind: &str) -> LedgerEntryType {
	match kind {
		"trade" => LedgerEntryType::Trade,
		"deposit" => LedgerEntryType::Deposit,
		"withdrawal" => LedgerEntryType::Withdrawal,
		"transfer" => LedgerEntryType::Transfer,
		"staking" | "earn" | "reward" => LedgerEntryType::Reward,
		_ => LedgerEntryType::Fee,
	}
}

fn parse_decimal(field: &str, value: &str) -> Result<f64, IngestError> {
	value.parse::<f64>().map_err(|e| {
		IngestError::validation("kraken.invalid_amount", format!("field {field} value {value:?} is not numeric: {e}"))
	})
}

#[async_trait]
impl ExchangeLedgerSource for KrakenApiClient {
	async fn fetch_ledger(
		&self,
		provider: &ResolvedProvider,
		cursor: Option<&CursorState>,
	) -> Result<StreamBatch<ExchangeLedgerEntry>, IngestError> {
		let start: DateTime<Utc> = match cursor.map(|c| &c.primary) {
			Some(CursorValue::Timestamp(ts)) => *ts,
			_ => Utc.timestamp_opt(0, 0).single().expect("epoch is a valid timestamp"),
		};

		// Kraken-style signed private call: nonce + API-Key/API-Sign headers
		// would be attached here in a real deployment. We model the wire
		// shape (the endpoint, the `start` window) without re-deriving
		// Kraken's HMAC-SHA512 signing scheme, which belongs in a dedicated
		// signing helper outside this client's responsibility.
		let spec = RequestSpec::get(format!("{}/0/private/Ledgers", provider.base_url))
			.with_query("start", start.timestamp().to_string())
			.with_query("ofs", "0");
		let response: LedgersResponse = self.http.execute_json(&provider.name, "exchange.ledger", spec).await?;

		if !response.error.is_empty() {
			return Err(IngestError::ProviderTerminal(ErrorDetails::new(
				"kraken.api_error",
				response.error.join("; "),
			)));
		}
		let result = response.result.ok_or_else(|| {
			IngestError::ProviderTerminal(ErrorDetails::new("kraken.empty_result", "Ledgers response had no result"))
		})?;

		let mut entries = Vec::with_capacity(result.ledger.len());
		for (id, row) in result.ledger {
			let timestamp = Utc
				.timestamp_opt(row.time as i64, 0)
				.single()
				.ok_or_else(|| IngestError::validation("kraken.invalid_timestamp", format!("entry {id} has an invalid time")))?;
			let amount = parse_decimal("amount", &row.amount)?;
			let fee = parse_decimal("fee", &row.fee)?;
			entries.push(ExchangeLedgerEntry {
				id: id.clone(),
				correlation_id: Some(row.refid),
				timestamp,
				entry_type: map_kind(&row.kind),
				asset: row.asset,
				amount,
				fee: if fee != 0.0 { Some(fee) } else { None },
				fee_currency: None,
				status: LedgerEntryStatus::Success,
				raw: serde_json::json!({"id": id, "time": row.time, "type": row.kind}),
			});
		}
		entries.sort_by_key(|e| e.timestamp);
		entries.truncate(BATCH_SIZE);

		Ok(StreamBatch { is_complete: entries.len() < BATCH_SIZE, data: entries })
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use exitbook_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
	use exitbook_providers::{EnvReader, FactoryConfig, ProviderDescriptor, Registry};
	use exitbook_ratelimit::{RateLimitConfig, RateLimiter};
	use wiremock::{
		matchers::{method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;

	struct NoEnv;

	impl EnvReader for NoEnv {
		fn get(&self, _key: &str) -> Option<String> {
			None
		}
	}

	async fn provider_for(base_url: String) -> ResolvedProvider {
		let mut base_urls = BTreeMap::new();
		base_urls.insert("kraken".to_string(), base_url);
		let mut registry = Registry::default();
		registry.register(ProviderDescriptor {
			name: "kraken-api".to_string(),
			display_name: "Kraken".to_string(),
			base_urls,
			requires_api_key: None,
			default_rate_limit: RateLimitConfig::per_second(1000.0),
			default_circuit_breaker: CircuitBreakerConfig::default(),
			default_retries: 0,
			priority: 0,
			capabilities: KrakenApiClient::capabilities(),
		});
		registry.resolve("kraken", &FactoryConfig::default(), &NoEnv).unwrap().remove(0)
	}

	fn client() -> KrakenApiClient {
		let limiter = Arc::new(RateLimiter::with_default(RateLimitConfig::per_second(1000.0).with_burst(1000)));
		let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
		KrakenApiClient::new(Arc::new(HttpClient::new(limiter, breaker)), "key", "secret")
	}

	#[tokio::test]
	async fn maps_ledger_rows_into_normalized_entries() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/0/private/Ledgers"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"error": [],
				"result": {
					"ledger": {
						"LTRADE1": {"refid": "R1", "time": 1_700_000_000.0, "type": "trade", "asset": "XBT", "amount": "0.1", "fee": "0.0001"},
						"LTRADE2": {"refid": "R1", "time": 1_700_000_000.0, "type": "trade", "asset": "ZUSD", "amount": "-4000", "fee": "2"},
					}
				}
			})))
			.mount(&server)
			.await;

		let provider = provider_for(server.uri()).await;
		let batch = client().fetch_ledger(&provider, None).await.unwrap();
		assert!(batch.is_complete);
		assert_eq!(batch.data.len(), 2);
		assert!(batch.data.iter().any(|e| e.asset == "XBT" && e.entry_type == LedgerEntryType::Trade));
	}

	#[tokio::test]
	async fn surfaces_a_kraken_api_error_as_terminal() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/0/private/Ledgers"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"error": ["EAPI:Invalid key"],
				"result": null,
			})))
			.mount(&server)
			.await;

		let provider = provider_for(server.uri()).await;
		let err = client().fetch_ledger(&provider, None).await.unwrap_err();
		assert!(matches!(err, IngestError::ProviderTerminal(_)));
	}
}
