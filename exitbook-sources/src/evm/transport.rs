use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use exitbook_domain::{
	cursor::{CursorState, CursorType, CursorValue},
	error::IngestError,
};
use exitbook_http::HttpClient;
use exitbook_providers::{ResolvedProvider, StreamBatch, StreamingOperation};

use super::EvmTransferRecord;

/// One provider's wire format for the three EVM transfer kinds. A
/// transport never sees cursors or the provider manager — it only knows
/// how to ask its own REST/RPC surface for transfers since a given block.
#[async_trait]
pub trait EvmProviderTransport: Send + Sync {
	async fn fetch_normal(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError>;

	async fn fetch_internal(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError>;

	async fn fetch_token(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError>;
}

/// Fans one address's transfer history out across the three EVM transfer
/// kinds and back in as a single, block-ordered batch. Holds one
/// [`EvmProviderTransport`] per registered provider name so the same
/// operation can be hand to [`exitbook_providers::ProviderManager`] across
/// every EVM provider it fails over between.
pub struct EvmProviderClient {
	http: Arc<HttpClient>,
	address: String,
	transports: BTreeMap<String, Arc<dyn EvmProviderTransport>>,
}

impl EvmProviderClient {
	/// `http` is shared across every provider this client fails over
	/// between — `HttpClient` keys its rate limiter and circuit breaker by
	/// the `provider_key` passed to each call, so one instance already
	/// tracks per-provider state correctly.
	pub fn new(http: Arc<HttpClient>, address: impl Into<String>) -> Self {
		Self { http, address: address.into(), transports: BTreeMap::new() }
	}

	pub fn with_transport(mut self, provider_name: impl Into<String>, transport: Arc<dyn EvmProviderTransport>) -> Self {
		self.transports.insert(provider_name.into(), transport);
		self
	}
}

#[async_trait]
impl StreamingOperation for EvmProviderClient {
	type Record = EvmTransferRecord;

	async fn fetch_batch(
		&self,
		provider: &ResolvedProvider,
		cursor: Option<&CursorState>,
	) -> Result<StreamBatch<Self::Record>, IngestError> {
		let transport = self.transports.get(&provider.name).cloned().ok_or_else(|| {
			IngestError::validation("evm.no_transport", format!("no transport registered for provider {}", provider.name))
		})?;

		let since_block = match cursor.and_then(|c| c.value_for(CursorType::BlockNumber)) {
			Some(CursorValue::BlockNumber(n)) => Some(*n),
			_ => None,
		};

		let (normal, internal, token) = tokio::try_join!(
			transport.fetch_normal(&self.http, provider, &self.address, since_block),
			transport.fetch_internal(&self.http, provider, &self.address, since_block),
			transport.fetch_token(&self.http, provider, &self.address, since_block),
		)?;

		let mut data: Vec<EvmTransferRecord> = normal.into_iter().chain(internal).chain(token).collect();
		data.sort_by(|a, b| a.block_number.cmp(&b.block_number).then_with(|| a.hash.cmp(&b.hash)));

		Ok(StreamBatch { is_complete: true, data })
	}

	fn event_id(&self, record: &Self::Record) -> String {
		record.event_id()
	}

	fn extract_cursors(&self, record: &Self::Record) -> BTreeMap<CursorType, CursorValue> {
		let mut cursors = BTreeMap::new();
		cursors.insert(CursorType::BlockNumber, CursorValue::BlockNumber(record.block_number));
		cursors.insert(CursorType::Timestamp, CursorValue::Timestamp(record.timestamp));
		cursors
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap as Map;

	use chrono::Utc;
	use exitbook_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
	use exitbook_providers::{Capabilities, EnvReader, FactoryConfig, ProviderDescriptor, ReplayWindow, Registry};
	use exitbook_ratelimit::{RateLimitConfig, RateLimiter};

	use super::*;

	struct NoEnv;

	impl EnvReader for NoEnv {
		fn get(&self, _key: &str) -> Option<String> {
			None
		}
	}

	fn test_provider(name: &str) -> ResolvedProvider {
		let mut base_urls = Map::new();
		base_urls.insert("ethereum".to_string(), format!("https://{name}.example"));
		let mut registry = Registry::default();
		registry.register(ProviderDescriptor {
			name: name.to_string(),
			display_name: name.to_string(),
			base_urls,
			requires_api_key: None,
			default_rate_limit: RateLimitConfig::per_second(1000.0),
			default_circuit_breaker: CircuitBreakerConfig::default(),
			default_retries: 0,
			priority: 0,
			capabilities: Capabilities {
				supported_operations: vec!["evm.transfers".to_string()],
				supported_cursor_types: vec![CursorType::BlockNumber],
				preferred_cursor_type: CursorType::BlockNumber,
				replay_window: ReplayWindow::Blocks(2),
			},
		});
		registry.resolve("ethereum", &FactoryConfig::default(), &NoEnv).unwrap().remove(0)
	}

	fn record(kind: EvmTransferKind, hash: &str, block: u64, trace_index: Option<u32>, log_index: Option<u32>) -> EvmTransferRecord {
		EvmTransferRecord {
			kind,
			hash: hash.to_string(),
			trace_index,
			log_index,
			block_number: block,
			timestamp: Utc::now(),
			from: "0xfrom".to_string(),
			to: "0xto".to_string(),
			asset_symbol: "ETH".to_string(),
			amount: 1.0,
			raw: serde_json::Value::Null,
		}
	}

	struct StubTransport {
		normal: Vec<EvmTransferRecord>,
		internal: Vec<EvmTransferRecord>,
		token: Vec<EvmTransferRecord>,
		seen_since_block: std::sync::Mutex<Option<u64>>,
	}

	#[async_trait]
	impl EvmProviderTransport for StubTransport {
		async fn fetch_normal(
			&self,
			_http: &HttpClient,
			_provider: &ResolvedProvider,
			_address: &str,
			since_block: Option<u64>,
		) -> Result<Vec<EvmTransferRecord>, IngestError> {
			*self.seen_since_block.lock().unwrap() = since_block;
			Ok(self.normal.clone())
		}

		async fn fetch_internal(
			&self,
			_http: &HttpClient,
			_provider: &ResolvedProvider,
			_address: &str,
			_since_block: Option<u64>,
		) -> Result<Vec<EvmTransferRecord>, IngestError> {
			Ok(self.internal.clone())
		}

		async fn fetch_token(
			&self,
			_http: &HttpClient,
			_provider: &ResolvedProvider,
			_address: &str,
			_since_block: Option<u64>,
		) -> Result<Vec<EvmTransferRecord>, IngestError> {
			Ok(self.token.clone())
		}
	}

	fn http() -> Arc<HttpClient> {
		let limiter = Arc::new(RateLimiter::with_default(RateLimitConfig::per_second(1000.0).with_burst(1000)));
		let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
		Arc::new(HttpClient::new(limiter, breaker))
	}

	#[tokio::test]
	async fn fans_out_into_one_ordered_batch_with_disambiguated_event_ids() {
		let transport = Arc::new(StubTransport {
			normal: vec![record(EvmTransferKind::Normal, "0xabc", 10, None, None)],
			internal: vec![record(EvmTransferKind::Internal, "0xabc", 10, Some(2), None)],
			token: vec![record(EvmTransferKind::Token, "0xabc", 10, None, Some(5))],
			seen_since_block: std::sync::Mutex::new(None),
		});
		let client = EvmProviderClient::new(http(), "0xaddress").with_transport("etherscan-like", transport);
		let provider = test_provider("etherscan-like");

		let batch = client.fetch_batch(&provider, None).await.unwrap();
		assert_eq!(batch.data.len(), 3);

		let ids: Vec<String> = batch.data.iter().map(|r| client.event_id(r)).collect();
		assert_eq!(ids, vec!["0xabc", "0xabc:internal:2", "0xabc:token:5"]);
		assert_eq!(ids.iter().collect::<std::collections::HashSet<_>>().len(), 3);
	}

	#[tokio::test]
	async fn threads_the_cursors_block_number_through_as_since_block() {
		let transport = Arc::new(StubTransport {
			normal: Vec::new(),
			internal: Vec::new(),
			token: Vec::new(),
			seen_since_block: std::sync::Mutex::new(None),
		});
		let client = EvmProviderClient::new(http(), "0xaddress").with_transport("etherscan-like", transport.clone());
		let provider = test_provider("etherscan-like");
		let cursor = CursorState::new(CursorValue::BlockNumber(900), "etherscan-like", Utc::now());

		client.fetch_batch(&provider, Some(&cursor)).await.unwrap();
		assert_eq!(*transport.seen_since_block.lock().unwrap(), Some(900));
	}

	#[tokio::test]
	async fn errors_when_no_transport_is_registered_for_the_provider() {
		let client = EvmProviderClient::new(http(), "0xaddress");
		let provider = test_provider("unregistered");
		let err = client.fetch_batch(&provider, None).await.unwrap_err();
		assert!(matches!(err, IngestError::Validation(_)));
	}
}
