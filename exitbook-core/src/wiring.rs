//! Process-wide wiring: one [`RuntimeContext`] per running process, built
//! once from [`CoreSettings`] (spec §9 "Global state ... initialized once,
//! torn down on shutdown").

use std::sync::Arc;

use exitbook_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
use exitbook_domain::events::InstrumentationSink;
use exitbook_http::HttpClient;
use exitbook_instrumentation::Counters;
use exitbook_persistence::{PersistenceError, Store};
use exitbook_providers::{registry, ProviderManager, ProviderManagerConfig};
use exitbook_ratelimit::RateLimiter;
use exitbook_sources::{alchemy_like_descriptor, etherscan_like_descriptor, kraken_api_descriptor, kraken_csv_descriptor};

use crate::settings::CoreSettings;

/// Everything an external-interface call (spec §6) needs: a persistence
/// handle, a provider manager sitting on top of the process-wide registry,
/// and the single [`HttpClient`] every network-backed source client shares
/// (its rate limiter and circuit breaker are keyed per provider name
/// internally, so one instance already tracks per-provider state
/// correctly). Cheap to clone — every field is already behind `Arc` or,
/// for `Store`, a pooled connection.
#[derive(Clone)]
pub struct RuntimeContext {
	pub store: Store,
	pub manager: Arc<ProviderManager>,
	pub http: Arc<HttpClient>,
	pub counters: Arc<Counters>,
}

impl RuntimeContext {
	/// Connects persistence, registers every known provider once per
	/// process (spec §9), and assembles the provider manager on top of a
	/// shared circuit breaker and rate limiter. Calling this more than
	/// once in a process is harmless: [`registry::initialize_providers`]
	/// is itself idempotent-by-construction (`OnceLock`).
	pub async fn bootstrap(settings: &CoreSettings) -> Result<Self, PersistenceError> {
		let store = Store::connect(&settings.persistence.database_url).await?;

		register_known_providers();

		let counters = Arc::new(Counters::default());
		let sink = counters.clone() as Arc<dyn InstrumentationSink>;
		let manager = Arc::new(
			ProviderManager::new(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())), Arc::new(RateLimiter::new()))
				.with_instrumentation(sink.clone())
				.with_config(ProviderManagerConfig { dedup_capacity: settings.providers.dedup_capacity }),
		);
		let http = Arc::new(
			HttpClient::new(Arc::new(RateLimiter::new()), Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())))
				.with_instrumentation(sink),
		);

		Ok(Self { store, manager, http, counters })
	}

	#[cfg(any(test, feature = "test-util"))]
	pub async fn in_memory() -> Self {
		// Each test gets a clean provider table: the global registry is
		// process-wide (spec §9), and `register_known_providers` pushes
		// rather than replaces, so repeated calls within one test binary
		// would otherwise accumulate duplicate descriptors.
		registry::reset_registry_for_tests();
		register_known_providers();
		let counters = Arc::new(Counters::default());
		let manager = Arc::new(
			ProviderManager::new(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())), Arc::new(RateLimiter::new()))
				.with_instrumentation(counters.clone() as Arc<dyn InstrumentationSink>),
		);
		let http = Arc::new(HttpClient::new(Arc::new(RateLimiter::new()), Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()))));
		Self { store: Store::in_memory().await, manager, http, counters }
	}

	pub fn sink(&self) -> Arc<dyn InstrumentationSink> {
		self.counters.clone()
	}
}

/// Populates the process-wide registry with the illustrative providers
/// this workspace ships adapters for (spec §8 scenarios 1-2): two EVM
/// block-explorer-shaped providers registered for `ethereum`, and
/// Kraken's REST + CSV pair registered for `kraken`. A deployment with
/// more sources would extend this, not replace it — `initialize_providers`
/// takes a closure precisely so callers can add to the table (spec §9).
fn register_known_providers() {
	registry::initialize_providers(|registry| {
		registry.register(etherscan_like_descriptor("ethereum", "https://api.etherscan-like.example", 0));
		registry.register(alchemy_like_descriptor("ethereum", "https://api.alchemy-like.example", 1));
		registry.register(kraken_api_descriptor("https://api.kraken.com"));
		registry.register(kraken_csv_descriptor("kraken-csv"));
	});
}
