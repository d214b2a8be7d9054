//! Provider registry & factory (spec §4.4).
//!
//! The registry is process-wide, populated once by [`initialize_providers`]
//! (spec §9 "Global state"), the same shape as the teacher's
//! `lazy_static!`-backed metric `Registry` in `engine/src/metrics.rs`
//! generalized to something mutable and resettable, since provider
//! metadata — unlike metrics — must be swappable between tests.

use std::{
	collections::BTreeMap,
	sync::{Mutex, OnceLock},
};

use exitbook_circuitbreaker::CircuitBreakerConfig;
use exitbook_domain::cursor::CursorType;
use exitbook_ratelimit::RateLimitConfig;

#[derive(Debug, Clone)]
pub struct Capabilities {
	pub supported_operations: Vec<String>,
	pub supported_cursor_types: Vec<CursorType>,
	pub preferred_cursor_type: CursorType,
	pub replay_window: ReplayWindow,
}

#[derive(Debug, Clone, Copy)]
pub enum ReplayWindow {
	Minutes(u32),
	Blocks(u32),
}

#[derive(Debug, Clone)]
pub struct RequiresApiKey {
	pub env_var: &'static str,
}

#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
	pub name: String,
	pub display_name: String,
	/// Blockchain -> base URL override. A provider supporting several
	/// chains from one account (e.g. a multi-chain indexer) lists each
	/// here; a single-chain provider has exactly one entry.
	pub base_urls: BTreeMap<String, String>,
	pub requires_api_key: Option<RequiresApiKey>,
	pub default_rate_limit: RateLimitConfig,
	pub default_circuit_breaker: CircuitBreakerConfig,
	pub default_retries: u32,
	pub priority: i32,
	pub capabilities: Capabilities,
}

impl ProviderDescriptor {
	pub fn supports_chain(&self, blockchain: &str) -> bool {
		self.base_urls.contains_key(blockchain)
	}

	pub fn supports_operation(&self, operation: &str) -> bool {
		self.capabilities.supported_operations.iter().any(|op| op == operation)
	}
}

/// Per-provider overrides a caller can supply on top of registered
/// defaults (spec §4.4 step 1).
#[derive(Debug, Clone, Default)]
pub struct ProviderOverride {
	pub enabled: Option<bool>,
	pub priority: Option<i32>,
	pub rate_limit: Option<RateLimitConfig>,
	pub retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
	pub overrides: BTreeMap<String, ProviderOverride>,
	pub preferred_provider: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
	#[error("preferred provider {requested:?} is not registered for {blockchain}; available providers: {available:?}")]
	PreferredProviderNotRegistered { requested: String, blockchain: String, available: Vec<String> },
}

/// An env-var reader abstraction so tests can simulate missing API keys
/// without mutating the process environment (which would make tests
/// order-dependent).
pub trait EnvReader: Send + Sync {
	fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvReader for ProcessEnv {
	fn get(&self, key: &str) -> Option<String> {
		std::env::var(key).ok()
	}
}

#[derive(Default)]
pub struct Registry {
	providers: Vec<ProviderDescriptor>,
}

impl Registry {
	pub fn register(&mut self, descriptor: ProviderDescriptor) {
		self.providers.push(descriptor);
	}

	/// The factory: builds the ordered, filtered, validated provider list
	/// for one blockchain (spec §4.4 steps 1-5).
	pub fn resolve(
		&self,
		blockchain: &str,
		config: &FactoryConfig,
		env: &dyn EnvReader,
	) -> Result<Vec<ResolvedProvider>, FactoryError> {
		let mut resolved: Vec<ResolvedProvider> = Vec::new();

		for (insertion_index, descriptor) in self.providers.iter().enumerate() {
			if !descriptor.supports_chain(blockchain) {
				continue;
			}
			let overrides = config.overrides.get(&descriptor.name).cloned().unwrap_or_default();
			if overrides.enabled == Some(false) {
				continue;
			}
			if let Some(requirement) = &descriptor.requires_api_key {
				if env.get(requirement.env_var).is_none() {
					// Spec §6: missing keys demote the provider out of the
					// active set, they never fail startup.
					tracing::warn!(
						provider = %descriptor.name,
						env_var = requirement.env_var,
						"skipping provider: required API key environment variable is not set",
					);
					continue;
				}
			}
			let base_url = descriptor
				.base_urls
				.get(blockchain)
				.cloned()
				.expect("supports_chain already confirmed this key exists");

			resolved.push(ResolvedProvider {
				name: descriptor.name.clone(),
				base_url,
				rate_limit: overrides.rate_limit.unwrap_or(descriptor.default_rate_limit),
				circuit_breaker: descriptor.default_circuit_breaker,
				retries: overrides.retries.unwrap_or(descriptor.default_retries),
				priority: overrides.priority.unwrap_or(descriptor.priority),
				capabilities: descriptor.capabilities.clone(),
				insertion_index,
			});
		}

		// Ascending priority, ties broken by insertion order (spec §4.4
		// step 4). A stable sort on `(priority, insertion_index)` gives us
		// both in one pass.
		resolved.sort_by_key(|p| (p.priority, p.insertion_index));

		if let Some(requested) = &config.preferred_provider {
			if !resolved.iter().any(|p| &p.name == requested) {
				return Err(FactoryError::PreferredProviderNotRegistered {
					requested: requested.clone(),
					blockchain: blockchain.to_string(),
					available: resolved.iter().map(|p| p.name.clone()).collect(),
				});
			}
		}

		Ok(resolved)
	}

	pub fn provider_names(&self) -> Vec<&str> {
		self.providers.iter().map(|p| p.name.as_str()).collect()
	}
}

#[derive(Debug, Clone)]
pub struct ResolvedProvider {
	pub name: String,
	pub base_url: String,
	pub rate_limit: RateLimitConfig,
	pub circuit_breaker: CircuitBreakerConfig,
	pub retries: u32,
	pub priority: i32,
	pub capabilities: Capabilities,
	insertion_index: usize,
}

static GLOBAL_REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn global() -> &'static Mutex<Registry> {
	GLOBAL_REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Populates the process-wide registry. Called once at startup (spec §9).
pub fn initialize_providers(register: impl FnOnce(&mut Registry)) {
	let mut registry = global().lock().expect("provider registry mutex poisoned");
	register(&mut registry);
}

pub fn with_global_registry<T>(f: impl FnOnce(&Registry) -> T) -> T {
	let registry = global().lock().expect("provider registry mutex poisoned");
	f(&registry)
}

/// Test-only reset hook (spec §9: "Tests must expose a reset hook").
#[cfg(any(test, feature = "test-util"))]
pub fn reset_registry_for_tests() {
	*global().lock().expect("provider registry mutex poisoned") = Registry::default();
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap as Map;

	use super::*;

	struct FakeEnv(Map<&'static str, &'static str>);

	impl EnvReader for FakeEnv {
		fn get(&self, key: &str) -> Option<String> {
			self.0.get(key).map(|v| v.to_string())
		}
	}

	fn descriptor(name: &str, priority: i32, requires_key: Option<&'static str>) -> ProviderDescriptor {
		let mut base_urls = BTreeMap::new();
		base_urls.insert("ethereum".to_string(), format!("https://{name}.example"));
		ProviderDescriptor {
			name: name.to_string(),
			display_name: name.to_string(),
			base_urls,
			requires_api_key: requires_key.map(|env_var| RequiresApiKey { env_var }),
			default_rate_limit: RateLimitConfig::per_second(5.0),
			default_circuit_breaker: CircuitBreakerConfig::default(),
			default_retries: 3,
			priority,
			capabilities: Capabilities {
				supported_operations: vec!["fetch_transfers".to_string()],
				supported_cursor_types: vec![CursorType::BlockNumber],
				preferred_cursor_type: CursorType::BlockNumber,
				replay_window: ReplayWindow::Blocks(2),
			},
		}
	}

	#[test]
	fn orders_by_priority_then_insertion() {
		let mut registry = Registry::default();
		registry.register(descriptor("p-high-priority-num", 5, None));
		registry.register(descriptor("p-low-priority-num", 1, None));
		registry.register(descriptor("p-also-low", 1, None));

		let resolved = registry.resolve("ethereum", &FactoryConfig::default(), &FakeEnv(Map::new())).unwrap();
		let names: Vec<_> = resolved.iter().map(|p| p.name.as_str()).collect();
		assert_eq!(names, vec!["p-low-priority-num", "p-also-low", "p-high-priority-num"]);
	}

	#[test]
	fn skips_providers_missing_required_api_key() {
		let mut registry = Registry::default();
		registry.register(descriptor("needs-key", 0, Some("MY_PROVIDER_KEY")));
		registry.register(descriptor("no-key-needed", 1, None));

		let resolved = registry.resolve("ethereum", &FactoryConfig::default(), &FakeEnv(Map::new())).unwrap();
		assert_eq!(resolved.len(), 1);
		assert_eq!(resolved[0].name, "no-key-needed");
	}

	#[test]
	fn includes_provider_once_its_api_key_env_var_is_present() {
		let mut registry = Registry::default();
		registry.register(descriptor("needs-key", 0, Some("MY_PROVIDER_KEY")));

		let mut env = Map::new();
		env.insert("MY_PROVIDER_KEY", "secret");
		let resolved = registry.resolve("ethereum", &FactoryConfig::default(), &FakeEnv(env)).unwrap();
		assert_eq!(resolved.len(), 1);
	}

	#[test]
	fn preferred_provider_must_be_registered() {
		let mut registry = Registry::default();
		registry.register(descriptor("p1", 0, None));

		let config = FactoryConfig { preferred_provider: Some("does-not-exist".to_string()), ..Default::default() };
		let err = registry.resolve("ethereum", &config, &FakeEnv(Map::new())).unwrap_err();
		assert!(matches!(err, FactoryError::PreferredProviderNotRegistered { .. }));
	}
}
