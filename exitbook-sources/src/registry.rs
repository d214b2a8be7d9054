//! Provider descriptors for the concrete clients in this crate. Each
//! descriptor is the metadata half of a provider — rate limit, circuit
//! breaker, replay window — paired at wiring time (in `exitbook-core`) with
//! the client half built in [`crate::evm`]/[`crate::exchange`].

use std::collections::BTreeMap;
use std::time::Duration;

use exitbook_circuitbreaker::CircuitBreakerConfig;
use exitbook_domain::cursor::CursorType;
use exitbook_providers::{Capabilities, ProviderDescriptor, ReplayWindow, RequiresApiKey};
use exitbook_ratelimit::RateLimitConfig;

/// `etherscan-like` (spec §8 scenario 2): a REST block-explorer API keyed by
/// an API key, rate limited conservatively since most free tiers cap at a
/// handful of requests per second.
pub fn etherscan_like_descriptor(chain: &str, base_url: impl Into<String>, priority: i32) -> ProviderDescriptor {
	let mut base_urls = BTreeMap::new();
	base_urls.insert(chain.to_string(), base_url.into());
	ProviderDescriptor {
		name: "etherscan-like".to_string(),
		display_name: "Etherscan-compatible explorer".to_string(),
		base_urls,
		requires_api_key: Some(RequiresApiKey { env_var: "ETHERSCAN_LIKE_API_KEY" }),
		default_rate_limit: RateLimitConfig::per_second(5.0),
		default_circuit_breaker: CircuitBreakerConfig { failure_threshold: 5, cooldown: Duration::from_secs(30) },
		default_retries: 3,
		priority,
		capabilities: Capabilities {
			supported_operations: vec!["evm.transfers".to_string()],
			supported_cursor_types: vec![CursorType::BlockNumber, CursorType::Timestamp],
			preferred_cursor_type: CursorType::BlockNumber,
			replay_window: ReplayWindow::Blocks(3),
		},
	}
}

/// `alchemy-like` (spec §8 scenario 2): a JSON-RPC indexer, generally
/// capable of a much higher sustained rate than a free block-explorer tier.
pub fn alchemy_like_descriptor(chain: &str, base_url: impl Into<String>, priority: i32) -> ProviderDescriptor {
	let mut base_urls = BTreeMap::new();
	base_urls.insert(chain.to_string(), base_url.into());
	ProviderDescriptor {
		name: "alchemy-like".to_string(),
		display_name: "Alchemy-compatible indexer".to_string(),
		base_urls,
		requires_api_key: Some(RequiresApiKey { env_var: "ALCHEMY_LIKE_API_KEY" }),
		default_rate_limit: RateLimitConfig::per_second(25.0),
		default_circuit_breaker: CircuitBreakerConfig { failure_threshold: 5, cooldown: Duration::from_secs(20) },
		default_retries: 3,
		priority,
		capabilities: Capabilities {
			supported_operations: vec!["evm.transfers".to_string()],
			supported_cursor_types: vec![CursorType::BlockNumber],
			preferred_cursor_type: CursorType::BlockNumber,
			replay_window: ReplayWindow::Blocks(3),
		},
	}
}

/// `kraken-api` (spec §8 scenario 1's live-REST sibling): a single-account
/// REST ledger, no failover partner since Kraken has no alternate provider
/// in this system — one entry is still a `Vec<ResolvedProvider>` of length
/// one, which `ProviderManager` handles the same as any other.
pub fn kraken_api_descriptor(base_url: impl Into<String>) -> ProviderDescriptor {
	let mut base_urls = BTreeMap::new();
	base_urls.insert("kraken".to_string(), base_url.into());
	ProviderDescriptor {
		name: "kraken-api".to_string(),
		display_name: "Kraken".to_string(),
		base_urls,
		requires_api_key: Some(RequiresApiKey { env_var: "KRAKEN_API_KEY" }),
		default_rate_limit: RateLimitConfig::per_second(1.0),
		default_circuit_breaker: CircuitBreakerConfig::default(),
		default_retries: 3,
		priority: 0,
		capabilities: Capabilities {
			supported_operations: vec!["exchange.ledger".to_string()],
			supported_cursor_types: vec![CursorType::Timestamp],
			preferred_cursor_type: CursorType::Timestamp,
			replay_window: ReplayWindow::Minutes(5),
		},
	}
}

/// `kraken-csv`: a local, no-network provider for a directory of ledger
/// exports. Registered with a `file://` pseudo base URL so it slots into
/// the same provider-resolution machinery as every networked source.
pub fn kraken_csv_descriptor(directory_label: impl Into<String>) -> ProviderDescriptor {
	let mut base_urls = BTreeMap::new();
	base_urls.insert("kraken".to_string(), format!("file://{}", directory_label.into()));
	ProviderDescriptor {
		name: "kraken-csv".to_string(),
		display_name: "Kraken (CSV export)".to_string(),
		base_urls,
		requires_api_key: None,
		default_rate_limit: RateLimitConfig::per_second(1000.0),
		default_circuit_breaker: CircuitBreakerConfig::default(),
		default_retries: 0,
		priority: 0,
		capabilities: Capabilities {
			supported_operations: vec!["exchange.ledger".to_string()],
			supported_cursor_types: vec![CursorType::Timestamp],
			preferred_cursor_type: CursorType::Timestamp,
			replay_window: ReplayWindow::Minutes(0),
		},
	}
}
