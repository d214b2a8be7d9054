//! Per-provider circuit breaker with a separate rate-limit cooldown (spec
//! §4.2). Three states — closed, open, half-open — guarded by one mutex per
//! provider key so a `Retry-After` poke and a failure-count transition can
//! never interleave into an inconsistent state (spec §5 "Shared resources").

use std::{
	collections::HashMap,
	sync::Mutex,
	time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
	pub failure_threshold: u32,
	pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		// Spec §4.2 defaults: 3 consecutive failures, 5 minute cooldown.
		Self { failure_threshold: 3, cooldown: Duration::from_secs(5 * 60) }
	}
}

enum Internal {
	Closed { consecutive_failures: u32 },
	Open { opened_at: Instant },
	HalfOpen,
}

struct Provider {
	config: CircuitBreakerConfig,
	state: Internal,
	/// 429 cooldown is tracked independently of failure-counted state
	/// transitions (spec §4.2: "429 responses trip a separate rate-limit
	/// cooldown").
	rate_limit_cooldown_until: Option<Instant>,
}

impl Provider {
	fn new(config: CircuitBreakerConfig) -> Self {
		Self { config, state: Internal::Closed { consecutive_failures: 0 }, rate_limit_cooldown_until: None }
	}

	fn as_state(&self) -> BreakerState {
		match self.state {
			Internal::Closed { .. } => BreakerState::Closed,
			Internal::Open { .. } => BreakerState::Open,
			Internal::HalfOpen => BreakerState::HalfOpen,
		}
	}

	/// Open -> half-open is lazy: it's observed the next time someone
	/// checks, not driven by a background timer.
	fn settle(&mut self) {
		if let Internal::Open { opened_at } = self.state {
			if opened_at.elapsed() >= self.config.cooldown {
				self.state = Internal::HalfOpen;
			}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	Allowed,
	/// One trial call allowed in half-open; the breaker expects exactly
	/// one caller to report its outcome before admitting another.
	TrialAllowed,
	FailFast,
	RateLimitCooldown,
}

pub struct CircuitBreaker {
	providers: Mutex<HashMap<String, Provider>>,
	default_config: CircuitBreakerConfig,
}

impl CircuitBreaker {
	pub fn new(default_config: CircuitBreakerConfig) -> Self {
		Self { providers: Mutex::new(HashMap::new()), default_config }
	}

	fn with_provider<T>(&self, key: &str, f: impl FnOnce(&mut Provider) -> T) -> T {
		let mut providers = self.providers.lock().expect("circuit breaker mutex poisoned");
		let provider = providers.entry(key.to_string()).or_insert_with(|| Provider::new(self.default_config));
		f(provider)
	}

	pub fn configure(&self, key: impl Into<String>, config: CircuitBreakerConfig) {
		self.providers.lock().expect("circuit breaker mutex poisoned").insert(key.into(), Provider::new(config));
	}

	/// Whether a call to `key` should be attempted right now.
	pub fn admission(&self, key: &str) -> Admission {
		self.with_provider(key, |provider| {
			if let Some(until) = provider.rate_limit_cooldown_until {
				if Instant::now() < until {
					return Admission::RateLimitCooldown;
				}
				provider.rate_limit_cooldown_until = None;
			}
			provider.settle();
			match provider.state {
				Internal::Closed { .. } => Admission::Allowed,
				Internal::Open { .. } => Admission::FailFast,
				Internal::HalfOpen => Admission::TrialAllowed,
			}
		})
	}

	pub fn state(&self, key: &str) -> BreakerState {
		self.with_provider(key, |provider| {
			provider.settle();
			provider.as_state()
		})
	}

	/// Records a request/5xx failure. 4xx other than 429 must not be
	/// reported here (spec §4.2) — callers classify before calling.
	pub fn on_failure(&self, key: &str) {
		self.with_provider(key, |provider| {
			provider.settle();
			provider.state = match provider.state {
				Internal::Closed { consecutive_failures } => {
					let consecutive_failures = consecutive_failures + 1;
					if consecutive_failures >= provider.config.failure_threshold {
						tracing::warn!(provider = key, consecutive_failures, "circuit breaker opening");
						Internal::Open { opened_at: Instant::now() }
					} else {
						Internal::Closed { consecutive_failures }
					}
				},
				Internal::HalfOpen => {
					tracing::warn!(provider = key, "half-open trial failed, re-opening circuit");
					Internal::Open { opened_at: Instant::now() }
				},
				Internal::Open { opened_at } => Internal::Open { opened_at },
			};
		})
	}

	pub fn on_success(&self, key: &str) {
		self.with_provider(key, |provider| {
			provider.settle();
			provider.state = match provider.state {
				Internal::HalfOpen => {
					tracing::info!(provider = key, "half-open trial succeeded, closing circuit");
					Internal::Closed { consecutive_failures: 0 }
				},
				Internal::Closed { .. } => Internal::Closed { consecutive_failures: 0 },
				Internal::Open { opened_at } => Internal::Open { opened_at },
			};
		})
	}

	/// Records a 429, honoring `retry_after` if the provider supplied one;
	/// does not touch the failure-count state machine at all.
	pub fn on_rate_limited(&self, key: &str, retry_after: Option<Duration>) {
		let cooldown = retry_after.unwrap_or(Duration::from_secs(1));
		self.with_provider(key, |provider| {
			provider.rate_limit_cooldown_until = Some(Instant::now() + cooldown);
		});
	}

	pub fn reset(&self, key: &str) {
		self.providers.lock().expect("circuit breaker mutex poisoned").remove(key);
	}
}
