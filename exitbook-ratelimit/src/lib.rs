//! Token-bucket admission control, one bucket per logical key (spec §4.1).
//!
//! The key is typically a provider name but the limiter doesn't care — any
//! string is a valid bucket key, which is what lets the HTTP client's
//! `with_rate_limit` scope (spec §4.3) temporarily swap in a limiter keyed
//! however the caller likes.

use std::{
	collections::HashMap,
	sync::Arc,
	time::{Duration, Instant},
};

use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
	#[error("no rate limit configuration for key {0:?}")]
	UnknownKey(String),
}

/// The three independent ceilings a caller may declare; the effective rate
/// is the minimum of whichever are set (spec §4.1: "the effective
/// requests-per-second is the minimum of the declared per-second,
/// per-minute/60, and per-hour/3600 rates").
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
	pub per_second: Option<f64>,
	pub per_minute: Option<f64>,
	pub per_hour: Option<f64>,
	/// Bucket capacity. Defaults to 1 if not set (spec §4.1).
	pub burst: Option<u32>,
}

impl RateLimitConfig {
	pub fn per_second(rate: f64) -> Self {
		Self { per_second: Some(rate), per_minute: None, per_hour: None, burst: None }
	}

	pub fn with_burst(mut self, burst: u32) -> Self {
		self.burst = Some(burst);
		self
	}

	/// The floor described in spec §4.1. A config with nothing declared has
	/// no effective rate and is rejected at bucket-creation time — callers
	/// must pick at least one ceiling.
	pub fn effective_rps(&self) -> Option<f64> {
		[self.per_second, self.per_minute.map(|r| r / 60.0), self.per_hour.map(|r| r / 3600.0)]
			.into_iter()
			.flatten()
			.fold(None, |acc, rate| Some(acc.map_or(rate, |a: f64| a.min(rate))))
	}

	pub fn capacity(&self) -> f64 {
		self.burst.unwrap_or(1) as f64
	}
}

struct Bucket {
	config: RateLimitConfig,
	tokens: f64,
	last_refill: Instant,
	/// Serializes waiters on this key so only one task computes-and-sleeps
	/// at a time; tokio's semaphore hands permits out in arrival order,
	/// which gives `wait_token` its approximately-FIFO admission guarantee
	/// (spec §4.1) without a hand-rolled queue.
	admission: Arc<Semaphore>,
}

impl Bucket {
	fn new(config: RateLimitConfig) -> Self {
		Self { tokens: config.capacity(), last_refill: Instant::now(), config, admission: Arc::new(Semaphore::new(1)) }
	}

	fn refill(&mut self) {
		let Some(rps) = self.config.effective_rps() else { return };
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * rps).min(self.config.capacity());
		self.last_refill = now;
	}

	/// Seconds to wait before one more token is available, assuming no
	/// other taker intervenes. Zero if a token is already available.
	fn deficit_wait(&self) -> Duration {
		if self.tokens >= 1.0 {
			return Duration::ZERO;
		}
		match self.config.effective_rps() {
			Some(rps) if rps > 0.0 => Duration::from_secs_f64((1.0 - self.tokens) / rps),
			_ => Duration::ZERO,
		}
	}

	fn take(&mut self) {
		self.tokens -= 1.0;
	}
}

/// Current status of one bucket, for `get_status` (spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
	pub tokens: f64,
	pub max_tokens: f64,
	pub effective_rps: Option<f64>,
}

pub struct RateLimiter {
	buckets: Mutex<HashMap<String, Bucket>>,
	default_config: Option<RateLimitConfig>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self { buckets: Mutex::new(HashMap::new()), default_config: None }
	}

	/// A limiter that lazily creates buckets for unseen keys using
	/// `default_config`, convenient for tests and for providers that don't
	/// declare per-key overrides.
	pub fn with_default(default_config: RateLimitConfig) -> Self {
		Self { buckets: Mutex::new(HashMap::new()), default_config: Some(default_config) }
	}

	pub async fn configure(&self, key: impl Into<String>, config: RateLimitConfig) {
		self.buckets.lock().await.insert(key.into(), Bucket::new(config));
	}

	async fn ensure_bucket<'a>(
		&self,
		buckets: &'a mut HashMap<String, Bucket>,
		key: &str,
	) -> Result<(), RateLimitError> {
		if buckets.contains_key(key) {
			return Ok(());
		}
		match self.default_config {
			Some(config) => {
				buckets.insert(key.to_string(), Bucket::new(config));
				Ok(())
			},
			None => Err(RateLimitError::UnknownKey(key.to_string())),
		}
	}

	/// Acquires one token for `key`, blocking (without holding any lock
	/// across the sleep) until one is available, then recurses to confirm
	/// a token is still there once woken — another waiter admitted ahead of
	/// us in the interim may have taken it first.
	pub async fn wait_token(&self, key: &str) -> Result<(), RateLimitError> {
		let admission = {
			let mut buckets = self.buckets.lock().await;
			self.ensure_bucket(&mut buckets, key).await?;
			buckets.get(key).expect("just ensured").admission.clone()
		};

		// Only one waiter per key computes-and-sleeps at a time; this is
		// what keeps admission order close to FIFO (spec §4.1).
		let _permit = admission.acquire().await.expect("semaphore is never closed");

		loop {
			let wait = {
				let mut buckets = self.buckets.lock().await;
				let bucket = buckets.get_mut(key).expect("bucket exists while its semaphore is held");
				bucket.refill();
				let wait = bucket.deficit_wait();
				if wait.is_zero() {
					bucket.take();
					return Ok(());
				}
				wait
			};
			tracing::trace!(key, wait_ms = wait.as_millis() as u64, "rate limiter waiting for token");
			tokio::time::sleep(wait).await;
		}
	}

	/// Non-blocking check used for provider-skip decisions (spec §4.5:
	/// "its preflight rate-limit status is exhausted beyond a small
	/// threshold").
	pub async fn can_make_request(&self, key: &str) -> bool {
		let mut buckets = self.buckets.lock().await;
		if self.ensure_bucket(&mut buckets, key).await.is_err() {
			return false;
		}
		let bucket = buckets.get_mut(key).expect("just ensured");
		bucket.refill();
		bucket.tokens >= 1.0
	}

	pub async fn get_status(&self, key: &str) -> Option<RateLimitStatus> {
		let mut buckets = self.buckets.lock().await;
		let bucket = buckets.get_mut(key)?;
		bucket.refill();
		Some(RateLimitStatus {
			tokens: bucket.tokens,
			max_tokens: bucket.config.capacity(),
			effective_rps: bucket.config.effective_rps(),
		})
	}

	pub async fn reset(&self, key: &str) {
		self.buckets.lock().await.remove(key);
	}
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn effective_rps_takes_the_minimum_ceiling() {
		let config = RateLimitConfig { per_second: Some(10.0), per_minute: Some(60.0), per_hour: None, burst: None };
		// per_minute/60 == 1.0, which is below per_second's 10.0.
		assert_eq!(config.effective_rps(), Some(1.0));
	}

	#[test]
	fn capacity_defaults_to_one() {
		let config = RateLimitConfig::per_second(5.0);
		assert_eq!(config.capacity(), 1.0);
	}

	#[tokio::test(start_paused = true)]
	async fn wait_token_admits_at_the_declared_rate() {
		let limiter = RateLimiter::new();
		limiter.configure("provider-a", RateLimitConfig::per_second(2.0).with_burst(1)).await;

		limiter.wait_token("provider-a").await.unwrap();
		assert!(!limiter.can_make_request("provider-a").await);

		let started = tokio::time::Instant::now();
		limiter.wait_token("provider-a").await.unwrap();
		// At 2 req/s a single token refills in 500ms.
		assert!(started.elapsed() >= Duration::from_millis(490));
	}

	#[tokio::test]
	async fn unconfigured_key_without_default_is_rejected() {
		let limiter = RateLimiter::new();
		assert!(matches!(limiter.wait_token("nope").await, Err(RateLimitError::UnknownKey(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn waiters_on_the_same_key_do_not_starve_each_other() {
		let limiter = Arc::new(RateLimiter::new());
		limiter.configure("shared", RateLimitConfig::per_second(10.0).with_burst(1)).await;

		let mut handles = Vec::new();
		for _ in 0..5 {
			let limiter = limiter.clone();
			handles.push(tokio::spawn(async move {
				limiter.wait_token("shared").await.unwrap();
			}));
		}
		for handle in handles {
			tokio::time::advance(Duration::from_millis(200)).await;
			handle.await.unwrap();
		}
	}

	#[tokio::test]
	async fn reset_discards_bucket_state() {
		let limiter = RateLimiter::new();
		limiter.configure("k", RateLimitConfig::per_second(1.0)).await;
		limiter.wait_token("k").await.unwrap();
		limiter.reset("k").await;
		assert!(limiter.get_status("k").await.is_none());
	}
}
