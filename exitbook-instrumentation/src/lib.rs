//! In-process counters for calls, retries, rate-limit waits and failovers
//! (spec §2), exported through a Prometheus registry the same way the
//! teacher's CFE exposes its own metrics (`engine/src/metrics.rs`):
//! `lazy_static`-registered collectors, served over a `warp` `/metrics`
//! route. Approximate consistency is sufficient (spec §5) so counters are
//! plain `Mutex<HashMap<..., u64>>` accumulators, not a fully linearizable
//! store.

use std::{collections::HashMap, net::IpAddr, sync::Mutex};

use exitbook_domain::events::{InstrumentationEvent, InstrumentationSink};
use prometheus::{IntCounterVec, Opts, Registry};
use tracing::info;
use warp::Filter;

lazy_static::lazy_static! {
	static ref REGISTRY: Registry = Registry::new();

	static ref CALLS: IntCounterVec = IntCounterVec::new(
		Opts::new("exitbook_provider_calls_total", "Count of all calls attempted per provider/operation"),
		&["provider", "operation"],
	).expect("metric registration is infallible for well-formed metric names");

	static ref RETRIES: IntCounterVec = IntCounterVec::new(
		Opts::new("exitbook_provider_retries_total", "Count of retries per provider/operation"),
		&["provider", "operation"],
	).expect("metric registration is infallible for well-formed metric names");

	static ref RATE_LIMIT_WAITS: IntCounterVec = IntCounterVec::new(
		Opts::new("exitbook_rate_limit_waits_total", "Count of rate-limit waits per key"),
		&["key"],
	).expect("metric registration is infallible for well-formed metric names");

	static ref FAILOVERS: IntCounterVec = IntCounterVec::new(
		Opts::new("exitbook_failovers_total", "Count of provider failovers per operation"),
		&["from_provider", "to_provider", "operation"],
	).expect("metric registration is infallible for well-formed metric names");
}

/// Registers every collector with the shared registry. Call once at
/// startup, before `serve_metrics`. Mirrors the teacher's
/// `metrics::register_metrics()`.
pub fn register_metrics() {
	for collector in [&*CALLS, &*RETRIES, &*RATE_LIMIT_WAITS, &*FAILOVERS] {
		// Re-registering an already-registered collector is a programmer
		// error, not a runtime condition to recover from.
		REGISTRY.register(Box::new(collector.clone())).expect("metric registered exactly once");
	}
}

fn metrics_text() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();
	let mut buffer = Vec::new();
	encoder.encode(&REGISTRY.gather(), &mut buffer).expect("prometheus text encoding cannot fail");
	String::from_utf8(buffer).expect("prometheus text encoder always emits valid utf8")
}

/// Serves `/metrics` on `hostname:port` until the returned future is
/// dropped, following the same shape as `engine/src/metrics.rs::start`.
pub async fn serve_metrics(hostname: &str, port: u16) -> anyhow::Result<()> {
	info!(hostname, port, "starting instrumentation metrics endpoint");
	let route = warp::path("metrics").and(warp::path::end()).map(|| metrics_text());
	warp::serve(route).bind((hostname.parse::<IpAddr>()?, port)).await;
	Ok(())
}

/// The in-process accumulator consumed directly by code that doesn't want
/// to go through Prometheus (e.g. the provider manager's own
/// `ALL_PROVIDERS_FAILED` error wants the raw counts to report per-provider
/// failure reasons alongside how many times each was tried).
#[derive(Default)]
pub struct Counters {
	calls: Mutex<HashMap<(String, String), u64>>,
	retries: Mutex<HashMap<(String, String), u64>>,
	rate_limit_waits: Mutex<HashMap<String, u64>>,
	failovers: Mutex<HashMap<(String, String, String), u64>>,
}

impl Counters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn calls_for(&self, provider: &str, operation: &str) -> u64 {
		*self.calls.lock().expect("counters mutex poisoned").get(&(provider.into(), operation.into())).unwrap_or(&0)
	}

	pub fn retries_for(&self, provider: &str, operation: &str) -> u64 {
		*self
			.retries
			.lock()
			.expect("counters mutex poisoned")
			.get(&(provider.into(), operation.into()))
			.unwrap_or(&0)
	}

	pub fn failovers_for(&self, operation: &str) -> u64 {
		self.failovers
			.lock()
			.expect("counters mutex poisoned")
			.iter()
			.filter(|((_, _, op), _)| op == operation)
			.map(|(_, count)| *count)
			.sum()
	}
}

impl InstrumentationSink for Counters {
	fn record(&self, event: InstrumentationEvent) {
		match event {
			InstrumentationEvent::RequestStarted { provider, operation } => {
				*self.calls.lock().expect("counters mutex poisoned").entry((provider.clone(), operation.clone())).or_insert(0) += 1;
				CALLS.with_label_values(&[&provider, &operation]).inc();
			},
			InstrumentationEvent::RequestCompleted { .. } => {},
			InstrumentationEvent::RequestRetried { provider, operation, .. } => {
				*self.retries.lock().expect("counters mutex poisoned").entry((provider.clone(), operation.clone())).or_insert(0) += 1;
				RETRIES.with_label_values(&[&provider, &operation]).inc();
			},
			InstrumentationEvent::RateLimitWaited { key, .. } => {
				*self.rate_limit_waits.lock().expect("counters mutex poisoned").entry(key.clone()).or_insert(0) += 1;
				RATE_LIMIT_WAITS.with_label_values(&[&key]).inc();
			},
			InstrumentationEvent::Failover { from_provider, to_provider, operation } => {
				*self
					.failovers
					.lock()
					.expect("counters mutex poisoned")
					.entry((from_provider.clone(), to_provider.clone(), operation.clone()))
					.or_insert(0) += 1;
				FAILOVERS.with_label_values(&[&from_provider, &to_provider, &operation]).inc();
			},
			InstrumentationEvent::CircuitOpened { .. } | InstrumentationEvent::CircuitClosed { .. } => {},
		}
	}
}
