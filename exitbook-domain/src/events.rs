use std::time::Duration;

/// Lifecycle events emitted by the HTTP client and provider manager (spec
/// §4.3, §4.5, §2 "Instrumentation"). Kept in the domain crate so that both
/// the emitting crates (`exitbook-http`, `exitbook-providers`) and the
/// consuming crate (`exitbook-instrumentation`) depend on a shared,
/// dependency-free vocabulary instead of on each other.
#[derive(Debug, Clone)]
pub enum InstrumentationEvent {
	RequestStarted { provider: String, operation: String },
	RequestCompleted { provider: String, operation: String, elapsed: Duration },
	RequestRetried { provider: String, operation: String, attempt: u32 },
	RateLimitWaited { key: String, waited: Duration },
	Failover { from_provider: String, to_provider: String, operation: String },
	CircuitOpened { provider: String },
	CircuitClosed { provider: String },
}

/// Anything that can receive instrumentation events. `exitbook-http` and
/// `exitbook-providers` are generic over this trait so tests can supply a
/// recording sink instead of the Prometheus-backed one.
pub trait InstrumentationSink: Send + Sync {
	fn record(&self, event: InstrumentationEvent);
}

/// A sink that discards everything, used as the default when a caller does
/// not care about instrumentation (mirrors the teacher's pattern of making
/// metrics an optional, injectable concern rather than a hard dependency of
/// every call site).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl InstrumentationSink for NullSink {
	fn record(&self, _event: InstrumentationEvent) {}
}
