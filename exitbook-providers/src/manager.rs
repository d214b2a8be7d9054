//! Provider manager: failover across an ordered provider list, and
//! streaming with cursor-resumable failover (spec §4.5). This is the
//! hardest contract in the system (spec §1) — the streaming surface is a
//! hand-rolled `Stream` impl, the same shape as the teacher's
//! `ConscientiousEvmWebsocketBlockHeaderStream` (`engine/src/evm.rs`),
//! rather than an `async-stream!` macro, because the workspace never pulls
//! in `async-stream`.

use std::{
	collections::BTreeMap,
	future::Future,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
};

use async_trait::async_trait;
use chrono::Utc;
use exitbook_circuitbreaker::{Admission, CircuitBreaker};
use exitbook_domain::{
	cursor::{CursorState, CursorType, CursorValue},
	error::{ErrorDetails, IngestError},
	events::{InstrumentationEvent, InstrumentationSink, NullSink},
};
use futures_core::Stream;
use lru::LruCache;
use tokio_util::sync::CancellationToken;

use crate::registry::{ReplayWindow, ResolvedProvider};

/// One batch of fetched records plus the cursor state it advances to (spec
/// §4.5/§3). `is_complete` tells the caller the source has no more data for
/// now (not necessarily forever — a later poll may find new data).
#[derive(Debug, Clone)]
pub struct StreamBatch<T> {
	pub data: Vec<T>,
	pub is_complete: bool,
}

/// A provider-agnostic fetch operation. One implementation exists per
/// (source, logical operation) pair — e.g. "fetch EVM transfers" — and is
/// handed to the manager, which supplies the provider and cursor.
#[async_trait]
pub trait StreamingOperation: Send + Sync {
	type Record: Send + Clone;

	async fn fetch_batch(
		&self,
		provider: &ResolvedProvider,
		cursor: Option<&CursorState>,
	) -> Result<StreamBatch<Self::Record>, IngestError>;

	/// Stable, provider-independent dedup key (spec GLOSSARY "EventId").
	fn event_id(&self, record: &Self::Record) -> String;

	/// Every cursor type derivable from this record (spec §4.6
	/// `extractCursors`).
	fn extract_cursors(&self, record: &Self::Record) -> BTreeMap<CursorType, CursorValue>;
}

#[async_trait]
pub trait SingleShotOperation: Send + Sync {
	type Output: Send;

	async fn call(&self, provider: &ResolvedProvider) -> Result<Self::Output, IngestError>;
}

#[derive(Debug)]
pub struct FailoverSuccess<T> {
	pub data: T,
	pub provider_name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("all providers failed for {operation}: {reasons:?}")]
pub struct AllProvidersFailedError {
	pub operation: String,
	pub reasons: Vec<(String, ErrorDetails)>,
}

pub struct ProviderManagerConfig {
	/// Dedup LRU capacity. Per spec §9's open question, sized to survive
	/// the largest declared replay window; 10x a typical in-window record
	/// count is the documented rule of thumb.
	pub dedup_capacity: usize,
}

impl Default for ProviderManagerConfig {
	fn default() -> Self {
		Self { dedup_capacity: 10_000 }
	}
}

pub struct ProviderManager {
	circuit_breaker: Arc<CircuitBreaker>,
	rate_limiter: Arc<exitbook_ratelimit::RateLimiter>,
	sink: Arc<dyn InstrumentationSink>,
	config: ProviderManagerConfig,
}

impl ProviderManager {
	pub fn new(circuit_breaker: Arc<CircuitBreaker>, rate_limiter: Arc<exitbook_ratelimit::RateLimiter>) -> Self {
		Self { circuit_breaker, rate_limiter, sink: Arc::new(NullSink), config: ProviderManagerConfig::default() }
	}

	pub fn with_instrumentation(mut self, sink: Arc<dyn InstrumentationSink>) -> Self {
		self.sink = sink;
		self
	}

	pub fn with_config(mut self, config: ProviderManagerConfig) -> Self {
		self.config = config;
		self
	}

	fn is_eligible(&self, provider: &ResolvedProvider, operation: &str) -> bool {
		if !provider.capabilities.supported_operations.iter().any(|op| op == operation) {
			return false;
		}
		if self.circuit_breaker.admission(&provider.name) == Admission::FailFast {
			return false;
		}
		true
	}

	/// Lazily registers a provider's declared rate limit with the shared
	/// limiter the first time it's used. Never re-configures an
	/// already-known key — doing so on every call would reset its bucket
	/// back to full capacity and defeat the limiter entirely.
	async fn ensure_rate_limit_configured(&self, provider: &ResolvedProvider) {
		if self.rate_limiter.get_status(&provider.name).await.is_none() {
			self.rate_limiter.configure(provider.name.clone(), provider.rate_limit).await;
		}
	}

	/// Single-shot failover (spec §4.5 `executeWithFailover`).
	pub async fn execute_with_failover<Op: SingleShotOperation>(
		&self,
		operation_name: &str,
		providers: &[ResolvedProvider],
		operation: &Op,
	) -> Result<FailoverSuccess<Op::Output>, AllProvidersFailedError> {
		let mut reasons = Vec::new();
		for provider in providers {
			if !self.is_eligible(provider, operation_name) {
				reasons.push((
					provider.name.clone(),
					ErrorDetails::new("provider.skipped", "circuit open or operation unsupported"),
				));
				continue;
			}
			self.ensure_rate_limit_configured(provider).await;
			if let Err(err) = self.rate_limiter.wait_token(&provider.name).await {
				reasons.push((provider.name.clone(), ErrorDetails::new("provider.rate_limit_unconfigured", err.to_string())));
				continue;
			}
			self.sink.record(InstrumentationEvent::RequestStarted {
				provider: provider.name.clone(),
				operation: operation_name.to_string(),
			});
			match operation.call(provider).await {
				Ok(data) => {
					self.circuit_breaker.on_success(&provider.name);
					return Ok(FailoverSuccess { data, provider_name: provider.name.clone() });
				},
				Err(err) => {
					if matches!(err, IngestError::ProviderTransient(_)) {
						self.circuit_breaker.on_failure(&provider.name);
					}
					reasons.push((provider.name.clone(), err.details().clone()));
				},
			}
		}
		Err(AllProvidersFailedError { operation: operation_name.to_string(), reasons })
	}

	/// Streaming failover (spec §4.5 `executeStreaming`). Returns a
	/// `Stream` yielding batches with consistent, resumable cursors.
	pub fn execute_streaming<Op>(
		self: Arc<Self>,
		operation_name: String,
		providers: Vec<ResolvedProvider>,
		operation: Arc<Op>,
		resume_cursor: Option<CursorState>,
		cancellation: CancellationToken,
	) -> ProviderStream<Op>
	where
		Op: StreamingOperation + 'static,
	{
		let dedup_capacity = std::num::NonZeroUsize::new(self.config.dedup_capacity.max(1)).unwrap();
		ProviderStream {
			manager: self,
			operation_name,
			providers,
			operation,
			provider_index: 0,
			cursor: resume_cursor,
			seen_event_ids: LruCache::new(dedup_capacity),
			cancellation,
			pending: None,
		}
	}
}

type PendingFuture<Op> =
	Pin<Box<dyn Future<Output = Result<StreamBatch<<Op as StreamingOperation>::Record>, IngestError>> + Send>>;

/// Hand-rolled `Stream` driving provider failover across batches. Manual
/// `poll_next` rather than a macro, per `engine/src/evm.rs`'s
/// `ConscientiousEvmWebsocketBlockHeaderStream`.
pub struct ProviderStream<Op: StreamingOperation + 'static> {
	manager: Arc<ProviderManager>,
	operation_name: String,
	providers: Vec<ResolvedProvider>,
	operation: Arc<Op>,
	provider_index: usize,
	cursor: Option<CursorState>,
	seen_event_ids: LruCache<String, ()>,
	cancellation: CancellationToken,
	pending: Option<PendingFuture<Op>>,
}

#[derive(Debug)]
pub struct ManagedBatch<T> {
	pub data: Vec<T>,
	pub cursor: CursorState,
	pub is_complete: bool,
	pub provider_name: String,
}

impl<Op: StreamingOperation + 'static> ProviderStream<Op> {
	fn current_provider(&self) -> Option<&ResolvedProvider> {
		self.providers.get(self.provider_index)
	}

	/// Applies a provider's declared replay window to step the cursor
	/// backward, absorbing reorgs/ordering differences when failing over
	/// (spec §4.5, §8 scenario 3).
	fn replayed_cursor_for(&self, provider: &ResolvedProvider) -> Option<CursorState> {
		let previous = self.cursor.as_ref()?;
		let preferred = provider.capabilities.preferred_cursor_type;
		let value = previous.value_for(preferred)?.clone();
		let mut replayed = previous.clone();
		replayed.primary = match (&value, provider.capabilities.replay_window) {
			(CursorValue::BlockNumber(n), ReplayWindow::Blocks(window)) => {
				CursorValue::BlockNumber(n.saturating_sub(u64::from(window)))
			},
			(CursorValue::Timestamp(t), ReplayWindow::Minutes(window)) => {
				CursorValue::Timestamp(*t - chrono::Duration::minutes(i64::from(window)))
			},
			_ => value,
		};
		Some(replayed)
	}

	fn advance_to_next_provider(&mut self, from_provider: &str) {
		let next_index = self.provider_index + 1;
		if let Some(next) = self.providers.get(next_index) {
			self.manager.sink.record(InstrumentationEvent::Failover {
				from_provider: from_provider.to_string(),
				to_provider: next.name.clone(),
				operation: self.operation_name.clone(),
			});
			if let Some(replayed) = self.replayed_cursor_for(next) {
				self.cursor = Some(replayed);
			}
		}
		self.provider_index = next_index;
	}

	fn filter_and_remember(&mut self, batch: StreamBatch<Op::Record>) -> StreamBatch<Op::Record> {
		let data = batch
			.data
			.into_iter()
			.filter(|record| {
				let id = self.operation.event_id(record);
				if self.seen_event_ids.contains(&id) {
					false
				} else {
					self.seen_event_ids.put(id, ());
					true
				}
			})
			.collect();
		StreamBatch { data, is_complete: batch.is_complete }
	}

	fn build_cursor(&self, last_record: &Op::Record, provider_name: &str) -> CursorState {
		let cursors = self.operation.extract_cursors(last_record);
		let preferred = self
			.current_provider()
			.map(|p| p.capabilities.preferred_cursor_type)
			.unwrap_or(CursorType::Timestamp);
		let primary = cursors
			.get(&preferred)
			.or_else(|| cursors.values().next())
			.cloned()
			.unwrap_or_else(|| CursorValue::Offset(0));
		let mut state = CursorState::new(primary, provider_name, Utc::now());
		for value in cursors.into_values() {
			state = state.with_alternative(value);
		}
		state
	}
}

impl<Op: StreamingOperation + 'static> Stream for ProviderStream<Op> {
	type Item = Result<ManagedBatch<Op::Record>, IngestError>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let this = self.get_mut();

		if this.cancellation.is_cancelled() {
			// Never advances the cursor past the last committed batch
			// (spec §5); we simply stop yielding.
			return Poll::Ready(Some(Err(IngestError::Cancelled(ErrorDetails::new(
				"stream.cancelled",
				"import was cancelled",
			)))));
		}

		loop {
			if this.pending.is_none() {
				let Some(provider) = this.current_provider().cloned() else {
					return Poll::Ready(Some(Err(IngestError::AllProvidersFailed(ErrorDetails::new(
						"stream.all_providers_failed",
						format!("no remaining providers for {}", this.operation_name),
					)))));
				};
				if !this.manager.is_eligible(&provider, &this.operation_name) {
					this.advance_to_next_provider(&provider.name);
					continue;
				}
				let operation = this.operation.clone();
				let cursor = this.cursor.clone();
				let manager = this.manager.clone();
				let fut: PendingFuture<Op> = Box::pin(async move {
					manager.ensure_rate_limit_configured(&provider).await;
					manager.rate_limiter.wait_token(&provider.name).await.map_err(|err| {
						IngestError::ProviderTransient(ErrorDetails::new("provider.rate_limit_unconfigured", err.to_string()))
					})?;
					operation.fetch_batch(&provider, cursor.as_ref()).await
				});
				this.pending = Some(fut);
			}

			let fut = this.pending.as_mut().expect("just ensured pending future exists");
			match fut.as_mut().poll(cx) {
				Poll::Pending => return Poll::Pending,
				Poll::Ready(result) => {
					this.pending = None;
					let provider_name = this.current_provider().map(|p| p.name.clone()).unwrap_or_default();
					match result {
						Ok(batch) => {
							this.manager.circuit_breaker.on_success(&provider_name);
							let filtered = this.filter_and_remember(batch);
							let cursor = match filtered.data.last() {
								Some(last) => this.build_cursor(last, &provider_name),
								None => this.cursor.clone().unwrap_or_else(|| {
									CursorState::new(CursorValue::Offset(0), &provider_name, Utc::now())
								}),
							};
							this.cursor = Some(cursor.clone());
							return Poll::Ready(Some(Ok(ManagedBatch {
								data: filtered.data,
								cursor,
								is_complete: filtered.is_complete,
								provider_name,
							})));
						},
						Err(err) if matches!(err, IngestError::Cancelled(_)) => {
							return Poll::Ready(Some(Err(err)));
						},
						Err(err) => {
							this.manager.circuit_breaker.on_failure(&provider_name);
							this.advance_to_next_provider(&provider_name);
							// Loop back around: try the next provider
							// immediately, invisibly to the consumer
							// except via the Failover instrumentation
							// event already recorded (spec §4.5).
							tracing::warn!(provider_name, error = %err, "provider failed mid-stream, failing over");
							continue;
						},
					}
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use exitbook_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
	use exitbook_ratelimit::{RateLimitConfig, RateLimiter};
	use tokio_stream::StreamExt;

	use super::*;
	use crate::registry::{Capabilities, EnvReader, FactoryConfig, ProviderDescriptor, Registry};

	struct NoEnv;

	impl EnvReader for NoEnv {
		fn get(&self, _key: &str) -> Option<String> {
			None
		}
	}

	fn provider(name: &str, priority: i32) -> ResolvedProvider {
		let mut base_urls = BTreeMap::new();
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
			priority,
			capabilities: Capabilities {
				supported_operations: vec!["fetch_transfers".to_string()],
				supported_cursor_types: vec![CursorType::BlockNumber],
				preferred_cursor_type: CursorType::BlockNumber,
				replay_window: ReplayWindow::Blocks(2),
			},
		});
		registry.resolve("ethereum", &FactoryConfig::default(), &NoEnv).unwrap().remove(0)
	}

	fn manager() -> Arc<ProviderManager> {
		Arc::new(ProviderManager::new(
			Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
			Arc::new(RateLimiter::new()),
		))
	}

	struct FlakyOp {
		succeed_on_call: u32,
		calls: AtomicU32,
	}

	#[async_trait]
	impl SingleShotOperation for FlakyOp {
		type Output = String;

		async fn call(&self, provider: &ResolvedProvider) -> Result<Self::Output, IngestError> {
			let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
			if call_index < self.succeed_on_call {
				Err(IngestError::ProviderTransient(ErrorDetails::new("boom", "provider unreachable")))
			} else {
				Ok(provider.name.clone())
			}
		}
	}

	#[tokio::test]
	async fn execute_with_failover_tries_the_next_provider_after_a_failure() {
		let manager = manager();
		let providers = vec![provider("a", 0), provider("b", 1)];
		let op = FlakyOp { succeed_on_call: 1, calls: AtomicU32::new(0) };

		let result = manager.execute_with_failover("fetch_transfers", &providers, &op).await.unwrap();
		assert_eq!(result.provider_name, "b");
		assert_eq!(result.data, "b");
	}

	#[tokio::test]
	async fn execute_with_failover_reports_every_provider_when_all_fail() {
		let manager = manager();
		let providers = vec![provider("a", 0), provider("b", 1)];
		let op = FlakyOp { succeed_on_call: u32::MAX, calls: AtomicU32::new(0) };

		let err = manager.execute_with_failover("fetch_transfers", &providers, &op).await.unwrap_err();
		assert_eq!(err.reasons.len(), 2);
	}

	#[derive(Clone)]
	struct Rec {
		id: String,
		block: u64,
	}

	struct ScriptedOp {
		fail_provider: String,
	}

	#[async_trait]
	impl StreamingOperation for ScriptedOp {
		type Record = Rec;

		async fn fetch_batch(
			&self,
			provider: &ResolvedProvider,
			_cursor: Option<&CursorState>,
		) -> Result<StreamBatch<Self::Record>, IngestError> {
			if provider.name == self.fail_provider {
				return Err(IngestError::ProviderTransient(ErrorDetails::new("boom", "provider down")));
			}
			Ok(StreamBatch {
				data: vec![Rec { id: "e1".to_string(), block: 10 }, Rec { id: "e2".to_string(), block: 11 }],
				is_complete: true,
			})
		}

		fn event_id(&self, record: &Self::Record) -> String {
			record.id.clone()
		}

		fn extract_cursors(&self, record: &Self::Record) -> BTreeMap<CursorType, CursorValue> {
			let mut cursors = BTreeMap::new();
			cursors.insert(CursorType::BlockNumber, CursorValue::BlockNumber(record.block));
			cursors
		}
	}

	#[tokio::test]
	async fn streaming_fails_over_to_the_next_provider_on_error() {
		let manager = manager();
		let providers = vec![provider("a", 0), provider("b", 1)];
		let op = Arc::new(ScriptedOp { fail_provider: "a".to_string() });

		let mut stream =
			manager.execute_streaming("fetch_transfers".to_string(), providers, op, None, CancellationToken::new());

		let batch = stream.next().await.unwrap().unwrap();
		assert_eq!(batch.provider_name, "b");
		assert_eq!(batch.data.len(), 2);
	}

	struct RepeatingOp {
		calls: AtomicU32,
	}

	#[async_trait]
	impl StreamingOperation for RepeatingOp {
		type Record = Rec;

		async fn fetch_batch(
			&self,
			_provider: &ResolvedProvider,
			_cursor: Option<&CursorState>,
		) -> Result<StreamBatch<Self::Record>, IngestError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst);
			if call == 0 {
				Ok(StreamBatch {
					data: vec![Rec { id: "e1".to_string(), block: 1 }, Rec { id: "e2".to_string(), block: 2 }],
					is_complete: false,
				})
			} else {
				Ok(StreamBatch {
					data: vec![Rec { id: "e2".to_string(), block: 2 }, Rec { id: "e3".to_string(), block: 3 }],
					is_complete: true,
				})
			}
		}

		fn event_id(&self, record: &Self::Record) -> String {
			record.id.clone()
		}

		fn extract_cursors(&self, record: &Self::Record) -> BTreeMap<CursorType, CursorValue> {
			let mut cursors = BTreeMap::new();
			cursors.insert(CursorType::BlockNumber, CursorValue::BlockNumber(record.block));
			cursors
		}
	}

	#[tokio::test]
	async fn streaming_drops_an_event_id_already_seen_in_an_earlier_batch() {
		let manager = manager();
		let providers = vec![provider("only", 0)];
		let op = Arc::new(RepeatingOp { calls: AtomicU32::new(0) });

		let mut stream =
			manager.execute_streaming("fetch_transfers".to_string(), providers, op, None, CancellationToken::new());

		let first = stream.next().await.unwrap().unwrap();
		assert_eq!(first.data.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec!["e1", "e2"]);

		let second = stream.next().await.unwrap().unwrap();
		assert_eq!(second.data.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), vec!["e3"]);
	}

	#[tokio::test]
	async fn streaming_stops_with_a_cancelled_error_once_the_token_fires() {
		let manager = manager();
		let providers = vec![provider("only", 0)];
		let op = Arc::new(RepeatingOp { calls: AtomicU32::new(0) });
		let cancellation = CancellationToken::new();
		cancellation.cancel();

		let mut stream = manager.execute_streaming("fetch_transfers".to_string(), providers, op, None, cancellation);

		let outcome = stream.next().await.unwrap();
		assert!(matches!(outcome, Err(IngestError::Cancelled(_))));
	}
}
