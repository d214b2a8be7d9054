//! At-least-once-with-idempotent-dedup import service (spec §4.7 steps
//! 1-5).

use std::sync::Arc;

use chrono::Utc;
use exitbook_domain::{
	error::IngestError,
	session::{ImportSession, SessionStatus},
	RawTransaction,
};
use exitbook_persistence::{accounts, locks, raw_transactions, sessions, Store};
use exitbook_providers::{ProviderManager, ResolvedProvider, StreamingOperation};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Builds a [`RawTransaction`] from one provider record. One implementation
/// per (source, operation) pair, supplied by `exitbook-core` at wiring
/// time — the service itself is generic over `Op::Record` and has no
/// source-specific knowledge (spec §9 "tagged variants for polymorphism").
pub trait RawTransactionMapper<Op: StreamingOperation>: Send + Sync {
	fn to_raw(&self, record: &Op::Record, account_id: Uuid, provider_name: &str, event_id: String) -> RawTransaction;
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
	pub session_id: Uuid,
	pub transactions_imported: u64,
	pub status: SessionStatus,
}

pub struct ImportService {
	store: Store,
	manager: Arc<ProviderManager>,
}

impl ImportService {
	pub fn new(store: Store, manager: Arc<ProviderManager>) -> Self {
		Self { store, manager }
	}

	/// Runs one streaming import to completion, cancellation, or terminal
	/// error (spec §4.7). Rejects a concurrent run on the same account via
	/// the advisory lock rather than interleaving their cursor writes.
	pub async fn run<Op, M>(
		&self,
		account_id: Uuid,
		operation_name: &str,
		providers: Vec<ResolvedProvider>,
		operation: Arc<Op>,
		mapper: &M,
		cancellation: CancellationToken,
	) -> Result<ImportOutcome, IngestError>
	where
		Op: StreamingOperation + 'static,
		M: RawTransactionMapper<Op>,
	{
		let pool = self.store.pool();
		let mut session = ImportSession::start(Uuid::new_v4(), account_id, Utc::now());
		let lock = locks::acquire(pool, account_id, session.id).await?;
		sessions::start(pool, &session).await?;

		let result = self.drive_stream(account_id, operation_name, providers, operation, mapper, cancellation, &mut session).await;

		match result {
			Ok(()) => session.finish(SessionStatus::Completed, Utc::now()),
			Err(ref err) if err.is_cancellation() => session.finish(SessionStatus::Cancelled, Utc::now()),
			Err(ref err) => session.fail(Utc::now(), err.details().clone()),
		}
		sessions::finish(pool, &session).await?;
		lock.release().await?;

		if let Err(err) = result {
			if !err.is_cancellation() && !err.is_partial_commit_eligible() {
				return Err(err);
			}
		}
		Ok(ImportOutcome { session_id: session.id, transactions_imported: session.transactions_imported, status: session.status })
	}

	async fn drive_stream<Op, M>(
		&self,
		account_id: Uuid,
		operation_name: &str,
		providers: Vec<ResolvedProvider>,
		operation: Arc<Op>,
		mapper: &M,
		cancellation: CancellationToken,
		session: &mut ImportSession,
	) -> Result<(), IngestError>
	where
		Op: StreamingOperation + 'static,
		M: RawTransactionMapper<Op>,
	{
		let pool = self.store.pool();
		let account = accounts::get(pool, account_id).await?;
		let resume_cursor = account.cursor_for(operation_name).cloned();

		let mut stream =
			self.manager.clone().execute_streaming(operation_name.to_string(), providers, operation.clone(), resume_cursor, cancellation);

		while let Some(item) = stream.next().await {
			let batch = item?;
			let raws: Vec<RawTransaction> = batch
				.data
				.iter()
				.map(|record| {
					let event_id = operation.event_id(record);
					mapper.to_raw(record, account_id, &batch.provider_name, event_id)
				})
				.collect();

			let outcome = raw_transactions::insert_batch_and_advance_cursor(pool, account_id, operation_name, &raws, &batch.cursor).await?;
			session.transactions_imported += outcome.inserted;

			if batch.is_complete {
				break;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::{
		collections::BTreeMap,
		sync::atomic::{AtomicU32, Ordering},
	};

	use async_trait::async_trait;
	use exitbook_circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
	use exitbook_domain::{
		cursor::{CursorState, CursorType, CursorValue},
		error::ErrorDetails,
		Account, AccountType,
	};
	use exitbook_providers::{Capabilities, EnvReader, FactoryConfig, ProviderDescriptor, Registry, ReplayWindow, StreamBatch};
	use exitbook_ratelimit::{RateLimitConfig, RateLimiter};

	use super::*;

	#[derive(Clone)]
	struct Rec {
		id: String,
		block: u64,
	}

	struct TwoBatchOp {
		calls: AtomicU32,
	}

	#[async_trait]
	impl StreamingOperation for TwoBatchOp {
		type Record = Rec;

		async fn fetch_batch(
			&self,
			_provider: &ResolvedProvider,
			_cursor: Option<&CursorState>,
		) -> Result<exitbook_providers::StreamBatch<Self::Record>, IngestError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst);
			if call == 0 {
				Ok(StreamBatch { data: vec![Rec { id: "e1".to_string(), block: 1 }], is_complete: false })
			} else {
				Ok(StreamBatch { data: vec![Rec { id: "e2".to_string(), block: 2 }], is_complete: true })
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

	struct RecMapper;

	impl RawTransactionMapper<TwoBatchOp> for RecMapper {
		fn to_raw(&self, record: &Rec, account_id: Uuid, provider_name: &str, event_id: String) -> RawTransaction {
			RawTransaction {
				id: Uuid::new_v4(),
				account_id,
				provider_name: provider_name.to_string(),
				source_address: None,
				transaction_type_hint: None,
				event_id,
				blockchain_transaction_hash: Some(record.id.clone()),
				timestamp: Utc::now(),
				provider_data: serde_json::json!({"block": record.block}),
				normalized_data: serde_json::json!({"block": record.block}),
				processing_status: exitbook_domain::ProcessingStatus::Pending,
				processed_at: None,
				created_at: Utc::now(),
			}
		}
	}

	struct NoEnv;
	impl EnvReader for NoEnv {
		fn get(&self, _key: &str) -> Option<String> {
			None
		}
	}

	fn test_providers() -> Vec<ResolvedProvider> {
		let mut base_urls = BTreeMap::new();
		base_urls.insert("ethereum".to_string(), "https://only.example".to_string());
		let mut registry = Registry::default();
		registry.register(ProviderDescriptor {
			name: "only".to_string(),
			display_name: "only".to_string(),
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
		registry.resolve("ethereum", &FactoryConfig::default(), &NoEnv).unwrap()
	}

	async fn seeded_account(store: &Store) -> Uuid {
		let account = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::Blockchain, "ethereum", "0xabc");
		accounts::create(store.pool(), &account).await.unwrap();
		account.id
	}

	fn manager() -> Arc<ProviderManager> {
		Arc::new(ProviderManager::new(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())), Arc::new(RateLimiter::new())))
	}

	#[tokio::test]
	async fn a_completed_stream_commits_every_batch_and_marks_the_session_completed() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let service = ImportService::new(store.clone(), manager());
		let op = Arc::new(TwoBatchOp { calls: AtomicU32::new(0) });

		let outcome = service
			.run(account_id, "evm.transfers", test_providers(), op, &RecMapper, CancellationToken::new())
			.await
			.unwrap();

		assert_eq!(outcome.status, SessionStatus::Completed);
		assert_eq!(outcome.transactions_imported, 2);

		let account = accounts::get(store.pool(), account_id).await.unwrap();
		assert!(account.cursor_for("evm.transfers").is_some());
	}

	#[tokio::test]
	async fn a_second_concurrent_run_on_the_same_account_is_rejected() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let _held = locks::acquire(store.pool(), account_id, Uuid::new_v4()).await.unwrap();

		let service = ImportService::new(store.clone(), manager());
		let op = Arc::new(TwoBatchOp { calls: AtomicU32::new(0) });
		let err =
			service.run(account_id, "evm.transfers", test_providers(), op, &RecMapper, CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, IngestError::Validation(_)));
	}

	#[tokio::test]
	async fn a_cancelled_stream_marks_the_session_cancelled_without_failing_the_call() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let service = ImportService::new(store.clone(), manager());
		let op = Arc::new(TwoBatchOp { calls: AtomicU32::new(0) });
		let cancellation = CancellationToken::new();
		cancellation.cancel();

		let outcome = service.run(account_id, "evm.transfers", test_providers(), op, &RecMapper, cancellation).await.unwrap();
		assert_eq!(outcome.status, SessionStatus::Cancelled);
		assert_eq!(outcome.transactions_imported, 0);
	}
}
