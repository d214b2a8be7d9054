//! Error taxonomy shared across the ingestion core (spec §7).
//!
//! Each crate below `exitbook-domain` is free to define its own leaf error
//! enum, but every leaf error is convertible into an [`IngestError`] so that
//! the import service and orchestrator can make commit/discard decisions
//! without matching on crate-specific types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured, serializable detail attached to an [`IngestError`]. Stored
/// verbatim in `import_session_errors` and `import_sessions.error_details`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorDetails {
	pub code: String,
	pub message: String,
	pub context: serde_json::Value,
}

impl ErrorDetails {
	pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { code: code.into(), message: message.into(), context: serde_json::Value::Null }
	}

	pub fn with_context(mut self, context: serde_json::Value) -> Self {
		self.context = context;
		self
	}
}

/// The error taxonomy from spec §7. Every fallible ingestion-core operation
/// eventually produces one of these, not an ad-hoc string.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum IngestError {
	/// Input failed a declared schema: credentials, provider config, a
	/// mapped raw record, or a normalized output. No retry.
	#[error("validation failed: {0}")]
	Validation(ErrorDetails),

	/// Network/5xx/timeout. Retried by the HTTP client; if retries are
	/// exhausted this becomes a provider failover trigger, not a terminal
	/// error for the caller.
	#[error("provider transient error: {0}")]
	ProviderTransient(ErrorDetails),

	/// 4xx other than 429. The provider is capability-mismatched or the
	/// credentials are bad for this session; triggers failover, not retry.
	#[error("provider terminal error: {0}")]
	ProviderTerminal(ErrorDetails),

	/// 429. Honors `Retry-After`; does not count as a circuit failure.
	#[error("rate limited: {0}")]
	RateLimited(ErrorDetails),

	/// Every provider in the ordered list was exhausted for one operation.
	#[error("all providers failed: {0}")]
	AllProvidersFailed(ErrorDetails),

	/// The stream yielded some valid records, then errored. Carries the
	/// cause so the import service can commit-partial-and-stop.
	#[error("partial import: {0}")]
	PartialImport(ErrorDetails),

	/// Distinguished from failure: the caller's context was cancelled.
	#[error("cancelled: {0}")]
	Cancelled(ErrorDetails),

	/// A correctness invariant was violated (e.g. cursor regression). This
	/// is a bug, not an expected failure mode.
	#[error("internal invariant violated: {0}")]
	InternalInvariant(ErrorDetails),
}

impl fmt::Display for ErrorDetails {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[{}] {}", self.code, self.message)
	}
}

impl IngestError {
	pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::Validation(ErrorDetails::new(code, message))
	}

	pub fn internal_invariant(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::InternalInvariant(ErrorDetails::new(code, message))
	}

	/// Whether this error, surfaced mid-stream, should make the import
	/// service commit the partial batch it already has rather than discard
	/// it outright.
	pub fn is_partial_commit_eligible(&self) -> bool {
		matches!(self, Self::PartialImport(_))
	}

	pub fn is_cancellation(&self) -> bool {
		matches!(self, Self::Cancelled(_))
	}

	pub fn details(&self) -> &ErrorDetails {
		match self {
			Self::Validation(d)
			| Self::ProviderTransient(d)
			| Self::ProviderTerminal(d)
			| Self::RateLimited(d)
			| Self::AllProvidersFailed(d)
			| Self::PartialImport(d)
			| Self::Cancelled(d)
			| Self::InternalInvariant(d) => d,
		}
	}
}
