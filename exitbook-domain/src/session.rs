use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetails;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
	Started,
	Completed,
	Failed,
	Cancelled,
}

impl SessionStatus {
	pub fn is_terminal(self) -> bool {
		!matches!(self, Self::Started)
	}
}

/// One run of an import for one account (spec §3).
///
/// Invariant: sessions are immutable once terminal; counts reflect records
/// actually committed, never records merely fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
	pub id: Uuid,
	pub account_id: Uuid,
	pub status: SessionStatus,
	pub started_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
	pub duration_ms: Option<i64>,
	pub transactions_imported: u64,
	pub transactions_failed: u64,
	pub error_message: Option<String>,
	pub error_details: Option<ErrorDetails>,
	pub import_result_metadata: serde_json::Value,
}

impl ImportSession {
	pub fn start(id: Uuid, account_id: Uuid, now: DateTime<Utc>) -> Self {
		Self {
			id,
			account_id,
			status: SessionStatus::Started,
			started_at: now,
			completed_at: None,
			duration_ms: None,
			transactions_imported: 0,
			transactions_failed: 0,
			error_message: None,
			error_details: None,
			import_result_metadata: serde_json::Value::Null,
		}
	}

	/// Transitions to a terminal status. Panics if called twice — per the
	/// invariant, a session is immutable once terminal, so a second call
	/// from otherwise-correct code is an internal bug, not user error.
	pub fn finish(&mut self, status: SessionStatus, now: DateTime<Utc>) {
		assert!(!self.status.is_terminal(), "import session {} is already terminal", self.id);
		assert!(status.is_terminal(), "finish() requires a terminal status");
		self.status = status;
		self.completed_at = Some(now);
		self.duration_ms = Some((now - self.started_at).num_milliseconds());
	}

	pub fn fail(&mut self, now: DateTime<Utc>, error: ErrorDetails) {
		self.error_message = Some(error.message.clone());
		self.error_details = Some(error);
		self.finish(SessionStatus::Failed, now);
	}
}
