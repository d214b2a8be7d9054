use exitbook_domain::error::{ErrorDetails, IngestError};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),

	#[error("malformed stored json in column {column}: {source}")]
	MalformedJson { column: &'static str, #[source] source: serde_json::Error },

	#[error("account {account_id} is already locked by an in-progress session")]
	AccountAlreadyLocked { account_id: uuid::Uuid },

	#[error("cursor for account {account_id} operation {operation:?} would regress")]
	CursorWouldRegress { account_id: uuid::Uuid, operation: String },

	#[error("no row found: {0}")]
	NotFound(&'static str),
}

impl PersistenceError {
	pub fn json(column: &'static str, source: serde_json::Error) -> Self {
		Self::MalformedJson { column, source }
	}
}

/// Every persistence failure is a validation-shaped `IngestError` (spec
/// §7): a bad row is never retriable and never triggers provider failover,
/// it is a data problem the caller must stop and look at.
impl From<PersistenceError> for IngestError {
	fn from(err: PersistenceError) -> Self {
		IngestError::Validation(ErrorDetails::new("persistence.error", err.to_string()))
	}
}
