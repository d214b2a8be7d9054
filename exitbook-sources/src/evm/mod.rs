//! Blockchain provider clients: EVM transfer fan-out across three transfer
//! kinds (normal, internal, token) from one address (spec §4.6, §8 scenario
//! 2). Grounded in the teacher's split between a transport-level RPC client
//! and a retry/failover-aware wrapper (`engine/src/evm/rpc.rs` +
//! `evm/retry_rpc.rs`): [`EvmProviderTransport`] is the transport, concrete
//! to one provider's wire format; [`EvmProviderClient`] is the wrapper,
//! generic over any registered transport and handed to the provider
//! manager as a single [`exitbook_providers::StreamingOperation`].

mod providers;
mod transport;

pub use providers::{AlchemyLikeProvider, EtherscanLikeProvider};
pub use transport::{EvmProviderClient, EvmProviderTransport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvmTransferKind {
	Normal,
	Internal,
	Token,
}

/// One EVM transfer, of any kind. `trace_index`/`log_index` only apply to
/// `Internal`/`Token` respectively — they exist to give those kinds an
/// event ID distinct from the normal transaction sharing the same hash
/// (spec §8 scenario 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvmTransferRecord {
	pub kind: EvmTransferKind,
	pub hash: String,
	pub trace_index: Option<u32>,
	pub log_index: Option<u32>,
	pub block_number: u64,
	pub timestamp: DateTime<Utc>,
	pub from: String,
	pub to: String,
	pub asset_symbol: String,
	pub amount: f64,
	pub raw: serde_json::Value,
}

impl EvmTransferRecord {
	pub fn event_id(&self) -> String {
		match self.kind {
			EvmTransferKind::Normal => self.hash.clone(),
			EvmTransferKind::Internal => format!("{}:internal:{}", self.hash, self.trace_index.unwrap_or_default()),
			EvmTransferKind::Token => format!("{}:token:{}", self.hash, self.log_index.unwrap_or_default()),
		}
	}
}
