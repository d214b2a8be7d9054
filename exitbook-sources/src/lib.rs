//! Source clients: the provider-specific edge of ingestion (spec §4.6).
//!
//! Every concrete client in this crate implements
//! [`exitbook_providers::StreamingOperation`] directly rather than through an
//! extra indirection layer — `fetch_batch`/`event_id`/`extract_cursors` is
//! already exactly the "fetch records, derive cursors, name a dedup key"
//! contract a source needs, and the provider manager already owns
//! cross-provider replay-window application (`ProviderStream::replayed_cursor_for`),
//! so a source never needs to apply one itself.

pub mod evm;
pub mod exchange;
pub mod registry;

pub use evm::{AlchemyLikeProvider, EtherscanLikeProvider, EvmProviderClient, EvmProviderTransport, EvmTransferKind, EvmTransferRecord};
pub use exchange::{
	ExchangeLedgerEntry, ExchangeLedgerOperation, ExchangeLedgerSource, KrakenApiClient, KrakenCsvClient, LedgerEntryStatus,
	LedgerEntryType,
};
pub use registry::{alchemy_like_descriptor, etherscan_like_descriptor, kraken_api_descriptor, kraken_csv_descriptor};
