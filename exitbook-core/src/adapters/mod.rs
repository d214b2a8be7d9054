//! Concrete [`exitbook_processor::SourceAdapter`]/[`exitbook_import::service::RawTransactionMapper`]
//! pairs for the providers wired in by [`crate::wiring`]. One submodule per
//! source family, matching the registry's own grouping (spec §8 scenarios
//! 1-2).

pub mod evm;
pub mod kraken;

pub use evm::{user_addresses as evm_user_addresses, EvmRawTransactionMapper, EvmSourceAdapter};
pub use kraken::{KrakenRawTransactionMapper, KrakenSourceAdapter};
