//! Four-stage price enrichment pipeline (spec §4.9): derive, normalize,
//! fetch, derive again. Each stage is optional via [`EnrichOptions`]; every
//! write goes through [`exitbook_domain::price::PriceAtTxTime::resolve_write`]
//! so a run can never downgrade a movement's price source, only raise it.

pub mod fiat;
pub mod pipeline;
pub mod providers;

pub use pipeline::{EnrichOptions, EnrichStats, FxMissingBehavior, Pipeline};
pub use providers::{CryptoPriceProvider, FxRateProvider, InteractiveFxPrompt};
