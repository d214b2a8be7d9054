//! Per-source correlation, fund-flow classification and canonical
//! `Transaction` production (spec §4.8).
//!
//! One [`SourceAdapter`] per (blockchain adapter or exchange adapter)
//! supplies the source-specific parts — how raws correlate, how a
//! correlated group turns into movements/fees — while [`Processor`] owns
//! the parts that are the same everywhere: loading the pending set,
//! consolidating, classifying the default way unless the adapter overrides
//! it, writing the batch atomically, and marking raws processed only after
//! that write succeeds.

pub mod classify;
pub mod processor;

pub use classify::{default_classify, SourceAdapter};
pub use processor::{ProcessOutcome, Processor};
