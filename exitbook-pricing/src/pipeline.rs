//! The four enrichment stages themselves (spec §4.9) and the priority-write
//! rule every stage obeys: a write only lands if its source strictly
//! outranks whatever is already there (or nothing is there yet).

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use exitbook_domain::{
	error::{ErrorDetails, IngestError},
	overrides::unlink_fingerprint,
	price::{Money, PriceAtTxTime, PriceGranularity, PriceSource},
	transaction::OperationCategory,
	Transaction,
};
use exitbook_persistence::{links, overrides, prices, transactions, Store};
use uuid::Uuid;

use crate::{fiat::is_fiat, CryptoPriceProvider, FxRateProvider, InteractiveFxPrompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FxMissingBehavior {
	/// Fall back to an interactive prompt if one is configured; a rate
	/// still missing after that is reported but does not abort the run.
	Prompt,
	/// Abort Stage 2 (and the rest of the pipeline) the moment any rate
	/// is missing, surfacing every failure found so far (spec §8 scenario
	/// 4).
	Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichOptions {
	pub run_derive: bool,
	pub run_normalize: bool,
	pub run_fetch: bool,
	pub run_derive2: bool,
	pub on_missing_fx: FxMissingBehavior,
}

impl Default for EnrichOptions {
	fn default() -> Self {
		Self { run_derive: true, run_normalize: true, run_fetch: true, run_derive2: true, on_missing_fx: FxMissingBehavior::Prompt }
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnrichStats {
	pub derive: u32,
	pub normalize: u32,
	pub fetch: u32,
	pub derive2: u32,
}

pub struct Pipeline {
	store: Store,
	fx_provider: Option<Arc<dyn FxRateProvider>>,
	interactive_fx: Option<Arc<dyn InteractiveFxPrompt>>,
	crypto_provider: Option<Arc<dyn CryptoPriceProvider>>,
}

impl Pipeline {
	pub fn new(store: Store) -> Self {
		Self { store, fx_provider: None, interactive_fx: None, crypto_provider: None }
	}

	pub fn with_fx_provider(mut self, provider: Arc<dyn FxRateProvider>) -> Self {
		self.fx_provider = Some(provider);
		self
	}

	pub fn with_interactive_fx(mut self, prompt: Arc<dyn InteractiveFxPrompt>) -> Self {
		self.interactive_fx = Some(prompt);
		self
	}

	pub fn with_crypto_provider(mut self, provider: Arc<dyn CryptoPriceProvider>) -> Self {
		self.crypto_provider = Some(provider);
		self
	}

	/// Runs the requested stages over every transaction in `user_id`'s
	/// account tree carrying an unpriced movement or fee, then persists
	/// every transaction touched in one batch (spec §4.8's
	/// abort-the-whole-batch discipline applies here too — a save failure
	/// at the end discards the whole run's derived prices, never a
	/// partial set).
	pub async fn run(&self, user_id: Uuid, options: EnrichOptions) -> Result<EnrichStats, IngestError> {
		let overrides_state = overrides::fold_effective_state(self.store.pool(), user_id).await?;
		let mut txs = load_working_set(&self.store).await?;
		load_override_targets(&self.store, &mut txs, &overrides_state).await?;
		apply_overrides(&mut txs, &overrides_state);

		let mut stats = EnrichStats::default();
		if options.run_derive {
			stats.derive = derive_pass(&mut txs) + propagate_links(&self.store, &mut txs, &overrides_state).await?;
		}
		if options.run_normalize {
			stats.normalize =
				normalize_pass(&mut txs, self.fx_provider.as_deref(), self.interactive_fx.as_deref(), options.on_missing_fx).await?;
		}
		if options.run_fetch {
			stats.fetch = fetch_pass(&self.store, &mut txs, self.crypto_provider.as_deref()).await?;
		}
		if options.run_derive2 {
			stats.derive2 = derive_pass(&mut txs) + propagate_links(&self.store, &mut txs, &overrides_state).await?;
		}

		let changed: Vec<Transaction> = txs.into_values().collect();
		transactions::upsert_all(self.store.pool(), &changed).await?;
		Ok(stats)
	}
}

async fn load_working_set(store: &Store) -> Result<HashMap<Uuid, Transaction>, IngestError> {
	let unpriced = transactions::list_with_unpriced_items(store.pool()).await?;
	Ok(unpriced.into_iter().map(|tx| (tx.id, tx)).collect())
}

/// Pulls in every transaction a user override targets, even one that is
/// already fully priced — `list_with_unpriced_items` alone would silently
/// drop a scam flag or price pin on such a transaction, since nothing else
/// would ever load it into the working set for [`apply_overrides`] to act
/// on (spec §3 `ScamFlag`/`PriceOverride`: both must win unconditionally,
/// not only when the target happens to still have an unpriced slot).
async fn load_override_targets(
	store: &Store,
	txs: &mut HashMap<Uuid, Transaction>,
	overrides_state: &overrides::EffectiveOverrides,
) -> Result<(), IngestError> {
	let target_ids = overrides_state.scam_flagged.iter().copied().chain(overrides_state.price_overrides.keys().map(|(tx_id, _)| *tx_id));
	for id in target_ids {
		if txs.contains_key(&id) {
			continue;
		}
		match transactions::get(store.pool(), id).await {
			Ok(tx) => {
				txs.insert(id, tx);
			},
			Err(exitbook_persistence::PersistenceError::NotFound(_)) => {},
			Err(err) => return Err(err.into()),
		}
	}
	Ok(())
}

/// One priceable slot: an asset symbol, its gross amount (needed for
/// Stage 1's ratio derivation) and a mutable handle to its price field.
/// Movements and fees are both priceable (spec §3), so this flattens both.
struct Slot<'a> {
	asset_symbol: String,
	price: &'a mut Option<PriceAtTxTime>,
}

fn slots_mut(tx: &mut Transaction) -> Vec<Slot<'_>> {
	let mut out = Vec::new();
	for m in tx.movements.inflows.iter_mut() {
		out.push(Slot { asset_symbol: m.asset_symbol.clone(), price: &mut m.price_at_tx_time });
	}
	for m in tx.movements.outflows.iter_mut() {
		out.push(Slot { asset_symbol: m.asset_symbol.clone(), price: &mut m.price_at_tx_time });
	}
	for f in tx.fees.iter_mut() {
		out.push(Slot { asset_symbol: f.asset_symbol.clone(), price: &mut f.price_at_tx_time });
	}
	out
}

/// Applies the priority-monotonic write rule (spec §4.9 state machine):
/// writes only if `candidate`'s source strictly outranks whatever is
/// already in `slot`, or nothing is there yet. Returns whether it wrote.
fn write_price(slot: &mut Option<PriceAtTxTime>, candidate: PriceAtTxTime) -> bool {
	let allowed = PriceAtTxTime::resolve_write(slot.as_ref(), &candidate).is_some();
	if allowed {
		*slot = Some(candidate);
	}
	allowed
}

/// User overrides win unconditionally over anything the pipeline derives
/// (spec §3, §9's conservative reading of priority 3). Applied before any
/// stage runs: every subsequent stage writes at priority ≤ 3 via
/// [`write_price`], which can never outrank an override already sitting at
/// priority 3 — so this bootstrap alone is enough to protect it for the
/// rest of the run.
fn apply_overrides(txs: &mut HashMap<Uuid, Transaction>, overrides_state: &overrides::EffectiveOverrides) {
	let now = Utc::now();
	for tx in txs.values_mut() {
		if overrides_state.is_scam_flagged(tx.id) {
			tx.excluded_from_accounting = true;
		}
		let tx_id = tx.id;
		for slot in slots_mut(tx) {
			if let Some(money) = overrides_state.price_for(tx_id, &slot.asset_symbol) {
				*slot.price = Some(PriceAtTxTime::new(money.clone(), PriceSource::UserProvided, now, PriceGranularity::Exact));
			}
		}
	}
}

/// Stage 1 / Stage 4 (spec §4.9): for a trade-shaped transaction with
/// exactly one fiat leg, stamp both legs; for anything else, stamp any
/// fiat movement or fee on its own. Returns how many prices were newly
/// written.
fn derive_pass(txs: &mut HashMap<Uuid, Transaction>) -> u32 {
	txs.values_mut().map(derive_one).sum()
}

fn derive_one(tx: &mut Transaction) -> u32 {
	let mut written = if tx.operation.category == OperationCategory::Trade { derive_trade_sides(tx) } else { derive_single_leg_movements(tx) };
	written += derive_single_leg_fees(tx);
	written
}

fn identity_source(currency: &str) -> PriceSource {
	if currency.eq_ignore_ascii_case("USD") {
		PriceSource::ExchangeExecution
	} else {
		PriceSource::FiatExecutionTentative
	}
}

fn derive_trade_sides(tx: &mut Transaction) -> u32 {
	if tx.movements.inflows.len() != 1 || tx.movements.outflows.len() != 1 {
		return 0;
	}
	let inflow_is_fiat = is_fiat(&tx.movements.inflows[0].asset_symbol);
	let outflow_is_fiat = is_fiat(&tx.movements.outflows[0].asset_symbol);
	if inflow_is_fiat == outflow_is_fiat {
		// Both fiat (FX trade) or both crypto (swap): no ratio to derive here,
		// Stage 3 prices the crypto leg(s) directly.
		return 0;
	}

	let datetime = tx.datetime;
	let mut written = 0u32;
	let (fiat_movement, crypto_movement) =
		if inflow_is_fiat { (&mut tx.movements.inflows[0], &mut tx.movements.outflows[0]) } else { (&mut tx.movements.outflows[0], &mut tx.movements.inflows[0]) };

	let fiat_currency = fiat_movement.asset_symbol.clone();
	let fiat_amount = fiat_movement.gross_amount;
	let crypto_amount = crypto_movement.gross_amount;
	let source = identity_source(&fiat_currency);

	let identity = PriceAtTxTime::new(Money::new(1.0, fiat_currency.clone()), source, datetime, PriceGranularity::Exact);
	if write_price(&mut fiat_movement.price_at_tx_time, identity) {
		written += 1;
	}

	if crypto_amount.abs() > f64::EPSILON {
		let ratio = fiat_amount.abs() / crypto_amount.abs();
		let derived = PriceAtTxTime::new(Money::new(ratio, fiat_currency), source, datetime, PriceGranularity::Exact);
		if write_price(&mut crypto_movement.price_at_tx_time, derived) {
			written += 1;
		}
	}
	written
}

fn derive_single_leg_movements(tx: &mut Transaction) -> u32 {
	let datetime = tx.datetime;
	let mut written = 0;
	for m in tx.movements.inflows.iter_mut().chain(tx.movements.outflows.iter_mut()) {
		if !is_fiat(&m.asset_symbol) {
			continue;
		}
		let identity = PriceAtTxTime::new(Money::new(1.0, m.asset_symbol.clone()), identity_source(&m.asset_symbol), datetime, PriceGranularity::Exact);
		if write_price(&mut m.price_at_tx_time, identity) {
			written += 1;
		}
	}
	written
}

fn derive_single_leg_fees(tx: &mut Transaction) -> u32 {
	let datetime = tx.datetime;
	let mut written = 0;
	for f in tx.fees.iter_mut() {
		if !is_fiat(&f.asset_symbol) {
			continue;
		}
		let identity = PriceAtTxTime::new(Money::new(1.0, f.asset_symbol.clone()), identity_source(&f.asset_symbol), datetime, PriceGranularity::Exact);
		if write_price(&mut f.price_at_tx_time, identity) {
			written += 1;
		}
	}
	written
}

/// Copies a priced movement's price onto its confirmed-link counterpart's
/// same-asset movement, in both directions (spec §4.9 "prices propagate
/// across confirmed TransactionLinks"; spec §8 scenario 5) — unless the user
/// has unlinked that specific (transaction, transaction, asset) triple
/// (spec §3 `OverrideEvent::Unlink`), in which case propagation across that
/// pair is suppressed for that asset only.
async fn propagate_links(
	store: &Store,
	txs: &mut HashMap<Uuid, Transaction>,
	overrides_state: &overrides::EffectiveOverrides,
) -> Result<u32, IngestError> {
	let mut written = 0u32;
	let ids: Vec<Uuid> = txs.keys().copied().collect();
	for id in ids {
		let link_rows = links::list_for_transaction(store.pool(), id).await?;
		for link in link_rows.iter().filter(|l| l.is_propagation_eligible()) {
			if let Some(other_id) = link.other_side(id) {
				written += propagate_pair(store, txs, id, other_id, overrides_state).await?;
			}
		}
	}
	Ok(written)
}

async fn propagate_pair(
	store: &Store,
	txs: &mut HashMap<Uuid, Transaction>,
	a_id: Uuid,
	b_id: Uuid,
	overrides_state: &overrides::EffectiveOverrides,
) -> Result<u32, IngestError> {
	ensure_loaded(store, txs, a_id).await?;
	ensure_loaded(store, txs, b_id).await?;

	let mut written = 0;
	let a_tx = txs.get(&a_id).expect("just loaded");
	let a_identity = (a_tx.source.clone(), a_tx.external_id.clone());
	let a_prices = priced_by_asset(a_tx);

	let b_tx = txs.get(&b_id).expect("just loaded");
	let b_identity = (b_tx.source.clone(), b_tx.external_id.clone());
	let b_prices = priced_by_asset(b_tx);

	written += apply_propagated(txs.get_mut(&b_id).expect("just loaded"), &a_prices, &a_identity, &b_identity, overrides_state);
	written += apply_propagated(txs.get_mut(&a_id).expect("just loaded"), &b_prices, &b_identity, &a_identity, overrides_state);
	Ok(written)
}

async fn ensure_loaded(store: &Store, txs: &mut HashMap<Uuid, Transaction>, id: Uuid) -> Result<(), IngestError> {
	if !txs.contains_key(&id) {
		let tx = transactions::get(store.pool(), id).await?;
		txs.insert(id, tx);
	}
	Ok(())
}

fn priced_by_asset(tx: &Transaction) -> HashMap<String, Money> {
	let mut map = HashMap::new();
	for m in tx.movements.inflows.iter().chain(tx.movements.outflows.iter()) {
		if let Some(p) = &m.price_at_tx_time {
			map.entry(m.asset_symbol.clone()).or_insert_with(|| p.price.clone());
		}
	}
	for f in tx.fees.iter() {
		if let Some(p) = &f.price_at_tx_time {
			map.entry(f.asset_symbol.clone()).or_insert_with(|| p.price.clone());
		}
	}
	map
}

fn apply_propagated(
	tx: &mut Transaction,
	source_prices: &HashMap<String, Money>,
	source_identity: &(String, String),
	own_identity: &(String, String),
	overrides_state: &overrides::EffectiveOverrides,
) -> u32 {
	let datetime = tx.datetime;
	let mut written = 0;
	for slot in slots_mut(tx) {
		let Some(money) = source_prices.get(&slot.asset_symbol) else { continue };
		let fingerprint = unlink_fingerprint(
			(source_identity.0.as_str(), source_identity.1.as_str()),
			(own_identity.0.as_str(), own_identity.1.as_str()),
			&slot.asset_symbol,
		);
		if overrides_state.is_unlinked(&fingerprint) {
			continue;
		}
		let candidate = PriceAtTxTime::new(money.clone(), PriceSource::DerivedRatio, datetime, PriceGranularity::Exact);
		if write_price(slot.price, candidate) {
			written += 1;
		}
	}
	written
}

/// Stage 2 (spec §4.9): upgrades a `fiat-execution-tentative` price in a
/// non-USD fiat currency to USD via `fx_provider`. `rate_to_usd` returning
/// `Err` is a hard provider failure and always propagates; `Ok(None)` is
/// "no rate available", which `mode` decides how to handle.
async fn normalize_pass(
	txs: &mut HashMap<Uuid, Transaction>,
	fx_provider: Option<&dyn FxRateProvider>,
	interactive: Option<&dyn InteractiveFxPrompt>,
	mode: FxMissingBehavior,
) -> Result<u32, IngestError> {
	let Some(fx) = fx_provider else { return Ok(0) };
	let mut written = 0u32;
	let mut failures: Vec<(String, DateTime<Utc>)> = Vec::new();

	for tx in txs.values_mut() {
		let datetime = tx.datetime;
		for slot in slots_mut(tx) {
			let needs_normalizing = matches!(
				slot.price.as_ref(),
				Some(existing) if existing.source == PriceSource::FiatExecutionTentative && !existing.price.currency.eq_ignore_ascii_case("USD")
			);
			if !needs_normalizing {
				continue;
			}
			let existing = slot.price.as_ref().expect("checked above");
			let currency = existing.price.currency.clone();
			let native_amount = existing.price.amount;
			let granularity = existing.granularity;

			let rate = match fx.rate_to_usd(&currency, datetime).await? {
				Some(rate) => Some(rate),
				None => match interactive {
					Some(prompt) => prompt.prompt_for_rate(&currency, datetime).await?,
					None => None,
				},
			};

			match rate {
				Some(rate) => {
					let candidate = PriceAtTxTime::new(Money::new(native_amount * rate, "USD"), PriceSource::DerivedRatio, Utc::now(), granularity)
						.with_fx(rate, "fx-provider", datetime);
					if write_price(slot.price, candidate) {
						written += 1;
					}
				},
				None => failures.push((currency, datetime)),
			}
		}
	}

	if !failures.is_empty() {
		if mode == FxMissingBehavior::Fail {
			return Err(fx_failure_error(&failures));
		}
		tracing::warn!(count = failures.len(), "FX rate conversion failures; tentative prices left in place");
	}
	Ok(written)
}

fn fx_failure_error(failures: &[(String, DateTime<Utc>)]) -> IngestError {
	let mut message = format!("{} FX rate conversion failure(s):", failures.len());
	for (currency, at) in failures.iter().take(5) {
		message.push_str(&format!(" {currency}@{at}"));
	}
	message.push_str(". Run `prices set-fx` to supply the missing rate(s).");
	IngestError::Validation(ErrorDetails::new("pricing.fx_normalize_failed", message))
}

/// Stage 3 (spec §4.9): prices remaining unpriced non-fiat movements from
/// `crypto_provider`, memoizing each lookup in the price cache. Cannot
/// overwrite Stage 2's `derived-ratio` results — only a strictly lower
/// priority slot (none, or a stray tentative price) is eligible.
async fn fetch_pass(store: &Store, txs: &mut HashMap<Uuid, Transaction>, crypto: Option<&dyn CryptoPriceProvider>) -> Result<u32, IngestError> {
	let Some(provider) = crypto else { return Ok(0) };
	let mut written = 0u32;

	for tx in txs.values_mut() {
		let datetime = tx.datetime;
		for slot in slots_mut(tx) {
			if is_fiat(&slot.asset_symbol) {
				continue;
			}
			let already_at_or_above_market = slot.price.as_ref().is_some_and(|p| p.source.priority() >= PriceSource::MarketProvider.priority());
			if already_at_or_above_market {
				continue;
			}

			let bucket = bucket_timestamp(datetime.timestamp(), PriceGranularity::Day);
			let cached = prices::get(store.pool(), &slot.asset_symbol, "USD", bucket, PriceGranularity::Day).await?;
			let money = match cached {
				Some(c) => c.price,
				None => match provider.price_at(&slot.asset_symbol, "USD", datetime).await? {
					Some(money) => {
						let cached = prices::CachedPrice { price: money.clone(), source: "market-provider".to_string(), fetched_at: Utc::now() };
						prices::put(store.pool(), &slot.asset_symbol, bucket, PriceGranularity::Day, &cached).await?;
						money
					},
					None => continue,
				},
			};

			let candidate = PriceAtTxTime::new(money, PriceSource::MarketProvider, Utc::now(), PriceGranularity::Day);
			if write_price(slot.price, candidate) {
				written += 1;
			}
		}
	}
	Ok(written)
}

fn bucket_timestamp(ts: i64, granularity: PriceGranularity) -> i64 {
	let bucket_secs: i64 = match granularity {
		PriceGranularity::Exact => 1,
		PriceGranularity::Minute => 60,
		PriceGranularity::Hour => 3600,
		PriceGranularity::Day => 86400,
	};
	(ts / bucket_secs) * bucket_secs
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use exitbook_domain::{
		transaction::{Fee, FeeScope, FeeSettlement, Movement, Movements, Operation, OperationType, TxStatus},
		Account, AccountType,
	};
	use exitbook_persistence::accounts;

	use super::*;

	fn kraken_trade(account_id: Uuid, base_amount: f64, base: &str, quote_amount: f64, quote: &str) -> Transaction {
		let mut movements = Movements::default();
		movements.push_inflow(Movement::new(base, base, base_amount));
		movements.push_outflow(Movement::new(quote, quote, quote_amount));
		Transaction {
			id: Uuid::new_v4(),
			account_id,
			external_id: format!("{base}-{quote}"),
			datetime: Utc::now(),
			timestamp: Utc::now().timestamp(),
			source: "kraken".to_string(),
			source_type: "exchange".to_string(),
			status: TxStatus::Confirmed,
			from: None,
			to: None,
			movements,
			fees: vec![],
			operation: Operation { category: OperationCategory::Trade, op_type: OperationType::Buy },
			notes: vec![],
			blockchain: None,
			is_spam: false,
			excluded_from_accounting: false,
		}
	}

	async fn seeded_account(store: &Store) -> Uuid {
		let account = Account::new(Uuid::new_v4(), Uuid::new_v4(), AccountType::ExchangeCsv, "kraken", "csv");
		accounts::create(store.pool(), &account).await.unwrap();
		account.id
	}

	#[tokio::test]
	async fn a_non_usd_fiat_trade_gets_tentative_prices_on_both_legs() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let tx = kraken_trade(account_id, 100.0, "XLM", 50.0, "CAD");
		transactions::upsert(store.pool(), &tx).await.unwrap();

		let pipeline = Pipeline::new(store.clone());
		let stats = pipeline.run(Uuid::new_v4(), EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() })
			.await
			.unwrap();
		assert_eq!(stats.derive, 2);

		let found = transactions::find_by_identity(store.pool(), "kraken", "XLM-CAD").await.unwrap().unwrap();
		let xlm = found.movements.inflows.iter().find(|m| m.asset_symbol == "XLM").unwrap();
		let cad = found.movements.outflows.iter().find(|m| m.asset_symbol == "CAD").unwrap();
		let xlm_price = xlm.price_at_tx_time.as_ref().unwrap();
		assert_eq!(xlm_price.source, PriceSource::FiatExecutionTentative);
		assert!((xlm_price.price.amount - 0.5).abs() < f64::EPSILON);
		assert_eq!(cad.price_at_tx_time.as_ref().unwrap().price.amount, 1.0);
	}

	#[tokio::test]
	async fn a_usd_trade_gets_exchange_execution_prices() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let tx = kraken_trade(account_id, 2.0, "ETH", 4000.0, "USD");
		transactions::upsert(store.pool(), &tx).await.unwrap();

		let pipeline = Pipeline::new(store.clone());
		pipeline
			.run(Uuid::new_v4(), EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() })
			.await
			.unwrap();

		let found = transactions::find_by_identity(store.pool(), "kraken", "ETH-USD").await.unwrap().unwrap();
		let eth = found.movements.inflows.iter().find(|m| m.asset_symbol == "ETH").unwrap();
		assert_eq!(eth.price_at_tx_time.as_ref().unwrap().source, PriceSource::ExchangeExecution);
		assert_eq!(eth.price_at_tx_time.as_ref().unwrap().price.amount, 2000.0);
	}

	struct FixedFx(f64);

	#[async_trait]
	impl FxRateProvider for FixedFx {
		async fn rate_to_usd(&self, _currency: &str, _at: DateTime<Utc>) -> Result<Option<f64>, IngestError> {
			Ok(Some(self.0))
		}
	}

	struct MissingFx;

	#[async_trait]
	impl FxRateProvider for MissingFx {
		async fn rate_to_usd(&self, _currency: &str, _at: DateTime<Utc>) -> Result<Option<f64>, IngestError> {
			Ok(None)
		}
	}

	#[tokio::test]
	async fn normalize_upgrades_a_tentative_fiat_price_to_usd() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let tx = kraken_trade(account_id, 100.0, "XLM", 50.0, "CAD");
		transactions::upsert(store.pool(), &tx).await.unwrap();

		let pipeline = Pipeline::new(store.clone()).with_fx_provider(Arc::new(FixedFx(0.73)));
		let stats = pipeline
			.run(Uuid::new_v4(), EnrichOptions { run_fetch: false, run_derive2: false, ..Default::default() })
			.await
			.unwrap();
		assert!(stats.normalize > 0);

		let found = transactions::find_by_identity(store.pool(), "kraken", "XLM-CAD").await.unwrap().unwrap();
		let xlm = found.movements.inflows.iter().find(|m| m.asset_symbol == "XLM").unwrap();
		let price = xlm.price_at_tx_time.as_ref().unwrap();
		assert_eq!(price.source, PriceSource::DerivedRatio);
		assert_eq!(price.price.currency, "USD");
		assert!((price.price.amount - 0.5 * 0.73).abs() < 1e-9);
	}

	#[tokio::test]
	async fn fail_mode_aborts_with_a_message_naming_the_missing_conversion() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let tx = kraken_trade(account_id, 100.0, "XLM", 50.0, "CAD");
		transactions::upsert(store.pool(), &tx).await.unwrap();

		let pipeline = Pipeline::new(store.clone()).with_fx_provider(Arc::new(MissingFx));
		let err = pipeline
			.run(
				Uuid::new_v4(),
				EnrichOptions { run_fetch: false, run_derive2: false, on_missing_fx: FxMissingBehavior::Fail, ..Default::default() },
			)
			.await
			.unwrap_err();
		let message = err.details().message.clone();
		assert!(message.contains("1 FX rate conversion failure(s)"));
		assert!(message.contains("prices set-fx"));
	}

	struct FixedCrypto(f64);

	#[async_trait]
	impl CryptoPriceProvider for FixedCrypto {
		async fn price_at(&self, _asset_symbol: &str, currency: &str, _at: DateTime<Utc>) -> Result<Option<Money>, IngestError> {
			Ok(Some(Money::new(self.0, currency)))
		}
	}

	#[tokio::test]
	async fn fetch_prices_a_crypto_crypto_swap_leg_with_a_market_provider_price() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let tx = kraken_trade(account_id, 1.0, "ETH", 0.05, "BTC");
		transactions::upsert(store.pool(), &tx).await.unwrap();

		let pipeline = Pipeline::new(store.clone()).with_crypto_provider(Arc::new(FixedCrypto(2500.0)));
		let stats = pipeline
			.run(Uuid::new_v4(), EnrichOptions { run_derive: false, run_normalize: false, run_derive2: false, ..Default::default() })
			.await
			.unwrap();
		assert_eq!(stats.fetch, 2);

		let found = transactions::find_by_identity(store.pool(), "kraken", "ETH-BTC").await.unwrap().unwrap();
		let eth = found.movements.inflows.iter().find(|m| m.asset_symbol == "ETH").unwrap();
		assert_eq!(eth.price_at_tx_time.as_ref().unwrap().source, PriceSource::MarketProvider);
	}

	#[tokio::test]
	async fn a_linked_priced_withdrawal_propagates_its_price_onto_an_unpriced_deposit() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;

		let mut withdrawal = kraken_trade(account_id, 0.0, "ETH", 0.0, "ETH");
		withdrawal.movements = Movements::default();
		withdrawal.movements.push_outflow(Movement::new("ETH", "ETH", 1.0));
		withdrawal.movements.outflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(2000.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		withdrawal.operation = Operation { category: OperationCategory::Transfer, op_type: OperationType::Withdrawal };
		withdrawal.external_id = "withdrawal-1".to_string();
		transactions::upsert(store.pool(), &withdrawal).await.unwrap();
		let withdrawal_id = transactions::find_by_identity(store.pool(), "kraken", "withdrawal-1").await.unwrap().unwrap().id;

		let mut deposit = kraken_trade(account_id, 0.0, "ETH", 0.0, "ETH");
		deposit.movements = Movements::default();
		deposit.movements.push_inflow(Movement::new("ETH", "ETH", 1.0));
		deposit.operation = Operation { category: OperationCategory::Transfer, op_type: OperationType::Deposit };
		deposit.source = "ethereum".to_string();
		deposit.source_type = "blockchain".to_string();
		deposit.external_id = "deposit-1".to_string();
		transactions::upsert(store.pool(), &deposit).await.unwrap();
		let deposit_id = transactions::find_by_identity(store.pool(), "ethereum", "deposit-1").await.unwrap().unwrap().id;

		exitbook_persistence::links::create(
			store.pool(),
			&exitbook_domain::TransactionLink {
				id: Uuid::new_v4(),
				from_transaction_id: withdrawal_id,
				to_transaction_id: deposit_id,
				status: exitbook_domain::link::LinkStatus::Confirmed,
			},
		)
		.await
		.unwrap();

		let pipeline = Pipeline::new(store.clone());
		pipeline.run(Uuid::new_v4(), EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() }).await.unwrap();

		let found = transactions::get(store.pool(), deposit_id).await.unwrap();
		let price = found.movements.inflows[0].price_at_tx_time.as_ref().unwrap();
		assert_eq!(price.source, PriceSource::DerivedRatio);
		assert_eq!(price.price.amount, 2000.0);
	}

	#[tokio::test]
	async fn a_user_price_override_wins_even_over_exchange_execution() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let user_id = Uuid::new_v4();
		let mut tx = kraken_trade(account_id, 2.0, "ETH", 4000.0, "USD");
		tx.movements.inflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(2000.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		transactions::upsert(store.pool(), &tx).await.unwrap();

		exitbook_persistence::overrides::append(
			store.pool(),
			&exitbook_domain::overrides::OverrideRecord {
				id: Uuid::new_v4(),
				user_id,
				event: exitbook_domain::overrides::OverrideEvent::Price(exitbook_domain::overrides::PriceOverride {
					transaction_id: tx.id,
					asset_symbol: "ETH".to_string(),
					price: Money::new(1900.0, "USD"),
				}),
				created_at: Utc::now(),
			},
		)
		.await
		.unwrap();

		let pipeline = Pipeline::new(store.clone());
		pipeline.run(user_id, EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() }).await.unwrap();

		let found = transactions::get(store.pool(), tx.id).await.unwrap();
		let price = found.movements.inflows[0].price_at_tx_time.as_ref().unwrap();
		assert_eq!(price.source, PriceSource::UserProvided);
		assert_eq!(price.price.amount, 1900.0);
	}

	#[tokio::test]
	async fn a_price_override_on_a_fully_priced_transaction_still_applies() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let user_id = Uuid::new_v4();
		let mut tx = kraken_trade(account_id, 2.0, "ETH", 4000.0, "USD");
		tx.movements.inflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(2000.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		tx.movements.outflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(1.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		transactions::upsert(store.pool(), &tx).await.unwrap();
		// every slot already priced, so `list_with_unpriced_items` alone would never surface this transaction.
		assert!(transactions::list_with_unpriced_items(store.pool()).await.unwrap().is_empty());

		exitbook_persistence::overrides::append(
			store.pool(),
			&exitbook_domain::overrides::OverrideRecord {
				id: Uuid::new_v4(),
				user_id,
				event: exitbook_domain::overrides::OverrideEvent::Price(exitbook_domain::overrides::PriceOverride {
					transaction_id: tx.id,
					asset_symbol: "ETH".to_string(),
					price: Money::new(1900.0, "USD"),
				}),
				created_at: Utc::now(),
			},
		)
		.await
		.unwrap();

		let pipeline = Pipeline::new(store.clone());
		pipeline.run(user_id, EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() }).await.unwrap();

		let found = transactions::get(store.pool(), tx.id).await.unwrap();
		let price = found.movements.inflows[0].price_at_tx_time.as_ref().unwrap();
		assert_eq!(price.source, PriceSource::UserProvided);
		assert_eq!(price.price.amount, 1900.0);
	}

	#[tokio::test]
	async fn a_scam_flag_on_a_fully_priced_transaction_still_applies() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let user_id = Uuid::new_v4();
		let mut tx = kraken_trade(account_id, 2.0, "ETH", 4000.0, "USD");
		tx.movements.inflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(2000.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		tx.movements.outflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(1.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		transactions::upsert(store.pool(), &tx).await.unwrap();
		assert!(transactions::list_with_unpriced_items(store.pool()).await.unwrap().is_empty());

		exitbook_persistence::overrides::append(
			store.pool(),
			&exitbook_domain::overrides::OverrideRecord {
				id: Uuid::new_v4(),
				user_id,
				event: exitbook_domain::overrides::OverrideEvent::ScamFlag { transaction_id: tx.id },
				created_at: Utc::now(),
			},
		)
		.await
		.unwrap();

		let pipeline = Pipeline::new(store.clone());
		pipeline.run(user_id, EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() }).await.unwrap();

		let found = transactions::get(store.pool(), tx.id).await.unwrap();
		assert!(found.excluded_from_accounting);
	}

	#[tokio::test]
	async fn an_unlink_override_suppresses_propagation_for_that_asset_only() {
		let store = Store::in_memory().await;
		let account_id = seeded_account(&store).await;
		let user_id = Uuid::new_v4();

		let mut withdrawal = kraken_trade(account_id, 0.0, "ETH", 0.0, "ETH");
		withdrawal.movements = Movements::default();
		withdrawal.movements.push_outflow(Movement::new("ETH", "ETH", 1.0));
		withdrawal.movements.outflows[0].price_at_tx_time =
			Some(PriceAtTxTime::new(Money::new(2000.0, "USD"), PriceSource::ExchangeExecution, Utc::now(), PriceGranularity::Exact));
		withdrawal.operation = Operation { category: OperationCategory::Transfer, op_type: OperationType::Withdrawal };
		withdrawal.external_id = "withdrawal-unlinked".to_string();
		transactions::upsert(store.pool(), &withdrawal).await.unwrap();
		let withdrawal_id = transactions::find_by_identity(store.pool(), "kraken", "withdrawal-unlinked").await.unwrap().unwrap().id;

		let mut deposit = kraken_trade(account_id, 0.0, "ETH", 0.0, "ETH");
		deposit.movements = Movements::default();
		deposit.movements.push_inflow(Movement::new("ETH", "ETH", 1.0));
		deposit.operation = Operation { category: OperationCategory::Transfer, op_type: OperationType::Deposit };
		deposit.source = "ethereum".to_string();
		deposit.source_type = "blockchain".to_string();
		deposit.external_id = "deposit-unlinked".to_string();
		transactions::upsert(store.pool(), &deposit).await.unwrap();
		let deposit_id = transactions::find_by_identity(store.pool(), "ethereum", "deposit-unlinked").await.unwrap().unwrap().id;

		exitbook_persistence::links::create(
			store.pool(),
			&exitbook_domain::TransactionLink {
				id: Uuid::new_v4(),
				from_transaction_id: withdrawal_id,
				to_transaction_id: deposit_id,
				status: exitbook_domain::link::LinkStatus::Confirmed,
			},
		)
		.await
		.unwrap();

		let fingerprint = exitbook_domain::overrides::unlink_fingerprint(("kraken", "withdrawal-unlinked"), ("ethereum", "deposit-unlinked"), "ETH");
		exitbook_persistence::overrides::append(
			store.pool(),
			&exitbook_domain::overrides::OverrideRecord {
				id: Uuid::new_v4(),
				user_id,
				event: exitbook_domain::overrides::OverrideEvent::Unlink(exitbook_domain::overrides::UnlinkOverride {
					fingerprint,
					reason: None,
				}),
				created_at: Utc::now(),
			},
		)
		.await
		.unwrap();

		let pipeline = Pipeline::new(store.clone());
		pipeline.run(user_id, EnrichOptions { run_normalize: false, run_fetch: false, run_derive2: false, ..Default::default() }).await.unwrap();

		let found = transactions::get(store.pool(), deposit_id).await.unwrap();
		assert!(found.movements.inflows[0].price_at_tx_time.is_none());
	}

	#[test]
	fn fee_with_no_usable_amount_does_not_panic_the_ratio_derive() {
		let mut tx = kraken_trade(Uuid::new_v4(), 0.0, "XLM", 50.0, "CAD");
		derive_trade_sides(&mut tx);
		// a zero-amount crypto leg is skipped, not divided-by-zero into the transaction
		assert!(tx.movements.inflows[0].price_at_tx_time.is_none());
	}

	#[allow(dead_code)]
	fn _use_fee_imports(_: Fee, _: FeeScope, _: FeeSettlement) {}
}
