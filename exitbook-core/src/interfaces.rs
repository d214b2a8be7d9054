//! The five consumed interfaces (spec §6): everything a CLI/TUI or other
//! out-of-scope collaborator calls to drive ingestion. Each method here
//! resolves providers off the process-wide registry, builds the
//! source-specific client and adapter, and drives the shared
//! import/process/pricing machinery.

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use exitbook_domain::{error::IngestError, AccountType};
use exitbook_http::HttpClient;
use exitbook_import::{ImportOutcome, ImportService, Orchestrator};
use exitbook_persistence::accounts;
use exitbook_pricing::{EnrichOptions, EnrichStats, Pipeline};
use exitbook_processor::Processor;
use exitbook_providers::{registry, EnvReader, FactoryConfig, ProcessEnv};
use exitbook_sources::{AlchemyLikeProvider, EtherscanLikeProvider, EvmProviderClient, ExchangeLedgerOperation, KrakenApiClient, KrakenCsvClient};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
	adapters::{evm_user_addresses, EvmRawTransactionMapper, EvmSourceAdapter, KrakenRawTransactionMapper, KrakenSourceAdapter},
	pricing::{NoFxPrompt, NullFxRateProvider, ProviderManagerCryptoPriceProvider},
	wiring::RuntimeContext,
};

/// Default tracked quote assets for fund-flow classification's buy/sell
/// split (spec §4.8: "buy if inflow is the tracked quote asset"). A
/// deployment with different stable/fiat conventions overrides this via
/// [`Interfaces::with_quote_assets`].
fn default_quote_assets() -> HashSet<String> {
	["USD", "USDT", "USDC"].into_iter().map(str::to_string).collect()
}

pub struct Interfaces {
	ctx: RuntimeContext,
	quote_assets: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessAllReport {
	pub processed: u64,
	pub failed: u64,
	pub errors: Vec<String>,
}

impl Interfaces {
	pub fn new(ctx: RuntimeContext) -> Self {
		Self { ctx, quote_assets: default_quote_assets() }
	}

	pub fn with_quote_assets(mut self, quote_assets: HashSet<String>) -> Self {
		self.quote_assets = quote_assets;
		self
	}

	/// `importBlockchain(blockchain, addressOrXpub, providerName?, xpubGap?)`
	/// (spec §6). xpub fan-out (spec §4.7) is left to a future blockchain
	/// adapter that ships a real BIP32 deriver — genuinely out of scope
	/// here (SPEC_FULL.md §3's "source-specific wire parsing beyond the
	/// illustrative Kraken/EVM adapters") since neither illustrative EVM
	/// provider derives addresses from an extended public key. A caller
	/// that hands in an xpub for `ethereum` gets the orchestrator's own
	/// warned no-op (spec §4.7, §9 open question) rather than a fan-out.
	pub async fn import_blockchain(
		&self,
		user_id: Uuid,
		blockchain: &str,
		address_or_xpub: &str,
		provider_name: Option<&str>,
		_xpub_gap: Option<u32>,
	) -> Result<ImportOutcome, IngestError> {
		let orchestrator = Orchestrator::new(self.ctx.store.clone());
		let account = orchestrator.resolve_account(user_id, AccountType::Blockchain, blockchain, address_or_xpub).await?;

		let providers = self.resolve_providers(blockchain, provider_name)?;
		let client = Arc::new(build_evm_client(self.ctx.http.clone(), address_or_xpub));
		let service = ImportService::new(self.ctx.store.clone(), self.ctx.manager.clone());
		service.run(account.id, "evm.transfers", providers, client, &EvmRawTransactionMapper, CancellationToken::new()).await
	}

	/// `importExchangeApi(exchange, credentials)` (spec §6). `credentials`
	/// is the exchange-specific JSON blob the caller already validated
	/// (spec §1 non-goals: no credential storage scheme is prescribed);
	/// Kraken's shape is `{"apiKey": ..., "apiSecret": ...}`. The API key
	/// doubles as the account's identity tuple, matching how
	/// [`exitbook_import::orchestrator::Orchestrator::resolve_account`]
	/// keys every other account type by a stable external identifier.
	pub async fn import_exchange_api(
		&self,
		user_id: Uuid,
		exchange: &str,
		credentials: serde_json::Value,
	) -> Result<ImportOutcome, IngestError> {
		let orchestrator = Orchestrator::new(self.ctx.store.clone());
		let api_key = credentials["apiKey"].as_str().unwrap_or_default().to_string();
		let api_secret = credentials["apiSecret"].as_str().unwrap_or_default().to_string();
		let account = orchestrator.resolve_account(user_id, AccountType::ExchangeApi, exchange, &api_key).await?;

		let providers = self.resolve_providers(exchange, Some("kraken-api"))?;
		let client = Arc::new(ExchangeLedgerOperation(KrakenApiClient::new(self.ctx.http.clone(), api_key, api_secret)));
		let service = ImportService::new(self.ctx.store.clone(), self.ctx.manager.clone());
		service.run(account.id, "exchange.ledger", providers, client, &KrakenRawTransactionMapper, CancellationToken::new()).await
	}

	/// `importExchangeCsv(exchange, csvDirectories[])` (spec §6). One
	/// session per directory: [`KrakenCsvClient`] reads a single directory
	/// per instance, so a multi-directory import runs each directory
	/// through its own session rather than inventing a merged-directory
	/// client the source crate doesn't expose. Imported counts are summed;
	/// the returned `session_id` is the last directory's.
	pub async fn import_exchange_csv(
		&self,
		user_id: Uuid,
		exchange: &str,
		csv_directories: Vec<String>,
	) -> Result<ImportOutcome, IngestError> {
		let orchestrator = Orchestrator::new(self.ctx.store.clone());
		let account = orchestrator.resolve_account(user_id, AccountType::ExchangeCsv, exchange, "kraken-csv").await?;

		let mut total_imported = 0u64;
		let mut last = None;
		for directory in csv_directories {
			let providers = self.resolve_providers(exchange, Some("kraken-csv"))?;
			let client = Arc::new(ExchangeLedgerOperation(KrakenCsvClient::new(PathBuf::from(directory))));
			let service = ImportService::new(self.ctx.store.clone(), self.ctx.manager.clone());
			let outcome =
				service.run(account.id, "exchange.ledger", providers, client, &KrakenRawTransactionMapper, CancellationToken::new()).await?;
			total_imported += outcome.transactions_imported;
			last = Some(outcome);
		}
		let mut outcome = last.ok_or_else(|| IngestError::validation("core.no_csv_directories", "no CSV directories were given"))?;
		outcome.transactions_imported = total_imported;
		Ok(outcome)
	}

	/// `processAllPending()` (spec §6). Sweeps every account regardless of
	/// user, per spec §4.8's "the processor consumes `pending` raw records
	/// for one account" having no declared user scope. A single account's
	/// failure is recorded and does not stop the sweep.
	pub async fn process_all_pending(&self) -> Result<ProcessAllReport, IngestError> {
		let pool = self.ctx.store.pool();
		let all_accounts = accounts::list_all(pool).await?;
		let mut report = ProcessAllReport::default();

		for account in &all_accounts {
			let user_addresses = self.user_addresses_for(pool, account.user_id).await?;
			let processor = Processor::new(self.ctx.store.clone());
			let result = match account.source_name.as_str() {
				"kraken" => processor.process_account(account.id, &KrakenSourceAdapter, &user_addresses, &self.quote_assets).await,
				blockchain => {
					let adapter = EvmSourceAdapter::new(blockchain, account.identifier.as_str());
					processor.process_account(account.id, &adapter, &user_addresses, &self.quote_assets).await
				},
			};
			match result {
				Ok(outcome) => report.processed += outcome.transactions_written,
				Err(err) => {
					report.failed += 1;
					report.errors.push(format!("{}: {}", account.id, err));
				},
			}
		}
		Ok(report)
	}

	/// `enrichPrices(options)` (spec §6). The crypto price provider runs
	/// over the same failover machinery every other provider uses; no FX
	/// provider is wired by default (spec §3 non-goals name no fiat-rate
	/// source), so Stage 2 only resolves rates a caller supplies via
	/// [`Pipeline::with_fx_provider`]/[`Pipeline::with_interactive_fx`] on
	/// a pipeline built from this context's store directly.
	pub async fn enrich_prices(&self, user_id: Uuid, options: EnrichOptions) -> Result<EnrichStats, IngestError> {
		let pipeline = Pipeline::new(self.ctx.store.clone())
			.with_fx_provider(Arc::new(NullFxRateProvider))
			.with_interactive_fx(Arc::new(NoFxPrompt))
			.with_crypto_provider(Arc::new(ProviderManagerCryptoPriceProvider::new(self.ctx.manager.clone())));
		pipeline.run(user_id, options).await
	}

	fn resolve_providers(&self, chain_or_exchange: &str, preferred: Option<&str>) -> Result<Vec<exitbook_providers::ResolvedProvider>, IngestError> {
		let mut config = FactoryConfig::default();
		config.preferred_provider = preferred.map(str::to_string);
		let env = ProcessEnv;
		registry::with_global_registry(|registry| registry.resolve(chain_or_exchange, &config, &env))
			.map_err(|err| IngestError::validation("core.provider_resolution_failed", err.to_string()))
	}

	/// Every address this user controls, across every blockchain account
	/// (their own address plus any xpub-derived children), for the
	/// processor's self-transfer signal (spec §4.8). Exchange accounts
	/// have no address and contribute nothing here.
	async fn user_addresses_for(&self, pool: &sqlx::SqlitePool, user_id: Uuid) -> Result<HashSet<String>, IngestError> {
		let mut addresses = HashSet::new();
		for account in accounts::list_all_for_user(pool, user_id).await? {
			if account.account_type == AccountType::Blockchain {
				addresses.extend(evm_user_addresses(&account.identifier));
				for child in accounts::children_of(pool, account.id).await? {
					addresses.extend(evm_user_addresses(&child.identifier));
				}
			}
		}
		Ok(addresses)
	}
}

/// Builds an [`EvmProviderClient`] wired with both illustrative transports
/// (spec §8 scenario 2), so failover between `etherscan-like` and
/// `alchemy-like` works regardless of which provider the caller prefers.
fn build_evm_client(http: Arc<HttpClient>, address: &str) -> EvmProviderClient {
	EvmProviderClient::new(http, address)
		.with_transport("etherscan-like", Arc::new(EtherscanLikeProvider::new(std::env::var("ETHERSCAN_LIKE_API_KEY").ok())))
		.with_transport("alchemy-like", Arc::new(AlchemyLikeProvider))
}
