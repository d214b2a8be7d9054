use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use exitbook_domain::error::{ErrorDetails, IngestError};
use exitbook_http::{HttpClient, RequestSpec};
use exitbook_providers::ResolvedProvider;
use serde::Deserialize;

use super::{EvmTransferKind, EvmTransferRecord};

fn parse_block(field: &str, raw: &str) -> Result<u64, IngestError> {
	raw.parse::<u64>().map_err(|e| IngestError::validation("evm.invalid_block_number", format!("{field}={raw:?}: {e}")))
}

fn parse_timestamp(field: &str, raw: &str) -> Result<chrono::DateTime<Utc>, IngestError> {
	let secs = raw.parse::<i64>().map_err(|e| IngestError::validation("evm.invalid_timestamp", format!("{field}={raw:?}: {e}")))?;
	Utc.timestamp_opt(secs, 0)
		.single()
		.ok_or_else(|| IngestError::validation("evm.invalid_timestamp", format!("{field}={raw:?} is out of range")))
}

/// Wei-denominated `value` field, in every Etherscan-family response,
/// converted to a whole-unit amount. Token decimals other than 18 are a
/// known simplification here — the processor layer re-derives exact
/// amounts from `raw` where a source needs to correct this.
fn wei_to_amount(raw: &str) -> f64 {
	raw.parse::<f64>().unwrap_or(0.0) / 1e18
}

/// An Etherscan-family block explorer API: `module=account`, one `action`
/// value per transfer kind, JSON array results.
pub struct EtherscanLikeProvider {
	api_key: Option<String>,
}

impl EtherscanLikeProvider {
	pub fn new(api_key: Option<String>) -> Self {
		Self { api_key }
	}

	async fn call(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
		action: &str,
	) -> Result<Vec<serde_json::Value>, IngestError> {
		let mut spec = RequestSpec::get(format!("{}/api", provider.base_url))
			.with_query("module", "account")
			.with_query("action", action)
			.with_query("address", address)
			.with_query("sort", "asc")
			.with_query("startblock", since_block.map(|b| b.to_string()).unwrap_or_else(|| "0".to_string()));
		if let Some(key) = &self.api_key {
			spec = spec.with_query("apikey", key.clone());
		}

		let envelope: EtherscanEnvelope = http.execute_json(&provider.name, &format!("evm.{action}"), spec).await?;
		if envelope.status == "0" {
			// Etherscan's idiom for "the query was valid but matched
			// nothing" is also status "0" — distinguish it from a real
			// error by message rather than failing the whole fetch.
			if envelope.message.eq_ignore_ascii_case("no transactions found") {
				return Ok(Vec::new());
			}
			return Err(IngestError::ProviderTerminal(ErrorDetails::new("evm.etherscan_error", envelope.message)));
		}
		match envelope.result {
			serde_json::Value::Array(rows) => Ok(rows),
			other => Err(IngestError::validation("evm.unexpected_result_shape", format!("expected an array, got {other}"))),
		}
	}
}

#[derive(Debug, Deserialize)]
struct EtherscanEnvelope {
	status: String,
	message: String,
	result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EtherscanRow {
	hash: String,
	#[serde(rename = "blockNumber")]
	block_number: String,
	#[serde(rename = "timeStamp")]
	timestamp: String,
	from: String,
	to: String,
	value: String,
	#[serde(rename = "traceId")]
	trace_id: Option<String>,
	#[serde(rename = "logIndex")]
	log_index: Option<String>,
	#[serde(rename = "tokenSymbol")]
	token_symbol: Option<String>,
}

fn map_row(row: serde_json::Value, kind: EvmTransferKind) -> Result<EvmTransferRecord, IngestError> {
	let row: EtherscanRow = serde_json::from_value(row.clone())
		.map_err(|e| IngestError::validation("evm.malformed_row", format!("{e}: {row}")))?;
	let hash = row.hash.clone();
	Ok(EvmTransferRecord {
		kind,
		block_number: parse_block("blockNumber", &row.block_number)?,
		timestamp: parse_timestamp("timeStamp", &row.timestamp)?,
		from: row.from,
		to: row.to,
		asset_symbol: row.token_symbol.unwrap_or_else(|| "ETH".to_string()),
		amount: wei_to_amount(&row.value),
		trace_index: row.trace_id.as_deref().map(parse_trace_index),
		log_index: row.log_index.as_deref().and_then(|v| v.parse().ok()),
		raw: serde_json::json!({"hash": hash.clone()}),
		hash,
	})
}

fn parse_trace_index(trace_id: &str) -> u32 {
	trace_id.split('_').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl super::EvmProviderTransport for EtherscanLikeProvider {
	async fn fetch_normal(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		self.call(http, provider, address, since_block, "txlist")
			.await?
			.into_iter()
			.map(|row| map_row(row, EvmTransferKind::Normal))
			.collect()
	}

	async fn fetch_internal(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		self.call(http, provider, address, since_block, "txlistinternal")
			.await?
			.into_iter()
			.map(|row| map_row(row, EvmTransferKind::Internal))
			.collect()
	}

	async fn fetch_token(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		self.call(http, provider, address, since_block, "tokentx")
			.await?
			.into_iter()
			.map(|row| map_row(row, EvmTransferKind::Token))
			.collect()
	}
}

/// An Alchemy-family indexer: a single JSON-RPC method, `category` picks
/// the transfer kind instead of a distinct REST action per kind.
pub struct AlchemyLikeProvider;

#[derive(Debug, Deserialize)]
struct AlchemyEnvelope {
	result: Option<AlchemyResult>,
	error: Option<AlchemyRpcError>,
}

#[derive(Debug, Deserialize)]
struct AlchemyRpcError {
	message: String,
}

#[derive(Debug, Deserialize)]
struct AlchemyResult {
	transfers: Vec<AlchemyTransfer>,
}

#[derive(Debug, Deserialize)]
struct AlchemyTransfer {
	hash: String,
	#[serde(rename = "blockNum")]
	block_num: String,
	from: String,
	to: String,
	value: Option<f64>,
	asset: Option<String>,
	#[serde(rename = "uniqueId")]
	unique_id: Option<String>,
}

impl AlchemyLikeProvider {
	async fn call(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
		categories: &[&str],
		kind: EvmTransferKind,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		let from_block = since_block.map(|b| format!("0x{b:x}")).unwrap_or_else(|| "0x0".to_string());
		let body = serde_json::json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "alchemy_getAssetTransfers",
			"params": [{
				"fromBlock": from_block,
				"toAddress": address,
				"category": categories,
				"withMetadata": false,
			}],
		});
		let spec = RequestSpec::post(provider.base_url.clone(), body).idempotent(true);
		let envelope: AlchemyEnvelope = http.execute_json(&provider.name, "evm.alchemy_getAssetTransfers", spec).await?;

		if let Some(err) = envelope.error {
			return Err(IngestError::ProviderTerminal(ErrorDetails::new("evm.alchemy_rpc_error", err.message)));
		}
		let result = envelope
			.result
			.ok_or_else(|| IngestError::validation("evm.empty_result", "alchemy_getAssetTransfers returned neither result nor error"))?;

		result
			.transfers
			.into_iter()
			.map(|t| {
				let block_number = u64::from_str_radix(t.block_num.trim_start_matches("0x"), 16)
					.map_err(|e| IngestError::validation("evm.invalid_block_number", format!("{:?}: {e}", t.block_num)))?;
				Ok(EvmTransferRecord {
					kind,
					hash: t.hash.clone(),
					trace_index: if kind == EvmTransferKind::Internal { Some(0) } else { None },
					log_index: t.unique_id.as_deref().and_then(|id| id.rsplit(':').next()).and_then(|v| v.parse().ok()),
					block_number,
					// Alchemy's transfer list doesn't carry a timestamp
					// without a second metadata round trip; the block
					// number is the authoritative cursor here regardless.
					timestamp: Utc::now(),
					from: t.from,
					to: t.to,
					asset_symbol: t.asset.unwrap_or_else(|| "ETH".to_string()),
					amount: t.value.unwrap_or(0.0),
					raw: serde_json::json!({"hash": t.hash}),
				})
			})
			.collect()
	}
}

#[async_trait]
impl super::EvmProviderTransport for AlchemyLikeProvider {
	async fn fetch_normal(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		self.call(http, provider, address, since_block, &["external"], EvmTransferKind::Normal).await
	}

	async fn fetch_internal(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		self.call(http, provider, address, since_block, &["internal"], EvmTransferKind::Internal).await
	}

	async fn fetch_token(
		&self,
		http: &HttpClient,
		provider: &ResolvedProvider,
		address: &str,
		since_block: Option<u64>,
	) -> Result<Vec<EvmTransferRecord>, IngestError> {
		self.call(http, provider, address, since_block, &["erc20", "erc721", "erc1155"], EvmTransferKind::Token).await
	}
}
