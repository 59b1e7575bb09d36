//! P-chain JSON-RPC fetcher: block ingestion plus the validator snapshot
//! calls used by the validator syncer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ObjectParams;
use jsonrpsee_http_client::{HttpClient, HttpClientBuilder};
use log::warn;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cache::BlockCache;
use crate::pchain::models::{parse_platform_block, PlatformBlock, PlatformTxParser};
use crate::retry::{backoff_delay, FetchError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Cap for paginated platform.* calls (getUTXOs and friends).
pub const RPC_PAGE_LIMIT: u32 = 1024;

#[derive(Debug, Clone)]
pub struct PchainFetcherOptions {
    pub rpc_url: String,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl PchainFetcherOptions {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            max_concurrency: 50,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct PchainFetcher {
    chain_id: u32,
    client: HttpClient,
    cache: Option<Arc<BlockCache>>,
    parser: Box<dyn PlatformTxParser>,
    opts: PchainFetcherOptions,
    rpc_limit: Arc<Semaphore>,
}

impl PchainFetcher {
    pub fn new(
        chain_id: u32,
        opts: PchainFetcherOptions,
        cache: Option<Arc<BlockCache>>,
        parser: Box<dyn PlatformTxParser>,
    ) -> Result<Self> {
        let endpoint = platform_endpoint(&opts.rpc_url);
        let client = HttpClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(endpoint)?;

        Ok(Self {
            chain_id,
            client,
            cache,
            parser,
            rpc_limit: Arc::new(Semaphore::new(opts.max_concurrency)),
            opts,
        })
    }

    pub async fn get_latest_block(&self) -> Result<u64, FetchError> {
        self.with_retry("platform.getHeight", || async {
            let _permit = self.rpc_limit.acquire().await?;
            let value: Value = self
                .client
                .request("platform.getHeight", ObjectParams::new())
                .await?;
            parse_u64_field(value.get("height"), "height")
        })
        .await
    }

    /// Fetches `[from, to]` inclusive through the cache, dense and ordered
    /// by height or a fatal error.
    pub async fn fetch_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<PlatformBlock>, FetchError> {
        if from > to {
            return Err(FetchError::InvalidRange { from, to });
        }

        let mut blocks: HashMap<u64, PlatformBlock> = HashMap::new();
        let mut missing: Vec<u64> = Vec::new();

        if let Some(cache) = &self.cache {
            let cached = cache.get_range(from, to);
            for height in from..=to {
                match cached.get(&height) {
                    Some(bytes) => {
                        match parse_platform_block(self.chain_id, height, bytes, &*self.parser) {
                            Ok(block) => {
                                blocks.insert(height, block);
                            }
                            Err(err) => {
                                warn!(
                                    "[chain {}] cached block {height} unparsable, refetching: {err:#}",
                                    self.chain_id
                                );
                                missing.push(height);
                            }
                        }
                    }
                    None => missing.push(height),
                }
            }
        } else {
            missing.extend(from..=to);
        }

        let fetched = join_all(missing.iter().map(|&height| self.fetch_block(height))).await;
        for result in fetched {
            let block = result?;
            blocks.insert(block.height, block);
        }

        let mut ordered = Vec::with_capacity((to - from + 1) as usize);
        for height in from..=to {
            match blocks.remove(&height) {
                Some(block) => ordered.push(block),
                None => {
                    return Err(FetchError::Integrity(format!(
                        "missing block {height} after fetch of [{from}, {to}]"
                    )))
                }
            }
        }

        Ok(ordered)
    }

    async fn fetch_block(&self, height: u64) -> Result<PlatformBlock, FetchError> {
        let bytes = self
            .with_retry("platform.getBlockByHeight", || async {
                let _permit = self.rpc_limit.acquire().await?;

                let mut params = ObjectParams::new();
                params.insert("height", height)?;
                params.insert("encoding", "json")?;

                let value: Value = self
                    .client
                    .request("platform.getBlockByHeight", params)
                    .await?;
                Ok(serde_json::to_vec(&value)?)
            })
            .await?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(height, &bytes) {
                warn!(
                    "[chain {}] failed to cache block {height}: {err:#}",
                    self.chain_id
                );
            }
        }

        parse_platform_block(self.chain_id, height, &bytes, &*self.parser).map_err(|e| {
            FetchError::Integrity(format!("failed to parse fetched block {height}: {e:#}"))
        })
    }

    /// Current validator set; `None` targets the primary network.
    pub async fn get_current_validators(
        &self,
        subnet_id: Option<&str>,
    ) -> Result<GetCurrentValidatorsResponse, FetchError> {
        self.with_retry("platform.getCurrentValidators", || async {
            let _permit = self.rpc_limit.acquire().await?;

            let mut params = ObjectParams::new();
            if let Some(subnet_id) = subnet_id {
                params.insert("subnetID", subnet_id)?;
            }

            let response: GetCurrentValidatorsResponse = self
                .client
                .request("platform.getCurrentValidators", params)
                .await?;
            Ok(response)
        })
        .await
    }

    pub async fn get_l1_validator(
        &self,
        validation_id: &str,
    ) -> Result<GetL1ValidatorResponse, FetchError> {
        self.with_retry("platform.getL1Validator", || async {
            let _permit = self.rpc_limit.acquire().await?;

            let mut params = ObjectParams::new();
            params.insert("validationID", validation_id)?;

            let response: GetL1ValidatorResponse =
                self.client.request("platform.getL1Validator", params).await?;
            Ok(response)
        })
        .await
    }

    pub async fn get_utxos(&self, addresses: &[String]) -> Result<GetUtxosResponse, FetchError> {
        self.with_retry("platform.getUTXOs", || async {
            let _permit = self.rpc_limit.acquire().await?;

            let mut params = ObjectParams::new();
            params.insert("addresses", addresses)?;
            params.insert("limit", RPC_PAGE_LIMIT)?;
            params.insert("encoding", "hex")?;

            let response: GetUtxosResponse =
                self.client.request("platform.getUTXOs", params).await?;
            Ok(response)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, call: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.opts.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.opts.retry_delay, attempt);
                warn!(
                    "[chain {}] {what} failed: {:#}; retrying ({attempt}/{}) after {delay:?}",
                    self.chain_id,
                    last_err.as_ref().expect("error recorded before retry"),
                    self.opts.max_retries
                );
                tokio::time::sleep(delay).await;
            }

            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => last_err = Some(err),
            }
        }

        Err(FetchError::Rpc(format!(
            "{what} failed after {} attempts: {:#}",
            self.opts.max_retries + 1,
            last_err.expect("at least one attempt ran")
        )))
    }
}

/// The platform API lives under /ext/P regardless of how the node URL is
/// given in the config.
fn platform_endpoint(rpc_url: &str) -> String {
    let trimmed = rpc_url.trim_end_matches('/');
    if trimmed.ends_with("/ext/P") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/ext/P")
    }
}

/// The RPC returns numbers as strings in most places; accept both.
pub fn parse_u64_field(value: Option<&Value>, field: &str) -> Result<u64> {
    match value {
        Some(Value::String(s)) if s.is_empty() => Ok(0),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|e| anyhow!("failed to parse {field} '{s}': {e}")),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| anyhow!("{field} is not a u64: {n}")),
        Some(other) => Err(anyhow!("unexpected {field} value: {other}")),
        None => Ok(0),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GetCurrentValidatorsResponse {
    #[serde(default)]
    pub validators: Vec<ValidatorInfo>,
}

/// Validator entry as returned by platform.getCurrentValidators. Numeric
/// fields come back as strings; L1-only fields are absent for primary
/// network validators.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidatorInfo {
    #[serde(default, rename = "txID")]
    pub tx_id: String,
    #[serde(default, rename = "nodeID")]
    pub node_id: String,
    #[serde(default, rename = "validationID")]
    pub validation_id: String,
    #[serde(default, rename = "startTime")]
    pub start_time: String,
    #[serde(default, rename = "endTime")]
    pub end_time: String,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub uptime: String,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerInfo {
    #[serde(default)]
    pub locktime: String,
    #[serde(default)]
    pub threshold: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetL1ValidatorResponse {
    #[serde(default, rename = "nodeID")]
    pub node_id: String,
    #[serde(default, rename = "validationID")]
    pub validation_id: String,
    #[serde(default, rename = "subnetID")]
    pub subnet_id: String,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub balance: String,
    #[serde(default, rename = "startTime")]
    pub start_time: String,
    #[serde(default, rename = "remainingBalanceOwner")]
    pub remaining_balance_owner: OwnerInfo,
    #[serde(default, rename = "deactivationOwner")]
    pub deactivation_owner: OwnerInfo,
    #[serde(default, rename = "minNonce")]
    pub min_nonce: String,
    #[serde(default)]
    pub height: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtxoEndIndex {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub utxo: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetUtxosResponse {
    #[serde(default, rename = "numFetched")]
    pub num_fetched: String,
    #[serde(default)]
    pub utxos: Vec<String>,
    #[serde(default, rename = "endIndex")]
    pub end_index: UtxoEndIndex,
    #[serde(default)]
    pub encoding: String,
}

/// One UTXO pulled apart just far enough to find amounts: codec id (2),
/// tx id (32), output index (4), asset id (32), type id (4), amount (8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUtxo {
    pub tx_id_hex: String,
    pub output_index: u32,
    pub amount: u64,
}

pub fn parse_utxo_hex(utxo_hex: &str) -> Result<ParsedUtxo> {
    let bytes = hex::decode(utxo_hex.trim_start_matches("0x"))
        .map_err(|e| anyhow!("failed to decode UTXO hex: {e}"))?;

    if bytes.len() < 82 {
        return Err(anyhow!("UTXO too short: {} bytes", bytes.len()));
    }

    let tx_id_hex = format!("0x{}", hex::encode(&bytes[2..34]));
    let output_index = u32::from_be_bytes(
        bytes[34..38]
            .try_into()
            .expect("slice of length 4 fits u32"),
    );
    let amount = u64::from_be_bytes(
        bytes[74..82]
            .try_into()
            .expect("slice of length 8 fits u64"),
    );

    Ok(ParsedUtxo {
        tx_id_hex,
        output_index,
        amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_is_normalised() {
        assert_eq!(
            platform_endpoint("http://localhost:9650"),
            "http://localhost:9650/ext/P"
        );
        assert_eq!(
            platform_endpoint("http://localhost:9650/"),
            "http://localhost:9650/ext/P"
        );
        assert_eq!(
            platform_endpoint("http://localhost:9650/ext/P"),
            "http://localhost:9650/ext/P"
        );
    }

    #[test]
    fn u64_fields_accept_strings_and_numbers() {
        assert_eq!(parse_u64_field(Some(&json!("123")), "height").unwrap(), 123);
        assert_eq!(parse_u64_field(Some(&json!(123)), "height").unwrap(), 123);
        assert_eq!(parse_u64_field(Some(&json!("")), "height").unwrap(), 0);
        assert_eq!(parse_u64_field(None, "height").unwrap(), 0);
        assert!(parse_u64_field(Some(&json!("abc")), "height").is_err());
    }

    #[test]
    fn parses_utxo_layout() {
        // codec(2) + txid(32 of 0xaa) + index(4 = 7) + asset(32) + type(4) + amount(8 = 5000)
        let mut bytes = vec![0u8; 2];
        bytes.extend([0xaa; 32]);
        bytes.extend(7u32.to_be_bytes());
        bytes.extend([0u8; 32]);
        bytes.extend([0u8; 4]);
        bytes.extend(5000u64.to_be_bytes());

        let utxo = parse_utxo_hex(&hex::encode(&bytes)).unwrap();
        assert_eq!(utxo.output_index, 7);
        assert_eq!(utxo.amount, 5000);
        assert_eq!(utxo.tx_id_hex, format!("0x{}", "aa".repeat(32)));
    }

    #[test]
    fn short_utxo_is_rejected() {
        assert!(parse_utxo_hex("0x0000").is_err());
    }
}
