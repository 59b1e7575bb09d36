//! Bounded-concurrency, batching, retrying EVM JSON-RPC fetcher with a
//! write-through disk cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use jsonrpsee::core::params::{ArrayParams, BatchRequestBuilder};
use jsonrpsee::core::{client::ClientT, rpc_params};
use jsonrpsee_http_client::{HttpClient, HttpClientBuilder};
use log::warn;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cache::BlockCache;
use crate::evm::models::{parse_bundle, parse_hex_u64, EvmBlockBundle, RpcBlockEnvelope};
use crate::retry::{backoff_delay, FetchError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub rpc_url: String,
    pub max_concurrency: usize,
    pub rpc_batch_size: usize,
    pub debug_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl FetcherOptions {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            max_concurrency: 100,
            rpc_batch_size: 100,
            debug_batch_size: 15,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct EvmFetcher {
    chain_id: u32,
    client: HttpClient,
    cache: Option<Arc<BlockCache>>,
    opts: FetcherOptions,
    rpc_limit: Arc<Semaphore>,
}

impl EvmFetcher {
    pub fn new(
        chain_id: u32,
        opts: FetcherOptions,
        cache: Option<Arc<BlockCache>>,
    ) -> anyhow::Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(&opts.rpc_url)?;

        Ok(Self {
            chain_id,
            client,
            cache,
            rpc_limit: Arc::new(Semaphore::new(opts.max_concurrency)),
            opts,
        })
    }

    pub async fn get_latest_block(&self) -> Result<u64, FetchError> {
        self.with_retry("eth_blockNumber", || async {
            let _permit = self.rpc_limit.acquire().await?;
            let value: Value = self.client.request("eth_blockNumber", rpc_params![]).await?;
            value
                .as_str()
                .map(parse_hex_u64)
                .ok_or_else(|| anyhow!("unexpected eth_blockNumber response: {value}"))
        })
        .await
    }

    /// Fetches `[from, to]` inclusive: cache hits are parsed in place, the
    /// misses fetched in parallel batches, and the result is materialised as
    /// a dense, height-ordered sequence or fails as a whole.
    pub async fn fetch_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<EvmBlockBundle>, FetchError> {
        if from > to {
            return Err(FetchError::InvalidRange { from, to });
        }

        let mut bundles: HashMap<u64, EvmBlockBundle> = HashMap::new();
        let mut missing: Vec<u64> = Vec::new();

        if let Some(cache) = &self.cache {
            let cached = cache.get_range(from, to);
            for height in from..=to {
                match cached.get(&height) {
                    Some(bytes) => match parse_bundle(self.chain_id, height, bytes) {
                        Ok(bundle) => {
                            bundles.insert(height, bundle);
                        }
                        // A corrupt entry is just a miss; the refetch
                        // overwrites it.
                        Err(err) => {
                            warn!(
                                "[chain {}] cached block {height} unparsable, refetching: {err:#}",
                                self.chain_id
                            );
                            missing.push(height);
                        }
                    },
                    None => missing.push(height),
                }
            }
        } else {
            missing.extend(from..=to);
        }

        if !missing.is_empty() {
            let chunk_futures = missing
                .chunks(self.opts.rpc_batch_size)
                .map(|chunk| self.fetch_chunk(chunk.to_vec()));

            for result in join_all(chunk_futures).await {
                for (height, bundle) in result? {
                    bundles.insert(height, bundle);
                }
            }
        }

        let mut ordered = Vec::with_capacity((to - from + 1) as usize);
        for height in from..=to {
            match bundles.remove(&height) {
                Some(bundle) => ordered.push(bundle),
                None => {
                    return Err(FetchError::Integrity(format!(
                        "missing block {height} after fetch of [{from}, {to}]"
                    )))
                }
            }
        }

        Ok(ordered)
    }

    /// Fetches one batch-sized group of heights: blocks and receipts in one
    /// batched request each, traces in smaller debug-sized batches.
    async fn fetch_chunk(
        &self,
        heights: Vec<u64>,
    ) -> Result<Vec<(u64, EvmBlockBundle)>, FetchError> {
        let block_params = heights
            .iter()
            .map(|h| rpc_params![format!("0x{h:x}"), true])
            .collect();
        let blocks = self
            .batch_call("eth_getBlockByNumber", block_params, false)
            .await?;

        let receipt_params = heights
            .iter()
            .map(|h| rpc_params![format!("0x{h:x}")])
            .collect();
        let receipts = self
            .batch_call("eth_getBlockReceipts", receipt_params, false)
            .await?;

        let tracer = serde_json::json!({ "tracer": "callTracer" });
        let mut traces: Vec<Value> = Vec::with_capacity(heights.len());
        for sub in heights.chunks(self.opts.debug_batch_size) {
            let params = sub
                .iter()
                .map(|h| rpc_params![format!("0x{h:x}"), tracer.clone()])
                .collect();
            traces.extend(
                self.batch_call("debug_traceBlockByNumber", params, true)
                    .await?,
            );
        }

        if blocks.len() != heights.len()
            || receipts.len() != heights.len()
            || traces.len() != heights.len()
        {
            return Err(FetchError::Integrity(format!(
                "batch length mismatch: {} heights, {} blocks, {} receipts, {} traces",
                heights.len(),
                blocks.len(),
                receipts.len(),
                traces.len()
            )));
        }

        let mut out = Vec::with_capacity(heights.len());
        for (i, &height) in heights.iter().enumerate() {
            let envelope = RpcBlockEnvelope {
                block: blocks[i].clone(),
                receipts: receipts[i].clone(),
                traces: traces[i].clone(),
            };
            let bytes = serde_json::to_vec(&envelope)
                .map_err(|e| FetchError::Rpc(format!("failed to serialise envelope: {e}")))?;

            let bundle = parse_bundle(self.chain_id, height, &bytes).map_err(|e| {
                FetchError::Integrity(format!("failed to parse fetched block {height}: {e:#}"))
            })?;

            if let Some(cache) = &self.cache {
                if let Err(err) = cache.put(height, &bytes) {
                    warn!(
                        "[chain {}] failed to cache block {height}: {err:#}",
                        self.chain_id
                    );
                }
            }

            out.push((height, bundle));
        }

        Ok(out)
    }

    /// Sends one batched request, retried as a whole. Each sub-response must
    /// be present; `allow_null` tolerates nodes that answer a sub-call with
    /// null (callTracer on empty blocks).
    async fn batch_call(
        &self,
        method: &str,
        params_list: Vec<ArrayParams>,
        allow_null: bool,
    ) -> Result<Vec<Value>, FetchError> {
        self.with_retry(method, || {
            let params_list = params_list.clone();
            async move {
                let mut batch = BatchRequestBuilder::new();
                for params in params_list {
                    batch.insert(method, params)?;
                }

                let _permit = self.rpc_limit.acquire().await?;
                let responses = self.client.batch_request::<Value>(batch).await?;

                let mut values = Vec::new();
                for entry in responses.into_iter() {
                    let value = entry.map_err(|e| anyhow!("{method} sub-call failed: {e:?}"))?;
                    if value.is_null() && !allow_null {
                        return Err(anyhow!("{method} sub-call returned null"));
                    }
                    values.push(value);
                }
                Ok(values)
            }
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, call: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inverted_range_fails_fast() {
        let fetcher = EvmFetcher::new(
            1,
            FetcherOptions::new("http://localhost:18545"),
            None,
        )
        .unwrap();

        let err = fetcher.fetch_block_range(10, 9).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRange { from: 10, to: 9 }));
    }
}
