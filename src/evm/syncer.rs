//! Per-chain sync loop: watermark in, window of blocks through the sink,
//! watermark out. One instance per configured EVM chain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clickhouse::Client;
use log::{error, info};
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::cache::BlockCache;
use crate::ch::{set_sync_watermark, sync_watermark, update_chain_status};
use crate::config::ChainConfig;
use crate::evm::rpc::{EvmFetcher, FetcherOptions};
use crate::evm::sink::RawSink;
use crate::retry::FetchError;
use crate::shutdown::Shutdown;

/// Latest ingested block, pushed to the indexer runner after each commit.
pub type LatestBlock = Option<(u64, OffsetDateTime)>;

const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct ChainSyncer {
    cfg: ChainConfig,
    client: Client,
    fetcher: EvmFetcher,
    sink: RawSink,
    block_tx: watch::Sender<LatestBlock>,
    shutdown: Arc<Shutdown>,
}

impl ChainSyncer {
    pub fn new(
        cfg: ChainConfig,
        client: Client,
        cache: Arc<BlockCache>,
        shutdown: Arc<Shutdown>,
    ) -> Result<(Self, watch::Receiver<LatestBlock>)> {
        let fetcher = EvmFetcher::new(
            cfg.chain_id,
            FetcherOptions {
                max_concurrency: cfg.max_concurrency,
                rpc_batch_size: cfg.rpc_batch_size,
                debug_batch_size: cfg.debug_batch_size,
                ..FetcherOptions::new(cfg.rpc_url.clone())
            },
            Some(cache),
        )?;

        let sink = RawSink::new(client.clone(), cfg.chain_id);
        let (block_tx, block_rx) = watch::channel(None);

        Ok((
            Self {
                cfg,
                client,
                fetcher,
                sink,
                block_tx,
                shutdown,
            },
            block_rx,
        ))
    }

    pub async fn run(self) {
        let chain_id = self.cfg.chain_id;

        // start_block is a floor: historical data below it is never requested.
        let mut watermark = loop {
            match sync_watermark(&self.client, chain_id).await {
                Ok(w) => break w.max(self.cfg.start_block.saturating_sub(1)),
                Err(err) => {
                    error!("[chain {chain_id}] failed to load watermark: {err:#}");
                    self.sleep(ERROR_RETRY_INTERVAL).await;
                }
            }
        };

        info!(
            "[chain {chain_id}] starting sync for {} at watermark {watermark}",
            self.cfg.name
        );

        while !self.shutdown.is_triggered() {
            match self.sync_once(watermark).await {
                Ok(Some(advanced_to)) => watermark = advanced_to,
                Ok(None) => self.sleep(HEAD_POLL_INTERVAL).await,
                Err(err) => {
                    // A broken invariant must not be retried past: silent
                    // advancement would corrupt every derivation downstream.
                    if err
                        .downcast_ref::<FetchError>()
                        .is_some_and(|e| e.is_fatal())
                    {
                        panic!("[chain {chain_id}] fatal: {err:#}");
                    }
                    error!("[chain {chain_id}] sync iteration failed: {err:#}");
                    self.sleep(ERROR_RETRY_INTERVAL).await;
                }
            }
        }

        info!("[chain {chain_id}] sync loop stopped");
    }

    /// One iteration: fetch the next window, append it, commit the
    /// watermark. Returns None when caught up with the chain head.
    async fn sync_once(&self, watermark: u64) -> Result<Option<u64>> {
        let latest = self.fetcher.get_latest_block().await?;
        if watermark >= latest {
            return Ok(None);
        }

        let to = latest.min(watermark + self.cfg.fetch_batch_size);
        let bundles = self.fetcher.fetch_block_range(watermark + 1, to).await?;

        self.sink.append(&bundles).await?;

        update_chain_status(&self.client, self.cfg.chain_id, &self.cfg.name, latest).await?;

        // The commit point: everything up to `to` is durably appended.
        set_sync_watermark(&self.client, self.cfg.chain_id, to).await?;

        if let Some(last) = bundles.last() {
            let _ = self.block_tx.send(Some((last.number, last.time)));
        }

        Ok(Some(to))
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.wait() => {}
        }
    }
}
