//! P-chain sync loop: same watermark contract as the EVM syncer, one raw
//! table (`platform_txs`) instead of four.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clickhouse::Client;
use log::{error, info};
use tokio::sync::watch;

use crate::cache::BlockCache;
use crate::ch::{insert_rows, set_sync_watermark, sync_watermark, update_chain_status};
use crate::config::ChainConfig;
use crate::evm::syncer::LatestBlock;
use crate::pchain::models::KeyHeuristicParser;
use crate::pchain::rpc::{PchainFetcher, PchainFetcherOptions};
use crate::retry::FetchError;
use crate::shutdown::Shutdown;

const HEAD_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct PchainSyncer {
    cfg: ChainConfig,
    client: Client,
    fetcher: Arc<PchainFetcher>,
    block_tx: watch::Sender<LatestBlock>,
    shutdown: Arc<Shutdown>,
}

impl PchainSyncer {
    pub fn new(
        cfg: ChainConfig,
        client: Client,
        cache: Arc<BlockCache>,
        shutdown: Arc<Shutdown>,
    ) -> Result<(Self, watch::Receiver<LatestBlock>)> {
        let fetcher = Arc::new(PchainFetcher::new(
            cfg.chain_id,
            PchainFetcherOptions {
                max_concurrency: cfg.max_concurrency,
                ..PchainFetcherOptions::new(cfg.rpc_url.clone())
            },
            Some(cache),
            Box::new(KeyHeuristicParser),
        )?);

        let (block_tx, block_rx) = watch::channel(None);

        Ok((
            Self {
                cfg,
                client,
                fetcher,
                block_tx,
                shutdown,
            },
            block_rx,
        ))
    }

    /// The validator syncer shares this fetcher for its snapshot calls.
    pub fn fetcher(&self) -> Arc<PchainFetcher> {
        Arc::clone(&self.fetcher)
    }

    pub async fn run(self) {
        let chain_id = self.cfg.chain_id;

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
            "[chain {chain_id}] starting P-chain sync for {} at watermark {watermark}",
            self.cfg.name
        );

        while !self.shutdown.is_triggered() {
            match self.sync_once(watermark).await {
                Ok(Some(advanced_to)) => watermark = advanced_to,
                Ok(None) => self.sleep(HEAD_POLL_INTERVAL).await,
                Err(err) => {
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

        info!("[chain {chain_id}] P-chain sync loop stopped");
    }

    async fn sync_once(&self, watermark: u64) -> Result<Option<u64>> {
        let latest = self.fetcher.get_latest_block().await?;
        if watermark >= latest {
            return Ok(None);
        }

        let to = latest.min(watermark + self.cfg.fetch_batch_size);
        let blocks = self.fetcher.fetch_block_range(watermark + 1, to).await?;

        let rows: Vec<_> = blocks.iter().flat_map(|b| b.txs.clone()).collect();
        insert_rows(&self.client, "platform_txs", &rows).await?;

        info!(
            "[chain {}] appended blocks {}..{to}: {} platform txs",
            self.cfg.chain_id,
            watermark + 1,
            rows.len()
        );

        update_chain_status(&self.client, self.cfg.chain_id, &self.cfg.name, latest).await?;
        set_sync_watermark(&self.client, self.cfg.chain_id, to).await?;

        if let Some(last) = blocks.last() {
            let _ = self.block_tx.send(Some((last.height, last.time)));
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
