//! `cache` - fill the disk cache at max speed without touching ClickHouse.
//! Resumes from the cache checkpoint and saves it as the dense prefix
//! grows, so an interrupted run restarts where it left off.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::cache::BlockCache;
use crate::cmd::CACHE_ROOT;
use crate::config::{load_config, ChainConfig, Vm};
use crate::evm::rpc::{EvmFetcher, FetcherOptions};
use crate::pchain::models::KeyHeuristicParser;
use crate::pchain::rpc::{PchainFetcher, PchainFetcherOptions};
use crate::shutdown::Shutdown;

/// Concurrent range fetches per chain; each range has its own internal
/// concurrency from max_concurrency.
const PARALLEL_RANGES: usize = 10;

/// How much the dense prefix must grow before the checkpoint is rewritten.
const CHECKPOINT_INTERVAL: u64 = 1_000;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run_cache(config_path: &str, shutdown: Arc<Shutdown>) -> Result<()> {
    info!("Starting cache-only mode (no ClickHouse)...");

    let configs = load_config(config_path)?;

    let handles: Vec<_> = configs
        .into_iter()
        .map(|cfg| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let chain_id = cfg.chain_id;
                if let Err(err) = cache_chain(cfg, shutdown).await {
                    error!("[chain {chain_id}] cache failed: {err:#}");
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.await;
    }

    info!("Cache complete");
    Ok(())
}

/// Either fetcher kind, reduced to what backfilling needs.
enum CacheFetcher {
    Evm(EvmFetcher),
    Pchain(PchainFetcher),
}

impl CacheFetcher {
    async fn get_latest_block(&self) -> Result<u64> {
        match self {
            CacheFetcher::Evm(f) => Ok(f.get_latest_block().await?),
            CacheFetcher::Pchain(f) => Ok(f.get_latest_block().await?),
        }
    }

    /// Fetches (and thereby caches) a range, returning the block count.
    async fn fill_range(&self, from: u64, to: u64) -> Result<u64> {
        let count = match self {
            CacheFetcher::Evm(f) => f.fetch_block_range(from, to).await?.len(),
            CacheFetcher::Pchain(f) => f.fetch_block_range(from, to).await?.len(),
        };
        Ok(count as u64)
    }
}

async fn cache_chain(cfg: ChainConfig, shutdown: Arc<Shutdown>) -> Result<()> {
    let chain_id = cfg.chain_id;
    let cache = Arc::new(BlockCache::new(CACHE_ROOT, chain_id)?);

    let checkpoint = cache.checkpoint();
    if checkpoint > 0 {
        info!("[chain {chain_id}] found checkpoint at block {checkpoint}, resuming from there");
    }

    // Backfill wants aggressive retries: the run is long, failures cheap.
    let fetcher = match cfg.vm {
        Vm::Evm => CacheFetcher::Evm(EvmFetcher::new(
            chain_id,
            FetcherOptions {
                max_concurrency: cfg.max_concurrency,
                rpc_batch_size: cfg.rpc_batch_size,
                debug_batch_size: cfg.debug_batch_size,
                max_retries: 100,
                retry_delay: Duration::from_millis(100),
                ..FetcherOptions::new(cfg.rpc_url.clone())
            },
            Some(cache.clone()),
        )?),
        Vm::Pchain => CacheFetcher::Pchain(PchainFetcher::new(
            chain_id,
            PchainFetcherOptions {
                max_concurrency: cfg.max_concurrency,
                max_retries: 100,
                retry_delay: Duration::from_millis(100),
                ..PchainFetcherOptions::new(cfg.rpc_url.clone())
            },
            Some(cache.clone()),
            Box::new(KeyHeuristicParser),
        )?),
    };

    let latest = fetcher.get_latest_block().await?;

    let original_start = cfg.start_block.max(1);
    let start = if checkpoint >= original_start {
        checkpoint + 1
    } else {
        original_start
    };

    if start > latest {
        info!("[chain {chain_id}] already cached up to block {checkpoint}. Nothing to do");
        return Ok(());
    }

    let total_blocks = latest - original_start + 1;
    info!(
        "[chain {chain_id}] caching blocks {start} to {latest} ({} remaining, {total_blocks} total)",
        latest - start + 1
    );

    let cached_count = Arc::new(AtomicU64::new(0));
    let already_cached = start - original_start;
    let started = Instant::now();

    // Progress printer.
    let progress = {
        let cached_count = cached_count.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
                    _ = shutdown.wait() => return,
                }

                let cached = cached_count.load(Ordering::Relaxed);
                let elapsed = started.elapsed().as_secs_f64();
                let rate = cached as f64 / elapsed.max(0.001);
                let done = already_cached + cached;
                let percent = done as f64 / total_blocks as f64 * 100.0;

                let remaining = total_blocks.saturating_sub(done);
                let eta_secs = if rate > 0.0 {
                    remaining as f64 / rate
                } else {
                    0.0
                };

                info!(
                    "[chain {chain_id}] progress: {done}/{total_blocks} blocks ({percent:.1}%) | {rate:.1} blocks/sec | ETA {}s",
                    eta_secs as u64
                );
            }
        })
    };

    // Ranges complete out of order; the checkpoint only advances along the
    // dense prefix.
    let frontier = Arc::new(Mutex::new(DenseFrontier::new(start - 1)));

    let chunk = cfg.fetch_batch_size.max(1);
    let mut ranges = Vec::new();
    let mut current = start;
    while current <= latest {
        let end = (current + chunk - 1).min(latest);
        ranges.push((current, end));
        current = end + 1;
    }

    stream::iter(ranges)
        .map(|(from, to)| {
            let fetcher = &fetcher;
            let cache = cache.clone();
            let cached_count = cached_count.clone();
            let frontier = frontier.clone();
            let shutdown = shutdown.clone();
            async move {
                if shutdown.is_triggered() {
                    return;
                }
                match fetcher.fill_range(from, to).await {
                    Ok(count) => {
                        cached_count.fetch_add(count, Ordering::Relaxed);

                        let mut frontier = frontier.lock().await;
                        if let Some(dense_end) = frontier.complete(from, to) {
                            if let Err(err) = cache.set_checkpoint(dense_end) {
                                warn!("[chain {chain_id}] failed to save checkpoint at {dense_end}: {err:#}");
                            } else {
                                info!("[chain {chain_id}] checkpoint saved at block {dense_end}");
                            }
                        }
                    }
                    Err(err) => {
                        error!("[chain {chain_id}] error fetching blocks {from}-{to}: {err:#}");
                    }
                }
            }
        })
        .buffer_unordered(PARALLEL_RANGES)
        .collect::<Vec<()>>()
        .await;

    progress.abort();

    // Final checkpoint for whatever dense prefix we ended with.
    let dense_end = frontier.lock().await.dense_end();
    if dense_end >= start {
        cache.set_checkpoint(dense_end)?;
        info!("[chain {chain_id}] final checkpoint saved at block {dense_end}");
    }

    let elapsed = started.elapsed();
    let cached = cached_count.load(Ordering::Relaxed);
    info!(
        "[chain {chain_id}] cached {cached} blocks in {elapsed:?} (avg {:.1} blocks/sec)",
        cached as f64 / elapsed.as_secs_f64().max(0.001)
    );

    Ok(())
}

/// Tracks completed ranges and reports when the contiguous prefix grows
/// enough to justify rewriting the checkpoint.
struct DenseFrontier {
    dense_end: u64,
    last_saved: u64,
    pending: BTreeMap<u64, u64>,
}

impl DenseFrontier {
    fn new(dense_end: u64) -> Self {
        Self {
            dense_end,
            last_saved: dense_end,
            pending: BTreeMap::new(),
        }
    }

    /// Records `[from, to]` as complete. Returns a checkpoint candidate
    /// when the dense prefix advanced by at least the save interval.
    fn complete(&mut self, from: u64, to: u64) -> Option<u64> {
        self.pending.insert(from, to);

        while let Some((&next_from, &next_to)) = self.pending.first_key_value() {
            if next_from != self.dense_end + 1 {
                break;
            }
            self.pending.remove(&next_from);
            self.dense_end = next_to;
        }

        if self.dense_end >= self.last_saved + CHECKPOINT_INTERVAL {
            self.last_saved = self.dense_end;
            Some(self.dense_end)
        } else {
            None
        }
    }

    fn dense_end(&self) -> u64 {
        self.dense_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_only_advances_densely() {
        let mut frontier = DenseFrontier::new(0);

        // Second chunk completes first: no dense progress yet.
        assert_eq!(frontier.complete(1_001, 2_000), None);
        assert_eq!(frontier.dense_end(), 0);

        // First chunk closes the gap and both count.
        assert_eq!(frontier.complete(1, 1_000), Some(2_000));
        assert_eq!(frontier.dense_end(), 2_000);
    }

    #[test]
    fn checkpoint_candidates_respect_the_interval() {
        let mut frontier = DenseFrontier::new(0);
        assert_eq!(frontier.complete(1, 500), None);
        assert_eq!(frontier.complete(501, 1_200), Some(1_200));
        // Not enough new progress since the last save.
        assert_eq!(frontier.complete(1_201, 1_900), None);
        assert_eq!(frontier.complete(1_901, 2_300), Some(2_300));
    }
}
