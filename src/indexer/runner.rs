//! Per-chain scheduler for the derived computations. Discovers the SQL
//! populations at startup, observes the latest ingested block from the
//! syncer, and serially steps every indexer that has work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clickhouse::Client;
use log::info;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::config::Vm;
use crate::evm::syncer::LatestBlock;
use crate::indexer::incremental::IncrementalKind;
use crate::indexer::sqlfile::discover_sql_files;
use crate::indexer::watermarks::{load_watermarks, Watermark};
use crate::shutdown::Shutdown;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct IndexRunner {
    pub(super) chain_id: u32,
    pub(super) client: Client,
    pub(super) sql_root: PathBuf,
    pub(super) metrics_variant: &'static str,
    pub(super) incremental_variant: &'static str,

    // Block state, updated from the syncer's watch channel.
    pub(super) latest_block_num: u64,
    pub(super) latest_block_time: OffsetDateTime,

    // In-memory watermarks backed by the indexer_watermarks table, plus the
    // runtime side-table of throttle and save timestamps.
    pub(super) watermarks: HashMap<String, Watermark>,
    pub(super) last_run: HashMap<String, Instant>,
    pub(super) last_save: HashMap<String, Instant>,

    // Discovered once at startup.
    pub(super) granular_metrics: Vec<String>,
    pub(super) batched_indexers: Vec<String>,
    pub(super) immediate_indexers: Vec<String>,
}

impl IndexRunner {
    pub async fn new(
        chain_id: u32,
        client: Client,
        sql_root: impl Into<PathBuf>,
        vm: Vm,
    ) -> Result<Self> {
        let sql_root = sql_root.into();
        let (metrics_variant, incremental_variant) = match vm {
            Vm::Evm => ("evm_metrics", "evm_incremental"),
            Vm::Pchain => ("pchain_metrics", "pchain_incremental"),
        };

        let granular_metrics = discover_sql_files(&sql_root.join(metrics_variant))?;
        let batched_indexers =
            discover_sql_files(&sql_root.join(incremental_variant).join("batched"))?;
        let immediate_indexers =
            discover_sql_files(&sql_root.join(incremental_variant).join("immediate"))?;

        let watermarks = load_watermarks(&client, chain_id).await?;

        info!(
            "[chain {chain_id}] index runner initialized - {} granular metrics, {} batched, {} immediate indexers",
            granular_metrics.len(),
            batched_indexers.len(),
            immediate_indexers.len()
        );

        Ok(Self {
            chain_id,
            client,
            sql_root,
            metrics_variant,
            incremental_variant,
            latest_block_num: 0,
            latest_block_time: OffsetDateTime::UNIX_EPOCH,
            watermarks,
            last_run: HashMap::new(),
            last_save: HashMap::new(),
            granular_metrics,
            batched_indexers,
            immediate_indexers,
        })
    }

    pub fn on_block(&mut self, block_num: u64, block_time: OffsetDateTime) {
        self.latest_block_num = block_num;
        self.latest_block_time = block_time;
    }

    /// Polls for work until shutdown. Indexer executions are strictly
    /// serial within one runner; a failed execution panics the task.
    pub async fn run(mut self, block_rx: watch::Receiver<LatestBlock>, shutdown: Arc<Shutdown>) {
        info!("[chain {}] starting indexer loop", self.chain_id);

        while !shutdown.is_triggered() {
            if let Some((num, time)) = *block_rx.borrow() {
                self.on_block(num, time);
            }

            self.process_all_indexers().await;

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.wait() => {}
            }
        }

        info!("[chain {}] indexer loop stopped", self.chain_id);
    }

    async fn process_all_indexers(&mut self) {
        // Nothing ingested yet.
        if self.latest_block_num == 0 {
            return;
        }

        self.process_granular_metrics().await;
        self.process_incrementals(IncrementalKind::Batched).await;
        self.process_incrementals(IncrementalKind::Immediate).await;
    }
}
