//! Typed batch appender for the four EVM raw tables.

use anyhow::Result;
use clickhouse::Client;
use log::info;

use crate::ch::insert_rows;
use crate::evm::models::EvmBlockBundle;

pub struct RawSink {
    client: Client,
    chain_id: u32,
}

impl RawSink {
    pub fn new(client: Client, chain_id: u32) -> Self {
        Self { client, chain_id }
    }

    /// Appends every row of every bundle across the four raw tables in one
    /// logical step. The watermark must only advance after this returns Ok;
    /// a partial write is safe to replay because every table replaces by
    /// sort key.
    pub async fn append(&self, bundles: &[EvmBlockBundle]) -> Result<()> {
        if bundles.is_empty() {
            return Ok(());
        }

        let blocks: Vec<_> = bundles.iter().map(|b| b.block.clone()).collect();
        let txs: Vec<_> = bundles.iter().flat_map(|b| b.txs.clone()).collect();
        let traces: Vec<_> = bundles.iter().flat_map(|b| b.traces.clone()).collect();
        let logs: Vec<_> = bundles.iter().flat_map(|b| b.logs.clone()).collect();

        insert_rows(&self.client, "raw_blocks", &blocks).await?;
        insert_rows(&self.client, "raw_txs", &txs).await?;
        insert_rows(&self.client, "raw_traces", &traces).await?;
        insert_rows(&self.client, "raw_logs", &logs).await?;

        info!(
            "[chain {}] appended blocks {}..{}: {} blocks, {} txs, {} traces, {} logs",
            self.chain_id,
            bundles.first().map(|b| b.number).unwrap_or(0),
            bundles.last().map(|b| b.number).unwrap_or(0),
            blocks.len(),
            txs.len(),
            traces.len(),
            logs.len()
        );

        Ok(())
    }
}
