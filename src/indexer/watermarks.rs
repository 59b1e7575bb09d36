//! Indexer progress tracking: one watermark per (chain, indexer,
//! granularity), held in memory and backed by a replace-by-key table.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clickhouse::{Client, Row};
use log::info;
use serde::Deserialize;
use time::OffsetDateTime;

/// Progress for one indexer. Granular metrics use `last_period`,
/// incremental indexers use `last_block_num`; the unused half stays at its
/// default.
#[derive(Debug, Clone, Copy)]
pub struct Watermark {
    pub last_period: OffsetDateTime,
    pub last_block_num: u64,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            last_period: OffsetDateTime::UNIX_EPOCH,
            last_block_num: 0,
        }
    }
}

/// Granular metrics are keyed `name:granularity`; incrementals by name.
pub fn watermark_key(indexer_name: &str, granularity: &str) -> String {
    if granularity.is_empty() {
        indexer_name.to_string()
    } else {
        format!("{indexer_name}:{granularity}")
    }
}

#[derive(Debug, Row, Deserialize)]
struct WatermarkDbRow {
    indexer_name: String,
    granularity: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    last_period: OffsetDateTime,
    last_block_num: u64,
}

/// Loads all watermarks for a chain into memory at startup.
pub async fn load_watermarks(
    client: &Client,
    chain_id: u32,
) -> Result<HashMap<String, Watermark>> {
    let rows = client
        .query(
            "SELECT indexer_name, granularity, last_period, last_block_num
             FROM indexer_watermarks FINAL
             WHERE chain_id = ?",
        )
        .bind(chain_id)
        .fetch_all::<WatermarkDbRow>()
        .await
        .context("failed to load indexer watermarks")?;

    let mut watermarks = HashMap::new();
    for row in rows {
        watermarks.insert(
            watermark_key(&row.indexer_name, &row.granularity),
            Watermark {
                last_period: row.last_period,
                last_block_num: row.last_block_num,
            },
        );
    }

    info!("[chain {chain_id}] loaded {} watermarks", watermarks.len());
    Ok(watermarks)
}

pub async fn save_watermark(
    client: &Client,
    chain_id: u32,
    indexer_name: &str,
    granularity: &str,
    watermark: &Watermark,
) -> Result<()> {
    let millis =
        (watermark.last_period.unix_timestamp_nanos() / 1_000_000) as i64;

    client
        .query(
            "INSERT INTO indexer_watermarks
             (chain_id, indexer_name, granularity, last_period, last_block_num)
             VALUES (?, ?, ?, fromUnixTimestamp64Milli(?), ?)",
        )
        .bind(chain_id)
        .bind(indexer_name)
        .bind(granularity)
        .bind(millis)
        .bind(watermark.last_block_num)
        .execute()
        .await
        .with_context(|| format!("failed to save watermark for {indexer_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_only_mention_granularity_when_set() {
        assert_eq!(
            watermark_key("evm_metrics/tx_count", "day"),
            "evm_metrics/tx_count:day"
        );
        assert_eq!(
            watermark_key("evm_incremental/batched/address_on_chain", ""),
            "evm_incremental/batched/address_on_chain"
        );
    }
}
