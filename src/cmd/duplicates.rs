//! `duplicates` - sanity check for key collisions in the raw tables.
//!
//! The tables replace by sort key on merge, so duplicates here are either
//! rows awaiting a background merge or a sign of a broken sort key.

use anyhow::{Context, Result};
use log::info;

use crate::ch;

const RAW_TABLE_KEYS: &[(&str, &str)] = &[
    ("raw_blocks", "chain_id, block_number"),
    ("raw_txs", "chain_id, block_number, tx_index"),
    ("raw_traces", "chain_id, block_number, tx_index, trace_address"),
    ("raw_logs", "chain_id, block_number, tx_index, log_index"),
    ("platform_txs", "chain_id, block_number, tx_id"),
];

pub async fn run_duplicates() -> Result<()> {
    let client = ch::connect().await?;

    let mut found_any = false;
    for (table, keys) in RAW_TABLE_KEYS {
        info!("Checking {table} on ({keys})...");

        let sql = format!(
            "SELECT count() FROM (SELECT 1 FROM {table} GROUP BY {keys} HAVING count() > 1)"
        );
        let duplicate_keys = client
            .query(&sql)
            .fetch_one::<u64>()
            .await
            .with_context(|| format!("failed to check {table}"))?;

        if duplicate_keys > 0 {
            found_any = true;
            println!("{table}: {duplicate_keys} duplicated keys");
        } else {
            println!("{table}: clean");
        }
    }

    if found_any {
        println!("Duplicates found. They collapse on merge; run OPTIMIZE TABLE ... FINAL to force it.");
    } else {
        println!("No duplicate records in raw tables");
    }

    Ok(())
}
