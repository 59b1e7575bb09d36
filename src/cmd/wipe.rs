//! `wipe` - drop derived state. By default only the calculated tables go;
//! raw data and the sync watermark survive so ingestion never repeats.

use anyhow::{bail, Context, Result};
use clickhouse::{Client, Row};
use serde::Deserialize;

use crate::ch;
use crate::ch::schema::{PCHAIN_CALCULATED_TABLES, RAW_TABLES};

pub async fn run_wipe(all: bool, chain: Option<u32>, pchain: bool) -> Result<()> {
    let client = ch::connect().await?;

    if let Some(chain_id) = chain {
        if !all {
            bail!("--chain requires --all to be set; use: wipe --all --chain {chain_id}");
        }
        wipe_chain_data(&client, chain_id).await?;
        println!("All data for chain {chain_id} wiped");
        return Ok(());
    }

    if pchain {
        wipe_pchain_tables(&client).await?;
        println!("P-chain calculated tables dropped");
        return Ok(());
    }

    wipe_calculated_tables(&client, all).await?;
    if all {
        println!("All tables dropped");
    } else {
        println!("Calculated tables dropped");
    }
    Ok(())
}

/// Deletes one chain's rows from the raw tables, its watermark and its
/// status row. Other chains are untouched.
async fn wipe_chain_data(client: &Client, chain_id: u32) -> Result<()> {
    for table in RAW_TABLES {
        println!("Deleting from {table} where chain_id = {chain_id}...");
        client
            .query(&format!(
                "ALTER TABLE {table} DELETE WHERE chain_id = {chain_id}"
            ))
            .execute()
            .await
            .with_context(|| format!("failed to delete from {table}"))?;
    }

    println!("Deleting watermark for chain {chain_id}...");
    client
        .query(&format!(
            "DELETE FROM sync_watermark WHERE chain_id = {chain_id}"
        ))
        .execute()
        .await
        .context("failed to delete from sync_watermark")?;

    println!("Deleting chain status for chain {chain_id}...");
    client
        .query(&format!(
            "ALTER TABLE chain_status DELETE WHERE chain_id = {chain_id}"
        ))
        .execute()
        .await
        .context("failed to delete from chain_status")?;

    Ok(())
}

#[derive(Debug, Row, Deserialize)]
struct TableRow {
    name: String,
    database: String,
}

/// Drops every non-system table, keeping the raw tables and the sync
/// watermark unless --all.
async fn wipe_calculated_tables(client: &Client, all: bool) -> Result<()> {
    let tables = client
        .query(
            "SELECT name, database
             FROM system.tables
             WHERE database = currentDatabase() AND engine != 'System'
             ORDER BY engine = 'MaterializedView' DESC, name",
        )
        .fetch_all::<TableRow>()
        .await
        .context("failed to list tables")?;

    let keep: Vec<&str> = if all {
        Vec::new()
    } else {
        let mut keep = RAW_TABLES.to_vec();
        keep.push("sync_watermark");
        keep
    };

    let doomed: Vec<&TableRow> = tables
        .iter()
        .filter(|t| !keep.contains(&t.name.as_str()))
        .collect();

    if doomed.is_empty() {
        println!("No calculated tables found to drop");
        return Ok(());
    }

    println!("Found {} tables to drop", doomed.len());
    for table in doomed {
        println!("Dropping {}.{}...", table.database, table.name);
        client
            .query(&format!(
                "DROP TABLE IF EXISTS `{}`.`{}` SETTINGS max_table_size_to_drop = 0",
                table.database, table.name
            ))
            .execute()
            .await
            .with_context(|| format!("failed to drop {}", table.name))?;
    }

    Ok(())
}

/// Drops only the P-chain derivation tables and the validator-sync
/// watermark; the next validator sync cycle rebuilds them from raw data.
async fn wipe_pchain_tables(client: &Client) -> Result<()> {
    for table in PCHAIN_CALCULATED_TABLES {
        println!("Dropping {table}...");
        client
            .query(&format!(
                "DROP TABLE IF EXISTS `{table}` SETTINGS max_table_size_to_drop = 0"
            ))
            .execute()
            .await
            .with_context(|| format!("failed to drop {table}"))?;
    }

    client
        .query("ALTER TABLE indexer_watermarks DELETE WHERE indexer_name = 'pchain/validator_sync'")
        .execute()
        .await
        .context("failed to reset validator sync watermark")?;

    Ok(())
}
