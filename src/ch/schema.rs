//! Schema definitions for ClickHouse tables.
//!
//! Every table is a ReplacingMergeTree keyed so that re-inserting the same
//! logical row collapses to one row on merge; `sync_watermark` is the one
//! exception, an EmbeddedRocksDB key-value table for single-row upserts.

use anyhow::{Context, Result};
use clickhouse::Client;
use log::info;

/// Table schema definition
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static str,
    pub engine: &'static str,
    pub order_by: &'static str,
}

/// Raw tables: written once by the chain syncers, never wiped by default.
pub const RAW_TABLES: &[&str] = &[
    "raw_blocks",
    "raw_txs",
    "raw_traces",
    "raw_logs",
    "platform_txs",
];

/// P-chain derivation tables, owned by the validator syncer.
pub const PCHAIN_CALCULATED_TABLES: &[&str] = &[
    "subnets",
    "subnet_chains",
    "l1_validator_state",
    "l1_validator_history",
    "l1_validator_balance_txs",
    "l1_validator_refunds",
    "l1_fee_stats",
];

pub const TABLE_SCHEMAS: &[TableSchema] = &[
    TableSchema {
        name: "raw_blocks",
        columns: "chain_id UInt32,
                 block_number UInt64,
                 block_hash String,
                 parent_hash String,
                 block_time DateTime64(3, 'UTC'),
                 miner String,
                 gas_limit UInt64,
                 gas_used UInt64,
                 base_fee_per_gas UInt64,
                 difficulty String,
                 size UInt64,
                 extra_data String,
                 tx_count UInt32,
                 inserted_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(inserted_at)",
        order_by: "chain_id, block_number",
    },
    TableSchema {
        name: "raw_txs",
        columns: "chain_id UInt32,
                 block_number UInt64,
                 block_time DateTime64(3, 'UTC'),
                 tx_hash String,
                 tx_index UInt32,
                 from_address String,
                 to_address String,
                 value String,
                 nonce UInt64,
                 gas_limit UInt64,
                 gas_price UInt64,
                 max_fee_per_gas UInt64,
                 max_priority_fee_per_gas UInt64,
                 base_fee_per_gas UInt64,
                 input String,
                 tx_type UInt8,
                 success Bool,
                 gas_used UInt64,
                 effective_gas_price UInt64,
                 cumulative_gas_used UInt64,
                 contract_address String,
                 inserted_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(inserted_at)",
        order_by: "chain_id, block_number, tx_index",
    },
    TableSchema {
        name: "raw_traces",
        columns: "chain_id UInt32,
                 block_number UInt64,
                 tx_hash String,
                 tx_index UInt32,
                 trace_address String,
                 call_type String,
                 from_address String,
                 to_address String,
                 value String,
                 gas UInt64,
                 gas_used UInt64,
                 input String,
                 output String,
                 error String,
                 tx_success Bool,
                 tx_from String,
                 tx_to String,
                 inserted_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(inserted_at)",
        order_by: "chain_id, block_number, tx_index, trace_address",
    },
    TableSchema {
        name: "raw_logs",
        columns: "chain_id UInt32,
                 block_number UInt64,
                 block_time DateTime64(3, 'UTC'),
                 tx_hash String,
                 tx_index UInt32,
                 log_index UInt32,
                 address String,
                 topic0 String,
                 topic1 String,
                 topic2 String,
                 topic3 String,
                 data String,
                 tx_success Bool,
                 tx_from String,
                 tx_to String,
                 inserted_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(inserted_at)",
        order_by: "chain_id, block_number, tx_index, log_index",
    },
    TableSchema {
        name: "platform_txs",
        columns: "chain_id UInt32,
                 block_number UInt64,
                 block_time DateTime64(3, 'UTC'),
                 tx_id String,
                 tx_type LowCardinality(String),
                 tx_data String,
                 inserted_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(inserted_at)",
        order_by: "chain_id, block_number, tx_id",
    },
    TableSchema {
        name: "chain_status",
        columns: "chain_id UInt32,
                 name String,
                 latest_block UInt64,
                 updated_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(updated_at)",
        order_by: "chain_id",
    },
    TableSchema {
        name: "indexer_watermarks",
        columns: "chain_id UInt32,
                 indexer_name String,
                 granularity LowCardinality(String),
                 last_period DateTime64(3, 'UTC'),
                 last_block_num UInt64,
                 updated_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(updated_at)",
        order_by: "chain_id, indexer_name, granularity",
    },
    TableSchema {
        name: "metrics",
        columns: "chain_id UInt32,
                 metric LowCardinality(String),
                 granularity LowCardinality(String),
                 period DateTime64(3, 'UTC'),
                 value UInt64,
                 computed_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(computed_at)",
        order_by: "chain_id, metric, granularity, period",
    },
    // Derived tables written by the incremental indexer SQL.
    TableSchema {
        name: "addresses_on_chain",
        columns: "chain_id UInt32,
                 address String,
                 first_seen_block UInt64,
                 first_seen_time DateTime64(3, 'UTC')",
        engine: "ReplacingMergeTree(first_seen_block)",
        order_by: "chain_id, address",
    },
    TableSchema {
        name: "contract_deployments",
        columns: "chain_id UInt32,
                 contract_address String,
                 deployer String,
                 tx_hash String,
                 block_number UInt64,
                 block_time DateTime64(3, 'UTC')",
        engine: "ReplacingMergeTree(block_number)",
        order_by: "chain_id, contract_address",
    },
    // Keyed per (address, block) so a replayed range replaces its own rows
    // and the pre-range baseline stays readable.
    TableSchema {
        name: "native_balances",
        columns: "chain_id UInt32,
                 address String,
                 block_number UInt64,
                 balance Int256",
        engine: "ReplacingMergeTree",
        order_by: "chain_id, address, block_number",
    },
    TableSchema {
        name: "subnet_activity",
        columns: "chain_id UInt32,
                 subnet_id String,
                 last_active_block UInt64,
                 updated_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(updated_at)",
        order_by: "chain_id, subnet_id",
    },
    // P-chain derivation tables.
    TableSchema {
        name: "subnets",
        columns: "chain_id UInt32,
                 subnet_id String,
                 subnet_type LowCardinality(String),
                 owner String,
                 created_at_block UInt64,
                 created_at_time DateTime64(3, 'UTC'),
                 last_updated DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(last_updated)",
        order_by: "chain_id, subnet_id",
    },
    TableSchema {
        name: "subnet_chains",
        columns: "chain_id UInt32,
                 subnet_id String,
                 tx_id String,
                 chain_name String,
                 vm_id String,
                 created_at_block UInt64,
                 created_at_time DateTime64(3, 'UTC'),
                 last_updated DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(last_updated)",
        order_by: "chain_id, subnet_id, tx_id",
    },
    TableSchema {
        name: "l1_validator_state",
        columns: "chain_id UInt32,
                 subnet_id String,
                 validation_id String,
                 node_id String,
                 weight UInt64,
                 balance UInt64,
                 start_time DateTime64(3, 'UTC'),
                 end_time DateTime64(3, 'UTC'),
                 uptime Float64,
                 active Bool,
                 last_updated DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(last_updated)",
        order_by: "chain_id, subnet_id, validation_id",
    },
    TableSchema {
        name: "l1_validator_history",
        columns: "chain_id UInt32,
                 validation_id String,
                 subnet_id String,
                 node_id String,
                 tx_id String,
                 tx_type LowCardinality(String),
                 weight UInt64,
                 registered_at_block UInt64,
                 registered_at_time DateTime64(3, 'UTC'),
                 last_updated DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(last_updated)",
        order_by: "chain_id, validation_id, tx_id",
    },
    TableSchema {
        name: "l1_validator_balance_txs",
        columns: "chain_id UInt32,
                 validation_id String,
                 tx_id String,
                 kind LowCardinality(String),
                 amount UInt64,
                 block_number UInt64,
                 block_time DateTime64(3, 'UTC')",
        engine: "ReplacingMergeTree(block_number)",
        order_by: "chain_id, validation_id, tx_id",
    },
    TableSchema {
        name: "l1_validator_refunds",
        columns: "chain_id UInt32,
                 validation_id String,
                 disabled_at DateTime64(3, 'UTC'),
                 active_seconds UInt64,
                 total_deposits UInt64,
                 amount UInt64,
                 computed_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(computed_at)",
        order_by: "chain_id, validation_id",
    },
    TableSchema {
        name: "l1_fee_stats",
        columns: "chain_id UInt32,
                 subnet_id String,
                 validator_count UInt32,
                 active_count UInt32,
                 total_balance UInt64,
                 total_weight UInt64,
                 fee_per_second UInt64,
                 computed_at DateTime64(3, 'UTC') DEFAULT now64(3)",
        engine: "ReplacingMergeTree(computed_at)",
        order_by: "chain_id, subnet_id",
    },
];

/// Creates every table if it does not exist. Idempotent; run at startup.
pub async fn create_tables(client: &Client) -> Result<()> {
    for schema in TABLE_SCHEMAS {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY ({})",
            schema.name, schema.columns, schema.engine, schema.order_by
        );
        client
            .query(&ddl)
            .execute()
            .await
            .with_context(|| format!("failed to create table {}", schema.name))?;
    }

    // The sync watermark is key-addressable: one row per chain, upserted in
    // place, readable without FINAL.
    client
        .query(
            "CREATE TABLE IF NOT EXISTS sync_watermark (
                chain_id UInt32,
                block_num UInt64
            ) ENGINE = EmbeddedRocksDB PRIMARY KEY chain_id",
        )
        .execute()
        .await
        .context("failed to create table sync_watermark")?;

    info!("Ensured {} tables exist", TABLE_SCHEMAS.len() + 1);
    Ok(())
}
