//! ClickHouse connection and the small shared tables (sync watermark,
//! chain status) that both syncer kinds write through.

pub mod schema;

use anyhow::{Context, Result};
use clickhouse::{Client, Row};
use log::info;
use serde::{Deserialize, Serialize};

/// Rows per INSERT for the high-variance tables. Keeps a single request
/// within the store's memory limits when blocks carry tens of thousands of
/// logs or traces.
pub const INSERT_CHUNK_SIZE: usize = 5_000;

/// Builds a client from the environment: `CLICKHOUSE_URL` (default
/// `http://localhost:8123`), `CLICKHOUSE_DATABASE`, `CLICKHOUSE_USER`,
/// `CLICKHOUSE_PASSWORD`. Verifies the connection with a probe query.
pub async fn connect() -> Result<Client> {
    let url =
        std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let database = std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "default".to_string());
    let user = std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string());
    let password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();

    let client = Client::default()
        .with_url(&url)
        .with_database(&database)
        .with_user(user)
        .with_password(password);

    client
        .query("SELECT 1")
        .fetch_one::<u8>()
        .await
        .with_context(|| format!("failed to connect to ClickHouse at {url}"))?;

    info!("Connected to ClickHouse at {url} (database {database})");
    Ok(client)
}

/// Appends rows in chunks of [`INSERT_CHUNK_SIZE`]. Partial writes are
/// acceptable: every table replaces by sort key, so a retried append
/// converges to the same logical content.
pub async fn insert_rows<T>(client: &Client, table: &str, rows: &[T]) -> Result<()>
where
    T: Row + Serialize,
{
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut insert = client
            .insert(table)
            .with_context(|| format!("failed to open insert into {table}"))?;
        for row in chunk {
            insert.write(row).await?;
        }
        insert
            .end()
            .await
            .with_context(|| format!("failed to insert into {table}"))?;
    }
    Ok(())
}

#[derive(Debug, Row, Deserialize)]
struct WatermarkValue {
    block_num: u64,
}

/// Highest fully-persisted block for a chain, 0 when the chain has never
/// completed an iteration.
pub async fn sync_watermark(client: &Client, chain_id: u32) -> Result<u64> {
    let row = client
        .query("SELECT block_num FROM sync_watermark WHERE chain_id = ?")
        .bind(chain_id)
        .fetch_optional::<WatermarkValue>()
        .await
        .context("failed to read sync watermark")?;

    Ok(row.map(|r| r.block_num).unwrap_or(0))
}

/// Commits the raw-data watermark. Called only after every raw table for
/// every block up to `block_num` has been appended.
pub async fn set_sync_watermark(client: &Client, chain_id: u32, block_num: u64) -> Result<()> {
    client
        .query("INSERT INTO sync_watermark (chain_id, block_num) VALUES (?, ?)")
        .bind(chain_id)
        .bind(block_num)
        .execute()
        .await
        .context("failed to save sync watermark")
}

/// Observational heartbeat: the chain name and the RPC head seen this
/// iteration.
pub async fn update_chain_status(
    client: &Client,
    chain_id: u32,
    name: &str,
    latest_block: u64,
) -> Result<()> {
    client
        .query("INSERT INTO chain_status (chain_id, name, latest_block) VALUES (?, ?, ?)")
        .bind(chain_id)
        .bind(name)
        .bind(latest_block)
        .execute()
        .await
        .context("failed to update chain status")
}
